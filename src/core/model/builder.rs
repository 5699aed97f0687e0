use std::fmt;

use glam::{Mat3, Mat4, Vec3};
use thiserror::Error;

use crate::core::geom::{edges, oct_encode, Aabb};
use crate::core::shared::{EntityIndex, InstanceIndex, PrimitiveIndex};

use super::{Entity, Model, Primitive, PrimitiveInstance};

#[remain::sorted]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Err {
    #[error("an entity with id {0:?} already exists")]
    DuplicateEntity(String),
    #[error("a primitive with id {0:?} already exists")]
    DuplicatePrimitive(String),
    #[error("invalid input mesh: {0}")]
    InvalidInput(String),
}

/// A non-fatal problem found while building. Reported alongside the model,
/// never aborts the build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    UnknownPrimitive {
        entity_id: String,
        primitive_id: String,
    },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::UnknownPrimitive {
                entity_id,
                primitive_id,
            } => write!(
                f,
                "entity {:?} references unknown primitive {:?}",
                entity_id, primitive_id
            ),
        }
    }
}

pub struct PrimitiveParams<'a> {
    pub id: &'a str,
    /// True when two or more entities will reference this primitive. Reused
    /// primitives stay in object space; single-use ones are baked into
    /// world space here.
    pub reused: bool,
    pub modeling_matrix: Mat4,
    pub color: [u8; 3],
    /// Opacity in `[0, 1]`; stored as an 8-bit channel.
    pub opacity: f32,
    pub positions: Vec<f32>,
    pub normals: &'a [f32],
    pub indices: Vec<u32>,
}

pub struct EntityParams<'a> {
    pub id: &'a str,
    pub matrix: Mat4,
    pub primitive_ids: &'a [&'a str],
    /// All-or-nothing: either every primitive of this entity is shared
    /// with another entity, or none is.
    pub has_reused_primitives: bool,
}

impl Model {
    /// Registers a geometry atom. Computes its edge indices, bakes the
    /// modeling transform for single-use primitives, and oct-encodes the
    /// normals (through the inverse-transpose of the modeling matrix when
    /// baking; reused primitives keep their object-space frame).
    pub fn create_primitive(&mut self, params: PrimitiveParams<'_>) -> Result<PrimitiveIndex, Err> {
        if self.primitive_index_by_id.contains_key(params.id) {
            return Err(Err::DuplicatePrimitive(params.id.to_owned()));
        }
        validate_mesh(&params)?;

        let edge_indices = edges::build_edge_indices(
            &params.positions,
            &params.indices,
            self.config.edge_threshold_deg,
        );

        let mut positions = params.positions;
        let normals_oct = if params.reused {
            encode_normals(params.normals, None)?
        } else {
            bake_positions(&mut positions, &params.modeling_matrix);
            let normal_matrix = Mat3::from_mat4(params.modeling_matrix)
                .inverse()
                .transpose();
            encode_normals(params.normals, Some(&normal_matrix))?
        };

        let index = PrimitiveIndex::from(self.primitives.len());
        self.primitive_index_by_id
            .insert(params.id.to_owned(), index);
        self.primitives.push(Primitive {
            id: params.id.to_owned(),
            index,
            color: params.color,
            opacity: (params.opacity.clamp(0.0, 1.0) * 255.0).round() as u8,
            reused: params.reused,
            positions,
            normals_oct,
            indices: params.indices,
            edge_indices,
            positions_quantized: Vec::new(),
        });
        Ok(index)
    }

    /// Registers a named object referencing previously created primitives.
    /// One instance is appended to the model-wide list per resolvable id;
    /// unknown ids are dropped with a warning.
    pub fn create_entity(&mut self, params: EntityParams<'_>) -> Result<EntityIndex, Err> {
        if self.entity_index_by_id.contains_key(params.id) {
            return Err(Err::DuplicateEntity(params.id.to_owned()));
        }

        let index = EntityIndex::from(self.entities.len());
        let mut instances = Vec::with_capacity(params.primitive_ids.len());
        let mut aabb = Aabb::EMPTY;

        for primitive_id in params.primitive_ids {
            let primitive_index = match self.primitive_index_by_id.get(*primitive_id) {
                Some(&i) => i,
                None => {
                    log::warn!(
                        "entity {:?} references unknown primitive {:?}, dropping",
                        params.id,
                        primitive_id
                    );
                    self.warnings.push(Warning::UnknownPrimitive {
                        entity_id: params.id.to_owned(),
                        primitive_id: (*primitive_id).to_owned(),
                    });
                    continue;
                }
            };

            let instance_index = InstanceIndex::from(self.instances.len());
            self.instances.push(PrimitiveInstance {
                index: instance_index,
                primitive: primitive_index,
                entity: index,
            });
            instances.push(instance_index);

            let primitive = &self.primitives[usize::from(primitive_index)];
            if params.has_reused_primitives {
                for p in primitive.positions.chunks_exact(3) {
                    aabb.expand_point(
                        params
                            .matrix
                            .transform_point3(Vec3::new(p[0], p[1], p[2])),
                    );
                }
            } else {
                aabb.expand_positions(&primitive.positions);
            }
        }

        self.entity_index_by_id.insert(params.id.to_owned(), index);
        self.entities.push(Entity {
            id: params.id.to_owned(),
            index,
            matrix: params.matrix,
            instances,
            aabb,
            has_reused_primitives: params.has_reused_primitives,
        });
        Ok(index)
    }
}

fn validate_mesh(params: &PrimitiveParams<'_>) -> Result<(), Err> {
    if params.positions.is_empty() {
        return Err(Err::InvalidInput(format!(
            "primitive {:?} has no positions",
            params.id
        )));
    }
    if params.positions.len() % 3 != 0 {
        return Err(Err::InvalidInput(format!(
            "primitive {:?}: position count {} is not a multiple of 3",
            params.id,
            params.positions.len()
        )));
    }
    if params.normals.len() != params.positions.len() {
        return Err(Err::InvalidInput(format!(
            "primitive {:?}: {} normal values for {} position values",
            params.id,
            params.normals.len(),
            params.positions.len()
        )));
    }
    if params.positions.iter().any(|v| !v.is_finite()) {
        return Err(Err::InvalidInput(format!(
            "primitive {:?} has non-finite positions",
            params.id
        )));
    }
    let vertex_count = (params.positions.len() / 3) as u32;
    if let Some(&bad) = params.indices.iter().find(|&&i| i >= vertex_count) {
        return Err(Err::InvalidInput(format!(
            "primitive {:?}: index {} out of range ({} vertices)",
            params.id, bad, vertex_count
        )));
    }
    Ok(())
}

pub(crate) fn bake_positions(positions: &mut [f32], matrix: &Mat4) {
    for p in positions.chunks_exact_mut(3) {
        let world = matrix.transform_point3(Vec3::new(p[0], p[1], p[2]));
        p[0] = world.x;
        p[1] = world.y;
        p[2] = world.z;
    }
}

/// Renormalizes and oct-encodes normals, optionally pushing them through a
/// normal matrix first. A normal that cannot be renormalized is invalid
/// input.
fn encode_normals(normals: &[f32], normal_matrix: Option<&Mat3>) -> Result<Vec<i8>, Err> {
    let mut out = Vec::with_capacity(normals.len() / 3 * 2);
    for n in normals.chunks_exact(3) {
        let mut normal = Vec3::new(n[0], n[1], n[2]);
        if let Some(m) = normal_matrix {
            normal = *m * normal;
        }
        let normal = normal.try_normalize().ok_or_else(|| {
            Err::InvalidInput(format!("normal {:?} cannot be renormalized", n))
        })?;
        let oct = oct_encode(normal);
        out.push(oct[0]);
        out.push(oct[1]);
    }
    Ok(out)
}
