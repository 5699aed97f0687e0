//! Spatial partitioner: groups entities into tiles with a kd-tree over
//! their world-space boxes, then fills in the quantized positions that the
//! encoder streams out.

use glam::{Mat3, Mat4};
use thiserror::Error;

use crate::core::geom::{
    self, oct_decode, oct_encode, positions_decode_matrix, quantize_positions, Aabb,
};
use crate::core::model::builder::bake_positions;
use crate::core::model::{Model, Tile};
use crate::core::shared::{ConfigType, EntityIndex, TileIndex};

/// Depth bound of the kd-tree. Five levels keeps tiles coarse enough that
/// one decode matrix amortizes over thousands of vertices.
pub const KD_TREE_MAX_DEPTH: usize = 5;

#[derive(Debug, Clone)]
pub struct Config {
    pub max_depth: usize,
}

impl ConfigType for Config {
    fn default() -> Self {
        Self {
            max_depth: KD_TREE_MAX_DEPTH,
        }
    }
}

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Err {
    #[error("tile quantization failed: {0}")]
    Quantization(#[from] geom::Err),
}

struct KdNode {
    aabb: Aabb,
    left: Option<Box<KdNode>>,
    right: Option<Box<KdNode>>,
    entities: Vec<EntityIndex>,
}

impl KdNode {
    fn new(aabb: Aabb) -> Self {
        Self {
            aabb,
            left: None,
            right: None,
            entities: Vec::new(),
        }
    }

    fn insert(&mut self, entity: EntityIndex, entity_aabb: &Aabb, depth: usize, max_depth: usize) {
        if depth >= max_depth {
            self.hold(entity, entity_aabb);
            return;
        }

        if let Some(left) = &mut self.left {
            if left.aabb.contains_aabb(entity_aabb) {
                left.insert(entity, entity_aabb, depth + 1, max_depth);
                return;
            }
        }
        if let Some(right) = &mut self.right {
            if right.aabb.contains_aabb(entity_aabb) {
                right.insert(entity, entity_aabb, depth + 1, max_depth);
                return;
            }
        }

        let (lo, hi) = self.aabb.split(self.aabb.longest_axis());
        if lo.contains_aabb(entity_aabb) {
            self.left
                .get_or_insert_with(|| Box::new(KdNode::new(lo)))
                .insert(entity, entity_aabb, depth + 1, max_depth);
        } else if hi.contains_aabb(entity_aabb) {
            self.right
                .get_or_insert_with(|| Box::new(KdNode::new(hi)))
                .insert(entity, entity_aabb, depth + 1, max_depth);
        } else {
            self.hold(entity, entity_aabb);
        }
    }

    fn hold(&mut self, entity: EntityIndex, entity_aabb: &Aabb) {
        self.entities.push(entity);
        self.aabb.expand_aabb(entity_aabb);
    }

    /// Pre-order flattening: every node holding entities becomes one tile.
    fn flatten(self, tiles: &mut Vec<Tile>) {
        if !self.entities.is_empty() {
            // A node can hold only zero-instance entities, leaving its box
            // empty; such a tile carries no geometry to decode.
            let decode_matrix = if self.aabb.is_empty() {
                Mat4::IDENTITY
            } else {
                positions_decode_matrix(&self.aabb)
            };
            tiles.push(Tile {
                index: TileIndex::from(tiles.len()),
                aabb: self.aabb,
                decode_matrix,
                entities: self.entities,
            });
        }
        if let Some(left) = self.left {
            left.flatten(tiles);
        }
        if let Some(right) = self.right {
            right.flatten(tiles);
        }
    }
}

/// Partitions the model's entities into tiles and quantizes every
/// primitive's positions: single-use primitives against their tile's AABB,
/// reused primitives once against the union of all reused object-space
/// boxes (which also fixes the model's instanced decode matrix).
pub fn build_tiles(model: &mut Model, cfg: &Config) -> Result<(), Err> {
    reconcile_reuse(model);

    let mut root_aabb = Aabb::EMPTY;
    for entity in model.entities() {
        root_aabb.expand_aabb(&entity.aabb);
    }

    let mut root = KdNode::new(root_aabb);
    for entity in model.entities() {
        root.insert(entity.index, &entity.aabb, 0, cfg.max_depth);
    }

    let mut tiles = Vec::new();
    root.flatten(&mut tiles);
    model.tiles = tiles;

    quantize_reused(model)?;
    quantize_tiled(model)?;
    Ok(())
}

/// The shared bucket is decided by actual use, never by the creation-time
/// declaration alone: a primitive is reused iff two or more instances
/// reference it, which is also how the parser tells instanced from
/// self-contained meshes. A primitive declared shared but referenced at
/// most once gets its owning entity's transform folded in and becomes
/// single-use; one declared single-use but referenced repeatedly joins the
/// shared bucket (its entities carry identity matrices on the wire, so
/// placement is unchanged).
fn reconcile_reuse(model: &mut Model) {
    let mut counts = vec![0usize; model.primitives.len()];
    let mut owner: Vec<Option<EntityIndex>> = vec![None; model.primitives.len()];
    for instance in &model.instances {
        counts[usize::from(instance.primitive)] += 1;
        owner[usize::from(instance.primitive)] = Some(instance.entity);
    }

    for p in 0..model.primitives.len() {
        let is_reused = counts[p] >= 2;
        if model.primitives[p].reused == is_reused {
            continue;
        }
        if is_reused {
            log::warn!(
                "primitive {:?} was created single-use but has {} instances, moving it to the shared bucket",
                model.primitives[p].id,
                counts[p]
            );
        } else {
            log::warn!(
                "primitive {:?} was created shared but has {} instance(s), folding it into its tile",
                model.primitives[p].id,
                counts[p]
            );
            if let Some(entity_index) = owner[p] {
                let entity = &model.entities[usize::from(entity_index)];
                if entity.has_reused_primitives {
                    let matrix = entity.matrix;
                    let primitive = &mut model.primitives[p];
                    bake_positions(&mut primitive.positions, &matrix);
                    rebake_normals(&mut primitive.normals_oct, &matrix);
                }
            }
        }
        model.primitives[p].reused = is_reused;
    }
}

/// Rotates already-encoded normals through the inverse-transpose of a
/// transform being folded into the positions.
fn rebake_normals(normals_oct: &mut [i8], matrix: &Mat4) {
    let normal_matrix = Mat3::from_mat4(*matrix).inverse().transpose();
    for pair in normals_oct.chunks_exact_mut(2) {
        let rotated = normal_matrix * oct_decode([pair[0], pair[1]]);
        if let Some(n) = rotated.try_normalize() {
            let oct = oct_encode(n);
            pair[0] = oct[0];
            pair[1] = oct[1];
        }
    }
}

fn quantize_reused(model: &mut Model) -> Result<(), Err> {
    let mut reused_aabb = Aabb::EMPTY;
    for primitive in &model.primitives {
        if primitive.reused {
            reused_aabb.expand_positions(&primitive.positions);
        }
    }
    if reused_aabb.is_empty() {
        return Ok(());
    }

    model.reused_primitives_aabb = reused_aabb;
    model.instanced_primitives_decode_matrix = positions_decode_matrix(&reused_aabb);
    for primitive in &mut model.primitives {
        if primitive.reused {
            primitive.positions_quantized = quantize_positions(&primitive.positions, &reused_aabb)?;
        }
    }
    Ok(())
}

fn quantize_tiled(model: &mut Model) -> Result<(), Err> {
    for tile_index in 0..model.tiles.len() {
        let tile_aabb = model.tiles[tile_index].aabb;
        let entities = model.tiles[tile_index].entities.clone();
        for entity_index in entities {
            let instance_indices = model.entities[usize::from(entity_index)].instances.clone();
            for instance_index in instance_indices {
                let primitive_index = model.instances[usize::from(instance_index)].primitive;
                let primitive = &mut model.primitives[usize::from(primitive_index)];
                if primitive.reused || !primitive.positions_quantized.is_empty() {
                    continue;
                }
                primitive.positions_quantized =
                    quantize_positions(&primitive.positions, &tile_aabb)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{EntityParams, PrimitiveParams};
    use glam::{Mat4, Vec3};

    fn tri_at(offset: Vec3) -> (Vec<f32>, Vec<f32>, Vec<u32>) {
        let positions = vec![
            offset.x,
            offset.y,
            offset.z,
            offset.x + 1.0,
            offset.y,
            offset.z,
            offset.x,
            offset.y + 1.0,
            offset.z,
        ];
        let normals = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        (positions, normals, vec![0, 1, 2])
    }

    fn add_entity(model: &mut Model, name: &str, offset: Vec3) {
        let (positions, normals, indices) = tri_at(offset);
        let primitive_id = format!("{}-geom", name);
        model
            .create_primitive(PrimitiveParams {
                id: &primitive_id,
                reused: false,
                modeling_matrix: Mat4::IDENTITY,
                color: [128, 128, 128],
                opacity: 1.0,
                positions,
                normals: &normals,
                indices,
            })
            .unwrap();
        model
            .create_entity(EntityParams {
                id: name,
                matrix: Mat4::IDENTITY,
                primitive_ids: &[&primitive_id],
                has_reused_primitives: false,
            })
            .unwrap();
    }

    #[test]
    fn single_entity_yields_one_tile_with_its_aabb() {
        let mut model = Model::new();
        add_entity(&mut model, "only", Vec3::ZERO);
        build_tiles(&mut model, &Config::default()).unwrap();

        assert_eq!(model.tiles().len(), 1);
        let tile = &model.tiles()[0];
        assert_eq!(tile.aabb, model.entities()[0].aabb);
        assert_eq!(tile.entities, vec![EntityIndex::from(0)]);
        assert!(!model.primitives()[0].positions_quantized.is_empty());
    }

    #[test]
    fn distant_entities_land_in_distinct_tiles() {
        let mut model = Model::new();
        add_entity(&mut model, "near", Vec3::ZERO);
        add_entity(&mut model, "far", Vec3::new(1000.0, 0.0, 0.0));
        build_tiles(&mut model, &Config::default()).unwrap();

        assert!(model.tiles().len() >= 2, "got {} tiles", model.tiles().len());
        let tile_of = |e: usize| {
            model
                .tiles()
                .iter()
                .position(|t| t.entities.contains(&EntityIndex::from(e)))
                .unwrap()
        };
        assert_ne!(tile_of(0), tile_of(1));
    }

    #[test]
    fn every_tiled_entity_fits_its_tile() {
        let mut model = Model::new();
        for i in 0..16 {
            add_entity(
                &mut model,
                &format!("e{}", i),
                Vec3::new((i % 4) as f32 * 7.0, (i / 4) as f32 * 3.0, 0.0),
            );
        }
        build_tiles(&mut model, &Config::default()).unwrap();

        let mut seen = 0;
        for tile in model.tiles() {
            for &entity_index in &tile.entities {
                seen += 1;
                let entity_aabb = model.entity(entity_index).aabb;
                assert!(
                    tile.aabb.contains_aabb(&entity_aabb),
                    "entity {:?} with {:?} spills out of tile {:?}",
                    entity_index,
                    entity_aabb,
                    tile.aabb
                );
            }
        }
        assert_eq!(seen, 16, "an entity was dropped by the tiler");
    }

    #[test]
    fn reuse_flag_is_reconciled_with_instance_counts() {
        // Declared shared but referenced once: the owning transform is
        // folded in and the primitive becomes single-use.
        let (positions, normals, indices) = tri_at(Vec3::ZERO);
        let mut model = Model::new();
        model
            .create_primitive(PrimitiveParams {
                id: "once",
                reused: true,
                modeling_matrix: Mat4::IDENTITY,
                color: [0, 0, 0],
                opacity: 1.0,
                positions,
                normals: &normals,
                indices,
            })
            .unwrap();
        model
            .create_entity(EntityParams {
                id: "solo",
                matrix: Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)),
                primitive_ids: &["once"],
                has_reused_primitives: true,
            })
            .unwrap();
        build_tiles(&mut model, &Config::default()).unwrap();

        let primitive = &model.primitives()[0];
        assert!(!primitive.reused);
        assert_eq!(primitive.positions[0], 10.0, "owning transform folded in");
        assert!(model.reused_primitives_aabb().is_empty());
        let tile = &model.tiles()[0];
        assert!(tile.aabb.contains_aabb(&model.entities()[0].aabb));

        // Declared single-use but referenced twice: joins the shared
        // bucket, and the flag matches the instance count afterwards.
        let (positions, normals, indices) = tri_at(Vec3::ZERO);
        let mut model = Model::new();
        model
            .create_primitive(PrimitiveParams {
                id: "twice",
                reused: false,
                modeling_matrix: Mat4::IDENTITY,
                color: [0, 0, 0],
                opacity: 1.0,
                positions,
                normals: &normals,
                indices,
            })
            .unwrap();
        for name in ["a", "b"] {
            model
                .create_entity(EntityParams {
                    id: name,
                    matrix: Mat4::IDENTITY,
                    primitive_ids: &["twice"],
                    has_reused_primitives: false,
                })
                .unwrap();
        }
        build_tiles(&mut model, &Config::default()).unwrap();

        assert!(model.primitives()[0].reused);
        assert!(!model.reused_primitives_aabb().is_empty());

        let mut counts = vec![0usize; model.primitives().len()];
        for instance in model.instances() {
            counts[usize::from(instance.primitive)] += 1;
        }
        for primitive in model.primitives() {
            assert_eq!(
                primitive.reused,
                counts[usize::from(primitive.index)] >= 2,
                "primitive {:?} disagrees with its instance count",
                primitive.id
            );
        }
    }

    #[test]
    fn reused_primitives_share_the_global_bucket() {
        let (positions, normals, indices) = tri_at(Vec3::ZERO);
        let mut model = Model::new();
        model
            .create_primitive(PrimitiveParams {
                id: "bolt",
                reused: true,
                modeling_matrix: Mat4::IDENTITY,
                color: [10, 20, 30],
                opacity: 1.0,
                positions,
                normals: &normals,
                indices,
            })
            .unwrap();
        for (name, offset) in [("a", 100.0f32), ("b", -50.0)] {
            model
                .create_entity(EntityParams {
                    id: name,
                    matrix: Mat4::from_translation(Vec3::new(offset, 0.0, 0.0)),
                    primitive_ids: &["bolt"],
                    has_reused_primitives: true,
                })
                .unwrap();
        }
        build_tiles(&mut model, &Config::default()).unwrap();

        // Quantized once, in object space, against the reused bucket.
        let primitive = &model.primitives()[0];
        assert_eq!(primitive.positions_quantized.len(), primitive.positions.len());
        let decode = model.instanced_primitives_decode_matrix();
        let q = &primitive.positions_quantized;
        let first =
            decode.transform_point3(Vec3::new(q[0] as f32, q[1] as f32, q[2] as f32));
        assert!(first.distance(Vec3::ZERO) < 1e-3);
    }
}
