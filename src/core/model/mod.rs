pub mod builder;

use std::collections::HashMap;

use glam::Mat4;

use crate::core::geom::edges::DEFAULT_EDGE_THRESHOLD_DEG;
use crate::core::geom::Aabb;
use crate::core::shared::{ConfigType, EntityIndex, InstanceIndex, PrimitiveIndex, TileIndex};

pub use builder::{EntityParams, Err, PrimitiveParams, Warning};

/// A triangle-mesh geometry atom.
///
/// Positions are world-space when the primitive is single-use (the modeling
/// matrix was baked in at creation) and object-space when `reused`. Float
/// normals are not retained; they are oct-encoded at creation in the same
/// frame as the positions.
#[derive(Debug, Clone)]
pub struct Primitive {
    pub id: String,
    pub index: PrimitiveIndex,
    pub color: [u8; 3],
    pub opacity: u8,
    pub reused: bool,
    pub positions: Vec<f32>,
    pub normals_oct: Vec<i8>,
    pub indices: Vec<u32>,
    pub edge_indices: Vec<u32>,
    /// Filled by the tiler: quantized against the owning tile's AABB for
    /// single-use primitives, against the model-wide reused bucket otherwise.
    pub positions_quantized: Vec<u16>,
}

impl Primitive {
    pub fn vertex_count(&self) -> usize {
        self.positions.len() / 3
    }
}

/// One use of a primitive by an entity. The dense instance list is the
/// stable ordering the wire layout is built from.
#[derive(Debug, Clone, Copy)]
pub struct PrimitiveInstance {
    pub index: InstanceIndex,
    pub primitive: PrimitiveIndex,
    pub entity: EntityIndex,
}

/// A named object aggregating primitive instances.
#[derive(Debug, Clone)]
pub struct Entity {
    pub id: String,
    pub index: EntityIndex,
    /// Meaningful only when `has_reused_primitives`; single-use geometry
    /// already carries the transform in its positions.
    pub matrix: Mat4,
    pub instances: Vec<InstanceIndex>,
    /// World-space box over all referenced primitive positions.
    pub aabb: Aabb,
    pub has_reused_primitives: bool,
}

/// A spatial bucket of entities sharing one positions decode matrix.
#[derive(Debug, Clone)]
pub struct Tile {
    pub index: TileIndex,
    pub aabb: Aabb,
    pub decode_matrix: Mat4,
    pub entities: Vec<EntityIndex>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Dihedral threshold (degrees) for edge extraction.
    pub edge_threshold_deg: f32,
}

impl ConfigType for Config {
    fn default() -> Self {
        Self {
            edge_threshold_deg: DEFAULT_EDGE_THRESHOLD_DEG,
        }
    }
}

/// The in-memory model graph: insertion-ordered arenas of primitives,
/// instances, entities and tiles. Insertion order equals `*_index` and is
/// the sole ordering authority for the wire layout; the id maps exist for
/// lookup only and are never iterated when emitting data.
#[derive(Debug)]
pub struct Model {
    pub(crate) config: Config,
    pub(crate) primitives: Vec<Primitive>,
    pub(crate) instances: Vec<PrimitiveInstance>,
    pub(crate) entities: Vec<Entity>,
    pub(crate) tiles: Vec<Tile>,
    pub(crate) primitive_index_by_id: HashMap<String, PrimitiveIndex>,
    pub(crate) entity_index_by_id: HashMap<String, EntityIndex>,
    /// Union of the object-space boxes of all reused primitives.
    pub(crate) reused_primitives_aabb: Aabb,
    pub(crate) instanced_primitives_decode_matrix: Mat4,
    pub(crate) warnings: Vec<Warning>,
}

impl Model {
    pub fn new() -> Self {
        Self::with_config(ConfigType::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            primitives: Vec::new(),
            instances: Vec::new(),
            entities: Vec::new(),
            tiles: Vec::new(),
            primitive_index_by_id: HashMap::new(),
            entity_index_by_id: HashMap::new(),
            reused_primitives_aabb: Aabb::EMPTY,
            instanced_primitives_decode_matrix: Mat4::IDENTITY,
            warnings: Vec::new(),
        }
    }

    pub fn primitives(&self) -> &[Primitive] {
        &self.primitives
    }

    pub fn instances(&self) -> &[PrimitiveInstance] {
        &self.instances
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn tiles(&self) -> &[Tile] {
        &self.tiles
    }

    pub fn primitive(&self, index: PrimitiveIndex) -> &Primitive {
        &self.primitives[usize::from(index)]
    }

    pub fn entity(&self, index: EntityIndex) -> &Entity {
        &self.entities[usize::from(index)]
    }

    pub fn instance(&self, index: InstanceIndex) -> &PrimitiveInstance {
        &self.instances[usize::from(index)]
    }

    pub fn primitive_by_id(&self, id: &str) -> Option<&Primitive> {
        self.primitive_index_by_id.get(id).map(|&i| self.primitive(i))
    }

    pub fn entity_by_id(&self, id: &str) -> Option<&Entity> {
        self.entity_index_by_id.get(id).map(|&i| self.entity(i))
    }

    /// Decode matrix of the shared quantization bucket for reused
    /// primitives. Identity until the tiler has run or when the model has
    /// no reused primitives.
    pub fn instanced_primitives_decode_matrix(&self) -> Mat4 {
        self.instanced_primitives_decode_matrix
    }

    /// Union of the object-space boxes of all reused primitives; the box
    /// the instanced decode matrix is derived from. Empty until the tiler
    /// has run.
    pub fn reused_primitives_aabb(&self) -> Aabb {
        self.reused_primitives_aabb
    }

    /// Non-fatal problems accumulated while building.
    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }
}

impl Default for Model {
    fn default() -> Self {
        Self::new()
    }
}
