// lib.rs

//! Converts scenes of triangle meshes, transforms and product metadata
//! into compact streamable packages (format v6) and parses them back.
//! Large models with repeated detail compress well through three combined
//! techniques: geometry reuse by instancing, oct-encoded normals, and
//! positions quantized against spatially partitioned tiles.

/// Contains the shared definitions, the model graph, geometry utilities
/// and the package envelope.
pub mod core;

/// Groups entities into tiles with a kd-tree and quantizes positions.
pub mod tiler;

/// Defines the package encoder.
pub mod encode;

/// Defines the package parser.
pub mod decode;

/// The scene-builder interface the parser drives.
pub mod scene;

/// Contains the most commonly used traits, types, and objects.
pub mod prelude {
    pub use crate::core::geom::Aabb;
    pub use crate::core::model::{EntityParams, Model, PrimitiveParams, Warning};
    pub use crate::core::package::{Package, FORMAT_VERSION};
    pub use crate::core::shared::ConfigType;
    pub use crate::decode::{self, parse};
    pub use crate::encode::{self, encode};
    pub use crate::scene::SceneBuilder;
    pub use crate::tiler::{self, build_tiles};
}
