//! The narrow interface the parser drives while replaying a package. The
//! real implementation (a viewer, an exporter) lives outside this crate.

use glam::Mat4;

/// Vertex topology of a materialized geometry. Packages only carry
/// triangle lists today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Topology {
    Triangles,
}

/// A shared geometry, materialized once per instanced primitive. Positions
/// stay quantized; `positions_decode_matrix` maps them back to the space
/// the consumer renders in.
#[derive(Debug)]
pub struct GeometryParams<'a> {
    pub id: u64,
    pub topology: Topology,
    pub positions: &'a [u16],
    pub normals: &'a [i8],
    pub indices: &'a [u32],
    pub edge_indices: &'a [u32],
    pub positions_decode_matrix: Mat4,
}

/// Where a mesh's geometry comes from: a previously created shared
/// geometry placed by a modeling matrix, or arrays of its own.
#[derive(Debug)]
pub enum MeshSource<'a> {
    Instanced {
        geometry_id: u64,
        matrix: Mat4,
    },
    SelfContained {
        topology: Topology,
        positions: &'a [u16],
        normals: &'a [i8],
        indices: &'a [u32],
        edge_indices: &'a [u32],
        positions_decode_matrix: Mat4,
    },
}

#[derive(Debug)]
pub struct MeshParams<'a> {
    pub id: u64,
    pub source: MeshSource<'a>,
    pub color: [u8; 3],
    pub opacity: u8,
}

#[derive(Debug)]
pub struct EntityParams<'a> {
    pub id: &'a str,
    pub is_object: bool,
    pub mesh_ids: &'a [u64],
}

/// Receiver of construction calls from the parser. Calls arrive in
/// dependency order: a geometry before any mesh referencing it, every mesh
/// before the entity aggregating it.
pub trait SceneBuilder {
    fn create_geometry(&mut self, geometry: GeometryParams<'_>);
    fn create_mesh(&mut self, mesh: MeshParams<'_>);
    fn create_entity(&mut self, entity: EntityParams<'_>);
}
