//! Walks a tiled model and emits the 17 deflate-compressed element streams
//! of a v6 package. Iteration only ever touches the insertion-ordered
//! arenas and the tile list, which makes the uncompressed streams
//! byte-identical across runs.

use std::io::{self, Write};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use glam::Mat4;
use thiserror::Error;

use crate::core::model::Model;
use crate::core::package::{stream, Package, STREAM_COUNT, STREAM_NAMES};
use crate::core::shared::ConfigType;

#[derive(Debug, Clone)]
pub struct Config {
    /// Deflate level, 0-9. Only affects compressed size, never the
    /// uncompressed stream bytes.
    pub compression_level: u32,
}

impl ConfigType for Config {
    fn default() -> Self {
        Self {
            compression_level: 6,
        }
    }
}

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Err {
    #[error("failed to compress stream {stream}: {source}")]
    CodecError {
        stream: &'static str,
        source: io::Error,
    },
    #[error("`tiler::build_tiles` must run before encoding")]
    TilesNotBuilt,
}

/// Encodes a tiled model into a package.
pub fn encode(model: &Model, cfg: &Config) -> Result<Package, Err> {
    if model.tiles().is_empty() && !model.instances().is_empty() {
        return Err(Err::TilesNotBuilt);
    }

    log::debug!(
        "encoding {} primitives, {} instances, {} entities, {} tiles",
        model.primitives().len(),
        model.instances().len(),
        model.entities().len(),
        model.tiles().len()
    );

    // Per-primitive arrays, concatenated in primitive-index order. Portions
    // count elements, not bytes; the positions/normals portion counts
    // vertices (x3 u16 position values, x2 i8 normal values).
    let mut positions: Vec<u16> = Vec::new();
    let mut normals: Vec<i8> = Vec::new();
    let mut indices: Vec<u32> = Vec::new();
    let mut edge_indices: Vec<u32> = Vec::new();
    let mut positions_and_normals_portions: Vec<u32> = Vec::new();
    let mut indices_portions: Vec<u32> = Vec::new();
    let mut edge_indices_portions: Vec<u32> = Vec::new();
    let mut colors: Vec<u8> = Vec::new();

    for primitive in model.primitives() {
        positions_and_normals_portions.push((positions.len() / 3) as u32);
        indices_portions.push(indices.len() as u32);
        edge_indices_portions.push(edge_indices.len() as u32);
        positions.extend_from_slice(&primitive.positions_quantized);
        normals.extend_from_slice(&primitive.normals_oct);
        indices.extend_from_slice(&primitive.indices);
        edge_indices.extend_from_slice(&primitive.edge_indices);
        colors.extend_from_slice(&[
            primitive.color[0],
            primitive.color[1],
            primitive.color[2],
            primitive.opacity,
        ]);
    }

    // Per-entity arrays in tile order: tiles in flattening order, entities
    // within one tile in model insertion order. Instances keep their
    // creation order within each entity.
    let mut entity_ids: Vec<&str> = Vec::new();
    let mut matrices: Vec<f32> = Vec::new();
    let mut matrices_portions: Vec<u32> = Vec::new();
    let mut primitive_instances: Vec<u32> = Vec::new();
    let mut instances_portions: Vec<u32> = Vec::new();
    let mut tile_entities_portions: Vec<u32> = Vec::new();
    let mut tile_aabbs: Vec<f32> = Vec::new();
    let mut tile_decode_matrices: Vec<f32> = Vec::new();

    for tile in model.tiles() {
        tile_entities_portions.push(entity_ids.len() as u32);
        tile_aabbs.extend_from_slice(&tile.aabb.to_array());
        tile_decode_matrices.extend_from_slice(&tile.decode_matrix.to_cols_array());

        for &entity_index in &tile.entities {
            let entity = model.entity(entity_index);
            entity_ids.push(&entity.id);
            matrices_portions.push(matrices.len() as u32);
            // The wire matrix is what the parser applies to instanced
            // meshes: the entity transform when it was not baked into the
            // geometry, identity when it was.
            let wire_matrix = if entity.has_reused_primitives {
                entity.matrix
            } else {
                Mat4::IDENTITY
            };
            matrices.extend_from_slice(&wire_matrix.to_cols_array());
            instances_portions.push(primitive_instances.len() as u32);
            for &instance_index in &entity.instances {
                let primitive = model.instance(instance_index).primitive;
                primitive_instances.push(usize::from(primitive) as u32);
            }
        }
    }

    let entity_id_json = serde_json::to_vec(&entity_ids).map_err(|e| Err::CodecError {
        stream: STREAM_NAMES[stream::EACH_ENTITY_ID],
        source: io::Error::new(io::ErrorKind::Other, e),
    })?;

    let instanced_decode_matrix = model.instanced_primitives_decode_matrix().to_cols_array();

    let mut streams: Vec<Vec<u8>> = Vec::with_capacity(STREAM_COUNT);
    let level = Compression::new(cfg.compression_level);
    let push = |ordinal: usize, bytes: Vec<u8>, streams: &mut Vec<Vec<u8>>| {
        debug_assert_eq!(streams.len(), ordinal);
        deflate(STREAM_NAMES[ordinal], &bytes, level).map(|blob| streams.push(blob))
    };

    push(stream::POSITIONS, bytes_of_u16(&positions), &mut streams)?;
    push(stream::NORMALS, bytes_of_i8(&normals), &mut streams)?;
    push(stream::INDICES, bytes_of_u32(&indices), &mut streams)?;
    push(stream::EDGE_INDICES, bytes_of_u32(&edge_indices), &mut streams)?;
    push(stream::MATRICES, bytes_of_f32(&matrices), &mut streams)?;
    push(
        stream::INSTANCED_PRIMITIVES_DECODE_MATRIX,
        bytes_of_f32(&instanced_decode_matrix),
        &mut streams,
    )?;
    push(
        stream::EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION,
        bytes_of_u32(&positions_and_normals_portions),
        &mut streams,
    )?;
    push(
        stream::EACH_PRIMITIVE_INDICES_PORTION,
        bytes_of_u32(&indices_portions),
        &mut streams,
    )?;
    push(
        stream::EACH_PRIMITIVE_EDGE_INDICES_PORTION,
        bytes_of_u32(&edge_indices_portions),
        &mut streams,
    )?;
    push(
        stream::EACH_PRIMITIVE_COLOR_AND_OPACITY,
        colors,
        &mut streams,
    )?;
    push(
        stream::PRIMITIVE_INSTANCES,
        bytes_of_u32(&primitive_instances),
        &mut streams,
    )?;
    push(stream::EACH_ENTITY_ID, entity_id_json, &mut streams)?;
    push(
        stream::EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION,
        bytes_of_u32(&instances_portions),
        &mut streams,
    )?;
    push(
        stream::EACH_ENTITY_MATRICES_PORTION,
        bytes_of_u32(&matrices_portions),
        &mut streams,
    )?;
    push(stream::EACH_TILE_AABB, bytes_of_f32(&tile_aabbs), &mut streams)?;
    push(
        stream::EACH_TILE_DECODE_MATRIX,
        bytes_of_f32(&tile_decode_matrices),
        &mut streams,
    )?;
    push(
        stream::EACH_TILE_ENTITIES_PORTION,
        bytes_of_u32(&tile_entities_portions),
        &mut streams,
    )?;

    Ok(Package::new(streams))
}

fn deflate(name: &'static str, bytes: &[u8], level: Compression) -> Result<Vec<u8>, Err> {
    let mut encoder = ZlibEncoder::new(Vec::new(), level);
    encoder
        .write_all(bytes)
        .and_then(|_| encoder.finish())
        .map_err(|e| Err::CodecError {
            stream: name,
            source: e,
        })
}

fn bytes_of_u16(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_of_u32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_of_f32(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn bytes_of_i8(values: &[i8]) -> Vec<u8> {
    values.iter().map(|&v| v as u8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::model::{EntityParams, PrimitiveParams};
    use crate::tiler;
    use glam::{Mat4, Vec3};
    use std::io::Read;

    fn inflate(bytes: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        flate2::read::ZlibDecoder::new(bytes)
            .read_to_end(&mut out)
            .unwrap();
        out
    }

    fn two_entity_model() -> Model {
        let mut model = Model::new();
        for (name, x) in [("west", 0.0f32), ("east", 500.0)] {
            let positions = vec![x, 0.0, 0.0, x + 1.0, 0.0, 0.0, x, 1.0, 0.0];
            let normals = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
            let primitive_id = format!("{}-geom", name);
            model
                .create_primitive(PrimitiveParams {
                    id: &primitive_id,
                    reused: false,
                    modeling_matrix: Mat4::IDENTITY,
                    color: [1, 2, 3],
                    opacity: 0.5,
                    positions,
                    normals: &normals,
                    indices: vec![0, 1, 2],
                })
                .unwrap();
            model
                .create_entity(EntityParams {
                    id: name,
                    matrix: Mat4::from_translation(Vec3::ZERO),
                    primitive_ids: &[&primitive_id],
                    has_reused_primitives: false,
                })
                .unwrap();
        }
        tiler::build_tiles(&mut model, &tiler::Config::default()).unwrap();
        model
    }

    #[test]
    fn encoding_is_deterministic() {
        let model = two_entity_model();
        let a = encode(&model, &Config::default()).unwrap();
        let b = encode(&model, &Config::default()).unwrap();
        assert_eq!(a.to_bytes(), b.to_bytes());
    }

    #[test]
    fn entity_ids_are_written_in_tile_order() {
        let model = two_entity_model();
        let package = encode(&model, &Config::default()).unwrap();
        let ids: Vec<String> =
            serde_json::from_slice(&inflate(&package.streams()[stream::EACH_ENTITY_ID])).unwrap();

        let mut expected = Vec::new();
        for tile in model.tiles() {
            for &entity_index in &tile.entities {
                expected.push(model.entity(entity_index).id.clone());
            }
        }
        assert_eq!(ids, expected);
    }

    #[test]
    fn untiled_model_with_instances_is_rejected() {
        let mut model = Model::new();
        let normals = vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
        model
            .create_primitive(PrimitiveParams {
                id: "p",
                reused: false,
                modeling_matrix: Mat4::IDENTITY,
                color: [0, 0, 0],
                opacity: 1.0,
                positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
                normals: &normals,
                indices: vec![0, 1, 2],
            })
            .unwrap();
        model
            .create_entity(EntityParams {
                id: "e",
                matrix: Mat4::IDENTITY,
                primitive_ids: &["p"],
                has_reused_primitives: false,
            })
            .unwrap();

        assert!(matches!(
            encode(&model, &Config::default()),
            Result::Err(Err::TilesNotBuilt)
        ));
    }

    #[test]
    fn color_and_opacity_pack_four_bytes_per_primitive() {
        let model = two_entity_model();
        let package = encode(&model, &Config::default()).unwrap();
        let colors = inflate(&package.streams()[stream::EACH_PRIMITIVE_COLOR_AND_OPACITY]);
        assert_eq!(colors, vec![1, 2, 3, 128, 1, 2, 3, 128]);
    }
}
