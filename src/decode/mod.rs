//! The inverse of [`crate::encode`]: decompresses the element streams of a
//! package, slices them back into per-primitive / per-entity / per-tile
//! views through the portion arrays, and replays the model against a
//! [`SceneBuilder`]. Nothing is constructed on a fatal error.

mod views;

use std::collections::HashMap;
use std::io::Read;

use flate2::read::ZlibDecoder;
use glam::Mat4;
use thiserror::Error;

use crate::core::package::{self, stream, Package, FORMAT_VERSION, STREAM_NAMES};
use crate::scene::{
    EntityParams, GeometryParams, MeshParams, MeshSource, SceneBuilder, Topology,
};
use views::typed_view;

#[remain::sorted]
#[derive(Error, Debug)]
pub enum Err {
    #[error("stream {stream} is malformed: {detail}")]
    CodecError {
        stream: &'static str,
        detail: String,
    },
    #[error("package envelope error: {0}")]
    Envelope(#[from] package::Err),
    #[error("package format version {found} is not supported (expected {FORMAT_VERSION})")]
    FormatVersionMismatch { found: u32 },
    #[error("stream has ragged length: {0}")]
    View(#[from] views::Err),
}

fn codec_err(stream: &'static str, detail: impl Into<String>) -> Err {
    Err::CodecError {
        stream,
        detail: detail.into(),
    }
}

/// Parses a v6 package, driving `builder` with one `create_geometry` per
/// instanced primitive (deduplicated across the whole file), one
/// `create_mesh` per primitive use, and one `create_entity` per entity
/// that materialized at least one mesh.
pub fn parse<B: SceneBuilder>(package: &Package, builder: &mut B) -> Result<(), Err> {
    if package.version() != FORMAT_VERSION {
        return Err(Err::FormatVersionMismatch {
            found: package.version(),
        });
    }

    let raw = inflate_streams(package)?;

    let positions = typed_view::<u16>(&raw[stream::POSITIONS], STREAM_NAMES[stream::POSITIONS])?;
    let normals = typed_view::<i8>(&raw[stream::NORMALS], STREAM_NAMES[stream::NORMALS])?;
    let indices = typed_view::<u32>(&raw[stream::INDICES], STREAM_NAMES[stream::INDICES])?;
    let edge_indices = typed_view::<u32>(
        &raw[stream::EDGE_INDICES],
        STREAM_NAMES[stream::EDGE_INDICES],
    )?;
    let matrices = typed_view::<f32>(&raw[stream::MATRICES], STREAM_NAMES[stream::MATRICES])?;
    let instanced_decode = typed_view::<f32>(
        &raw[stream::INSTANCED_PRIMITIVES_DECODE_MATRIX],
        STREAM_NAMES[stream::INSTANCED_PRIMITIVES_DECODE_MATRIX],
    )?;
    let positions_and_normals_portions = typed_view::<u32>(
        &raw[stream::EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION],
        STREAM_NAMES[stream::EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION],
    )?;
    let indices_portions = typed_view::<u32>(
        &raw[stream::EACH_PRIMITIVE_INDICES_PORTION],
        STREAM_NAMES[stream::EACH_PRIMITIVE_INDICES_PORTION],
    )?;
    let edge_indices_portions = typed_view::<u32>(
        &raw[stream::EACH_PRIMITIVE_EDGE_INDICES_PORTION],
        STREAM_NAMES[stream::EACH_PRIMITIVE_EDGE_INDICES_PORTION],
    )?;
    let colors = &raw[stream::EACH_PRIMITIVE_COLOR_AND_OPACITY];
    let primitive_instances = typed_view::<u32>(
        &raw[stream::PRIMITIVE_INSTANCES],
        STREAM_NAMES[stream::PRIMITIVE_INSTANCES],
    )?;
    let entity_ids: Vec<String> = serde_json::from_slice(&raw[stream::EACH_ENTITY_ID])
        .map_err(|e| codec_err(STREAM_NAMES[stream::EACH_ENTITY_ID], e.to_string()))?;
    let instances_portions = typed_view::<u32>(
        &raw[stream::EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION],
        STREAM_NAMES[stream::EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION],
    )?;
    let matrices_portions = typed_view::<u32>(
        &raw[stream::EACH_ENTITY_MATRICES_PORTION],
        STREAM_NAMES[stream::EACH_ENTITY_MATRICES_PORTION],
    )?;
    let tile_aabbs = typed_view::<f32>(
        &raw[stream::EACH_TILE_AABB],
        STREAM_NAMES[stream::EACH_TILE_AABB],
    )?;
    let tile_decode_matrices = typed_view::<f32>(
        &raw[stream::EACH_TILE_DECODE_MATRIX],
        STREAM_NAMES[stream::EACH_TILE_DECODE_MATRIX],
    )?;
    let tile_entities_portions = typed_view::<u32>(
        &raw[stream::EACH_TILE_ENTITIES_PORTION],
        STREAM_NAMES[stream::EACH_TILE_ENTITIES_PORTION],
    )?;

    // Cross-stream shape checks before anything is materialized.
    if colors.len() % 4 != 0 {
        return Err(codec_err(
            STREAM_NAMES[stream::EACH_PRIMITIVE_COLOR_AND_OPACITY],
            format!("length {} is not a multiple of 4", colors.len()),
        ));
    }
    let num_primitives = colors.len() / 4;
    for (portions, ordinal) in [
        (
            &positions_and_normals_portions,
            stream::EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION,
        ),
        (&indices_portions, stream::EACH_PRIMITIVE_INDICES_PORTION),
        (
            &edge_indices_portions,
            stream::EACH_PRIMITIVE_EDGE_INDICES_PORTION,
        ),
    ] {
        if portions.len() != num_primitives {
            return Err(codec_err(
                STREAM_NAMES[ordinal],
                format!("{} entries for {} primitives", portions.len(), num_primitives),
            ));
        }
    }

    if tile_aabbs.len() % 6 != 0 || tile_decode_matrices.len() % 16 != 0 {
        return Err(codec_err(
            STREAM_NAMES[stream::EACH_TILE_AABB],
            "ragged tile array".to_owned(),
        ));
    }
    let num_tiles = tile_aabbs.len() / 6;
    if tile_decode_matrices.len() / 16 != num_tiles || tile_entities_portions.len() != num_tiles {
        return Err(codec_err(
            STREAM_NAMES[stream::EACH_TILE_ENTITIES_PORTION],
            format!("inconsistent tile counts (aabbs say {})", num_tiles),
        ));
    }

    let num_entities = entity_ids.len();
    if instances_portions.len() != num_entities || matrices_portions.len() != num_entities {
        return Err(codec_err(
            STREAM_NAMES[stream::EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION],
            format!("portion arrays disagree with {} entity ids", num_entities),
        ));
    }

    if instanced_decode.len() != 16 {
        return Err(codec_err(
            STREAM_NAMES[stream::INSTANCED_PRIMITIVES_DECODE_MATRIX],
            format!("expected 16 floats, found {}", instanced_decode.len()),
        ));
    }
    let instanced_decode_matrix = Mat4::from_cols_slice(&instanced_decode);

    // Instanced primitives are the ones used more than once.
    let mut instance_counts = vec![0u32; num_primitives];
    for &primitive in primitive_instances.iter() {
        let slot = instance_counts.get_mut(primitive as usize).ok_or_else(|| {
            codec_err(
                STREAM_NAMES[stream::PRIMITIVE_INSTANCES],
                format!("primitive index {} out of range ({})", primitive, num_primitives),
            )
        })?;
        *slot += 1;
    }

    log::debug!(
        "parsing package: {} primitives, {} instances, {} entities, {} tiles",
        num_primitives,
        primitive_instances.len(),
        num_entities,
        num_tiles
    );

    let mut geometries: HashMap<u32, u64> = HashMap::new();
    let mut next_geometry_id: u64 = 0;
    let mut next_mesh_id: u64 = 0;
    let mut mesh_ids: Vec<u64> = Vec::new();

    for tile_index in 0..num_tiles {
        let tile_decode_matrix =
            Mat4::from_cols_slice(&tile_decode_matrices[tile_index * 16..tile_index * 16 + 16]);

        let entity_range = portion_range(
            &tile_entities_portions,
            tile_index,
            num_entities,
            STREAM_NAMES[stream::EACH_TILE_ENTITIES_PORTION],
        )?;

        for entity_index in entity_range {
            let matrix_offset = matrices_portions[entity_index] as usize;
            if matrix_offset + 16 > matrices.len() {
                return Err(codec_err(
                    STREAM_NAMES[stream::EACH_ENTITY_MATRICES_PORTION],
                    format!("matrix offset {} past {} floats", matrix_offset, matrices.len()),
                ));
            }
            let entity_matrix =
                Mat4::from_cols_slice(&matrices[matrix_offset..matrix_offset + 16]);

            let instance_range = portion_range(
                &instances_portions,
                entity_index,
                primitive_instances.len(),
                STREAM_NAMES[stream::EACH_ENTITY_PRIMITIVE_INSTANCES_PORTION],
            )?;

            mesh_ids.clear();
            for instance_index in instance_range {
                let primitive = primitive_instances[instance_index];
                let vertex_range = portion_range(
                    &positions_and_normals_portions,
                    primitive as usize,
                    positions.len() / 3,
                    STREAM_NAMES[stream::EACH_PRIMITIVE_POSITIONS_AND_NORMALS_PORTION],
                )?;
                let primitive_positions = slice_checked(
                    &positions,
                    vertex_range.start * 3..vertex_range.end * 3,
                    STREAM_NAMES[stream::POSITIONS],
                )?;
                let primitive_normals = slice_checked(
                    &normals,
                    vertex_range.start * 2..vertex_range.end * 2,
                    STREAM_NAMES[stream::NORMALS],
                )?;
                let primitive_indices = slice_checked(
                    &indices,
                    portion_range(
                        &indices_portions,
                        primitive as usize,
                        indices.len(),
                        STREAM_NAMES[stream::EACH_PRIMITIVE_INDICES_PORTION],
                    )?,
                    STREAM_NAMES[stream::INDICES],
                )?;
                let primitive_edge_indices = slice_checked(
                    &edge_indices,
                    portion_range(
                        &edge_indices_portions,
                        primitive as usize,
                        edge_indices.len(),
                        STREAM_NAMES[stream::EACH_PRIMITIVE_EDGE_INDICES_PORTION],
                    )?,
                    STREAM_NAMES[stream::EDGE_INDICES],
                )?;
                let color_and_opacity = &colors[primitive as usize * 4..primitive as usize * 4 + 4];
                let color = [color_and_opacity[0], color_and_opacity[1], color_and_opacity[2]];
                let opacity = color_and_opacity[3];

                let mesh_id = next_mesh_id;
                next_mesh_id += 1;

                if instance_counts[primitive as usize] > 1 {
                    let geometry_id = match geometries.get(&primitive) {
                        Some(&id) => id,
                        None => {
                            let id = next_geometry_id;
                            next_geometry_id += 1;
                            geometries.insert(primitive, id);
                            builder.create_geometry(GeometryParams {
                                id,
                                topology: Topology::Triangles,
                                positions: primitive_positions,
                                normals: primitive_normals,
                                indices: primitive_indices,
                                edge_indices: primitive_edge_indices,
                                positions_decode_matrix: instanced_decode_matrix,
                            });
                            id
                        }
                    };
                    builder.create_mesh(MeshParams {
                        id: mesh_id,
                        source: MeshSource::Instanced {
                            geometry_id,
                            matrix: entity_matrix,
                        },
                        color,
                        opacity,
                    });
                } else {
                    // Single-use geometry is world-space; the entity matrix
                    // was baked in at build time and must not be reapplied.
                    builder.create_mesh(MeshParams {
                        id: mesh_id,
                        source: MeshSource::SelfContained {
                            topology: Topology::Triangles,
                            positions: primitive_positions,
                            normals: primitive_normals,
                            indices: primitive_indices,
                            edge_indices: primitive_edge_indices,
                            positions_decode_matrix: tile_decode_matrix,
                        },
                        color,
                        opacity,
                    });
                }
                mesh_ids.push(mesh_id);
            }

            if mesh_ids.is_empty() {
                continue;
            }
            builder.create_entity(EntityParams {
                id: &entity_ids[entity_index],
                is_object: true,
                mesh_ids: &mesh_ids,
            });
        }
    }

    Ok(())
}

fn inflate_streams(package: &Package) -> Result<Vec<Vec<u8>>, Err> {
    package
        .streams()
        .iter()
        .enumerate()
        .map(|(ordinal, blob)| {
            let mut out = Vec::new();
            ZlibDecoder::new(blob.as_slice())
                .read_to_end(&mut out)
                .map_err(|e| codec_err(STREAM_NAMES[ordinal], e.to_string()))?;
            Ok(out)
        })
        .collect()
}

/// Resolves entry `i` of a left-closed portion array into an element range;
/// the end is the next portion or `total` for the last entry.
fn portion_range(
    portions: &[u32],
    i: usize,
    total: usize,
    stream: &'static str,
) -> Result<std::ops::Range<usize>, Err> {
    let start = portions[i] as usize;
    let end = match portions.get(i + 1) {
        Some(&next) => next as usize,
        None => total,
    };
    if start > end || end > total {
        return Err(codec_err(
            stream,
            format!("portion {} spans {}..{} of {} elements", i, start, end, total),
        ));
    }
    Ok(start..end)
}

fn slice_checked<'a, T>(
    values: &'a [T],
    range: std::ops::Range<usize>,
    stream: &'static str,
) -> Result<&'a [T], Err> {
    values.get(range.clone()).ok_or_else(|| {
        codec_err(
            stream,
            format!("slice {}..{} past {} elements", range.start, range.end, values.len()),
        )
    })
}
