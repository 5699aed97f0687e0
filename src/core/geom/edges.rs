use std::collections::HashMap;

use glam::Vec3;

/// Dihedral-angle threshold (degrees) below which a shared edge is
/// considered smooth and skipped.
pub const DEFAULT_EDGE_THRESHOLD_DEG: f32 = 10.0;

/// Incident triangles of one undirected edge. Non-manifold edges keep the
/// first two incident triangles; further ones do not change the verdict.
struct EdgeUse {
    first_tri: usize,
    second_tri: Option<usize>,
}

/// Extracts a line-index list for wireframe display from a triangle mesh.
///
/// Every boundary edge (one incident triangle) is emitted. An interior edge
/// is emitted iff the angle between its two incident triangle normals
/// exceeds `threshold_deg`. Output is deterministic: edges appear in
/// triangle-scan order at their first encounter, smaller vertex index first.
pub fn build_edge_indices(positions: &[f32], indices: &[u32], threshold_deg: f32) -> Vec<u32> {
    let cos_threshold = threshold_deg.to_radians().cos();

    let normals: Vec<Vec3> = indices
        .chunks_exact(3)
        .map(|tri| triangle_normal(positions, tri))
        .collect();

    let mut uses: HashMap<(u32, u32), EdgeUse> = HashMap::new();
    for (tri, corners) in indices.chunks_exact(3).enumerate() {
        for (a, b) in triangle_edges(corners) {
            if a == b {
                continue;
            }
            uses.entry((a, b))
                .and_modify(|u| {
                    if u.second_tri.is_none() && u.first_tri != tri {
                        u.second_tri = Some(tri);
                    }
                })
                .or_insert(EdgeUse {
                    first_tri: tri,
                    second_tri: None,
                });
        }
    }

    // Second scan decides each edge at its first encounter, which pins the
    // output order to the triangle order regardless of map iteration.
    let mut out = Vec::new();
    for (tri, corners) in indices.chunks_exact(3).enumerate() {
        for (a, b) in triangle_edges(corners) {
            if a == b {
                continue;
            }
            let edge_use = &uses[&(a, b)];
            if edge_use.first_tri != tri {
                continue;
            }
            let emit = match edge_use.second_tri {
                None => true,
                Some(other) => is_crease(normals[tri], normals[other], cos_threshold),
            };
            if emit {
                out.push(a);
                out.push(b);
            }
        }
    }
    out
}

fn triangle_edges(corners: &[u32]) -> [(u32, u32); 3] {
    let edge = |a: u32, b: u32| if a < b { (a, b) } else { (b, a) };
    [
        edge(corners[0], corners[1]),
        edge(corners[1], corners[2]),
        edge(corners[2], corners[0]),
    ]
}

fn triangle_normal(positions: &[f32], tri: &[u32]) -> Vec3 {
    let v = |i: u32| {
        let i = i as usize * 3;
        Vec3::new(positions[i], positions[i + 1], positions[i + 2])
    };
    (v(tri[1]) - v(tri[0])).cross(v(tri[2]) - v(tri[0]))
}

fn is_crease(n0: Vec3, n1: Vec3, cos_threshold: f32) -> bool {
    let l0 = n0.length();
    let l1 = n1.length();
    if l0 == 0.0 || l1 == 0.0 {
        // Degenerate triangle, no usable dihedral.
        return false;
    }
    n0.dot(n1) / (l0 * l1) < cos_threshold
}
