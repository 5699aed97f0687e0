pub mod edges;

use glam::{Mat4, Vec3};
use thiserror::Error;

/// Number of distinct values per axis of a quantized position.
pub(crate) const QUANTIZATION_RANGE: f32 = 65535.0;

/// Magnitude of a signed oct-encoded normal component.
pub(crate) const OCT_RANGE: f32 = 127.0;

#[remain::sorted]
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Err {
    #[error("position component {value} on axis {axis} lies outside the quantization box [{min}, {max}] by more than one step")]
    QuantizationOverflow {
        axis: usize,
        value: f32,
        min: f32,
        max: f32,
    },
}

/// World- or object-space axis-aligned bounding box.
///
/// The empty box is inverted (`min = +inf`, `max = -inf`) so that expanding
/// it with the first point collapses onto that point. An empty box compares
/// as contained in every box, including another empty one.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub const EMPTY: Self = Self {
        min: Vec3::INFINITY,
        max: Vec3::NEG_INFINITY,
    };

    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self { min, max }
    }

    pub fn is_empty(&self) -> bool {
        self.min.x > self.max.x
    }

    pub fn expand_point(&mut self, p: Vec3) {
        self.min = self.min.min(p);
        self.max = self.max.max(p);
    }

    pub fn expand_aabb(&mut self, other: &Aabb) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    /// Expands by every `(x, y, z)` triple of a flat coordinate slice.
    pub fn expand_positions(&mut self, positions: &[f32]) {
        for p in positions.chunks_exact(3) {
            self.expand_point(Vec3::new(p[0], p[1], p[2]));
        }
    }

    /// True when `other` fits entirely inside `self`. Written so that an
    /// empty `other` is vacuously contained.
    pub fn contains_aabb(&self, other: &Aabb) -> bool {
        other.min.x >= self.min.x
            && other.min.y >= self.min.y
            && other.min.z >= self.min.z
            && other.max.x <= self.max.x
            && other.max.y <= self.max.y
            && other.max.z <= self.max.z
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    /// Index of the longest axis; ties resolve to the lower index (x < y < z).
    pub fn longest_axis(&self) -> usize {
        let size = self.max - self.min;
        let mut axis = 0;
        if size.y > size[axis] {
            axis = 1;
        }
        if size.z > size[axis] {
            axis = 2;
        }
        axis
    }

    /// Splits in half along `axis`, returning the low and high halves.
    pub fn split(&self, axis: usize) -> (Aabb, Aabb) {
        let mid = (self.min[axis] + self.max[axis]) * 0.5;
        let mut lo = *self;
        let mut hi = *self;
        lo.max[axis] = mid;
        hi.min[axis] = mid;
        (lo, hi)
    }

    /// Wire order: `(xmin, ymin, zmin, xmax, ymax, zmax)`.
    pub fn to_array(&self) -> [f32; 6] {
        [
            self.min.x, self.min.y, self.min.z, self.max.x, self.max.y, self.max.z,
        ]
    }

    pub fn from_array(v: [f32; 6]) -> Self {
        Self {
            min: Vec3::new(v[0], v[1], v[2]),
            max: Vec3::new(v[3], v[4], v[5]),
        }
    }
}

fn sign_not_zero(x: f32) -> f32 {
    if x < 0.0 {
        -1.0
    } else {
        1.0
    }
}

/// Oct-encodes a unit normal into a signed 8-bit pair in `-127..=127`.
///
/// The octahedral projection maps the upper hemisphere onto the unit
/// diamond and folds the lower hemisphere outward over its edges.
/// Quantization rounds ties away from zero (`f32::round`), which keeps the
/// poles exact: `(0, 0, 1)` encodes as `[0, 0]` and `(0, 0, -1)` as
/// `[127, 127]`.
pub fn oct_encode(n: Vec3) -> [i8; 2] {
    let abs_sum = n.x.abs() + n.y.abs() + n.z.abs();
    let mut u = n.x / abs_sum;
    let mut v = n.y / abs_sum;

    if n.z < 0.0 {
        let (prev_u, prev_v) = (u, v);
        u = (1.0 - prev_v.abs()) * sign_not_zero(prev_u);
        v = (1.0 - prev_u.abs()) * sign_not_zero(prev_v);
    }

    [
        (u * OCT_RANGE).round().clamp(-OCT_RANGE, OCT_RANGE) as i8,
        (v * OCT_RANGE).round().clamp(-OCT_RANGE, OCT_RANGE) as i8,
    ]
}

/// Inverse of [`oct_encode`]. The result is always unit length.
pub fn oct_decode(oct: [i8; 2]) -> Vec3 {
    let u = oct[0] as f32 / OCT_RANGE;
    let v = oct[1] as f32 / OCT_RANGE;

    let mut x = u;
    let mut y = v;
    let z = 1.0 - u.abs() - v.abs();

    if z < 0.0 {
        x = (1.0 - v.abs()) * sign_not_zero(u);
        y = (1.0 - u.abs()) * sign_not_zero(v);
    }

    Vec3::new(x, y, z).normalize()
}

/// Quantizes `(x, y, z)` float triples to 16-bit triples relative to `aabb`.
///
/// A coordinate may exceed the box by at most one quantization step (float
/// slop from upstream transforms); anything further out means the caller
/// quantized against the wrong box and is reported as
/// [`Err::QuantizationOverflow`]. Axes with zero extent quantize to 0.
pub fn quantize_positions(positions: &[f32], aabb: &Aabb) -> Result<Vec<u16>, Err> {
    let min = aabb.min.to_array();
    let range = (aabb.max - aabb.min).to_array();

    let mut out = Vec::with_capacity(positions.len());
    for p in positions.chunks_exact(3) {
        for axis in 0..3 {
            let value = p[axis];
            let step = range[axis] / QUANTIZATION_RANGE;
            if value < min[axis] - step || value > min[axis] + range[axis] + step {
                return Err(Err::QuantizationOverflow {
                    axis,
                    value,
                    min: min[axis],
                    max: min[axis] + range[axis],
                });
            }
            let q = if range[axis] > 0.0 {
                ((value - min[axis]) / range[axis] * QUANTIZATION_RANGE)
                    .round()
                    .clamp(0.0, QUANTIZATION_RANGE)
            } else {
                0.0
            };
            out.push(q as u16);
        }
    }
    Ok(out)
}

/// The affine map sending quantized 16-bit coordinates back to the space
/// they were quantized in: scale `(max - min) / 65535`, translation `min`.
///
/// Always derive this from the same box passed to [`quantize_positions`];
/// the round trip is then exact to within one step per axis.
pub fn positions_decode_matrix(aabb: &Aabb) -> Mat4 {
    let scale = (aabb.max - aabb.min) / QUANTIZATION_RANGE;
    Mat4::from_translation(aabb.min) * Mat4::from_scale(scale)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn angle_deg(a: Vec3, b: Vec3) -> f32 {
        a.dot(b).clamp(-1.0, 1.0).acos().to_degrees()
    }

    #[test]
    fn oct_round_trip_within_two_degrees() {
        let dirs = vec![
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(1.0, 1.0, 1.0),
            Vec3::new(-1.0, -1.0, -1.0),
            Vec3::new(1.0, -1.0, 1.0),
            Vec3::new(-1.0, 1.0, -1.0),
            Vec3::new(0.3, -0.8, 0.52),
            Vec3::new(-0.1, 0.02, -0.99),
            Vec3::new(0.7071, 0.7071, 0.0),
        ];
        for dir in dirs {
            let n = dir.normalize();
            let decoded = oct_decode(oct_encode(n));
            assert!(
                (decoded.length() - 1.0).abs() < 1e-6,
                "decoded normal is not unit length: {:?}",
                decoded
            );
            let err = angle_deg(n, decoded);
            assert!(err <= 2.0, "angular error {}° too large for {:?}", err, n);
        }
    }

    #[test]
    fn oct_poles_round_trip_stably() {
        for pole in [Vec3::Z, Vec3::NEG_Z] {
            let decoded = oct_decode(oct_encode(pole));
            let err = angle_deg(pole, decoded);
            assert!(err <= 0.5, "pole {:?} drifted by {}°", pole, err);
        }
        assert_eq!(oct_encode(Vec3::Z), [0, 0]);
        assert_eq!(oct_encode(Vec3::NEG_Z), [127, 127]);
    }

    #[test]
    fn quantize_round_trip_within_one_step() {
        let aabb = Aabb::new(Vec3::new(-2.0, 0.0, 10.0), Vec3::new(3.0, 4.0, 11.5));
        let positions = [-2.0, 0.0, 10.0, 3.0, 4.0, 11.5, 0.25, 1.75, 10.75];
        let quantized = quantize_positions(&positions, &aabb).unwrap();
        let decode = positions_decode_matrix(&aabb);
        let step = (aabb.max - aabb.min) / QUANTIZATION_RANGE;

        for (p, q) in positions.chunks_exact(3).zip(quantized.chunks_exact(3)) {
            let world =
                decode.transform_point3(Vec3::new(q[0] as f32, q[1] as f32, q[2] as f32));
            for axis in 0..3 {
                let diff = (world[axis] - p[axis]).abs();
                assert!(
                    diff <= step[axis],
                    "axis {} off by {} (> {})",
                    axis,
                    diff,
                    step[axis]
                );
            }
        }
    }

    #[test]
    fn quantize_rejects_out_of_box_positions() {
        let aabb = Aabb::new(Vec3::ZERO, Vec3::ONE);
        let err = quantize_positions(&[0.5, 0.5, 3.0], &aabb).unwrap_err();
        assert!(matches!(err, Err::QuantizationOverflow { axis: 2, .. }));
    }

    #[test]
    fn quantize_zero_extent_axis() {
        let aabb = Aabb::new(Vec3::new(0.0, 0.0, 5.0), Vec3::new(1.0, 1.0, 5.0));
        let quantized = quantize_positions(&[0.5, 1.0, 5.0], &aabb).unwrap();
        assert_eq!(quantized[2], 0);
        let decode = positions_decode_matrix(&aabb);
        let world = decode.transform_point3(Vec3::new(0.0, 0.0, 0.0));
        assert_eq!(world.z, 5.0);
    }

    #[test]
    fn empty_aabb_is_contained_everywhere() {
        let real = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert!(real.contains_aabb(&Aabb::EMPTY));
        assert!(!Aabb::EMPTY.contains_aabb(&real));
    }

    #[test]
    fn longest_axis_breaks_ties_low() {
        let cube = Aabb::new(Vec3::ZERO, Vec3::ONE);
        assert_eq!(cube.longest_axis(), 0);
        let tall = Aabb::new(Vec3::ZERO, Vec3::new(1.0, 5.0, 5.0));
        assert_eq!(tall.longest_axis(), 1);
    }
}
