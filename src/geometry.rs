//! Geometric primitives for multi-view line matching.
//!
//! Everything here is pure math over pixel coordinates (homogeneous
//! `Vector3` with w = 1), normalized camera rays and 3D segments. Camera
//! state lives in [`crate::view::View`]; the epipolar cache in the engine.

use crate::types::Segment3D;
use nalgebra::{Matrix3, Rotation3, Vector3};

/// Threshold below which homogeneous scales, ray/plane denominators and
/// segment lengths are treated as degenerate.
pub const EPS: f64 = 1e-12;

/// Cross-product (skew-symmetric) matrix of `t`.
pub fn skew(t: &Vector3<f64>) -> Matrix3<f64> {
    Matrix3::new(0.0, -t.z, t.y, t.z, 0.0, -t.x, -t.y, t.x, 0.0)
}

/// Fundamental matrix mapping pixels of the source view to epipolar lines in
/// the target view, from the two calibrated poses.
///
/// With the relative pose `R = R_t R_sᵀ`, `t = t_t − R t_s` this is
/// `F = K_tᵀ⁻¹ [t]× R K_s⁻¹`.
pub fn fundamental_from_poses(
    k_src: &Matrix3<f64>,
    r_src: &Matrix3<f64>,
    t_src: &Vector3<f64>,
    k_tgt: &Matrix3<f64>,
    r_tgt: &Matrix3<f64>,
    t_tgt: &Vector3<f64>,
) -> Matrix3<f64> {
    let r = r_tgt * r_src.transpose();
    let t = t_tgt - r * t_src;
    let e = skew(&t) * r;
    let k_tgt_tinv = k_tgt
        .transpose()
        .try_inverse()
        .unwrap_or_else(Matrix3::identity);
    let k_src_inv = k_src.try_inverse().unwrap_or_else(Matrix3::identity);
    k_tgt_tinv * e * k_src_inv
}

/// Rotation matrix `Rz(yaw) · Ry(pitch) · Rx(roll)` from Euler angles in
/// radians.
pub fn rotation_from_rpy(roll: f64, pitch: f64, yaw: f64) -> Matrix3<f64> {
    *Rotation3::from_euler_angles(roll, pitch, yaw).matrix()
}

/// True when `x` lies within the span of the segment `(p1, p2)` along their
/// common line (tested by the sign of the projected endpoint vectors).
pub fn point_on_segment(x: &Vector3<f64>, p1: &Vector3<f64>, p2: &Vector3<f64>) -> bool {
    let v1 = nalgebra::Vector2::new(p1.x - x.x, p1.y - x.y);
    let v2 = nalgebra::Vector2::new(p2.x - x.x, p2.y - x.y);
    v1.dot(&v2) < EPS
}

/// Mutual overlap score of two collinear intervals `(p1, p2)` and `(q1, q2)`
/// on a shared line: inner-pair distance over outer-pair distance, or 0 when
/// the intervals do not overlap or the outer span is shorter than one unit.
///
/// All four points must be given with homogeneous scale 1.
pub fn mutual_overlap(points: &[Vector3<f64>; 4]) -> f64 {
    let [p1, p2, q1, q2] = points;

    if !(point_on_segment(p1, q1, q2)
        || point_on_segment(p2, q1, q2)
        || point_on_segment(q1, p1, p2)
        || point_on_segment(q2, p1, p2))
    {
        return 0.0;
    }

    // The two points realizing the largest pairwise distance are the outer
    // pair; the remaining two are the inner pair.
    let mut max_dist = 0.0;
    let mut outer = (0usize, 3usize);
    for i in 0..3 {
        for j in (i + 1)..4 {
            let dist = (points[i] - points[j]).norm();
            if dist > max_dist {
                max_dist = dist;
                outer = (i, j);
            }
        }
    }

    if max_dist < 1.0 {
        return 0.0;
    }

    let inner: Vec<usize> = (0..4).filter(|&i| i != outer.0 && i != outer.1).collect();
    (points[inner[0]] - points[inner[1]]).norm() / max_dist
}

/// Depths of the source endpoints obtained by intersecting their rays with
/// the plane spanned by the target camera center and the target segment.
///
/// `None` when the plane is degenerate or a ray is (near) parallel to it.
pub fn triangulation_depths(
    c_src: &Vector3<f64>,
    ray_p1: &Vector3<f64>,
    ray_p2: &Vector3<f64>,
    c_tgt: &Vector3<f64>,
    ray_q1: &Vector3<f64>,
    ray_q2: &Vector3<f64>,
) -> Option<(f64, f64)> {
    let mut n = ray_q1.cross(ray_q2);
    let norm = n.norm();
    if norm < EPS {
        return None;
    }
    n /= norm;

    let denom1 = ray_p1.dot(&n);
    let denom2 = ray_p2.dot(&n);
    if denom1.abs() < EPS || denom2.abs() < EPS {
        return None;
    }

    let offset = c_tgt.dot(&n) - c_src.dot(&n);
    Some((offset / denom1, offset / denom2))
}

/// Angle between two 3D segments in degrees; folded into [0, 90] when
/// `undirected`.
pub fn angle_between_segments(s1: &Segment3D, s2: &Segment3D, undirected: bool) -> f64 {
    let dot = s1.dir().dot(&s2.dir()).clamp(-1.0, 1.0);
    let mut angle = dot.acos().to_degrees();
    if undirected && angle > 90.0 {
        angle = 180.0 - angle;
    }
    angle
}

/// Normalized 2D line `ax + by + c = 0` (with `a² + b² = 1`) through two
/// pixel points.
pub fn line_through(p1: &[f64; 2], p2: &[f64; 2]) -> Vector3<f64> {
    let a = p2[1] - p1[1];
    let b = p1[0] - p2[0];
    let c = p2[0] * p1[1] - p1[0] * p2[1];
    let norm = (a * a + b * b).sqrt().max(EPS);
    Vector3::new(a / norm, b / norm, c / norm)
}

/// Unsigned distance of a pixel point to a normalized 2D line.
pub fn line_point_distance(line: &Vector3<f64>, p: &[f64; 2]) -> f64 {
    (line.x * p[0] + line.y * p[1] + line.z).abs()
}
