//! Synthetic calibrated scenes with exact segment projections.

use nalgebra::{Matrix3, Vector3};

pub const FOCAL: f64 = 500.0;
pub const IMAGE_SIZE: u32 = 500;

pub fn intrinsics() -> Matrix3<f64> {
    Matrix3::new(FOCAL, 0.0, 250.0, 0.0, FOCAL, 250.0, 0.0, 0.0, 1.0)
}

/// Pose of a camera at `center` looking at the world origin (world y is up).
pub fn look_at_origin(center: Vector3<f64>) -> (Matrix3<f64>, Vector3<f64>) {
    let forward = (-center).normalize();
    let up = Vector3::new(0.0, 1.0, 0.0);
    let right = up.cross(&forward).normalize();
    let down = forward.cross(&right);
    let r = Matrix3::from_rows(&[right.transpose(), down.transpose(), forward.transpose()]);
    (r, -r * center)
}

pub fn project(
    k: &Matrix3<f64>,
    r: &Matrix3<f64>,
    t: &Vector3<f64>,
    x: &Vector3<f64>,
) -> [f64; 2] {
    let p = k * (r * x + t);
    [p.x / p.z, p.y / p.z]
}

#[derive(Clone, Debug)]
pub struct SyntheticView {
    pub cam_id: u32,
    pub r: Matrix3<f64>,
    pub t: Vector3<f64>,
    pub segments: Vec<[f64; 4]>,
}

/// Unit cube centered at the origin, tilted so that no edge is parallel to
/// any baseline of a horizontal camera ring: 12 edges as 3D endpoint pairs.
pub fn cube_edges() -> Vec<(Vector3<f64>, Vector3<f64>)> {
    let tilt = line3d_recon::geometry::rotation_from_rpy(0.35, 0.25, 0.15);
    let corner = |i: usize| {
        tilt * Vector3::new(
            if i & 1 == 0 { -0.5 } else { 0.5 },
            if i & 2 == 0 { -0.5 } else { 0.5 },
            if i & 4 == 0 { -0.5 } else { 0.5 },
        )
    };
    let pairs = [
        (0, 1), (2, 3), (4, 5), (6, 7), // along x
        (0, 2), (1, 3), (4, 6), (5, 7), // along y
        (0, 4), (1, 5), (2, 6), (3, 7), // along z
    ];
    pairs.iter().map(|&(a, b)| (corner(a), corner(b))).collect()
}

/// Cameras on a horizontal circle of the given radius looking at the origin,
/// each observing the exact pixel projections of the given 3D segments.
/// Segment index equals the 3D segment index in every view.
pub fn ring_views(
    num_cameras: usize,
    radius: f64,
    segments3d: &[(Vector3<f64>, Vector3<f64>)],
) -> Vec<SyntheticView> {
    let k = intrinsics();
    (0..num_cameras)
        .map(|i| {
            let angle = 2.0 * std::f64::consts::PI * i as f64 / num_cameras as f64;
            let center = Vector3::new(radius * angle.sin(), 0.0, -radius * angle.cos());
            let (r, t) = look_at_origin(center);
            let segments = segments3d
                .iter()
                .map(|(p1, p2)| {
                    let a = project(&k, &r, &t, p1);
                    let b = project(&k, &r, &t, p2);
                    [a[0], a[1], b[0], b[1]]
                })
                .collect();
            SyntheticView {
                cam_id: i as u32,
                r,
                t,
                segments,
            }
        })
        .collect()
}

/// Index of the candidate whose (unordered) endpoint pair matches the
/// segment within `tol`.
pub fn find_matching_segment(
    p1: &Vector3<f64>,
    p2: &Vector3<f64>,
    candidates: &[(Vector3<f64>, Vector3<f64>)],
    tol: f64,
) -> Option<usize> {
    candidates.iter().position(|(a, b)| {
        let forward = (p1 - a).norm() < tol && (p2 - b).norm() < tol;
        let reverse = (p1 - b).norm() < tol && (p2 - a).norm() < tol;
        forward || reverse
    })
}
