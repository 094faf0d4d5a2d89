//! Per-camera view state: calibration, pose, stored 2D segments and the
//! derived quantities used by matching, scoring and the final filters.

use crate::geometry::{self, EPS};
use crate::types::{CameraId, Segment3D};
use nalgebra::{Matrix3, Vector2, Vector3};

/// Fraction of the image diagonal below which a (projected) segment is
/// considered too short to be reliable.
pub const MIN_LINE_LENGTH_FACTOR: f64 = 0.005;

/// 2D line segment stored in a view, in pixel coordinates. Insertion order
/// is stable and defines the segment index.
#[derive(Clone, Copy, Debug)]
pub struct ViewSegment {
    pub p1: [f64; 2],
    pub p2: [f64; 2],
    pub length: f64,
}

impl ViewSegment {
    pub fn new(coords: [f64; 4]) -> Self {
        let dx = coords[0] - coords[2];
        let dy = coords[1] - coords[3];
        Self {
            p1: [coords[0], coords[1]],
            p2: [coords[2], coords[3]],
            length: (dx * dx + dy * dy).sqrt(),
        }
    }

    pub fn coords(&self) -> [f64; 4] {
        [self.p1[0], self.p1[1], self.p2[0], self.p2[1]]
    }
}

/// A calibrated view with its stored 2D segments.
///
/// Immutable after registration except for median-depth bookkeeping, the
/// spatial regularizer and the lazily computed collinearity lists.
#[derive(Clone, Debug)]
pub struct View {
    id: CameraId,
    k: Matrix3<f64>,
    r: Matrix3<f64>,
    t: Vector3<f64>,
    rt_kinv: Matrix3<f64>,
    center: Vector3<f64>,
    pp: Vector2<f64>,
    width: u32,
    height: u32,
    min_line_length: f64,
    segments: Vec<ViewSegment>,
    median_depth: f64,
    median_sigma: f64,
    k_reg: f64,
    collinear: Vec<Vec<u32>>,
}

impl View {
    pub fn new(
        id: CameraId,
        k: Matrix3<f64>,
        r: Matrix3<f64>,
        t: Vector3<f64>,
        width: u32,
        height: u32,
        median_depth: f64,
        segments: Vec<ViewSegment>,
    ) -> Self {
        let kinv = k.try_inverse().unwrap_or_else(Matrix3::identity);
        let rt_kinv = r.transpose() * kinv;
        let center = -r.transpose() * t;
        let pp = Vector2::new(k[(0, 2)], k[(1, 2)]);
        let diagonal = ((width as f64).powi(2) + (height as f64).powi(2)).sqrt();
        let num_segments = segments.len();
        Self {
            id,
            k,
            r,
            t,
            rt_kinv,
            center,
            pp,
            width,
            height,
            min_line_length: diagonal * MIN_LINE_LENGTH_FACTOR,
            segments,
            median_depth: median_depth.max(EPS),
            median_sigma: 0.0,
            k_reg: 0.0,
            collinear: vec![Vec::new(); num_segments],
        }
    }

    pub fn id(&self) -> CameraId {
        self.id
    }

    pub fn k_matrix(&self) -> &Matrix3<f64> {
        &self.k
    }

    pub fn rotation(&self) -> &Matrix3<f64> {
        &self.r
    }

    pub fn translation(&self) -> &Vector3<f64> {
        &self.t
    }

    pub fn center(&self) -> &Vector3<f64> {
        &self.center
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, seg: u32) -> &ViewSegment {
        &self.segments[seg as usize]
    }

    pub fn segments(&self) -> &[ViewSegment] {
        &self.segments
    }

    pub fn median_depth(&self) -> f64 {
        self.median_depth
    }

    pub fn median_sigma(&self) -> f64 {
        self.median_sigma
    }

    /// Spatial regularizer: world-space positional uncertainty per unit
    /// depth.
    pub fn regularizer(&self) -> f64 {
        self.k_reg
    }

    /// Normalized world-space ray through the homogeneous pixel `p`.
    pub fn ray(&self, p: &Vector3<f64>) -> Vector3<f64> {
        (self.rt_kinv * p).normalize()
    }

    /// Normalized ray through one endpoint of a stored segment.
    pub fn segment_ray(&self, seg: u32, first: bool) -> Vector3<f64> {
        let s = &self.segments[seg as usize];
        let p = if first { s.p1 } else { s.p2 };
        self.ray(&Vector3::new(p[0], p[1], 1.0))
    }

    /// Back-project a stored segment at the given endpoint depths.
    pub fn unproject_segment(&self, seg: u32, depth1: f64, depth2: f64) -> Segment3D {
        Segment3D::new(
            self.center + self.segment_ray(seg, true) * depth1,
            self.center + self.segment_ray(seg, false) * depth2,
        )
    }

    /// Viewing direction of the camera in world coordinates.
    pub fn optical_axis(&self) -> Vector3<f64> {
        self.r.row(2).transpose()
    }

    /// Angle between the optical axes of two views, in radians.
    pub fn optical_axes_angle(&self, other: &View) -> f64 {
        self.optical_axis()
            .dot(&other.optical_axis())
            .clamp(-1.0, 1.0)
            .acos()
    }

    /// Distance between the two camera centers.
    pub fn baseline(&self, other: &View) -> f64 {
        (self.center - other.center).norm()
    }

    /// Derive the regularizer from a pixel-space sigma: the world-space
    /// distance per unit depth between the rays through the principal point
    /// and a point `sigma_px` to its right.
    pub fn compute_spatial_regularizer(&mut self, sigma_px: f64) {
        let ray1 = self.ray(&Vector3::new(self.pp.x, self.pp.y, 1.0));
        let ray2 = self.ray(&Vector3::new(self.pp.x + sigma_px, self.pp.y, 1.0));
        self.k_reg = (ray1 - ray2).norm();
        self.median_sigma = self.median_depth * self.k_reg;
    }

    /// Set a fixed world-space regularizer.
    pub fn update_k(&mut self, sigma_world: f64) {
        self.k_reg = sigma_world;
        self.median_sigma = self.median_depth * self.k_reg;
    }

    /// Store a new median depth (midpoint element of the sorted depth
    /// multiset, computed by the caller).
    pub fn update_median_depth(&mut self, depth: f64) {
        self.median_depth = depth.max(EPS);
        self.median_sigma = self.median_depth * self.k_reg;
    }

    /// Recompute the per-segment collinearity lists: two segments are
    /// collinear when all four endpoints lie within `tau_px` of the other
    /// segment's infinite image line.
    pub fn find_collinear_segments(&mut self, tau_px: f64) {
        let n = self.segments.len();
        self.collinear = vec![Vec::new(); n];
        if tau_px <= EPS {
            return;
        }

        let lines: Vec<_> = self
            .segments
            .iter()
            .map(|s| geometry::line_through(&s.p1, &s.p2))
            .collect();

        for i in 0..n {
            for j in (i + 1)..n {
                let si = &self.segments[i];
                let sj = &self.segments[j];
                let d = geometry::line_point_distance(&lines[i], &sj.p1)
                    .max(geometry::line_point_distance(&lines[i], &sj.p2))
                    .max(geometry::line_point_distance(&lines[j], &si.p1))
                    .max(geometry::line_point_distance(&lines[j], &si.p2));
                if d < tau_px {
                    self.collinear[i].push(j as u32);
                    self.collinear[j].push(i as u32);
                }
            }
        }
    }

    /// Indices of segments collinear with `seg` (empty until
    /// [`View::find_collinear_segments`] ran).
    pub fn collinear_segments(&self, seg: u32) -> &[u32] {
        &self.collinear[seg as usize]
    }

    /// Project a world point into the view; `None` when it lies on the
    /// principal plane.
    pub fn project_point(&self, x: &Vector3<f64>) -> Option<[f64; 2]> {
        let p = self.k * (self.r * x + self.t);
        if p.z.abs() < EPS {
            return None;
        }
        Some([p.x / p.z, p.y / p.z])
    }

    /// True when the projection of a 3D segment into this view is at least
    /// the per-view minimum segment length. Unprojectable segments are kept.
    pub fn projected_long_enough(&self, seg: &Segment3D) -> bool {
        match (self.project_point(&seg.p1), self.project_point(&seg.p2)) {
            (Some(a), Some(b)) => {
                let dx = a[0] - b[0];
                let dy = a[1] - b[1];
                (dx * dx + dy * dy).sqrt() >= self.min_line_length
            }
            _ => true,
        }
    }
}
