//! Core data model shared across the reconstruction pipeline.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

/// Identifier of a registered camera/view, as supplied by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CameraId(pub u32);

impl std::fmt::Display for CameraId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference to a 2D segment: owning camera plus the segment's stable index
/// within that view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Segment2D {
    pub cam: CameraId,
    pub seg: u32,
}

impl Segment2D {
    pub fn new(cam: CameraId, seg: u32) -> Self {
        Self { cam, seg }
    }
}

/// 3D line segment as an ordered endpoint pair. Equality is by endpoints,
/// not by direction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment3D {
    pub p1: Vector3<f64>,
    pub p2: Vector3<f64>,
}

impl Segment3D {
    pub fn new(p1: Vector3<f64>, p2: Vector3<f64>) -> Self {
        Self { p1, p2 }
    }

    pub fn length(&self) -> f64 {
        (self.p2 - self.p1).norm()
    }

    /// Unit direction from `p1` to `p2`; zero for degenerate segments.
    pub fn dir(&self) -> Vector3<f64> {
        let d = self.p2 - self.p1;
        let n = d.norm();
        if n > 0.0 {
            d / n
        } else {
            Vector3::zeros()
        }
    }

    /// Distance from `x` to the infinite line through the segment.
    pub fn point_distance(&self, x: &Vector3<f64>) -> f64 {
        (x - self.p1).cross(&self.dir()).norm()
    }
}

/// Candidate correspondence between a source and a target 2D segment.
///
/// Depths are along the respective camera rays: `depth_p*` for the source
/// endpoints, `depth_q*` for the target endpoints. Stored matches always
/// carry strictly positive depths.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Match {
    pub src: Segment2D,
    pub tgt: Segment2D,
    pub overlap_score: f64,
    pub score3d: f64,
    pub depth_p1: f64,
    pub depth_p2: f64,
    pub depth_q1: f64,
    pub depth_q2: f64,
}

impl Match {
    /// Mirror the match for insertion into the target view's table. The 3D
    /// score is reset so the match is rescored once the target becomes the
    /// source view.
    pub fn inverse(&self) -> Match {
        Match {
            src: self.tgt,
            tgt: self.src,
            overlap_score: self.overlap_score,
            score3d: 0.0,
            depth_p1: self.depth_q1,
            depth_p2: self.depth_q2,
            depth_q1: self.depth_p1,
            depth_q2: self.depth_p2,
        }
    }
}

/// Weighted edge of the affinity graph, in dense local ids.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct AffinityEdge {
    pub i: u32,
    pub j: u32,
    pub w: f64,
}

/// Cluster of 2D segments agreeing on a single 3D line.
///
/// `reference` is the member whose 3D hypothesis was the longest; its
/// endpoint rays define the extent of the fitted line.
#[derive(Clone, Debug, Serialize)]
pub struct LineCluster3D {
    pub line: Segment3D,
    pub reference: Segment2D,
    pub members: Vec<Segment2D>,
}

/// Final reconstructed line: the underlying cluster plus the collinear 3D
/// intervals extracted along the fitted line.
#[derive(Clone, Debug, Serialize)]
pub struct FinalLine3D {
    pub cluster: LineCluster3D,
    pub segments: Vec<Segment3D>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment3d_direction_and_length() {
        let s = Segment3D::new(Vector3::new(1.0, 0.0, 0.0), Vector3::new(4.0, 0.0, 0.0));
        assert!((s.length() - 3.0).abs() < 1e-12);
        assert!((s.dir() - Vector3::new(1.0, 0.0, 0.0)).norm() < 1e-12);

        let degenerate = Segment3D::new(Vector3::zeros(), Vector3::zeros());
        assert_eq!(degenerate.dir(), Vector3::zeros());
    }

    #[test]
    fn point_distance_measures_infinite_line() {
        let s = Segment3D::new(Vector3::zeros(), Vector3::new(1.0, 0.0, 0.0));
        // Beyond the endpoint along the line: distance stays zero.
        assert!(s.point_distance(&Vector3::new(5.0, 0.0, 0.0)) < 1e-12);
        assert!((s.point_distance(&Vector3::new(0.5, 2.0, 0.0)) - 2.0).abs() < 1e-12);
    }

    #[test]
    fn inverse_match_swaps_sides_and_resets_score() {
        let m = Match {
            src: Segment2D::new(CameraId(0), 3),
            tgt: Segment2D::new(CameraId(1), 7),
            overlap_score: 0.8,
            score3d: 2.5,
            depth_p1: 1.0,
            depth_p2: 1.1,
            depth_q1: 2.0,
            depth_q2: 2.1,
        };
        let inv = m.inverse();
        assert_eq!(inv.src, m.tgt);
        assert_eq!(inv.tgt, m.src);
        assert_eq!(inv.depth_p1, m.depth_q1);
        assert_eq!(inv.depth_q2, m.depth_p2);
        assert_eq!(inv.score3d, 0.0);
        assert_eq!(inv.inverse().depth_p1, m.depth_p1);
    }
}
