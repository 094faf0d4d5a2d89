//! Pairwise epipolar matching.
//!
//! For a source view and one of its visual neighbors, every source segment
//! is matched against every target segment: the source endpoints are mapped
//! to epipolar lines, intersected with the target segment's image line, and
//! the resulting interval is gated by mutual epipolar overlap and strictly
//! positive two-way triangulation depths.

use crate::geometry::{self, EPS};
use crate::types::{Match, Segment2D};
use crate::view::View;
use nalgebra::{Matrix3, Vector3};
use std::cmp::Ordering;

/// Candidate matches per source segment against the target view.
///
/// With `knn > 0` only the k best candidates per source segment survive,
/// ranked by overlap score (ties keep target traversal order); otherwise all
/// passing candidates are kept in target traversal order.
pub(crate) fn match_pair(
    src: &View,
    tgt: &View,
    fundamental: &Matrix3<f64>,
    epipolar_overlap: f64,
    knn: i32,
) -> Vec<Vec<Match>> {
    let per_segment = |r: usize| match_segment(src, tgt, fundamental, epipolar_overlap, knn, r);

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..src.num_segments())
            .into_par_iter()
            .map(per_segment)
            .collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..src.num_segments()).map(per_segment).collect()
    }
}

fn match_segment(
    src: &View,
    tgt: &View,
    fundamental: &Matrix3<f64>,
    epipolar_overlap: f64,
    knn: i32,
    r: usize,
) -> Vec<Match> {
    let seg = src.segment(r as u32);
    let p1 = Vector3::new(seg.p1[0], seg.p1[1], 1.0);
    let p2 = Vector3::new(seg.p2[0], seg.p2[1], 1.0);
    let epi_p1 = fundamental * p1;
    let epi_p2 = fundamental * p2;
    let ray_p1 = src.segment_ray(r as u32, true);
    let ray_p2 = src.segment_ray(r as u32, false);

    let mut found: Vec<Match> = Vec::new();
    for (c, tseg) in tgt.segments().iter().enumerate() {
        let q1 = Vector3::new(tseg.p1[0], tseg.p1[1], 1.0);
        let q2 = Vector3::new(tseg.p2[0], tseg.p2[1], 1.0);
        let l2 = q1.cross(&q2);

        let mut p1_proj = l2.cross(&epi_p1);
        let mut p2_proj = l2.cross(&epi_p2);
        if p1_proj.z.abs() < EPS || p2_proj.z.abs() < EPS {
            continue;
        }
        p1_proj /= p1_proj.z;
        p2_proj /= p2_proj.z;

        let overlap = geometry::mutual_overlap(&[p1_proj, p2_proj, q1, q2]);
        if overlap <= epipolar_overlap {
            continue;
        }

        let ray_q1 = tgt.segment_ray(c as u32, true);
        let ray_q2 = tgt.segment_ray(c as u32, false);
        let Some((depth_p1, depth_p2)) = geometry::triangulation_depths(
            src.center(),
            &ray_p1,
            &ray_p2,
            tgt.center(),
            &ray_q1,
            &ray_q2,
        ) else {
            continue;
        };
        let Some((depth_q1, depth_q2)) = geometry::triangulation_depths(
            tgt.center(),
            &ray_q1,
            &ray_q2,
            src.center(),
            &ray_p1,
            &ray_p2,
        ) else {
            continue;
        };
        if depth_p1 <= EPS || depth_p2 <= EPS || depth_q1 <= EPS || depth_q2 <= EPS {
            continue;
        }

        found.push(Match {
            src: Segment2D::new(src.id(), r as u32),
            tgt: Segment2D::new(tgt.id(), c as u32),
            overlap_score: overlap,
            score3d: 0.0,
            depth_p1,
            depth_p2,
            depth_q1,
            depth_q2,
        });
    }

    if knn > 0 {
        found.sort_by(|a, b| {
            b.overlap_score
                .partial_cmp(&a.overlap_score)
                .unwrap_or(Ordering::Equal)
        });
        found.truncate(knn as usize);
    }
    found
}
