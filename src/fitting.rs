//! Per-cluster 3D line fitting and collinear-interval extraction.
//!
//! The endpoints of every member's 3D hypothesis form a point scatter whose
//! dominant principal direction (3×3 scatter-matrix SVD) gives the fitted
//! line. The cluster's reference segment is projected onto that line to fix
//! its extent; the member projections are then swept along the line to
//! extract the intervals supported by at least three distinct cameras.

use crate::geometry::EPS;
use crate::registry::RegistryInner;
use crate::types::{CameraId, LineCluster3D, Match, Segment2D, Segment3D};
use crate::view::View;
use nalgebra::{Matrix3, Vector3};
use std::collections::{HashMap, HashSet};

/// Fit a 3D line to the cluster members' current estimates.
///
/// `None` when no member has an estimate or the reference projection is
/// degenerate; such clusters are dropped.
pub(crate) fn fit_cluster(
    members: &[Segment2D],
    estimates: &[(Segment3D, Match)],
    entry_map: &HashMap<Segment2D, usize>,
    inner: &RegistryInner,
) -> Option<LineCluster3D> {
    let mut points: Vec<Vector3<f64>> = Vec::with_capacity(members.len() * 2);
    let mut reference: Option<Segment2D> = None;
    let mut max_len = 0.0;

    for &member in members {
        let Some(&entry) = entry_map.get(&member) else {
            continue;
        };
        let hyp = &estimates[entry].0;
        points.push(hyp.p1);
        points.push(hyp.p2);
        if hyp.length() > max_len {
            max_len = hyp.length();
            reference = Some(member);
        }
    }
    let reference = reference?;

    let mut centroid = Vector3::zeros();
    for p in &points {
        centroid += p;
    }
    centroid /= points.len() as f64;

    let mut scatter = Matrix3::zeros();
    for p in &points {
        let d = p - centroid;
        scatter += d * d.transpose();
    }

    let svd = scatter.svd(true, false);
    let u = svd.u?;
    let dominant = svd.singular_values.imax();
    let dir = u.column(dominant).into_owned().normalize();

    let initial = Segment3D::new(centroid, centroid + dir);
    let ref_view = inner.view_by_id(reference.cam)?;
    let line = project_segment_onto_line(ref_view, reference.seg, &initial)?;

    Some(LineCluster3D {
        line,
        reference,
        members: members.to_vec(),
    })
}

/// Project both endpoint rays of a stored 2D segment onto a 3D line by
/// minimizing squared ray-to-line distance. `None` when a ray is (near)
/// parallel to the line.
pub(crate) fn project_segment_onto_line(
    view: &View,
    seg: u32,
    line: &Segment3D,
) -> Option<Segment3D> {
    let p = line.p1;
    let u = line.dir();
    let q = *view.center();
    let v1 = view.segment_ray(seg, true);
    let v2 = view.segment_ray(seg, false);
    let w = p - q;

    let a = u.dot(&u);
    let b1 = u.dot(&v1);
    let b2 = u.dot(&v2);
    let c1 = v1.dot(&v1);
    let c2 = v2.dot(&v2);
    let d = u.dot(&w);
    let e1 = v1.dot(&w);
    let e2 = v2.dot(&w);

    let denom1 = a * c1 - b1 * b1;
    let denom2 = a * c2 - b2 * b2;
    if denom1.abs() <= EPS || denom2.abs() <= EPS {
        return None;
    }

    let s1 = (b1 * e1 - c1 * d) / denom1;
    let s2 = (b2 * e2 - c2 * d) / denom2;
    Some(Segment3D::new(p + s1 * u, p + s2 * u))
}

struct LinePoint {
    member: usize,
    cam: CameraId,
    pos: Vector3<f64>,
    dist_to_border: f64,
}

/// Collinear 3D intervals of a cluster: spans of the fitted line covered by
/// the projections of at least three distinct cameras. Clusters with fewer
/// than six projected endpoints yield no intervals.
pub(crate) fn collinear_intervals(cluster: &LineCluster3D, inner: &RegistryInner) -> Vec<Segment3D> {
    let cog = 0.5 * (cluster.line.p1 + cluster.line.p2);

    let mut points: Vec<LinePoint> = Vec::with_capacity(cluster.members.len() * 2);
    let mut border = Vector3::zeros();
    let mut dist_to_cog = 0.0;

    for (member, &seg2d) in cluster.members.iter().enumerate() {
        let Some(view) = inner.view_by_id(seg2d.cam) else {
            continue;
        };
        let Some(proj) = project_segment_onto_line(view, seg2d.seg, &cluster.line) else {
            continue;
        };
        for pos in [proj.p1, proj.p2] {
            let d = (pos - cog).norm();
            if d > dist_to_cog {
                dist_to_cog = d;
                border = pos;
            }
            points.push(LinePoint {
                member,
                cam: seg2d.cam,
                pos,
                dist_to_border: 0.0,
            });
        }
    }

    if points.len() < 6 {
        return Vec::new();
    }

    for point in &mut points {
        point.dist_to_border = (point.pos - border).norm();
    }
    // Stable sort: coincident endpoints keep member order.
    points.sort_by(|a, b| {
        a.dist_to_border
            .partial_cmp(&b.dist_to_border)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut intervals = Vec::new();
    let mut open_members: HashSet<usize> = HashSet::new();
    let mut open_cams: HashMap<CameraId, u32> = HashMap::new();
    let mut opened = false;
    let mut current_start = Vector3::zeros();

    for point in &points {
        if open_members.insert(point.member) {
            *open_cams.entry(point.cam).or_insert(0) += 1;
        } else {
            open_members.remove(&point.member);
            if let Some(count) = open_cams.get_mut(&point.cam) {
                *count -= 1;
                if *count == 0 {
                    open_cams.remove(&point.cam);
                }
            }
        }

        if opened && open_cams.len() < 3 {
            intervals.push(Segment3D::new(current_start, point.pos));
            opened = false;
        } else if !opened && open_cams.len() >= 3 {
            current_start = point.pos;
            opened = true;
        }
    }

    intervals
}
