//! Visual neighbor selection.
//!
//! Each view is assigned a bounded set of neighbor views to match against:
//! either the caller-supplied list (filtered to registered views) or the
//! best-scoring views by shared tie-point support, subject to viewing-angle
//! and pairwise-baseline constraints.

use crate::registry::RegistryInner;
use std::cmp::Ordering;
use std::f64::consts::FRAC_PI_2;

#[derive(Clone, Copy, Debug)]
struct VisualNeighbor {
    idx: usize,
    score: f64,
}

/// Neighbor view indices for every view, in registration order.
pub(crate) fn compute_visual_neighbors(
    inner: &RegistryInner,
    num_neighbors: usize,
    min_baseline: f64,
) -> Vec<Vec<usize>> {
    let n = inner.len();
    let per_view = |i: usize| neighbors_of(inner, i, num_neighbors, min_baseline);

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        (0..n).into_par_iter().map(per_view).collect()
    }
    #[cfg(not(feature = "parallel"))]
    {
        (0..n).map(per_view).collect()
    }
}

fn neighbors_of(
    inner: &RegistryInner,
    idx: usize,
    num_neighbors: usize,
    min_baseline: f64,
) -> Vec<usize> {
    let view = inner.view(idx);

    if let Some(fixed) = inner.fixed_neighbors_of(view.id()) {
        return fixed
            .iter()
            .filter_map(|&cam| inner.index_of(cam))
            .filter(|&other| other != idx)
            .collect();
    }

    let Some(wps) = inner.worldpoints_of(view.id()) else {
        return Vec::new();
    };

    // Count tie-points shared with every other view.
    let mut common = vec![0u32; inner.len()];
    for &wp in wps {
        if let Some(cams) = inner.views_seeing(wp) {
            for &cam in cams {
                if let Some(other) = inner.index_of(cam) {
                    if other != idx {
                        common[other] += 1;
                    }
                }
            }
        }
    }

    let mut candidates: Vec<VisualNeighbor> = Vec::new();
    for (other, &num_common) in common.iter().enumerate() {
        if num_common == 0 {
            continue;
        }
        let other_view = inner.view(other);
        let num_wps_other = inner
            .worldpoints_of(other_view.id())
            .map_or(0, <[u32]>::len);
        if view.optical_axes_angle(other_view) >= FRAC_PI_2 {
            continue;
        }
        candidates.push(VisualNeighbor {
            idx: other,
            score: 2.0 * f64::from(num_common) / (wps.len() + num_wps_other) as f64,
        });
    }

    // Best support first; ties resolved by registration order.
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.idx.cmp(&b.idx))
    });

    let mut admitted: Vec<usize> = Vec::new();
    for cand in candidates {
        if admitted.len() >= num_neighbors {
            break;
        }
        let cand_view = inner.view(cand.idx);
        if view.baseline(cand_view) <= min_baseline {
            continue;
        }
        let spread_out = admitted
            .iter()
            .all(|&a| cand_view.baseline(inner.view(a)) > min_baseline);
        if spread_out {
            admitted.push(cand.idx);
        }
    }
    admitted
}
