//! 3D-consistency scoring of candidate matches.
//!
//! Every candidate of a source segment is rescored by how well its
//! back-projection agrees with the candidates from other target views of the
//! same segment: angular similarity of the 3D directions combined with
//! positional similarity of the source-side depths, aggregated as a
//! per-target-camera maximum and summed across distinct cameras.

use crate::geometry::{self, EPS};
use crate::types::{CameraId, Match, Segment3D};
use crate::view::View;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

/// Pairwise similarities below this value do not contribute to a score.
pub(crate) const MIN_SIMILARITY_3D: f64 = 0.25;
/// Matches with a 3D score at or below this value are discarded.
pub(crate) const MIN_SCORE_3D: f64 = 0.25;
/// Minimum 3D score for a best match to enter the estimates table.
pub(crate) const MIN_BEST_SCORE_3D: f64 = 0.25;

/// Similarity of two candidate matches originating from the same source
/// segment, using their source-side back-projections.
fn similarity_for_scoring(
    view: &View,
    m1: &Match,
    m2: &Match,
    two_sig_a_sqr: f64,
    k: f64,
) -> f64 {
    let s1 = view.unproject_segment(m1.src.seg, m1.depth_p1, m1.depth_p2);
    let s2 = view.unproject_segment(m2.src.seg, m2.depth_p1, m2.depth_p2);
    if s1.length() < EPS || s2.length() < EPS {
        return 0.0;
    }

    let angle = geometry::angle_between_segments(&s1, &s2, true);
    let sim_a = (-angle * angle / two_sig_a_sqr).exp();

    let d1 = m1.depth_p1 - m2.depth_p1;
    let d2 = m1.depth_p2 - m2.depth_p2;
    let sig1 = m1.depth_p1 * k;
    let sig2 = m1.depth_p2 * k;
    let reg1 = (2.0 * sig1 * sig1).max(EPS);
    let reg2 = (2.0 * sig2 * sig2).max(EPS);
    let sim_p = (-d1 * d1 / reg1).exp().min((-d2 * d2 / reg2).exp());

    let sim = sim_a.min(sim_p);
    if sim > MIN_SIMILARITY_3D {
        sim
    } else {
        0.0
    }
}

/// Rescore all candidates of a source view. Returns the scored match table
/// and the number of clusterable segments (valid supports in at least two
/// distinct target views).
pub(crate) fn score_view(
    view: &View,
    matches: &[Vec<Match>],
    two_sig_a_sqr: f64,
) -> (Vec<Vec<Match>>, usize) {
    let k = view.regularizer();
    let per_segment = |candidates: &Vec<Match>| -> (Vec<Match>, bool) {
        let mut scored = candidates.clone();
        for m in &mut scored {
            let mut score3d = 0.0;
            let mut score_per_cam: HashMap<CameraId, f64> = HashMap::new();
            for m2 in candidates {
                if m.tgt.cam == m2.tgt.cam {
                    continue;
                }
                let sim = similarity_for_scoring(view, m, m2, two_sig_a_sqr, k);
                match score_per_cam.entry(m2.tgt.cam) {
                    Entry::Occupied(mut entry) => {
                        let best = entry.get_mut();
                        if sim > *best {
                            score3d += sim - *best;
                            *best = sim;
                        }
                    }
                    Entry::Vacant(entry) => {
                        score3d += sim;
                        entry.insert(sim);
                    }
                }
            }
            m.score3d = score3d;
        }
        let valid_cams: std::collections::HashSet<CameraId> = scored
            .iter()
            .filter(|m| m.score3d > MIN_SCORE_3D)
            .map(|m| m.tgt.cam)
            .collect();
        (scored, valid_cams.len() > 1)
    };

    let results: Vec<(Vec<Match>, bool)>;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        results = matches.par_iter().map(per_segment).collect();
    }
    #[cfg(not(feature = "parallel"))]
    {
        results = matches.iter().map(per_segment).collect();
    }

    let num_clusterable = results.iter().filter(|(_, valid)| *valid).count();
    (results.into_iter().map(|(scored, _)| scored).collect(), num_clusterable)
}

/// Result of filtering one view's scored matches.
pub(crate) struct FilterOutcome {
    /// Retained matches per segment (score3D above threshold).
    pub matches: Vec<Vec<Match>>,
    /// New estimates contributed by this view, in segment order.
    pub estimates: Vec<(Segment3D, Match)>,
    /// Source-side depths of the retained best matches.
    pub depths: Vec<f64>,
    /// Total number of retained matches.
    pub num_retained: usize,
}

/// Keep only sufficiently supported matches and materialize the best match
/// per segment as its 3D estimate.
pub(crate) fn filter_matches(view: &View, matches: Vec<Vec<Match>>) -> FilterOutcome {
    let per_segment = |candidates: Vec<Match>| -> (Vec<Match>, Option<(Segment3D, Match)>) {
        let retained: Vec<Match> = candidates
            .into_iter()
            .filter(|m| m.score3d > MIN_SCORE_3D)
            .collect();
        let mut best: Option<&Match> = None;
        for m in &retained {
            if best.map_or(true, |b| m.score3d > b.score3d) {
                best = Some(m);
            }
        }
        let estimate = best.filter(|m| m.score3d > MIN_BEST_SCORE_3D).map(|m| {
            (
                view.unproject_segment(m.src.seg, m.depth_p1, m.depth_p2),
                *m,
            )
        });
        (retained, estimate)
    };

    let results: Vec<(Vec<Match>, Option<(Segment3D, Match)>)>;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        results = matches.into_par_iter().map(per_segment).collect();
    }
    #[cfg(not(feature = "parallel"))]
    {
        results = matches.into_iter().map(per_segment).collect();
    }

    let mut outcome = FilterOutcome {
        matches: Vec::with_capacity(results.len()),
        estimates: Vec::new(),
        depths: Vec::new(),
        num_retained: 0,
    };
    for (retained, estimate) in results {
        outcome.num_retained += retained.len();
        if let Some((seg3d, best)) = estimate {
            outcome.depths.push(best.depth_p1);
            outcome.depths.push(best.depth_p2);
            outcome.estimates.push((seg3d, best));
        }
        outcome.matches.push(retained);
    }
    outcome
}

/// Midpoint element of the sorted depth multiset (no interpolation for even
/// sizes); `EPS` when empty.
pub(crate) fn median_depth_of(mut depths: Vec<f64>) -> f64 {
    if depths.is_empty() {
        return EPS;
    }
    depths.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    depths[depths.len() / 2]
}
