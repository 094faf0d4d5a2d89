//! Affinity graph construction over the scored 3D estimates.
//!
//! Rows of the affinity graph are 2D segments (interned into dense local
//! ids); an edge weights the 3D agreement between the best estimates of two
//! segments. With collinearity enabled, edges are extended to in-view
//! collinear partners of both endpoints. A symmetric used-pair set keeps the
//! edge list symmetric and free of duplicates.

use crate::geometry::{self, EPS};
use crate::registry::RegistryInner;
use crate::scoring::MIN_SIMILARITY_3D;
use crate::types::{AffinityEdge, Match, Segment2D, Segment3D};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Minimum similarity for an affinity edge to be recorded.
pub(crate) const MIN_AFFINITY: f64 = 0.25;

/// Dense local ids assigned to segments on first use in the affinity graph.
#[derive(Default)]
pub(crate) struct LocalIds {
    to_local: HashMap<Segment2D, u32>,
    to_global: Vec<Segment2D>,
}

impl LocalIds {
    fn get_or_assign(&mut self, seg: Segment2D) -> u32 {
        if let Some(&id) = self.to_local.get(&seg) {
            return id;
        }
        let id = self.to_global.len() as u32;
        self.to_local.insert(seg, id);
        self.to_global.push(seg);
        id
    }

    pub fn len(&self) -> usize {
        self.to_global.len()
    }

    pub fn global(&self, local: u32) -> Segment2D {
        self.to_global[local as usize]
    }
}

/// Sparse symmetric affinity graph.
pub(crate) struct AffinityGraph {
    pub edges: Vec<AffinityEdge>,
    pub local_ids: LocalIds,
}

/// Similarity between the estimate `(s1, m1)` and the best estimate of
/// `seg2`: angular agreement of the 3D segments combined with
/// endpoint-symmetric point-to-line distances, each regularized by
/// depth-dependent sigmas capped at the view's median sigma.
#[allow(clippy::too_many_arguments)]
pub(crate) fn similarity(
    inner: &RegistryInner,
    estimates: &[(Segment3D, Match)],
    entry_map: &HashMap<Segment2D, usize>,
    s1: &Segment3D,
    m1: &Match,
    seg2: Segment2D,
    two_sig_a_sqr: f64,
    truncate: bool,
) -> f64 {
    let Some(&entry) = entry_map.get(&seg2) else {
        return 0.0;
    };
    let (s2, m2) = &estimates[entry];
    if s1.length() < EPS || s2.length() < EPS {
        return 0.0;
    }

    let (Some(v1), Some(v2)) = (
        inner.view_by_id(m1.src.cam),
        inner.view_by_id(m2.src.cam),
    ) else {
        return 0.0;
    };

    let angle = geometry::angle_between_segments(s1, s2, true);
    let sim_a = (-angle * angle / two_sig_a_sqr).exp();

    let d11 = s2.point_distance(&s1.p1);
    let d12 = s2.point_distance(&s1.p2);
    let d21 = s1.point_distance(&s2.p1);
    let d22 = s1.point_distance(&s2.p2);

    let sigma = |depth: f64, view: &crate::view::View| -> f64 {
        if depth > view.median_depth() {
            view.median_sigma()
        } else {
            depth * view.regularizer()
        }
    };
    let reg11 = (2.0 * sigma(m1.depth_p1, v1).powi(2)).max(EPS);
    let reg12 = (2.0 * sigma(m1.depth_p2, v1).powi(2)).max(EPS);
    let reg21 = (2.0 * sigma(m2.depth_p1, v2).powi(2)).max(EPS);
    let reg22 = (2.0 * sigma(m2.depth_p2, v2).powi(2)).max(EPS);

    let sim_p1 = (-d11 * d11 / reg11).exp().min((-d12 * d12 / reg12).exp());
    let sim_p2 = (-d21 * d21 / reg21).exp().min((-d22 * d22 / reg22).exp());
    let sim = sim_a.min(sim_p1.min(sim_p2));

    if truncate && sim <= MIN_SIMILARITY_3D {
        return 0.0;
    }
    sim
}

struct PrimaryAffinity {
    tgt: Segment2D,
    w: f64,
    collinear: Vec<(Segment2D, f64)>,
}

struct EstimateAffinity {
    src: Segment2D,
    primaries: Vec<PrimaryAffinity>,
    src_collinear: Vec<(Segment2D, f64)>,
}

/// Build the symmetric affinity edge list over all estimates.
///
/// Similarities are evaluated in parallel per estimate; the used-pair
/// bookkeeping and id interning run in a deterministic serial merge over the
/// per-estimate buffers.
pub(crate) fn build_affinity(
    inner: &RegistryInner,
    estimates: &[(Segment3D, Match)],
    entry_map: &HashMap<Segment2D, usize>,
    matches: &[Vec<Vec<Match>>],
    two_sig_a_sqr: f64,
    collinearity_t: f64,
) -> AffinityGraph {
    let per_estimate = |(s3d, m): &(Segment3D, Match)| -> EstimateAffinity {
        let src = m.src;
        let sim_to = |other: Segment2D| {
            similarity(inner, estimates, entry_map, s3d, m, other, two_sig_a_sqr, false)
        };

        let mut primaries = Vec::new();
        if let Some(view_idx) = inner.index_of(src.cam) {
            for m2 in &matches[view_idx][src.seg as usize] {
                let tgt = m2.tgt;
                let w = sim_to(tgt);
                if w <= MIN_AFFINITY {
                    continue;
                }
                let mut collinear = Vec::new();
                if collinearity_t > EPS {
                    if let Some(tgt_view) = inner.view_by_id(tgt.cam) {
                        for &c in tgt_view.collinear_segments(tgt.seg) {
                            let cand = Segment2D::new(tgt.cam, c);
                            let cw = sim_to(cand);
                            if cw > MIN_AFFINITY {
                                collinear.push((cand, cw));
                            }
                        }
                    }
                }
                primaries.push(PrimaryAffinity { tgt, w, collinear });
            }
        }

        let mut src_collinear = Vec::new();
        if collinearity_t > EPS && !primaries.is_empty() {
            if let Some(src_view) = inner.view_by_id(src.cam) {
                for &c in src_view.collinear_segments(src.seg) {
                    let cand = Segment2D::new(src.cam, c);
                    let cw = sim_to(cand);
                    if cw > MIN_AFFINITY {
                        src_collinear.push((cand, cw));
                    }
                }
            }
        }

        EstimateAffinity {
            src,
            primaries,
            src_collinear,
        }
    };

    let buffers: Vec<EstimateAffinity>;
    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        buffers = estimates.par_iter().map(per_estimate).collect();
    }
    #[cfg(not(feature = "parallel"))]
    {
        buffers = estimates.iter().map(per_estimate).collect();
    }

    let mut edges = Vec::new();
    let mut local_ids = LocalIds::default();
    let mut used: HashSet<(Segment2D, Segment2D)> = HashSet::new();

    for est in buffers {
        let mut id1: Option<u32> = None;
        for primary in est.primaries {
            if !mark_used(&mut used, est.src, primary.tgt) {
                continue;
            }
            let a = *id1.get_or_insert_with(|| local_ids.get_or_assign(est.src));
            let b = local_ids.get_or_assign(primary.tgt);
            push_symmetric(&mut edges, a, b, primary.w);
            for (cand, w) in primary.collinear {
                if !mark_used(&mut used, est.src, cand) {
                    continue;
                }
                let c = local_ids.get_or_assign(cand);
                push_symmetric(&mut edges, a, c, w);
            }
        }
        if let Some(a) = id1 {
            for (cand, w) in est.src_collinear {
                if !mark_used(&mut used, est.src, cand) {
                    continue;
                }
                let c = local_ids.get_or_assign(cand);
                push_symmetric(&mut edges, a, c, w);
            }
        }
    }

    AffinityGraph { edges, local_ids }
}

fn push_symmetric(edges: &mut Vec<AffinityEdge>, i: u32, j: u32, w: f64) {
    edges.push(AffinityEdge { i, j, w });
    edges.push(AffinityEdge { i: j, j: i, w });
}

/// Claim the unordered pair; false when it was already used.
fn mark_used(used: &mut HashSet<(Segment2D, Segment2D)>, a: Segment2D, b: Segment2D) -> bool {
    let key = if a <= b { (a, b) } else { (b, a) };
    used.insert(key)
}

/// Enforce symmetry on a reweighted edge set by taking the per-pair minimum
/// (used after an external diffusion pass).
pub(crate) fn symmetrize_min(edges: &[AffinityEdge]) -> Vec<AffinityEdge> {
    let mut pairs: BTreeMap<(u32, u32), f64> = BTreeMap::new();
    for e in edges {
        let key = if e.i <= e.j { (e.i, e.j) } else { (e.j, e.i) };
        pairs
            .entry(key)
            .and_modify(|w| *w = w.min(e.w))
            .or_insert(e.w);
    }
    let mut out = Vec::with_capacity(pairs.len() * 2);
    for ((i, j), w) in pairs {
        if i == j {
            continue;
        }
        out.push(AffinityEdge { i, j, w });
        out.push(AffinityEdge { i: j, j: i, w });
    }
    out
}
