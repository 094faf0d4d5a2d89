//! Reconstruction engine orchestrating the end-to-end pipeline.
//!
//! The [`LineReconstructor`] owns all mutable pipeline state: the view
//! registry, per-view match tables, the 3D estimates and the final lines.
//! Usage mirrors the phase structure: register views (thread-safe, `&self`),
//! run [`LineReconstructor::match_segments`], then
//! [`LineReconstructor::reconstruct`], then read
//! [`LineReconstructor::lines`] or export through the writers in
//! [`crate::io`].
//!
//! Phase internals:
//! - Matching: per-view spatial regularizers, visual neighbors, pairwise
//!   epipolar candidates, 3D-consistency scoring, inverse-match
//!   materialization and filtering, all in view-registration order.
//! - Reconstruction: collinearity lists, affinity graph, optional diffusion
//!   reweighting, graph clustering, per-cluster SVD line fit, optional
//!   refinement, collinear-interval extraction, tiny-segment filtering.

mod params;

pub use params::{EngineOptions, MatchingParams, ReconstructionParams};

use crate::affinity;
use crate::clustering::{self, CLUSTERING_CONST};
use crate::detect::{self, ImageU8, SegmentDetector};
use crate::fitting;
use crate::geometry::{self, EPS};
use crate::matching;
use crate::neighbors;
use crate::registry::{RegisterError, RegistryInner, ViewLinks, ViewRegistry};
use crate::scoring;
use crate::types::{AffinityEdge, CameraId, FinalLine3D, LineCluster3D, Match, Segment2D, Segment3D};
use crate::view::{View, ViewSegment};
use log::{debug, error, info, warn};
use nalgebra::{Matrix3, Vector3};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

/// Optional affinity-reweighting backend (e.g. a diffusion process). The
/// returned edge set must cover the same vertex support with non-negative
/// weights; the engine symmetrizes it by per-pair minimum.
pub trait AffinityDiffusion: Send + Sync {
    fn reweight(&self, edges: &[AffinityEdge], num_nodes: usize) -> Vec<AffinityEdge>;
}

/// Optional cluster-refinement backend. Implementations may adjust the
/// endpoint geometry of each cluster against the views but must not change
/// cluster membership.
pub trait ClusterRefiner: Send + Sync {
    fn refine(&self, clusters: &mut [LineCluster3D], views: &[View], max_iter: usize);
}

/// Multi-view 3D line reconstruction engine.
pub struct LineReconstructor {
    options: EngineOptions,
    registry: ViewRegistry,
    /// Candidate matches per view and source segment, in registration order.
    matches: Vec<Vec<Vec<Match>>>,
    num_candidates: usize,
    num_matches: Vec<usize>,
    processed: Vec<bool>,
    matched_pairs: HashSet<(CameraId, CameraId)>,
    fundamentals: HashMap<(CameraId, CameraId), Matrix3<f64>>,
    estimates: Vec<(Segment3D, Match)>,
    entry_map: HashMap<Segment2D, usize>,
    lines: Vec<FinalLine3D>,
    effective_matching: MatchingParams,
    effective_recon: ReconstructionParams,
    fixed_regularizer: bool,
    two_sig_a_sqr: f64,
    collinearity_applied: f64,
    diffusion: Option<Box<dyn AffinityDiffusion>>,
    refiner: Option<Box<dyn ClusterRefiner>>,
    diffusion_applied: bool,
    refinement_applied: bool,
}

impl LineReconstructor {
    pub fn new(options: EngineOptions) -> Self {
        let defaults = MatchingParams::default().clamped();
        Self {
            options,
            registry: ViewRegistry::default(),
            matches: Vec::new(),
            num_candidates: 0,
            num_matches: Vec::new(),
            processed: Vec::new(),
            matched_pairs: HashSet::new(),
            fundamentals: HashMap::new(),
            estimates: Vec::new(),
            entry_map: HashMap::new(),
            lines: Vec::new(),
            fixed_regularizer: defaults.fixed_regularizer(),
            two_sig_a_sqr: (2.0 * defaults.sigma_a * defaults.sigma_a).max(EPS),
            effective_matching: defaults,
            effective_recon: ReconstructionParams::default().clamped(),
            collinearity_applied: 0.0,
            diffusion: None,
            refiner: None,
            diffusion_applied: false,
            refinement_applied: false,
        }
    }

    /// Install an affinity-diffusion backend.
    pub fn set_diffusion(&mut self, backend: Box<dyn AffinityDiffusion>) {
        self.diffusion = Some(backend);
    }

    /// Install a cluster-refinement backend.
    pub fn set_refiner(&mut self, backend: Box<dyn ClusterRefiner>) {
        self.refiner = Some(backend);
    }

    /// Register a calibrated view with precomputed 2D segments.
    ///
    /// Thread-safe; concurrent registrations of distinct ids are admitted in
    /// publication order. `ties_or_neighbors` is interpreted per the
    /// engine-level `neighbors_by_worldpoints` option.
    #[allow(clippy::too_many_arguments)]
    pub fn add_image(
        &self,
        cam_id: u32,
        k: Matrix3<f64>,
        r: Matrix3<f64>,
        t: Vector3<f64>,
        width: u32,
        height: u32,
        median_depth: f64,
        ties_or_neighbors: &[u32],
        segments: Vec<[f64; 4]>,
    ) -> Result<(), RegisterError> {
        let cam = CameraId(cam_id);
        self.register(cam, k, r, t, width, height, median_depth, ties_or_neighbors, || {
            if segments.is_empty() {
                None
            } else {
                Some(segments)
            }
        })
    }

    /// Register a calibrated view, detecting segments in the given grayscale
    /// image through an external detector (with downscaling, length
    /// filtering and optional caching).
    #[allow(clippy::too_many_arguments)]
    pub fn add_image_with_detector(
        &self,
        cam_id: u32,
        k: Matrix3<f64>,
        r: Matrix3<f64>,
        t: Vector3<f64>,
        median_depth: f64,
        ties_or_neighbors: &[u32],
        image: ImageU8<'_>,
        detector: &dyn SegmentDetector,
    ) -> Result<(), RegisterError> {
        let cam = CameraId(cam_id);
        let (width, height) = (image.w as u32, image.h as u32);
        self.register(cam, k, r, t, width, height, median_depth, ties_or_neighbors, || {
            detect::detect_segments(&self.options, cam, image, detector)
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn register(
        &self,
        cam: CameraId,
        k: Matrix3<f64>,
        r: Matrix3<f64>,
        t: Vector3<f64>,
        width: u32,
        height: u32,
        median_depth: f64,
        ties_or_neighbors: &[u32],
        segments: impl FnOnce() -> Option<Vec<[f64; 4]>>,
    ) -> Result<(), RegisterError> {
        if let Err(err) = self.registry.reserve(cam) {
            error!("{err}");
            return Err(err);
        }

        if ties_or_neighbors.is_empty() {
            let err = RegisterError::NoTiePoints(cam);
            error!("{err}");
            return Err(err);
        }

        let Some(segments) = segments().filter(|s| !s.is_empty()) else {
            let err = RegisterError::NoSegments(cam);
            warn!("{err}");
            return Err(err);
        };

        let segments: Vec<ViewSegment> = segments.into_iter().map(ViewSegment::new).collect();
        info!(
            "adding view [{cam}]: #lines = {} [{}]",
            segments.len(),
            self.registry.len()
        );

        let view = View::new(cam, k, r, t, width, height, median_depth, segments);
        let links = if self.options.neighbors_by_worldpoints {
            ViewLinks::WorldPoints(ties_or_neighbors.to_vec())
        } else {
            ViewLinks::Neighbors(ties_or_neighbors.iter().map(|&id| CameraId(id)).collect())
        };
        self.registry.publish(view, links);
        Ok(())
    }

    /// Number of registered views.
    pub fn num_views(&self) -> usize {
        self.registry.len()
    }

    /// Candidate matches generated by the last matching phase, before
    /// score filtering.
    pub fn num_candidate_matches(&self) -> usize {
        self.num_candidates
    }

    /// Matches retained after score filtering.
    pub fn num_matches(&self) -> usize {
        self.num_matches.iter().sum()
    }

    /// Segments with a materialized best 3D estimate.
    pub fn num_estimates(&self) -> usize {
        self.estimates.len()
    }

    /// Pixel coordinates of a stored 2D segment.
    pub fn segment_coords(&self, cam_id: u32, seg_id: u32) -> Option<[f64; 4]> {
        let inner = self.registry.read();
        let view = inner.view_by_id(CameraId(cam_id))?;
        if (seg_id as usize) >= view.num_segments() {
            return None;
        }
        Some(view.segment(seg_id).coords())
    }

    /// Run neighbor selection, pairwise matching and scoring. Previous
    /// matches and estimates are discarded.
    pub fn match_segments(&mut self, params: &MatchingParams) {
        let params = params.clamped();
        info!("line matching over {} view(s)", self.registry.len());

        let inner = self.registry.inner_mut();
        if inner.is_empty() {
            warn!("no images to match; register views first");
            return;
        }

        self.fixed_regularizer = params.fixed_regularizer();
        self.two_sig_a_sqr = (2.0 * params.sigma_a * params.sigma_a).max(EPS);
        self.effective_matching = params;

        let sigma_p = params.effective_sigma_p();
        if self.fixed_regularizer {
            info!("computing spatial regularizers... [{sigma_p} m]");
        } else {
            info!("computing spatial regularizers... [{sigma_p} px]");
        }

        let n = inner.len();
        self.matched_pairs.clear();
        self.estimates.clear();
        self.entry_map.clear();
        self.num_candidates = 0;
        self.num_matches = vec![0; n];
        self.processed = vec![false; n];
        self.matches = inner
            .views()
            .iter()
            .map(|v| vec![Vec::new(); v.num_segments()])
            .collect();

        let fixed = self.fixed_regularizer;
        let update_regularizer = |view: &mut View| {
            if fixed {
                view.update_k(sigma_p);
            } else {
                view.compute_spatial_regularizer(sigma_p);
            }
        };
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            inner.views_mut().par_iter_mut().for_each(update_regularizer);
        }
        #[cfg(not(feature = "parallel"))]
        {
            inner.views_mut().iter_mut().for_each(update_regularizer);
        }

        info!("computing visual neighbors...     [{} imgs.]", params.num_neighbors);
        let neighbor_sets =
            neighbors::compute_visual_neighbors(inner, params.num_neighbors, params.min_baseline);

        info!("computing matches...");
        for v in 0..n {
            let src_cam = inner.view(v).id();

            for &nb in &neighbor_sets[v] {
                let tgt_cam = inner.view(nb).id();
                if self.matched_pairs.contains(&(src_cam, tgt_cam)) {
                    continue;
                }

                let f = match self.fundamentals.get(&(src_cam, tgt_cam)) {
                    Some(f) => *f,
                    None => match self.fundamentals.get(&(tgt_cam, src_cam)) {
                        Some(f) => f.transpose(),
                        None => {
                            let src = inner.view(v);
                            let tgt = inner.view(nb);
                            let f = geometry::fundamental_from_poses(
                                src.k_matrix(),
                                src.rotation(),
                                src.translation(),
                                tgt.k_matrix(),
                                tgt.rotation(),
                                tgt.translation(),
                            );
                            self.fundamentals.insert((src_cam, tgt_cam), f);
                            f
                        }
                    },
                };

                let lists = matching::match_pair(
                    inner.view(v),
                    inner.view(nb),
                    &f,
                    params.epipolar_overlap,
                    params.knn,
                );
                for (seg, mut list) in lists.into_iter().enumerate() {
                    self.num_candidates += list.len();
                    self.matches[v][seg].append(&mut list);
                }

                self.matched_pairs.insert((src_cam, tgt_cam));
                self.matched_pairs.insert((tgt_cam, src_cam));
            }

            // Scoring against the accumulated candidates (including inverse
            // matches pushed by previously processed views).
            let (scored, num_clusterable) =
                scoring::score_view(inner.view(v), &self.matches[v], self.two_sig_a_sqr);
            self.matches[v] = scored;
            if inner.view(v).num_segments() > 0 {
                debug!(
                    "view [{src_cam}] scoring: clusterable_segments={}%",
                    num_clusterable * 100 / inner.view(v).num_segments()
                );
            }

            // Inverse materialization into views that are not yet processed.
            let mut inverse: Vec<(usize, Match)> = Vec::new();
            for list in &self.matches[v] {
                for m in list {
                    if m.score3d <= 0.0 {
                        continue;
                    }
                    if let Some(t) = inner.index_of(m.tgt.cam) {
                        if !self.processed[t] {
                            inverse.push((t, m.inverse()));
                        }
                    }
                }
            }
            for (t, m) in inverse {
                self.matches[t][m.src.seg as usize].push(m);
            }

            let outcome =
                scoring::filter_matches(inner.view(v), std::mem::take(&mut self.matches[v]));
            self.matches[v] = outcome.matches;
            self.num_matches[v] = outcome.num_retained;
            for (seg3d, m) in outcome.estimates {
                self.entry_map.insert(m.src, self.estimates.len());
                self.estimates.push((seg3d, m));
            }
            let median = scoring::median_depth_of(outcome.depths);
            inner.view_mut(v).update_median_depth(median);

            self.processed[v] = true;
            info!(
                "view [{src_cam}]: #matches = {}, median_depth = {:.3}",
                self.num_matches[v],
                inner.view(v).median_depth()
            );
        }
    }

    /// Run affinity construction, clustering, line fitting and interval
    /// extraction, plus the optional diffusion and refinement hooks.
    /// Previous reconstruction results are discarded.
    pub fn reconstruct(&mut self, params: &ReconstructionParams) {
        let params = params.clamped();
        info!("reconstructing 3D lines...");
        self.lines.clear();
        self.diffusion_applied = false;
        self.refinement_applied = false;
        self.effective_recon = params;

        if self.estimates.is_empty() {
            warn!("no clusterable segments; run the matching phase first");
            return;
        }

        let inner = self.registry.inner_mut();

        // Collinearity lists are recomputed only when the tolerance changed.
        let tau = params.collinearity_t;
        if tau > EPS
            && (self.collinearity_applied <= EPS || (self.collinearity_applied - tau).abs() > EPS)
        {
            info!("finding collinear segments... [{tau} px]");
            let find = |view: &mut View| view.find_collinear_segments(tau);
            #[cfg(feature = "parallel")]
            {
                use rayon::prelude::*;
                inner.views_mut().par_iter_mut().for_each(find);
            }
            #[cfg(not(feature = "parallel"))]
            {
                inner.views_mut().iter_mut().for_each(find);
            }
            self.collinearity_applied = tau;
        }

        let inner: &RegistryInner = inner;

        info!("computing affinity matrix...");
        let graph = affinity::build_affinity(
            inner,
            &self.estimates,
            &self.entry_map,
            &self.matches,
            self.two_sig_a_sqr,
            tau,
        );
        let total_segments = inner.total_segments().max(1);
        info!(
            "A: #entries = {}, #rows = {} [~{}%]",
            graph.edges.len(),
            graph.local_ids.len(),
            graph.local_ids.len() * 100 / total_segments
        );

        let mut edges = graph.edges;
        if params.perform_diffusion {
            match &self.diffusion {
                Some(backend) => {
                    info!("matrix diffusion...");
                    edges =
                        affinity::symmetrize_min(&backend.reweight(&edges, graph.local_ids.len()));
                    self.diffusion_applied = true;
                }
                None => {
                    warn!("diffusion requested but no backend is installed; clustering raw affinities");
                }
            }
        }

        if edges.is_empty() {
            warn!("no affinity entries; nothing to cluster");
            return;
        }

        info!("clustering segments...");
        let mut universe = clustering::cluster_edges(&edges, graph.local_ids.len(), CLUSTERING_CONST);
        let groups = universe.components();

        let local_ids = &graph.local_ids;
        let estimates = &self.estimates;
        let entry_map = &self.entry_map;
        let fit_group = |group: &Vec<u32>| -> Option<LineCluster3D> {
            let members: Vec<Segment2D> = group.iter().map(|&l| local_ids.global(l)).collect();
            let cameras: HashSet<CameraId> = members.iter().map(|s| s.cam).collect();
            if cameras.len() < params.visibility_t {
                return None;
            }
            fitting::fit_cluster(&members, estimates, entry_map, inner)
        };

        let mut clusters: Vec<LineCluster3D>;
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            clusters = groups.par_iter().filter_map(fit_group).collect();
        }
        #[cfg(not(feature = "parallel"))]
        {
            clusters = groups.iter().filter_map(fit_group).collect();
        }
        info!("clusters: total = {}, valid = {}", groups.len(), clusters.len());

        if clusters.is_empty() {
            warn!("no clusters found...");
            return;
        }

        if params.refine {
            match &self.refiner {
                Some(backend) => {
                    info!("optimizing 3D lines...");
                    backend.refine(&mut clusters, inner.views(), params.max_refine_iter);
                    self.refinement_applied = true;
                }
                None => warn!("refinement requested but no backend is installed; keeping fitted lines"),
            }
        }

        info!("computing final 3D lines...");
        let extract = |cluster: LineCluster3D| -> Option<FinalLine3D> {
            let segments = fitting::collinear_intervals(&cluster, inner);
            if segments.is_empty() {
                return None;
            }
            Some(FinalLine3D { cluster, segments })
        };
        let mut lines: Vec<FinalLine3D>;
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            lines = clusters.into_par_iter().filter_map(extract).collect();
        }
        #[cfg(not(feature = "parallel"))]
        {
            lines = clusters.into_iter().filter_map(extract).collect();
        }

        info!("filtering tiny segments...");
        let before = lines.len();
        for line in &mut lines {
            if let Some(view) = inner.view_by_id(line.cluster.reference.cam) {
                line.segments.retain(|s| view.projected_long_enough(s));
            }
        }
        lines.retain(|line| !line.segments.is_empty());
        info!("removed lines: {}", before - lines.len());

        self.lines = lines;
        info!("3D lines: total = {}", self.lines.len());
    }

    /// Final reconstructed lines of the last reconstruction phase.
    pub fn lines(&self) -> &[FinalLine3D] {
        &self.lines
    }

    /// Canonical output filename encoding the effective parameters of the
    /// last phases (without extension).
    pub fn result_filename(&self) -> String {
        let m = &self.effective_matching;
        let r = &self.effective_recon;
        let mut name = format!(
            "Line3D++__W_{}__N_{}__sigmaP_{}__sigmaA_{}__epiOverlap_{}__minBaseline_{}__",
            self.options.max_image_width,
            m.num_neighbors,
            m.effective_sigma_p(),
            m.sigma_a,
            m.epipolar_overlap,
            m.min_baseline
        );
        if m.knn > 0 {
            name.push_str(&format!("kNN_{}__", m.knn));
        }
        if r.collinearity_t > EPS {
            name.push_str(&format!("COLLIN_{}__", r.collinearity_t));
        }
        if self.fixed_regularizer {
            name.push_str("FXD_SIGMA_P__");
        }
        if self.diffusion_applied {
            name.push_str("DIFFUSION__");
        }
        if self.refinement_applied {
            name.push_str("OPTIMIZED__");
        }
        name.push_str(&format!("vis_{}", r.visibility_t));
        name
    }

    /// Write the final lines as ASCII STL into `folder`; returns the written
    /// path.
    pub fn write_stl(&self, folder: &Path) -> Result<PathBuf, crate::io::OutputError> {
        self.write_with(folder, "stl", crate::io::write_stl)
    }

    /// Write the final lines as Wavefront OBJ into `folder`.
    pub fn write_obj(&self, folder: &Path) -> Result<PathBuf, crate::io::OutputError> {
        self.write_with(folder, "obj", crate::io::write_obj)
    }

    /// Write the final lines with their 2D residuals as plain text into
    /// `folder`.
    pub fn write_txt(&self, folder: &Path) -> Result<PathBuf, crate::io::OutputError> {
        let inner = self.registry.read();
        let resolve = |seg: Segment2D| -> [f64; 4] {
            inner
                .view_by_id(seg.cam)
                .filter(|view| (seg.seg as usize) < view.num_segments())
                .map_or([0.0; 4], |view| view.segment(seg.seg).coords())
        };
        self.write_with(folder, "txt", |lines, path| {
            crate::io::write_txt(lines, &resolve, path)
        })
    }

    fn write_with(
        &self,
        folder: &Path,
        extension: &str,
        writer: impl Fn(&[FinalLine3D], &Path) -> Result<(), crate::io::OutputError>,
    ) -> Result<PathBuf, crate::io::OutputError> {
        if self.lines.is_empty() {
            warn!("no 3D lines to save");
            return Err(crate::io::OutputError::NoLines);
        }
        let path = folder.join(format!("{}.{extension}", self.result_filename()));
        writer(&self.lines, &path)?;
        Ok(path)
    }
}
