//! Parameter types configuring the reconstruction engine.
//!
//! Matching and reconstruction knobs arrive per phase call; engine-wide
//! options are fixed at construction. All clamps of the public contract are
//! applied on entry to a phase, and the effective (clamped) values are what
//! the result filename reports.

use serde::Deserialize;
use std::path::PathBuf;

/// Engine-wide options, fixed at construction time.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct EngineOptions {
    /// Maximum image dimension handed to the segment detector; larger images
    /// are downscaled for detection and the coordinates rescaled. 0 disables
    /// downscaling.
    pub max_image_width: u32,
    /// Upper bound on stored segments per view (longest kept).
    pub max_segments_per_view: usize,
    /// Interpret the per-view id list as shared tie-points (true) or as
    /// explicit visual-neighbor camera ids (false).
    pub neighbors_by_worldpoints: bool,
    /// Directory for the opaque per-view segment cache; `None` disables
    /// caching.
    pub segment_cache: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_image_width: 2048,
            max_segments_per_view: 3000,
            neighbors_by_worldpoints: true,
            segment_cache: None,
        }
    }
}

/// Parameters of the matching phase (neighbor selection, pairwise epipolar
/// matching and scoring).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct MatchingParams {
    /// Positional regularizer: non-negative values are a pixel sigma
    /// (minimum 0.1 px) converted per view; negative values fix a
    /// world-space sigma of `|sigma_p|` for every view.
    pub sigma_p: f64,
    /// Angular regularizer in degrees, clamped to [0, 90].
    pub sigma_a: f64,
    /// Maximum visual neighbors per view (at least 2).
    pub num_neighbors: usize,
    /// Minimum mutual epipolar overlap, clamped to [0, 0.99].
    pub epipolar_overlap: f64,
    /// Minimum baseline between a view and each admitted neighbor.
    pub min_baseline: f64,
    /// Candidates kept per source segment and view pair; 0 keeps all.
    pub knn: i32,
}

impl Default for MatchingParams {
    fn default() -> Self {
        Self {
            sigma_p: 2.5,
            sigma_a: 10.0,
            num_neighbors: 10,
            epipolar_overlap: 0.25,
            min_baseline: 0.1,
            knn: 10,
        }
    }
}

impl MatchingParams {
    /// Apply the documented clamps. `sigma_p` keeps its sign (it selects the
    /// regularizer mode); the magnitude floors are applied by
    /// [`MatchingParams::effective_sigma_p`].
    pub(crate) fn clamped(&self) -> MatchingParams {
        MatchingParams {
            sigma_p: self.sigma_p,
            sigma_a: self.sigma_a.abs().min(90.0),
            num_neighbors: self.num_neighbors.max(2),
            epipolar_overlap: self.epipolar_overlap.abs().min(0.99),
            min_baseline: self.min_baseline.max(0.0),
            knn: self.knn,
        }
    }

    /// Negative `sigma_p` selects a fixed world-space regularizer.
    pub(crate) fn fixed_regularizer(&self) -> bool {
        self.sigma_p < 0.0
    }

    /// Magnitude of the regularizer: `|sigma_p|` world units in fixed mode,
    /// at least 0.1 px otherwise.
    pub(crate) fn effective_sigma_p(&self) -> f64 {
        if self.fixed_regularizer() {
            self.sigma_p.abs()
        } else {
            self.sigma_p.max(0.1)
        }
    }
}

/// Parameters of the reconstruction phase (affinity, clustering, fitting).
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct ReconstructionParams {
    /// Minimum number of distinct cameras per surviving cluster (at least 3).
    pub visibility_t: usize,
    /// Reweight the affinity graph through the installed diffusion backend.
    pub perform_diffusion: bool,
    /// Pixel tolerance for in-view collinear affinity extensions; 0 disables
    /// them.
    pub collinearity_t: f64,
    /// Run the installed refinement backend on the clusters.
    pub refine: bool,
    /// Iteration cap handed to the refinement backend.
    pub max_refine_iter: usize,
}

impl Default for ReconstructionParams {
    fn default() -> Self {
        Self {
            visibility_t: 3,
            perform_diffusion: false,
            collinearity_t: 0.0,
            refine: false,
            max_refine_iter: 25,
        }
    }
}

impl ReconstructionParams {
    pub(crate) fn clamped(&self) -> ReconstructionParams {
        ReconstructionParams {
            visibility_t: self.visibility_t.max(3),
            ..*self
        }
    }
}
