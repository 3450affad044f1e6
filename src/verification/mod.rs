//! Global hypothesis verification.
//!
//! Given the full candidate pool (object poses across all models and
//! pipelines, plus optional plane candidates) and the scene, choose the
//! activation subset that best explains the observation: scene points near
//! an active candidate's visible surface are rewarded, unsupported
//! candidate points and nearby unexplained clutter are penalized, and
//! mutually exclusive candidates carry pairwise conflict penalties. The
//! subset is found by a configurable combinatorial search over single-
//! candidate activation flips.

pub mod cost;
pub mod model;
pub mod search;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cloud::PointCloud;
use crate::error::{check_non_negative, check_unit_interval, ConfigError};
use crate::matching::ModelDatabase;
use crate::types::{PlaneModel, PoseHypothesis};

use cost::CostArena;
use model::{CandidateModel, PruneReason, SceneIndex};
pub use search::SearchStrategy;

/// Verification parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifierConfig {
    /// Maximum model-to-scene distance (meters) for a scene point to count
    /// as explained; visible candidate points without support within this
    /// distance are model outliers.
    pub inliers_threshold: f64,
    /// Depth margin (meters) before a back-projected candidate point behind
    /// scene geometry counts as occluded.
    pub occlusion_threshold: f64,
    /// Angular cone (degrees) within which a scene point lies on the same
    /// viewing ray for occlusion comparison.
    pub occlusion_angle_deg: f64,
    /// Allowed illumination (L channel) deviation.
    pub color_sigma_l: f64,
    /// Allowed chrominance (ab channels) deviation.
    pub color_sigma_ab: f64,
    /// Allowed surface-normal deviation (degrees).
    pub sigma_normals_deg: f64,
    /// Penalty multiplier per model outlier point.
    pub regularizer: f64,
    /// Penalty multiplier per unexplained clutter point.
    pub clutter_regularizer: f64,
    /// Radius (meters) of the clutter neighborhood around explained points.
    pub radius_neighborhood_clutter: f64,
    /// Candidates with mean explanation weight below this never enter the
    /// search.
    pub min_model_fitness: f64,
    /// Candidates with a smaller visible fraction never enter the search.
    pub min_visible_ratio: f64,
    /// Fraction of shared explained support beyond which two candidates of
    /// the same model (or an object and a plane) are mutually exclusive.
    pub conflict_overlap_ratio: f64,
    /// Scale of the pairwise conflict penalty on the shared support weight.
    pub conflict_regularizer: f64,
    /// Initial activation status of every candidate entering the search.
    pub initial_status: bool,
    /// Search strategy.
    pub strategy: SearchStrategy,
    /// Iteration cap; the search returns the best activation found by then.
    pub max_iterations: usize,
    /// Tabu tenure (iterations a flipped candidate stays tabu).
    pub tabu_tenure: usize,
    /// Simulated-annealing start temperature.
    pub initial_temperature: f64,
    /// Geometric cooling factor per annealing iteration.
    pub cooling_rate: f64,
    /// Annealing RNG seed, fixed for reproducible runs.
    pub seed: u64,
}

impl Default for VerifierConfig {
    fn default() -> Self {
        Self {
            inliers_threshold: 0.01,
            occlusion_threshold: 0.01,
            occlusion_angle_deg: 2.0,
            color_sigma_l: 0.6,
            color_sigma_ab: 0.6,
            sigma_normals_deg: 30.0,
            regularizer: 3.0,
            clutter_regularizer: 5.0,
            radius_neighborhood_clutter: 0.03,
            min_model_fitness: 0.2,
            min_visible_ratio: 0.15,
            conflict_overlap_ratio: 0.3,
            conflict_regularizer: 2.0,
            initial_status: false,
            strategy: SearchStrategy::default(),
            max_iterations: 5000,
            tabu_tenure: 15,
            initial_temperature: 1.0,
            cooling_rate: 0.999,
            seed: 0,
        }
    }
}

impl VerifierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("inliers_threshold", self.inliers_threshold)?;
        check_non_negative("occlusion_threshold", self.occlusion_threshold)?;
        check_non_negative("occlusion_angle_deg", self.occlusion_angle_deg)?;
        check_non_negative("color_sigma_l", self.color_sigma_l)?;
        check_non_negative("color_sigma_ab", self.color_sigma_ab)?;
        check_non_negative("sigma_normals_deg", self.sigma_normals_deg)?;
        check_non_negative("regularizer", self.regularizer)?;
        check_non_negative("clutter_regularizer", self.clutter_regularizer)?;
        check_non_negative("radius_neighborhood_clutter", self.radius_neighborhood_clutter)?;
        check_unit_interval("min_model_fitness", self.min_model_fitness)?;
        check_unit_interval("min_visible_ratio", self.min_visible_ratio)?;
        check_unit_interval("conflict_overlap_ratio", self.conflict_overlap_ratio)?;
        check_non_negative("conflict_regularizer", self.conflict_regularizer)?;
        check_non_negative("initial_temperature", self.initial_temperature)?;
        check_unit_interval("cooling_rate", self.cooling_rate)?;
        if self.max_iterations == 0 {
            return Err(ConfigError::new("max_iterations", "must be positive"));
        }
        Ok(())
    }
}

/// Chooses which candidates are real.
pub struct HypothesisVerifier {
    config: VerifierConfig,
}

impl HypothesisVerifier {
    pub fn new(config: VerifierConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Verify the candidate pool against the scene.
    ///
    /// Returns one flag per candidate in the caller's ordering: object
    /// hypotheses first, then planes, the same convention as the input.
    /// Candidates pruned before the search (unknown model, nothing visible,
    /// low visibility or fitness) come back unverified.
    pub fn verify(
        &self,
        scene: &PointCloud,
        hypotheses: &[PoseHypothesis],
        planes: &[PlaneModel],
        db: &dyn ModelDatabase,
        segments: Option<&[usize]>,
    ) -> Vec<bool> {
        let total = hypotheses.len() + planes.len();
        if total == 0 {
            return Vec::new();
        }
        if scene.is_empty() {
            return vec![false; total];
        }

        let index = SceneIndex::build(scene, segments);

        // Cue computation is independent per candidate.
        let expanded: Vec<Result<CandidateModel, PruneReason>> = hypotheses
            .par_iter()
            .map(|h| match db.full_cloud(&h.model_id) {
                Some(cloud) => CandidateModel::from_hypothesis(h, cloud, &index, &self.config),
                None => Err(PruneReason::UnknownModel),
            })
            .chain(
                planes
                    .par_iter()
                    .map(|p| CandidateModel::from_plane(p, &index, &self.config)),
            )
            .collect();

        let mut eligible = Vec::new();
        let mut eligible_orig = Vec::new();
        for (orig, outcome) in expanded.into_iter().enumerate() {
            match outcome {
                Ok(cm) => {
                    eligible_orig.push(orig);
                    eligible.push(cm);
                }
                Err(reason) => {
                    let label = hypotheses
                        .get(orig)
                        .map(|h| h.model_id.to_string())
                        .unwrap_or_else(|| format!("plane#{}", orig - hypotheses.len()));
                    match reason {
                        PruneReason::UnknownModel => {
                            warn!(candidate = %label, "hypothesis references unknown model, rejected")
                        }
                        _ => debug!(candidate = %label, ?reason, "candidate pruned before search"),
                    }
                }
            }
        }

        let mut verified = vec![false; total];
        if eligible.is_empty() {
            return verified;
        }

        let conflicts = self.build_conflicts(&eligible);
        let mut arena = CostArena::new(
            &eligible,
            &conflicts,
            &self.config,
            scene.len(),
            self.config.initial_status,
        );
        search::optimize(&mut arena, &self.config);

        let active = arena.activation();
        debug!(
            candidates = eligible.len(),
            active = active.iter().filter(|&&a| a).count(),
            cost = arena.cost(),
            "hypothesis verification done"
        );
        for (pos, &orig) in eligible_orig.iter().enumerate() {
            verified[orig] = active[pos];
        }
        verified
    }

    /// Pairwise conflict edges: candidates of the same model, or an object
    /// and a plane, whose explained scene support overlaps beyond the
    /// configured ratio are mutually exclusive; the penalty scales with the
    /// weight of the shared support.
    fn build_conflicts(&self, candidates: &[CandidateModel]) -> Vec<Vec<(usize, f64)>> {
        let n = candidates.len();
        let mut conflicts = vec![Vec::new(); n];
        for i in 0..n {
            for j in (i + 1)..n {
                let exclusive_pair = match (&candidates[i].model_id, &candidates[j].model_id) {
                    (Some(a), Some(b)) => a == b,
                    // An object overlapping a plane (or vice versa) competes
                    // for the same scene region.
                    _ => true,
                };
                if !exclusive_pair {
                    continue;
                }

                let (overlap, shared_weight) =
                    explained_overlap(&candidates[i].explained, &candidates[j].explained);
                let smaller = candidates[i].explained.len().min(candidates[j].explained.len());
                if smaller == 0 {
                    continue;
                }
                if overlap as f64 / smaller as f64 > self.config.conflict_overlap_ratio {
                    let penalty = self.config.conflict_regularizer * shared_weight;
                    conflicts[i].push((j, penalty));
                    conflicts[j].push((i, penalty));
                }
            }
        }
        conflicts
    }
}

/// Count and accumulated min-weight of the shared scene indices of two
/// sorted explained lists.
fn explained_overlap(a: &[(usize, f64)], b: &[(usize, f64)]) -> (usize, f64) {
    let mut overlap = 0usize;
    let mut weight = 0.0;
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                overlap += 1;
                weight += a[i].1.min(b[j].1);
                i += 1;
                j += 1;
            }
        }
    }
    (overlap, weight)
}
