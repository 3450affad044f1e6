//! Correspondence consolidation across independent feature matchers.
//!
//! Raw correspondences from every matcher are rebased into the unified
//! keypoint store and merged into one set per model, with geometrically
//! redundant pairs removed. Two correspondences are redundant when their
//! scene points and their model points are each closer than `min_dist`
//! and (when normals are available) the respective normals are near
//! parallel. Among redundant pairs, the smaller match distance wins.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cloud::PointCloud;
use crate::error::{check_non_negative, check_unit_interval, ConfigError};
use crate::matching::KeypointStore;
use crate::types::{Correspondence, ModelCorrespondences, ModelId};

/// Redundancy-filter parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsolidatorConfig {
    /// Below this spatial distance (meters) two scene points, or two model
    /// points, count as the same location.
    pub min_dist: f64,
    /// Normal dot products above this count as near parallel.
    pub max_dotp: f64,
}

impl Default for ConsolidatorConfig {
    fn default() -> Self {
        Self {
            min_dist: 0.01,
            max_dotp: 0.8,
        }
    }
}

impl ConsolidatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("min_dist", self.min_dist)?;
        check_unit_interval("max_dotp", self.max_dotp)?;
        Ok(())
    }
}

/// Raw output of one matcher, with correspondence indices still local to
/// that matcher's own keypoint clouds.
pub struct MatcherOutput {
    /// Position of the matcher in the pipeline's matcher list (keys the
    /// keypoint-store offsets).
    pub matcher_idx: usize,
    /// Number of sub-estimators the matcher ran.
    pub num_estimators: usize,
    /// Per-model correspondences.
    pub correspondences: Vec<(ModelId, Vec<Correspondence>)>,
}

/// Merges per-matcher correspondences into one deduplicated set per model.
pub struct Consolidator {
    config: ConsolidatorConfig,
}

impl Consolidator {
    pub fn new(config: ConsolidatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Consolidate all matcher outputs against the unified keypoint store.
    ///
    /// Matchers reporting nothing for a model are skipped silently; a
    /// contribution with out-of-bounds indices is dropped with a warning
    /// (the model's other contributions still count).
    pub fn consolidate(
        &self,
        scene: &PointCloud,
        store: &KeypointStore,
        outputs: Vec<MatcherOutput>,
    ) -> ModelCorrespondences {
        let mut merged = ModelCorrespondences::new();

        for output in outputs {
            for (model, mut corrs) in output.correspondences {
                if corrs.is_empty() {
                    continue;
                }

                let Some(keypoints) = store.keypoints(&model) else {
                    warn!(model = %model, "matcher reported correspondences for unknown model, skipping");
                    continue;
                };

                // Rebase matcher-local keypoint indices into the merged store.
                let offset = store.offset(output.matcher_idx, &model);
                for c in &mut corrs {
                    c.model_idx += offset;
                }

                if corrs
                    .iter()
                    .any(|c| c.scene_idx >= scene.len() || c.model_idx >= keypoints.len())
                {
                    warn!(
                        model = %model,
                        matcher = output.matcher_idx,
                        "correspondence indices out of bounds, dropping this matcher's contribution"
                    );
                    continue;
                }

                // Multi-estimator matchers can report near-identical pairs
                // across scales; filter within the matcher's own output first.
                if output.num_estimators > 1 {
                    corrs = filter_redundant(&corrs, scene, keypoints, &self.config);
                }

                if !merged.contains(&model) {
                    merged.insert(model, corrs);
                    continue;
                }

                let existing = merged.get_mut_or_default(&model);
                let before = corrs.len();
                let mut appended = 0usize;
                for new_c in corrs {
                    match find_redundant(&new_c, existing, scene, keypoints, &self.config) {
                        Some(i) => {
                            // Keep the better (smaller-distance) match.
                            if new_c.distance < existing[i].distance {
                                existing[i] = new_c;
                            }
                        }
                        None => {
                            existing.push(new_c);
                            appended += 1;
                        }
                    }
                }
                debug!(model = %model, kept = appended, out_of = before, "merged matcher correspondences");
            }
        }

        merged
    }
}

/// Index of the first correspondence in `existing` redundant with `c`.
fn find_redundant(
    c: &Correspondence,
    existing: &[Correspondence],
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &ConsolidatorConfig,
) -> Option<usize> {
    existing
        .iter()
        .position(|e| is_redundant(c, e, scene, keypoints, config))
}

/// Redundancy predicate between two correspondences of the same model.
fn is_redundant(
    a: &Correspondence,
    b: &Correspondence,
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &ConsolidatorConfig,
) -> bool {
    let scene_close =
        (scene.points[a.scene_idx] - scene.points[b.scene_idx]).norm() < config.min_dist;
    let model_close =
        (keypoints.points[a.model_idx] - keypoints.points[b.model_idx]).norm() < config.min_dist;
    if !(scene_close && model_close) {
        return false;
    }

    // Without normals the spatial checks alone decide.
    let scene_parallel = match (scene.normal(a.scene_idx), scene.normal(b.scene_idx)) {
        (Some(na), Some(nb)) => na.dot(&nb) > config.max_dotp,
        _ => true,
    };
    let model_parallel = match (keypoints.normal(a.model_idx), keypoints.normal(b.model_idx)) {
        (Some(na), Some(nb)) => na.dot(&nb) > config.max_dotp,
        _ => true,
    };
    scene_parallel && model_parallel
}

/// Remove redundant correspondences within one set, keeping for each
/// redundancy group the first-seen entry. Idempotent: running it on an
/// already-filtered set returns the set unchanged.
pub fn filter_redundant(
    corrs: &[Correspondence],
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &ConsolidatorConfig,
) -> Vec<Correspondence> {
    let mut kept: Vec<Correspondence> = Vec::with_capacity(corrs.len());
    for c in corrs {
        if find_redundant(c, &kept, scene, keypoints, config).is_none() {
            kept.push(*c);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::FeatureMatcher;
    use nalgebra::Vector3;
    use std::collections::HashMap;

    fn spread_cloud(n: usize) -> PointCloud {
        // Points 1 m apart: nothing is redundant by position.
        PointCloud::from_points((0..n).map(|i| Vector3::new(i as f64, 0.0, 0.0)).collect())
    }

    #[test]
    fn test_filter_is_idempotent() {
        let scene = spread_cloud(10);
        let mut keypoints = spread_cloud(10);
        // Bring two model keypoints within min_dist of each other.
        keypoints.points[1] = keypoints.points[0] + Vector3::new(0.001, 0.0, 0.0);

        let mut scene_dup = scene.clone();
        scene_dup.points[1] = scene_dup.points[0] + Vector3::new(0.001, 0.0, 0.0);

        let corrs = vec![
            Correspondence::new(0, 0, 0.2),
            Correspondence::new(1, 1, 0.5), // redundant with the first
            Correspondence::new(2, 2, 0.1),
        ];
        let config = ConsolidatorConfig::default();

        let once = filter_redundant(&corrs, &scene_dup, &keypoints, &config);
        assert_eq!(once.len(), 2);
        let twice = filter_redundant(&once, &scene_dup, &keypoints, &config);
        assert_eq!(once, twice);
    }

    #[test]
    fn test_redundant_merge_keeps_smaller_distance() {
        struct M {
            kp: PointCloud,
            out: Vec<Correspondence>,
        }
        impl FeatureMatcher for M {
            fn match_scene(&self, _s: &PointCloud) -> HashMap<ModelId, Vec<Correspondence>> {
                HashMap::from([(ModelId::from("m"), self.out.clone())])
            }
            fn model_keypoints(&self) -> HashMap<ModelId, PointCloud> {
                HashMap::from([(ModelId::from("m"), self.kp.clone())])
            }
            fn feature_type(&self) -> u32 {
                0
            }
        }

        let scene = spread_cloud(5);
        // Both matchers see the same keypoint location; the merged store
        // holds each matcher's copy at a different offset.
        let kp = PointCloud::from_points(vec![Vector3::new(0.0, 5.0, 0.0)]);
        let m1 = M {
            kp: kp.clone(),
            out: vec![Correspondence::new(0, 0, 0.9)],
        };
        let m2 = M {
            kp,
            out: vec![Correspondence::new(0, 0, 0.3)],
        };
        let matchers: Vec<Box<dyn FeatureMatcher>> = vec![Box::new(m1), Box::new(m2)];
        let store = KeypointStore::build(&matchers);

        let outputs = matchers
            .iter()
            .enumerate()
            .map(|(i, m)| MatcherOutput {
                matcher_idx: i,
                num_estimators: m.num_estimators(),
                correspondences: m.match_scene(&scene).into_iter().collect(),
            })
            .collect();

        let consolidator = Consolidator::new(ConsolidatorConfig::default()).unwrap();
        let merged = consolidator.consolidate(&scene, &store, outputs);

        let set = merged.get(&ModelId::from("m")).unwrap();
        assert_eq!(set.len(), 1);
        // The second matcher's better match replaced the first.
        assert_eq!(set[0].distance, 0.3);
    }

    #[test]
    fn test_out_of_bounds_contribution_dropped() {
        let scene = spread_cloud(3);
        let keypoints = spread_cloud(3);

        struct M {
            kp: PointCloud,
        }
        impl FeatureMatcher for M {
            fn match_scene(&self, _s: &PointCloud) -> HashMap<ModelId, Vec<Correspondence>> {
                HashMap::new()
            }
            fn model_keypoints(&self) -> HashMap<ModelId, PointCloud> {
                HashMap::from([(ModelId::from("m"), self.kp.clone())])
            }
            fn feature_type(&self) -> u32 {
                0
            }
        }
        let matchers: Vec<Box<dyn FeatureMatcher>> = vec![Box::new(M { kp: keypoints })];
        let store = KeypointStore::build(&matchers);

        let outputs = vec![MatcherOutput {
            matcher_idx: 0,
            num_estimators: 1,
            correspondences: vec![(
                ModelId::from("m"),
                vec![Correspondence::new(99, 0, 0.1)], // scene index out of range
            )],
        }];
        let consolidator = Consolidator::new(ConsolidatorConfig::default()).unwrap();
        let merged = consolidator.consolidate(&scene, &store, outputs);
        assert!(merged.is_empty());
    }
}
