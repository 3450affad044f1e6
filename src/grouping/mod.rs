//! Geometric correspondence grouping.
//!
//! Partitions each model's correspondence set into clusters that are
//! mutually consistent under a single rigid transform, and emits one
//! candidate pose per retained cluster. The graph-based algorithm builds a
//! pairwise compatibility graph and extracts consistent clusters from it;
//! when the accumulated grouping work exceeds a wall-clock budget, the
//! remaining models fall back to a cheaper greedy pass instead.

pub mod graph;
pub mod greedy;

use std::time::{Duration, Instant};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cloud::PointCloud;
use crate::error::{check_non_negative, ConfigError};
use crate::geometry::{estimate_rigid_transform, MIN_PAIRS};
use crate::matching::KeypointStore;
use crate::types::{Correspondence, ModelCorrespondences, ModelId};

/// Correspondence-grouping parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupingConfig {
    /// Minimum cluster size; at least 3 correspondences are needed for a
    /// 6-DOF pose.
    pub gc_threshold: usize,
    /// Consensus resolution (meters): relative scene/model distances of a
    /// compatible pair must agree within this tolerance.
    pub gc_size: f64,
    /// Allowed disagreement between the scene-pair and model-pair normal
    /// dot products, when normals are available.
    pub thres_dot_distance: f64,
    /// Use the graph-based algorithm (otherwise always greedy).
    pub use_graph: bool,
    /// Wall-clock budget for graph-based grouping across all models;
    /// once exhausted, remaining models use the greedy fallback.
    pub max_time_cliques_ms: u64,
}

impl Default for GroupingConfig {
    fn default() -> Self {
        Self {
            gc_threshold: 3,
            gc_size: 0.01,
            thres_dot_distance: 0.2,
            use_graph: true,
            max_time_cliques_ms: 100,
        }
    }
}

impl GroupingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gc_threshold < MIN_PAIRS {
            return Err(ConfigError::new(
                "gc_threshold",
                format!("must be at least {MIN_PAIRS}, got {}", self.gc_threshold),
            ));
        }
        check_non_negative("gc_size", self.gc_size)?;
        check_non_negative("thres_dot_distance", self.thres_dot_distance)?;
        Ok(())
    }
}

/// Groups consolidated correspondences into rigid-pose clusters.
pub struct CorrespondenceGrouper {
    config: GroupingConfig,
}

/// One retained cluster with its estimated pose.
pub struct GroupedCluster {
    pub model_id: ModelId,
    pub pose: nalgebra::Isometry3<f64>,
    pub correspondences: Vec<Correspondence>,
}

impl CorrespondenceGrouper {
    pub fn new(config: GroupingConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Cluster every model's correspondences, draining the input sets.
    ///
    /// Models are independent and processed in parallel; the clique-time
    /// budget is shared across them through a common deadline.
    pub fn group_all(
        &self,
        scene: &PointCloud,
        store: &KeypointStore,
        correspondences: &mut ModelCorrespondences,
    ) -> Vec<GroupedCluster> {
        let deadline = Instant::now() + Duration::from_millis(self.config.max_time_cliques_ms);
        let per_model: Vec<(ModelId, Vec<Correspondence>)> = correspondences.drain().collect();

        let mut clusters: Vec<GroupedCluster> = per_model
            .into_par_iter()
            .flat_map(|(model, corrs)| self.group_model(scene, store, model, corrs, deadline))
            .collect();
        // Parallel collection order is nondeterministic; fix it.
        clusters.sort_by(|a, b| {
            a.model_id
                .cmp(&b.model_id)
                .then(b.correspondences.len().cmp(&a.correspondences.len()))
        });
        clusters
    }

    fn group_model(
        &self,
        scene: &PointCloud,
        store: &KeypointStore,
        model: ModelId,
        mut corrs: Vec<Correspondence>,
        deadline: Instant,
    ) -> Vec<GroupedCluster> {
        if corrs.len() < MIN_PAIRS {
            return Vec::new();
        }
        let Some(keypoints) = store.keypoints(&model) else {
            warn!(model = %model, "no keypoints for model, skipping grouping");
            return Vec::new();
        };

        // Deterministic cluster order: best matches first, stable tie-break.
        corrs.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.scene_idx.cmp(&b.scene_idx))
                .then(a.model_idx.cmp(&b.model_idx))
        });

        let clusters = if self.config.use_graph {
            match graph::cluster(&corrs, scene, keypoints, &self.config, deadline) {
                Some(c) => c,
                None => {
                    debug!(model = %model, "clique budget exhausted, greedy fallback");
                    greedy::cluster(&corrs, scene, keypoints, &self.config)
                }
            }
        } else {
            greedy::cluster(&corrs, scene, keypoints, &self.config)
        };

        let mut out = Vec::with_capacity(clusters.len());
        for cluster in clusters {
            debug_assert!(cluster.len() >= self.config.gc_threshold);
            let members: Vec<Correspondence> = cluster.iter().map(|&i| corrs[i]).collect();
            let model_pts: Vec<_> = members.iter().map(|c| keypoints.points[c.model_idx]).collect();
            let scene_pts: Vec<_> = members.iter().map(|c| scene.points[c.scene_idx]).collect();
            match estimate_rigid_transform(&model_pts, &scene_pts) {
                Some(pose) => out.push(GroupedCluster {
                    model_id: model.clone(),
                    pose,
                    correspondences: members,
                }),
                None => {
                    debug!(model = %model, size = members.len(), "degenerate cluster dropped");
                }
            }
        }
        debug!(model = %model, clusters = out.len(), "correspondence grouping done");
        out
    }
}

/// Pairwise rigid-consistency predicate between two correspondences.
///
/// The relative scene distance and relative model distance must agree
/// within `gc_size`, and when normals exist on both sides the pairwise
/// normal angles must agree within `thres_dot_distance`.
pub(crate) fn pair_consistent(
    a: &Correspondence,
    b: &Correspondence,
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &GroupingConfig,
) -> bool {
    if a.scene_idx == b.scene_idx || a.model_idx == b.model_idx {
        return false;
    }
    let d_scene = (scene.points[a.scene_idx] - scene.points[b.scene_idx]).norm();
    let d_model = (keypoints.points[a.model_idx] - keypoints.points[b.model_idx]).norm();
    if (d_scene - d_model).abs() >= config.gc_size {
        return false;
    }

    match (
        scene.normal(a.scene_idx),
        scene.normal(b.scene_idx),
        keypoints.normal(a.model_idx),
        keypoints.normal(b.model_idx),
    ) {
        (Some(sa), Some(sb), Some(ma), Some(mb)) => {
            (sa.dot(&sb) - ma.dot(&mb)).abs() < config.thres_dot_distance
        }
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::FeatureMatcher;
    use nalgebra::Vector3;
    use std::collections::HashMap;

    struct KpMatcher(PointCloud);
    impl FeatureMatcher for KpMatcher {
        fn match_scene(&self, _s: &PointCloud) -> HashMap<ModelId, Vec<Correspondence>> {
            HashMap::new()
        }
        fn model_keypoints(&self) -> HashMap<ModelId, PointCloud> {
            HashMap::from([(ModelId::from("cube"), self.0.clone())])
        }
        fn feature_type(&self) -> u32 {
            0
        }
    }

    fn store_with(kp: PointCloud) -> KeypointStore {
        let matchers: Vec<Box<dyn FeatureMatcher>> = vec![Box::new(KpMatcher(kp))];
        KeypointStore::build(&matchers)
    }

    /// Three mutually consistent correspondences: identical relative
    /// distances in model and scene (scene is the model shifted by 1 m).
    fn consistent_setup() -> (PointCloud, KeypointStore, ModelCorrespondences) {
        let model_pts = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.0, 0.1, 0.0),
        ];
        let scene_pts: Vec<_> = model_pts
            .iter()
            .map(|p| p + Vector3::new(1.0, 0.0, 0.0))
            .collect();
        let scene = PointCloud::from_points(scene_pts);
        let store = store_with(PointCloud::from_points(model_pts));
        let mut mc = ModelCorrespondences::new();
        mc.insert(
            ModelId::from("cube"),
            vec![
                Correspondence::new(0, 0, 0.1),
                Correspondence::new(1, 1, 0.2),
                Correspondence::new(2, 2, 0.3),
            ],
        );
        (scene, store, mc)
    }

    #[test]
    fn test_consistent_triple_yields_one_cluster() {
        let (scene, store, mut mc) = consistent_setup();
        let grouper = CorrespondenceGrouper::new(GroupingConfig::default()).unwrap();
        let clusters = grouper.group_all(&scene, &store, &mut mc);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].correspondences.len(), 3);
        approx::assert_relative_eq!(
            clusters[0].pose.translation.vector,
            Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-9
        );
        // Input sets are consumed.
        assert!(mc.is_empty());
    }

    #[test]
    fn test_never_emits_undersized_cluster() {
        let (scene, store, mut mc) = consistent_setup();
        let config = GroupingConfig {
            gc_threshold: 4,
            ..GroupingConfig::default()
        };
        let grouper = CorrespondenceGrouper::new(config).unwrap();
        let clusters = grouper.group_all(&scene, &store, &mut mc);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_fewer_than_three_correspondences_skipped() {
        let (scene, store, _) = consistent_setup();
        let mut mc = ModelCorrespondences::new();
        mc.insert(
            ModelId::from("cube"),
            vec![Correspondence::new(0, 0, 0.1), Correspondence::new(1, 1, 0.2)],
        );
        let grouper = CorrespondenceGrouper::new(GroupingConfig::default()).unwrap();
        assert!(grouper.group_all(&scene, &store, &mut mc).is_empty());
    }

    #[test]
    fn test_greedy_matches_graph_on_clean_input() {
        let (scene, store, mut mc) = consistent_setup();
        let config = GroupingConfig {
            use_graph: false,
            ..GroupingConfig::default()
        };
        let grouper = CorrespondenceGrouper::new(config).unwrap();
        let clusters = grouper.group_all(&scene, &store, &mut mc);
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].correspondences.len(), 3);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let config = GroupingConfig {
            gc_threshold: 2,
            ..GroupingConfig::default()
        };
        assert!(CorrespondenceGrouper::new(config).is_err());
    }
}
