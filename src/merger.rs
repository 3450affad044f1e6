//! Near-duplicate pose hypothesis merging.
//!
//! Correspondence grouping often emits several clusters that place the same
//! model at almost the same pose. Clusters of one model whose centroids lie
//! within `merge_dist` and whose relative rotation decomposes into Euler
//! angles all below `merge_angle_deg` are collapsed: the absorbing cluster
//! takes the union of the correspondences, re-estimates its transform from
//! that union, and then continues absorbing against the updated pose.
//! Already-absorbed clusters are not revisited. Merging never crosses model
//! identifiers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cloud::PointCloud;
use crate::error::{check_non_negative, ConfigError};
use crate::geometry::{estimate_rigid_transform, rotation_angle_deltas};
use crate::grouping::GroupedCluster;
use crate::matching::KeypointStore;
use crate::types::ModelId;

/// Close-hypothesis merging parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergerConfig {
    /// Disabled merging passes every cluster through unchanged.
    pub enabled: bool,
    /// Maximum centroid (translation) distance in meters.
    pub merge_dist: f64,
    /// Maximum per-axis Euler rotation difference in degrees.
    pub merge_angle_deg: f64,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            merge_dist: 0.02,
            merge_angle_deg: 10.0,
        }
    }
}

impl MergerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("merge_dist", self.merge_dist)?;
        check_non_negative("merge_angle_deg", self.merge_angle_deg)?;
        Ok(())
    }
}

pub struct HypothesisMerger {
    config: MergerConfig,
}

impl HypothesisMerger {
    pub fn new(config: MergerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Merge close clusters per model; clusters of different models never mix.
    pub fn merge(
        &self,
        scene: &PointCloud,
        store: &KeypointStore,
        clusters: Vec<GroupedCluster>,
    ) -> Vec<GroupedCluster> {
        if !self.config.enabled {
            return clusters;
        }

        let mut by_model: HashMap<ModelId, Vec<GroupedCluster>> = HashMap::new();
        let mut model_order = Vec::new();
        for c in clusters {
            if !by_model.contains_key(&c.model_id) {
                model_order.push(c.model_id.clone());
            }
            by_model.entry(c.model_id.clone()).or_default().push(c);
        }

        let mut merged = Vec::new();
        for model in model_order {
            if let Some(group) = by_model.remove(&model) {
                merged.extend(self.merge_model(scene, store, model, group));
            }
        }
        merged
    }

    fn merge_model(
        &self,
        scene: &PointCloud,
        store: &KeypointStore,
        model: ModelId,
        clusters: Vec<GroupedCluster>,
    ) -> Vec<GroupedCluster> {
        let angle_rad = self.config.merge_angle_deg.to_radians();
        let n = clusters.len();
        let mut taken = vec![false; n];
        let mut out = Vec::new();

        for i in 0..n {
            if taken[i] {
                continue;
            }
            taken[i] = true;

            let mut pose = clusters[i].pose;
            let mut corrs = clusters[i].correspondences.clone();

            for (j, cluster) in clusters.iter().enumerate().skip(i + 1) {
                if taken[j] {
                    continue;
                }
                let dist = (pose.translation.vector - cluster.pose.translation.vector).norm();
                let [rx, ry, rz] = rotation_angle_deltas(&pose, &cluster.pose);
                if dist < self.config.merge_dist
                    && rx < angle_rad
                    && ry < angle_rad
                    && rz < angle_rad
                {
                    taken[j] = true;
                    corrs.extend_from_slice(&cluster.correspondences);

                    // Re-estimate from the union before comparing against
                    // the remaining clusters.
                    if let Some(keypoints) = store.keypoints(&model) {
                        let model_pts: Vec<_> =
                            corrs.iter().map(|c| keypoints.points[c.model_idx]).collect();
                        let scene_pts: Vec<_> =
                            corrs.iter().map(|c| scene.points[c.scene_idx]).collect();
                        if let Some(refit) = estimate_rigid_transform(&model_pts, &scene_pts) {
                            pose = refit;
                        }
                    }
                }
            }

            out.push(GroupedCluster {
                model_id: model.clone(),
                pose,
                correspondences: corrs,
            });
        }

        if out.len() < n {
            debug!(model = %model, before = n, after = out.len(), "merged close hypotheses");
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::FeatureMatcher;
    use crate::types::Correspondence;
    use approx::assert_relative_eq;
    use nalgebra::{Isometry3, Translation3, UnitQuaternion, Vector3};
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

    fn fixture() -> (PointCloud, KeypointStore) {
        let model_pts = vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.0, 0.1, 0.0),
        ];
        let scene = PointCloud::from_points(
            model_pts.iter().map(|p| p + Vector3::new(1.0, 0.0, 0.0)).collect(),
        );
        let matchers: Vec<Box<dyn FeatureMatcher>> =
            vec![Box::new(KpMatcher(PointCloud::from_points(model_pts)))];
        (scene, KeypointStore::build(&matchers))
    }

    fn cluster_at(offset: Vector3<f64>, angle_deg: f64) -> GroupedCluster {
        let pose = Isometry3::from_parts(
            Translation3::from(Vector3::new(1.0, 0.0, 0.0) + offset),
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle_deg.to_radians()),
        );
        GroupedCluster {
            model_id: ModelId::from("cube"),
            pose,
            correspondences: vec![
                Correspondence::new(0, 0, 0.1),
                Correspondence::new(1, 1, 0.1),
                Correspondence::new(2, 2, 0.1),
            ],
        }
    }

    #[test]
    fn test_close_duplicates_collapse_with_summed_support() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig::default()).unwrap();
        // Duplicate at 1 mm offset, well below the 0.02 m default.
        let merged = merger.merge(
            &scene,
            &store,
            vec![cluster_at(Vector3::zeros(), 0.0), cluster_at(Vector3::new(0.001, 0.0, 0.0), 0.0)],
        );
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].correspondences.len(), 6);
    }

    #[test]
    fn test_far_hypotheses_stay_separate() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig::default()).unwrap();
        let merged = merger.merge(
            &scene,
            &store,
            vec![cluster_at(Vector3::zeros(), 0.0), cluster_at(Vector3::new(0.5, 0.0, 0.0), 0.0)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_large_rotation_blocks_merge() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig::default()).unwrap();
        // Same centroid but 45° apart: beyond the 10° default.
        let merged = merger.merge(
            &scene,
            &store,
            vec![cluster_at(Vector3::zeros(), 0.0), cluster_at(Vector3::zeros(), 45.0)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_order_independent_partition() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig::default()).unwrap();
        let a = cluster_at(Vector3::zeros(), 0.0);
        let b = cluster_at(Vector3::new(0.001, 0.0, 0.0), 0.0);
        let c = cluster_at(Vector3::new(0.5, 0.0, 0.0), 0.0);

        let fwd = merger.merge(&scene, &store, vec![a, b, c]);
        let a = cluster_at(Vector3::zeros(), 0.0);
        let b = cluster_at(Vector3::new(0.001, 0.0, 0.0), 0.0);
        let c = cluster_at(Vector3::new(0.5, 0.0, 0.0), 0.0);
        let rev = merger.merge(&scene, &store, vec![c, b, a]);

        assert_eq!(fwd.len(), rev.len());
        let support = |v: &[GroupedCluster]| v.iter().map(|c| c.correspondences.len()).sum::<usize>();
        assert_eq!(support(&fwd), support(&rev));
    }

    #[test]
    fn test_disabled_passes_through() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig {
            enabled: false,
            ..MergerConfig::default()
        })
        .unwrap();
        let merged = merger.merge(
            &scene,
            &store,
            vec![cluster_at(Vector3::zeros(), 0.0), cluster_at(Vector3::new(0.001, 0.0, 0.0), 0.0)],
        );
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn test_merged_pose_reestimated_from_union() {
        let (scene, store) = fixture();
        let merger = HypothesisMerger::new(MergerConfig::default()).unwrap();
        let merged = merger.merge(
            &scene,
            &store,
            vec![cluster_at(Vector3::new(0.001, 0.0, 0.0), 0.0), cluster_at(Vector3::zeros(), 0.0)],
        );
        assert_eq!(merged.len(), 1);
        // Both clusters share the same correspondences, so the refit lands
        // on the exact model-to-scene shift.
        assert_relative_eq!(
            merged[0].pose.translation.vector,
            Vector3::new(1.0, 0.0, 0.0),
            epsilon = 1e-9
        );
    }
}
