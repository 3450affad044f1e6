//! ICP pose refinement against a cropped scene region.
//!
//! Each surviving hypothesis gets a bounded number of iterative-closest-
//! point rounds. The scene is first cropped to the model's bounding box at
//! the current pose, inflated by the correspondence margin, so the nearest-
//! neighbor queries never touch unrelated scene geometry. Refinement only
//! adjusts the transform; the model identity is untouched, and when
//! correspondence rejection leaves too few inliers the original transform
//! is kept rather than failing the hypothesis.

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::{Isometry3, Point3, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cloud::PointCloud;
use crate::error::{check_non_negative, ConfigError};
use crate::geometry::estimate_rigid_transform;

/// Pose refinement parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefineConfig {
    /// Number of ICP iterations; 0 disables refinement entirely.
    pub icp_iterations: u32,
    /// Maximum model-to-scene correspondence distance (meters); also the
    /// margin added around the model bounding box when cropping the scene.
    pub max_corr_distance: f64,
    /// Minimum accepted correspondences per iteration; below this the
    /// hypothesis keeps its incoming transform.
    pub min_correspondences: usize,
    /// Convergence threshold on the incremental translation (meters).
    pub translation_epsilon: f64,
    /// Convergence threshold on the incremental rotation (radians).
    pub rotation_epsilon: f64,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            icp_iterations: 0,
            max_corr_distance: 0.05,
            min_correspondences: 10,
            translation_epsilon: 1e-4,
            rotation_epsilon: 1e-4,
        }
    }
}

impl RefineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_non_negative("max_corr_distance", self.max_corr_distance)?;
        check_non_negative("translation_epsilon", self.translation_epsilon)?;
        check_non_negative("rotation_epsilon", self.rotation_epsilon)?;
        Ok(())
    }
}

pub struct PoseRefiner {
    config: RefineConfig,
}

impl PoseRefiner {
    pub fn new(config: RefineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn enabled(&self) -> bool {
        self.config.icp_iterations > 0
    }

    /// Refine `pose` aligning `model` into `scene`. Always returns a usable
    /// transform: the refined one, or the input pose when refinement cannot
    /// find enough support.
    pub fn refine(
        &self,
        scene: &PointCloud,
        model: &PointCloud,
        pose: &Isometry3<f64>,
    ) -> Isometry3<f64> {
        if self.config.icp_iterations == 0 || model.is_empty() {
            return *pose;
        }

        let cropped = match self.crop_scene(scene, model, pose) {
            Some(c) => c,
            None => return *pose,
        };
        if cropped.len() < self.config.min_correspondences {
            debug!(
                cropped = cropped.len(),
                "too few scene points near hypothesis, keeping pose"
            );
            return *pose;
        }

        let mut tree: KdTree<f64, 3> = KdTree::new();
        for (i, p) in cropped.iter().enumerate() {
            tree.add(&[p.x, p.y, p.z], i as u64);
        }

        let max_sq = self.config.max_corr_distance * self.config.max_corr_distance;
        let mut current = *pose;

        for iteration in 0..self.config.icp_iterations {
            let mut src = Vec::new();
            let mut dst = Vec::new();
            for mp in &model.points {
                let p = (current * Point3::from(*mp)).coords;
                let nn = tree.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
                if nn.distance <= max_sq {
                    src.push(p);
                    dst.push(cropped[nn.item as usize]);
                }
            }

            if src.len() < self.config.min_correspondences {
                debug!(iteration, inliers = src.len(), "ICP starved of inliers, keeping pose");
                return *pose;
            }

            let Some(delta) = estimate_rigid_transform(&src, &dst) else {
                return *pose;
            };
            current = delta * current;

            if delta.translation.vector.norm() < self.config.translation_epsilon
                && delta.rotation.angle() < self.config.rotation_epsilon
            {
                break;
            }
        }

        current
    }

    /// Scene points inside the model's posed bounding box plus margin.
    fn crop_scene(
        &self,
        scene: &PointCloud,
        model: &PointCloud,
        pose: &Isometry3<f64>,
    ) -> Option<Vec<Vector3<f64>>> {
        let posed = model.transformed(pose);
        let (mut min, mut max) = posed.bounds()?;
        let margin = Vector3::repeat(self.config.max_corr_distance);
        min -= margin;
        max += margin;

        Some(
            scene
                .points
                .iter()
                .filter(|p| (0..3).all(|k| p[k] >= min[k] && p[k] <= max[k]))
                .copied()
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Translation3;

    // Planar grid, spaced so a few-millimeter offset still pairs every
    // point with its true counterpart.
    fn grid_model() -> PointCloud {
        let mut pts = Vec::new();
        for i in 0..6 {
            for j in 0..6 {
                pts.push(Vector3::new(i as f64 * 0.02, j as f64 * 0.02, 0.0));
            }
        }
        PointCloud::from_points(pts)
    }

    #[test]
    fn test_zero_iterations_is_passthrough() {
        let model = grid_model();
        let scene = model.clone();
        let refiner = PoseRefiner::new(RefineConfig::default()).unwrap();
        assert!(!refiner.enabled());
        let pose = Isometry3::translation(0.5, 0.0, 0.0);
        assert_eq!(refiner.refine(&scene, &model, &pose), pose);
    }

    #[test]
    fn test_converges_onto_shifted_instance() {
        let model = grid_model();
        let true_pose = Isometry3::translation(1.0, 0.2, -0.5);
        let scene = model.transformed(&true_pose);

        // Start a few millimeters off.
        let initial = Isometry3::from_parts(
            Translation3::new(1.004, 0.197, -0.503),
            true_pose.rotation,
        );
        let refiner = PoseRefiner::new(RefineConfig {
            icp_iterations: 30,
            ..RefineConfig::default()
        })
        .unwrap();
        let refined = refiner.refine(&scene, &model, &initial);
        assert_relative_eq!(
            refined.translation.vector,
            true_pose.translation.vector,
            epsilon = 1e-4
        );
    }

    #[test]
    fn test_too_few_inliers_keeps_pose() {
        let model = grid_model();
        // Scene far away from the hypothesis: crop leaves nothing.
        let scene = model.transformed(&Isometry3::translation(10.0, 0.0, 0.0));
        let refiner = PoseRefiner::new(RefineConfig {
            icp_iterations: 10,
            ..RefineConfig::default()
        })
        .unwrap();
        let pose = Isometry3::identity();
        assert_eq!(refiner.refine(&scene, &model, &pose), pose);
    }
}
