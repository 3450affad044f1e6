//! Per-candidate cue computation for hypothesis verification.
//!
//! Before the activation search runs, every candidate (object pose or
//! plane) is expanded into a `CandidateModel`: which of its points survive
//! occlusion reasoning, which scene points it explains and how well, how
//! many of its visible points are outliers, and which nearby scene points
//! would count as clutter if left unexplained. All of it is computed once,
//! so search moves only touch precomputed sparse index lists.

use std::collections::HashMap;

use kiddo::{KdTree, SquaredEuclidean};
use nalgebra::Vector3;

use crate::cloud::PointCloud;
use crate::types::{ModelId, PlaneModel, PoseHypothesis};

use super::VerifierConfig;

/// Scene lookup structures shared by all candidates during one run.
pub struct SceneIndex<'a> {
    pub cloud: &'a PointCloud,
    /// Kd-tree over scene point positions.
    pub positions: KdTree<f64, 3>,
    /// Kd-tree over normalized viewing directions (unit vectors from the
    /// sensor origin), used for occlusion back-projection.
    pub directions: KdTree<f64, 3>,
    /// Range (distance from the sensor origin) per scene point.
    pub ranges: Vec<f64>,
    /// Smooth-segment id per scene point, when a segmentation was supplied.
    pub segments: Option<&'a [usize]>,
}

impl<'a> SceneIndex<'a> {
    pub fn build(cloud: &'a PointCloud, segments: Option<&'a [usize]>) -> Self {
        let mut positions: KdTree<f64, 3> = KdTree::new();
        let mut directions: KdTree<f64, 3> = KdTree::new();
        let mut ranges = Vec::with_capacity(cloud.len());
        for (i, p) in cloud.points.iter().enumerate() {
            positions.add(&[p.x, p.y, p.z], i as u64);
            let range = p.norm();
            ranges.push(range);
            if range > f64::EPSILON {
                let d = p / range;
                directions.add(&[d.x, d.y, d.z], i as u64);
            }
        }
        Self {
            cloud,
            positions,
            directions,
            ranges,
            segments,
        }
    }
}

/// Why a candidate never entered the activation search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PruneReason {
    /// The referenced model id is not in the database.
    UnknownModel,
    /// No points survive occlusion reasoning.
    NoVisiblePoints,
    /// Visible fraction below `min_visible_ratio`.
    LowVisibility,
    /// Mean explanation weight below `min_model_fitness`.
    LowFitness,
}

/// A candidate expanded into verification cues.
#[derive(Debug)]
pub struct CandidateModel {
    /// Model id for object candidates; `None` for planes.
    pub model_id: Option<ModelId>,
    /// Visible points after occlusion reasoning (scene frame).
    pub visible_count: usize,
    /// Total point count before occlusion reasoning.
    pub complete_count: usize,
    /// Scene points this candidate explains, with agreement weight in (0, 1].
    /// Sorted by scene index, each index appearing once.
    pub explained: Vec<(usize, f64)>,
    /// Visible candidate points with no scene support within the inlier
    /// threshold.
    pub outlier_count: usize,
    /// Scene points adjacent to the explained region that this candidate
    /// does not explain itself; unexplained ones are charged as clutter.
    pub clutter_neighbors: Vec<usize>,
    /// Mean explanation weight over visible points.
    pub fitness: f64,
}

impl CandidateModel {
    /// Expand an object hypothesis. `model_cloud` is the assembled model in
    /// its own frame; `None` return carries the prune reason.
    pub fn from_hypothesis(
        hypothesis: &PoseHypothesis,
        model_cloud: &PointCloud,
        scene: &SceneIndex<'_>,
        config: &VerifierConfig,
    ) -> Result<Self, PruneReason> {
        let posed = model_cloud.transformed(&hypothesis.pose);
        let complete_count = posed.len();
        if complete_count == 0 {
            return Err(PruneReason::NoVisiblePoints);
        }

        // Self-occlusion / scene-occlusion: a candidate point whose viewing
        // ray hits closer scene geometry (beyond the sensor-noise threshold)
        // is excluded from all accounting.
        let occlusion_cone = 2.0 * (config.occlusion_angle_deg.to_radians() / 2.0).sin();
        let visible: Vec<usize> = (0..complete_count)
            .filter(|&i| {
                let p = posed.points[i];
                let range = p.norm();
                if range <= f64::EPSILON {
                    return true;
                }
                let d = p / range;
                let nn = scene.directions.nearest_one::<SquaredEuclidean>(&[d.x, d.y, d.z]);
                if nn.distance.sqrt() > occlusion_cone {
                    return true;
                }
                scene.ranges[nn.item as usize] + config.occlusion_threshold >= range
            })
            .collect();

        if visible.is_empty() {
            return Err(PruneReason::NoVisiblePoints);
        }
        let visible_ratio = visible.len() as f64 / complete_count as f64;
        if visible_ratio < config.min_visible_ratio {
            return Err(PruneReason::LowVisibility);
        }

        // Explained scene points: nearest scene point per visible candidate
        // point, weighted by normal and color agreement.
        let inlier_sq = config.inliers_threshold * config.inliers_threshold;
        let mut explained: HashMap<usize, f64> = HashMap::new();
        let mut outlier_count = 0usize;
        let mut weight_sum = 0.0;
        for &i in &visible {
            let p = posed.points[i];
            let nn = scene.positions.nearest_one::<SquaredEuclidean>(&[p.x, p.y, p.z]);
            if nn.distance > inlier_sq {
                outlier_count += 1;
                continue;
            }
            let s = nn.item as usize;
            let w = agreement_weight(&posed, i, scene.cloud, s, nn.distance, config);
            weight_sum += w;
            let entry = explained.entry(s).or_insert(0.0);
            if w > *entry {
                *entry = w;
            }
        }

        let fitness = weight_sum / visible.len() as f64;
        if fitness < config.min_model_fitness {
            return Err(PruneReason::LowFitness);
        }

        let mut explained: Vec<(usize, f64)> = explained.into_iter().collect();
        explained.sort_unstable_by_key(|&(s, _)| s);

        let clutter_neighbors = clutter_neighborhood(&explained, scene, config);

        Ok(Self {
            model_id: Some(hypothesis.model_id.clone()),
            visible_count: visible.len(),
            complete_count,
            explained,
            outlier_count,
            clutter_neighbors,
            fitness,
        })
    }

    /// Expand a plane candidate: its inliers are both its point set and its
    /// explained scene points, with full weight and no occlusion reasoning.
    pub fn from_plane(
        plane: &PlaneModel,
        scene: &SceneIndex<'_>,
        config: &VerifierConfig,
    ) -> Result<Self, PruneReason> {
        if plane.inliers.is_empty() {
            return Err(PruneReason::NoVisiblePoints);
        }
        let mut explained: Vec<(usize, f64)> = plane
            .inliers
            .iter()
            .filter(|&&s| s < scene.cloud.len())
            .map(|&s| (s, 1.0))
            .collect();
        if explained.is_empty() {
            return Err(PruneReason::NoVisiblePoints);
        }
        explained.sort_unstable_by_key(|&(s, _)| s);
        explained.dedup_by_key(|&mut (s, _)| s);

        let clutter_neighbors = clutter_neighborhood(&explained, scene, config);
        let count = explained.len();

        Ok(Self {
            model_id: None,
            visible_count: count,
            complete_count: count,
            explained,
            outlier_count: 0,
            clutter_neighbors,
            fitness: 1.0,
        })
    }

    /// Scene indices this candidate explains.
    pub fn explained_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.explained.iter().map(|&(s, _)| s)
    }
}

/// Gaussian agreement weight between a candidate point and its scene
/// support, combining position, normal, and color cues. Missing normal or
/// color channels degrade that factor to 1.
fn agreement_weight(
    posed: &PointCloud,
    model_idx: usize,
    scene: &PointCloud,
    scene_idx: usize,
    dist_sq: f64,
    config: &VerifierConfig,
) -> f64 {
    // One-sigma reach of a third of the inlier band, so a support point at
    // the threshold edge contributes almost nothing.
    let sigma_d = config.inliers_threshold / 3.0;
    let mut w = (-0.5 * dist_sq / (sigma_d * sigma_d)).exp();

    if let (Some(nm), Some(ns)) = (posed.normal(model_idx), scene.normal(scene_idx)) {
        let angle = nm.dot(&ns).clamp(-1.0, 1.0).acos().to_degrees();
        let ratio = angle / config.sigma_normals_deg;
        w *= (-0.5 * ratio * ratio).exp();
    }

    if let (Some(cm), Some(cs)) = (
        posed.colors_lab.as_ref().map(|c| c[model_idx]),
        scene.colors_lab.as_ref().map(|c| c[scene_idx]),
    ) {
        let dl = (cm.x - cs.x) / config.color_sigma_l;
        let dab = Vector3::new(0.0, cm.y - cs.y, cm.z - cs.z).norm() / config.color_sigma_ab;
        w *= (-0.5 * dl * dl).exp() * (-0.5 * dab * dab).exp();
    }

    w
}

/// Scene points within the clutter radius of the explained region that the
/// candidate does not explain itself, restricted to the same smooth segment
/// when a segmentation is available.
fn clutter_neighborhood(
    explained: &[(usize, f64)],
    scene: &SceneIndex<'_>,
    config: &VerifierConfig,
) -> Vec<usize> {
    let radius_sq = config.radius_neighborhood_clutter * config.radius_neighborhood_clutter;
    let mut neighbors = Vec::new();
    for &(s, _) in explained {
        let p = scene.cloud.points[s];
        for nn in scene
            .positions
            .within_unsorted::<SquaredEuclidean>(&[p.x, p.y, p.z], radius_sq)
        {
            let c = nn.item as usize;
            if c == s {
                continue;
            }
            if let Some(segments) = scene.segments {
                if segments[c] != segments[s] {
                    continue;
                }
            }
            neighbors.push(c);
        }
    }
    neighbors.sort_unstable();
    neighbors.dedup();
    // Points the candidate explains itself are support, not clutter.
    neighbors.retain(|c| explained.binary_search_by_key(c, |&(s, _)| s).is_err());
    neighbors
}
