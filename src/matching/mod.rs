//! Collaborator interfaces and the unified per-model keypoint store.
//!
//! Feature extraction, model training data, segmentation and global
//! classification are external concerns. The recognition core consumes
//! them through the narrow traits below, selected at configuration time,
//! with no downcasting over a recognizer class hierarchy.

pub mod consolidate;

use std::collections::HashMap;

use tracing::warn;

use crate::cloud::PointCloud;
use crate::types::{Correspondence, ModelId};

pub use consolidate::{Consolidator, ConsolidatorConfig};

/// A local feature matcher: proposes scene/model keypoint correspondences.
///
/// Correspondence `model_idx` values are local to the matcher's own keypoint
/// clouds; the pipeline offsets them into the unified store.
pub trait FeatureMatcher: Send + Sync {
    /// Match the scene against all trained models. A model with no matches
    /// is simply absent from the result.
    fn match_scene(&self, scene: &PointCloud) -> HashMap<ModelId, Vec<Correspondence>>;

    /// Per-model keypoint clouds (positions + normals) this matcher was
    /// trained on, stable for the duration of a recognition call.
    fn model_keypoints(&self) -> HashMap<ModelId, PointCloud>;

    /// Identity of the feature type (e.g. texture vs. shape descriptor).
    fn feature_type(&self) -> u32;

    /// Number of sub-estimators (e.g. descriptor scales). More than one
    /// triggers intra-matcher redundancy filtering.
    fn num_estimators(&self) -> usize {
        1
    }
}

/// Read-only access to complete model point clouds, used by pose refinement,
/// verification and the global-shape pipeline.
pub trait ModelDatabase: Send + Sync {
    /// Assembled full cloud of a model (positions, normals when available),
    /// or `None` for an unknown id.
    fn full_cloud(&self, model: &ModelId) -> Option<&PointCloud>;

    /// All model ids known to the database.
    fn model_ids(&self) -> Vec<ModelId>;
}

/// Partitions a scene into smooth surface segments.
pub trait Segmenter: Send + Sync {
    /// Per-point segment id, aligned with the scene cloud.
    fn segment(&self, scene: &PointCloud) -> Vec<usize>;
}

/// Classifies a scene segment against the model database by global shape.
pub trait GlobalClassifier: Send + Sync {
    /// Ranked `(model, score)` matches for a segment cloud; lower score is
    /// a better match. An unrecognized segment returns an empty list.
    fn classify(&self, segment: &PointCloud) -> Vec<(ModelId, f64)>;
}

/// Unified per-model keypoint store merged from every matcher.
///
/// Each matcher's keypoint range is appended (never overwritten), and the
/// start offset of that range is recorded per (matcher, model) so matcher-
/// local correspondence indices can be rebased into the merged store.
pub struct KeypointStore {
    merged: HashMap<ModelId, PointCloud>,
    /// `offsets[matcher_idx][model]` = start of that matcher's keypoint
    /// range within the merged cloud.
    offsets: Vec<HashMap<ModelId, usize>>,
}

impl KeypointStore {
    /// Merge keypoints from all matchers, in matcher order.
    pub fn build(matchers: &[Box<dyn FeatureMatcher>]) -> Self {
        let mut merged: HashMap<ModelId, PointCloud> = HashMap::new();
        let mut offsets = Vec::with_capacity(matchers.len());

        for matcher in matchers {
            let mut matcher_offsets = HashMap::new();
            for (model, kp) in matcher.model_keypoints() {
                if !kp.channels_aligned() {
                    warn!(model = %model, "keypoint cloud channels misaligned, skipping");
                    continue;
                }
                let entry = merged.entry(model.clone()).or_default();
                matcher_offsets.insert(model, entry.len());
                entry.points.extend_from_slice(&kp.points);
                match (&mut entry.normals, kp.normals) {
                    (Some(dst), Some(src)) => dst.extend_from_slice(&src),
                    (dst @ None, Some(src)) if entry.points.len() == src.len() => {
                        *dst = Some(src);
                    }
                    // Mixed availability: drop normals entirely rather than
                    // keep a channel misaligned with the merged points.
                    (dst, _) => *dst = None,
                }
            }
            offsets.push(matcher_offsets);
        }

        Self { merged, offsets }
    }

    /// Merged keypoint cloud of a model.
    pub fn keypoints(&self, model: &ModelId) -> Option<&PointCloud> {
        self.merged.get(model)
    }

    /// Start offset of `matcher_idx`'s keypoint range for `model`.
    pub fn offset(&self, matcher_idx: usize, model: &ModelId) -> usize {
        self.offsets
            .get(matcher_idx)
            .and_then(|m| m.get(model))
            .copied()
            .unwrap_or(0)
    }

    pub fn models(&self) -> impl Iterator<Item = &ModelId> {
        self.merged.keys()
    }
}
