//! Global-shape recognition pipeline.
//!
//! Partitions the scene into smooth segments, classifies each segment
//! against the model database by global shape, and proposes one centroid-
//! aligned hypothesis per (segment, matched model). Poses from this
//! pipeline are coarse and rely on downstream refinement.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cloud::PointCloud;
use crate::error::{ConfigError, RecognitionError};
use crate::matching::{GlobalClassifier, ModelDatabase, Segmenter};
use crate::types::{HypothesisSource, PoseHypothesis};

use super::RecognitionPipeline;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPipelineConfig {
    /// Segments with fewer points than this are not classified.
    pub min_segment_points: usize,
    /// Number of top-ranked classifier matches kept per segment.
    pub max_matches_per_segment: usize,
}

impl Default for GlobalPipelineConfig {
    fn default() -> Self {
        Self {
            min_segment_points: 50,
            max_matches_per_segment: 1,
        }
    }
}

impl GlobalPipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_matches_per_segment == 0 {
            return Err(ConfigError::new(
                "max_matches_per_segment",
                "must be positive",
            ));
        }
        Ok(())
    }
}

pub struct GlobalShapePipeline {
    segmenter: Box<dyn Segmenter>,
    classifier: Box<dyn GlobalClassifier>,
    db: Arc<dyn ModelDatabase>,
    config: GlobalPipelineConfig,
}

impl GlobalShapePipeline {
    pub fn new(
        segmenter: Box<dyn Segmenter>,
        classifier: Box<dyn GlobalClassifier>,
        db: Arc<dyn ModelDatabase>,
        config: GlobalPipelineConfig,
    ) -> Result<Self, RecognitionError> {
        config.validate()?;
        Ok(Self {
            segmenter,
            classifier,
            db,
            config,
        })
    }
}

impl RecognitionPipeline for GlobalShapePipeline {
    fn generate_hypotheses(&self, scene: &PointCloud) -> Result<Vec<PoseHypothesis>, RecognitionError> {
        if !scene.channels_aligned() {
            return Err(RecognitionError::MalformedScene(
                "scene channel lengths disagree with point count".into(),
            ));
        }
        if scene.is_empty() {
            return Ok(Vec::new());
        }

        let labels = self.segmenter.segment(scene);
        if labels.len() != scene.len() {
            return Err(RecognitionError::MalformedScene(format!(
                "segmentation returned {} labels for {} points",
                labels.len(),
                scene.len()
            )));
        }

        // BTreeMap keeps segment order deterministic.
        let mut segments: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, &label) in labels.iter().enumerate() {
            segments.entry(label).or_default().push(i);
        }
        debug!(segments = segments.len(), "scene segmented");

        let mut hypotheses = Vec::new();
        for (label, indices) in segments {
            if indices.len() < self.config.min_segment_points {
                continue;
            }
            let segment_cloud =
                PointCloud::from_points(indices.iter().map(|&i| scene.points[i]).collect());
            let segment_centroid = segment_cloud.centroid();

            let matches = self.classifier.classify(&segment_cloud);
            for (model_id, score) in matches.into_iter().take(self.config.max_matches_per_segment) {
                let model_centroid = match self.db.full_cloud(&model_id) {
                    Some(cloud) => cloud.centroid(),
                    None => {
                        warn!(model = %model_id, segment = label, "classified model not in database");
                        continue;
                    }
                };
                debug!(model = %model_id, segment = label, score, "global match");
                hypotheses.push(PoseHypothesis {
                    model_id,
                    pose: nalgebra::Isometry3::translation(
                        segment_centroid.x - model_centroid.x,
                        segment_centroid.y - model_centroid.y,
                        segment_centroid.z - model_centroid.z,
                    ),
                    correspondences: Vec::new(),
                    confidence: indices.len() as f64,
                    source: HypothesisSource::GlobalShape,
                });
            }
        }
        Ok(hypotheses)
    }

    fn feature_type(&self) -> u32 {
        0
    }

    fn name(&self) -> &'static str {
        "global_shape"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ModelId;
    use nalgebra::Vector3;
    use std::collections::HashMap;

    struct SplitSegmenter;
    impl Segmenter for SplitSegmenter {
        fn segment(&self, scene: &PointCloud) -> Vec<usize> {
            // Left/right of the yz plane.
            scene
                .points
                .iter()
                .map(|p| usize::from(p.x >= 0.0))
                .collect()
        }
    }

    /// Classifies every segment as the single known model.
    struct ConstClassifier(ModelId);
    impl GlobalClassifier for ConstClassifier {
        fn classify(&self, _segment: &PointCloud) -> Vec<(ModelId, f64)> {
            vec![(self.0.clone(), 0.1)]
        }
    }

    struct MapDb(HashMap<ModelId, PointCloud>);
    impl ModelDatabase for MapDb {
        fn full_cloud(&self, model: &ModelId) -> Option<&PointCloud> {
            self.0.get(model)
        }
        fn model_ids(&self) -> Vec<ModelId> {
            self.0.keys().cloned().collect()
        }
    }

    fn blob(center: Vector3<f64>, n: usize) -> Vec<Vector3<f64>> {
        (0..n)
            .map(|i| center + Vector3::new(0.0, 0.0, i as f64 * 1e-4))
            .collect()
    }

    #[test]
    fn test_one_hypothesis_per_segment_centroid_aligned() {
        let model_id = ModelId::from("box");
        // Model centered at the origin.
        let db = Arc::new(MapDb(HashMap::from([(
            model_id.clone(),
            PointCloud::from_points(blob(Vector3::new(0.0, 0.0, -0.00045), 10)),
        )])));
        let pipeline = GlobalShapePipeline::new(
            Box::new(SplitSegmenter),
            Box::new(ConstClassifier(model_id.clone())),
            db,
            GlobalPipelineConfig {
                min_segment_points: 5,
                max_matches_per_segment: 1,
            },
        )
        .unwrap();

        let mut pts = blob(Vector3::new(-1.0, 0.0, 0.0), 10);
        pts.extend(blob(Vector3::new(1.0, 0.0, 0.0), 10));
        let scene = PointCloud::from_points(pts);

        let hypotheses = pipeline.generate_hypotheses(&scene).unwrap();
        assert_eq!(hypotheses.len(), 2);
        assert!(hypotheses
            .iter()
            .all(|h| matches!(h.source, HypothesisSource::GlobalShape)));
        // Centroid alignment places the model at each segment center.
        let t0 = hypotheses[0].pose.translation.vector;
        assert!((t0.x - (-1.0)).abs() < 1e-9);
    }

    #[test]
    fn test_small_segments_skipped() {
        let model_id = ModelId::from("box");
        let db = Arc::new(MapDb(HashMap::from([(
            model_id.clone(),
            PointCloud::from_points(blob(Vector3::zeros(), 10)),
        )])));
        let pipeline = GlobalShapePipeline::new(
            Box::new(SplitSegmenter),
            Box::new(ConstClassifier(model_id)),
            db,
            GlobalPipelineConfig {
                min_segment_points: 100,
                max_matches_per_segment: 1,
            },
        )
        .unwrap();
        let scene = PointCloud::from_points(blob(Vector3::new(1.0, 0.0, 0.0), 10));
        assert!(pipeline.generate_hypotheses(&scene).unwrap().is_empty());
    }
}
