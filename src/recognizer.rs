//! Top-level recognition facade.
//!
//! Owns the hypothesis-generation pipelines, the pose refiner and the
//! verifier, and runs them in sequence over one scene: generate, refine,
//! verify. The caller gets every hypothesis back together with its
//! verification flag; nothing is silently discarded.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cloud::PointCloud;
use crate::error::RecognitionError;
use crate::matching::{ModelDatabase, Segmenter};
use crate::pipeline::MultiPipeline;
use crate::refine::{PoseRefiner, RefineConfig};
use crate::types::{ModelId, PlaneModel, PoseHypothesis};
use crate::verification::{HypothesisVerifier, VerifierConfig};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub refine: RefineConfig,
    pub verifier: VerifierConfig,
}

/// One verified (or rejected) object instance.
#[derive(Debug, Clone)]
pub struct RecognizedObject {
    pub model_id: ModelId,
    pub pose: nalgebra::Isometry3<f64>,
    pub verified: bool,
}

/// Result of one recognition call.
#[derive(Debug, Clone)]
pub struct RecognitionOutput {
    /// One entry per object hypothesis, in pool order.
    pub objects: Vec<RecognizedObject>,
    /// Verification flags for the supplied plane candidates, in input order.
    pub verified_planes: Vec<bool>,
    /// The refined pre-verification hypothesis pool, for diagnostics.
    pub pool: Vec<PoseHypothesis>,
}

impl RecognitionOutput {
    /// The verified instances only.
    pub fn verified(&self) -> impl Iterator<Item = &RecognizedObject> {
        self.objects.iter().filter(|o| o.verified)
    }
}

pub struct Recognizer {
    pipelines: MultiPipeline,
    db: Arc<dyn ModelDatabase>,
    segmenter: Option<Box<dyn Segmenter>>,
    refiner: PoseRefiner,
    verifier: HypothesisVerifier,
}

impl Recognizer {
    pub fn new(
        pipelines: MultiPipeline,
        db: Arc<dyn ModelDatabase>,
        config: RecognizerConfig,
    ) -> Result<Self, RecognitionError> {
        Ok(Self {
            pipelines,
            db,
            segmenter: None,
            refiner: PoseRefiner::new(config.refine)?,
            verifier: HypothesisVerifier::new(config.verifier)?,
        })
    }

    /// Supply a segmenter so clutter reasoning during verification is
    /// restricted to smooth segments.
    pub fn with_segmenter(mut self, segmenter: Box<dyn Segmenter>) -> Self {
        self.segmenter = Some(segmenter);
        self
    }

    /// Recognize all trained models in the scene.
    ///
    /// `planes` are pre-extracted scene planes that compete with object
    /// hypotheses for scene support during verification; pass an empty
    /// slice when plane extraction is not used.
    pub fn recognize(
        &self,
        scene: &PointCloud,
        planes: &[PlaneModel],
    ) -> Result<RecognitionOutput, RecognitionError> {
        if !scene.channels_aligned() {
            return Err(RecognitionError::MalformedScene(
                "scene channel lengths disagree with point count".into(),
            ));
        }

        let mut pool = self.pipelines.generate(scene);
        info!(hypotheses = pool.len(), "hypothesis pool generated");

        if self.refiner.enabled() {
            for hypothesis in &mut pool {
                match self.db.full_cloud(&hypothesis.model_id) {
                    Some(model) => {
                        hypothesis.pose = self.refiner.refine(scene, model, &hypothesis.pose);
                    }
                    None => {
                        warn!(model = %hypothesis.model_id, "no model cloud, pose left unrefined")
                    }
                }
            }
        }

        let segments = self.segmenter.as_ref().map(|s| s.segment(scene));
        let flags = self.verifier.verify(
            scene,
            &pool,
            planes,
            self.db.as_ref(),
            segments.as_deref(),
        );

        let objects = pool
            .iter()
            .zip(&flags)
            .map(|(h, &verified)| RecognizedObject {
                model_id: h.model_id.clone(),
                pose: h.pose,
                verified,
            })
            .collect();
        let verified_planes = flags[pool.len()..].to_vec();

        Ok(RecognitionOutput {
            objects,
            verified_planes,
            pool,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::RecognitionPipeline;
    use crate::types::HypothesisSource;
    use nalgebra::{Isometry3, Vector3};
    use std::collections::HashMap;

    struct MapDb(HashMap<ModelId, PointCloud>);
    impl ModelDatabase for MapDb {
        fn full_cloud(&self, model: &ModelId) -> Option<&PointCloud> {
            self.0.get(model)
        }
        fn model_ids(&self) -> Vec<ModelId> {
            self.0.keys().cloned().collect()
        }
    }

    struct OnePose {
        model: ModelId,
        pose: Isometry3<f64>,
    }
    impl RecognitionPipeline for OnePose {
        fn generate_hypotheses(
            &self,
            _scene: &PointCloud,
        ) -> Result<Vec<PoseHypothesis>, RecognitionError> {
            Ok(vec![PoseHypothesis {
                model_id: self.model.clone(),
                pose: self.pose,
                correspondences: Vec::new(),
                confidence: 3.0,
                source: HypothesisSource::LocalFeatures { feature_type: 1 },
            }])
        }
        fn feature_type(&self) -> u32 {
            1
        }
        fn name(&self) -> &'static str {
            "one_pose"
        }
    }

    fn grid(n: usize) -> Vec<Vector3<f64>> {
        let mut pts = Vec::new();
        for i in 0..n {
            for j in 0..n {
                pts.push(Vector3::new(
                    0.5 + i as f64 * 0.01,
                    0.5 + j as f64 * 0.01,
                    1.0,
                ));
            }
        }
        pts
    }

    #[test]
    fn test_generate_refine_verify_roundtrip() {
        let model_id = ModelId::from("tile");
        let model = PointCloud::from_points(grid(6));
        let scene = PointCloud::from_points(grid(6));
        let db = Arc::new(MapDb(HashMap::from([(model_id.clone(), model)])));

        let pipelines = MultiPipeline::new(vec![Box::new(OnePose {
            model: model_id.clone(),
            // 2 mm off; refinement should pull it back onto the scene.
            pose: Isometry3::translation(0.002, 0.0, 0.0),
        })]);
        let config = RecognizerConfig {
            refine: RefineConfig {
                icp_iterations: 10,
                ..RefineConfig::default()
            },
            verifier: VerifierConfig {
                strategy: crate::verification::SearchStrategy::LocalSearch,
                ..VerifierConfig::default()
            },
        };
        let recognizer = Recognizer::new(pipelines, db, config).unwrap();

        let out = recognizer.recognize(&scene, &[]).unwrap();
        assert_eq!(out.objects.len(), 1);
        assert!(out.objects[0].verified);
        assert_eq!(out.verified().count(), 1);
        let t = out.objects[0].pose.translation.vector;
        assert!(t.x.abs() < 1e-3, "refinement left offset {}", t.x);
        assert!(out.verified_planes.is_empty());
        assert_eq!(out.pool.len(), 1);
    }

    #[test]
    fn test_no_pipelines_empty_output() {
        let db = Arc::new(MapDb(HashMap::new()));
        let recognizer = Recognizer::new(
            MultiPipeline::new(Vec::new()),
            db,
            RecognizerConfig::default(),
        )
        .unwrap();
        let scene = PointCloud::from_points(grid(3));
        let out = recognizer.recognize(&scene, &[]).unwrap();
        assert!(out.objects.is_empty());
        assert!(out.pool.is_empty());
    }
}
