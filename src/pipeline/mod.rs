//! Hypothesis-generation pipelines and their aggregator.
//!
//! Each pipeline turns a scene into a list of pose hypotheses on its own.
//! The aggregator fans the scene out to every pipeline on scoped threads
//! and concatenates the results afterwards; pipelines never share mutable
//! state, so no cross-pipeline locking exists. A failing pipeline is logged
//! and contributes nothing.

pub mod global_shape;
pub mod local;

use tracing::{info, warn};

use crate::cloud::PointCloud;
use crate::error::RecognitionError;
use crate::types::PoseHypothesis;

pub use global_shape::{GlobalPipelineConfig, GlobalShapePipeline};
pub use local::{LocalFeaturePipeline, LocalPipelineConfig};

/// A self-contained hypothesis generator.
pub trait RecognitionPipeline: Send + Sync {
    /// Propose pose hypotheses for the scene. An empty list is a valid
    /// outcome; an error means the pipeline could not run at all.
    fn generate_hypotheses(&self, scene: &PointCloud)
        -> Result<Vec<PoseHypothesis>, RecognitionError>;

    /// Bitmask of the feature types this pipeline consumes; zero for
    /// pipelines not based on local features.
    fn feature_type(&self) -> u32;

    /// Stable name for logging.
    fn name(&self) -> &'static str;
}

/// Runs all registered pipelines against one scene and pools the results.
pub struct MultiPipeline {
    pipelines: Vec<Box<dyn RecognitionPipeline>>,
}

impl MultiPipeline {
    pub fn new(pipelines: Vec<Box<dyn RecognitionPipeline>>) -> Self {
        Self { pipelines }
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }

    /// Generate the pooled hypothesis list, pipeline results in registration
    /// order. Pipeline failures are isolated: the rest of the pool is still
    /// produced.
    pub fn generate(&self, scene: &PointCloud) -> Vec<PoseHypothesis> {
        let outcomes: Vec<std::thread::Result<Result<Vec<PoseHypothesis>, RecognitionError>>> =
            std::thread::scope(|s| {
                let handles: Vec<_> = self
                    .pipelines
                    .iter()
                    .map(|p| s.spawn(move || p.generate_hypotheses(scene)))
                    .collect();
                handles.into_iter().map(|h| h.join()).collect()
            });

        let mut pool = Vec::new();
        for (pipeline, outcome) in self.pipelines.iter().zip(outcomes) {
            match outcome {
                Ok(Ok(hypotheses)) => {
                    info!(
                        pipeline = pipeline.name(),
                        hypotheses = hypotheses.len(),
                        "pipeline finished"
                    );
                    pool.extend(hypotheses);
                }
                Ok(Err(err)) => {
                    warn!(pipeline = pipeline.name(), error = %err, "pipeline failed, skipping");
                }
                Err(_) => {
                    warn!(pipeline = pipeline.name(), "pipeline panicked, skipping");
                }
            }
        }
        pool
    }
}
