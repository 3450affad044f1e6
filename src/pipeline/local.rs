//! Local-feature recognition pipeline.
//!
//! Runs every registered feature matcher against the scene, consolidates
//! the matcher outputs into one correspondence set per model, clusters the
//! sets into geometrically consistent groups, and merges near-duplicate
//! clusters. One pose hypothesis per surviving cluster.

use tracing::debug;

use crate::cloud::PointCloud;
use crate::error::RecognitionError;
use crate::grouping::{CorrespondenceGrouper, GroupingConfig};
use crate::matching::consolidate::MatcherOutput;
use crate::matching::{Consolidator, ConsolidatorConfig, FeatureMatcher, KeypointStore};
use crate::merger::{HypothesisMerger, MergerConfig};
use crate::types::{HypothesisSource, PoseHypothesis};

use super::RecognitionPipeline;

/// Configuration for the local-feature pipeline stages.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LocalPipelineConfig {
    pub consolidator: ConsolidatorConfig,
    pub grouping: GroupingConfig,
    pub merger: MergerConfig,
}

pub struct LocalFeaturePipeline {
    matchers: Vec<Box<dyn FeatureMatcher>>,
    store: KeypointStore,
    consolidator: Consolidator,
    grouper: CorrespondenceGrouper,
    merger: HypothesisMerger,
    feature_types: u32,
}

impl LocalFeaturePipeline {
    /// Build the pipeline and its unified keypoint store. Fails fast on
    /// invalid stage parameters.
    pub fn new(
        matchers: Vec<Box<dyn FeatureMatcher>>,
        config: LocalPipelineConfig,
    ) -> Result<Self, RecognitionError> {
        let store = KeypointStore::build(&matchers);
        let feature_types = matchers.iter().fold(0, |acc, m| acc | m.feature_type());
        Ok(Self {
            matchers,
            store,
            consolidator: Consolidator::new(config.consolidator)?,
            grouper: CorrespondenceGrouper::new(config.grouping)?,
            merger: HypothesisMerger::new(config.merger)?,
            feature_types,
        })
    }

    pub fn store(&self) -> &KeypointStore {
        &self.store
    }
}

impl RecognitionPipeline for LocalFeaturePipeline {
    fn generate_hypotheses(&self, scene: &PointCloud) -> Result<Vec<PoseHypothesis>, RecognitionError> {
        if !scene.channels_aligned() {
            return Err(RecognitionError::MalformedScene(
                "scene channel lengths disagree with point count".into(),
            ));
        }
        if scene.is_empty() {
            return Ok(Vec::new());
        }

        let outputs: Vec<MatcherOutput> = self
            .matchers
            .iter()
            .enumerate()
            .map(|(matcher_idx, matcher)| MatcherOutput {
                matcher_idx,
                num_estimators: matcher.num_estimators(),
                correspondences: matcher.match_scene(scene).into_iter().collect(),
            })
            .collect();

        let mut consolidated = self.consolidator.consolidate(scene, &self.store, outputs);
        debug!(
            models = consolidated.len(),
            "consolidated matcher correspondences"
        );

        let clusters = self.grouper.group_all(scene, &self.store, &mut consolidated);
        let clusters = self.merger.merge(scene, &self.store, clusters);

        Ok(clusters
            .into_iter()
            .map(|c| {
                let confidence = c.correspondences.len() as f64;
                PoseHypothesis {
                    model_id: c.model_id,
                    pose: c.pose,
                    correspondences: c.correspondences,
                    confidence,
                    source: HypothesisSource::LocalFeatures {
                        feature_type: self.feature_types,
                    },
                }
            })
            .collect())
    }

    fn feature_type(&self) -> u32 {
        self.feature_types
    }

    fn name(&self) -> &'static str {
        "local_features"
    }
}
