//! Core data types shared across the recognition pipeline.

use std::collections::HashMap;
use std::fmt;

use nalgebra::Isometry3;

/// Identifier of an object model in the external model database.
///
/// ModelIds are opaque strings chosen by the database (typically the
/// training directory name). They are cheap to clone and hashable so each
/// stage can key its per-model work on them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ModelId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// A proposed match between one scene point and one model keypoint.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into the scene cloud.
    pub scene_idx: usize,
    /// Index into the model's unified keypoint store.
    pub model_idx: usize,
    /// Match distance in descriptor space; non-negative, lower is better.
    pub distance: f64,
}

impl Correspondence {
    pub fn new(scene_idx: usize, model_idx: usize, distance: f64) -> Self {
        Self {
            scene_idx,
            model_idx,
            distance,
        }
    }
}

/// Per-model correspondence sets for one recognition call.
///
/// Populated by the consolidator, drained by correspondence grouping.
#[derive(Debug, Default)]
pub struct ModelCorrespondences {
    sets: HashMap<ModelId, Vec<Correspondence>>,
}

impl ModelCorrespondences {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, model: &ModelId) -> Option<&[Correspondence]> {
        self.sets.get(model).map(|v| v.as_slice())
    }

    pub fn get_mut_or_default(&mut self, model: &ModelId) -> &mut Vec<Correspondence> {
        self.sets.entry(model.clone()).or_default()
    }

    pub fn contains(&self, model: &ModelId) -> bool {
        self.sets.contains_key(model)
    }

    pub fn insert(&mut self, model: ModelId, correspondences: Vec<Correspondence>) {
        self.sets.insert(model, correspondences);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ModelId, &Vec<Correspondence>)> {
        self.sets.iter()
    }

    pub fn len(&self) -> usize {
        self.sets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sets.is_empty()
    }

    /// Drain all per-model sets, consuming the container's contents.
    pub fn drain(&mut self) -> impl Iterator<Item = (ModelId, Vec<Correspondence>)> + '_ {
        self.sets.drain()
    }
}

/// Which recognition strategy produced a hypothesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HypothesisSource {
    /// Local-feature correspondence pipeline; carries the matcher's
    /// feature-type identity.
    LocalFeatures { feature_type: u32 },
    /// Global-shape classification over scene segments.
    GlobalShape,
}

/// A candidate rigid placement of one known model in the scene.
#[derive(Debug, Clone)]
pub struct PoseHypothesis {
    /// Model this hypothesis instantiates; must exist in the model database.
    pub model_id: ModelId,
    /// Rigid model-to-scene transform.
    pub pose: Isometry3<f64>,
    /// Correspondences supporting this hypothesis (empty for global-shape
    /// hypotheses, which are not correspondence-backed).
    pub correspondences: Vec<Correspondence>,
    /// Support score; for grouped hypotheses this is the correspondence count.
    pub confidence: f64,
    /// Provenance tag.
    pub source: HypothesisSource,
}

/// A planar support-surface hypothesis competing with object hypotheses
/// during verification.
#[derive(Debug, Clone)]
pub struct PlaneModel {
    /// Plane coefficients (a, b, c, d) with unit normal: ax + by + cz + d = 0.
    pub coefficients: [f64; 4],
    /// Scene point indices lying on the plane.
    pub inliers: Vec<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_id_display_and_hash() {
        let a = ModelId::from("mug");
        let b = ModelId::new("mug");
        assert_eq!(a, b);
        assert_eq!(format!("{a}"), "mug");

        let mut map = HashMap::new();
        map.insert(a, 1);
        assert_eq!(map[&b], 1);
    }

    #[test]
    fn test_correspondence_store_drain() {
        let mut sets = ModelCorrespondences::new();
        sets.get_mut_or_default(&ModelId::from("cube"))
            .push(Correspondence::new(0, 1, 0.5));
        assert_eq!(sets.len(), 1);
        let drained: Vec<_> = sets.drain().collect();
        assert_eq!(drained.len(), 1);
        assert!(sets.is_empty());
    }
}
