//! 3D object instance recognition from point clouds.
//!
//! Feature matchers propose scene/model correspondences; the core
//! consolidates them, groups them into geometrically consistent clusters,
//! merges near-duplicate poses, refines each pose with ICP, and finally
//! selects the subset of hypotheses that best explains the scene through
//! global hypothesis verification.
//!
//! Feature extraction, segmentation and classification stay outside the
//! crate, behind the traits in [`matching`].

pub mod cloud;
pub mod error;
pub mod geometry;
pub mod grouping;
pub mod matching;
pub mod merger;
pub mod pipeline;
pub mod recognizer;
pub mod refine;
pub mod types;
pub mod verification;

pub use cloud::PointCloud;
pub use error::{ConfigError, RecognitionError};
pub use recognizer::{RecognitionOutput, RecognizedObject, Recognizer, RecognizerConfig};
pub use types::{Correspondence, HypothesisSource, ModelId, PlaneModel, PoseHypothesis};
