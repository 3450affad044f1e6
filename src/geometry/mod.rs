//! Geometry utilities: rigid alignment and rotation comparison.

pub mod rigid;

pub use rigid::{estimate_rigid_transform, rotation_angle_deltas, MIN_PAIRS};
