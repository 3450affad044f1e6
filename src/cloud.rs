//! Point cloud container shared by all recognition stages.
//!
//! A `PointCloud` carries positions plus optional per-point normals and
//! CIELAB colors. The optional channels, when present, are aligned with the
//! positions (same length, same order); this is checked once at the
//! recognition entry point so later stages can index freely.

use nalgebra::{Isometry3, Point3, Vector3};

/// A 3D point cloud with optional aligned normal and color channels.
#[derive(Debug, Clone, Default)]
pub struct PointCloud {
    /// Point positions in meters.
    pub points: Vec<Vector3<f64>>,
    /// Unit surface normals, one per point, if available.
    pub normals: Option<Vec<Vector3<f64>>>,
    /// CIELAB colors (L in [0,1], a/b centered on 0.5), one per point, if available.
    pub colors_lab: Option<Vec<Vector3<f64>>>,
}

impl PointCloud {
    /// Cloud from bare positions, no normals or colors.
    pub fn from_points(points: Vec<Vector3<f64>>) -> Self {
        Self {
            points,
            normals: None,
            colors_lab: None,
        }
    }

    /// Cloud with aligned normals.
    pub fn with_normals(points: Vec<Vector3<f64>>, normals: Vec<Vector3<f64>>) -> Self {
        Self {
            points,
            normals: Some(normals),
            colors_lab: None,
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Check that optional channels are aligned with the positions.
    pub fn channels_aligned(&self) -> bool {
        self.normals.as_ref().map_or(true, |n| n.len() == self.points.len())
            && self
                .colors_lab
                .as_ref()
                .map_or(true, |c| c.len() == self.points.len())
    }

    /// Normal of point `i`, if normals are available.
    pub fn normal(&self, i: usize) -> Option<Vector3<f64>> {
        self.normals.as_ref().map(|n| n[i])
    }

    /// Clone of this cloud with every point (and normal) moved by `pose`.
    pub fn transformed(&self, pose: &Isometry3<f64>) -> PointCloud {
        PointCloud {
            points: self
                .points
                .iter()
                .map(|p| (pose * Point3::from(*p)).coords)
                .collect(),
            normals: self
                .normals
                .as_ref()
                .map(|ns| ns.iter().map(|n| pose.rotation * n).collect()),
            colors_lab: self.colors_lab.clone(),
        }
    }

    /// Axis-aligned bounding box, or `None` for an empty cloud.
    pub fn bounds(&self) -> Option<(Vector3<f64>, Vector3<f64>)> {
        let first = *self.points.first()?;
        let mut min = first;
        let mut max = first;
        for p in &self.points[1..] {
            for k in 0..3 {
                min[k] = min[k].min(p[k]);
                max[k] = max[k].max(p[k]);
            }
        }
        Some((min, max))
    }

    /// Centroid of the cloud, or zero for an empty cloud.
    pub fn centroid(&self) -> Vector3<f64> {
        if self.points.is_empty() {
            return Vector3::zeros();
        }
        self.points.iter().sum::<Vector3<f64>>() / self.points.len() as f64
    }
}
