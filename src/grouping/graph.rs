//! Graph-based correspondence clustering.
//!
//! Builds the full pairwise compatibility graph over a model's
//! correspondences, then grows one cluster per unused seed vertex by
//! greedy clique expansion: a candidate joins only if it is compatible
//! with every member already in the cluster. Candidates are tried in
//! descending shared-neighbor order so densely connected (strongly
//! consistent) correspondences join first.

use std::time::Instant;

use crate::cloud::PointCloud;
use crate::types::Correspondence;

use super::{pair_consistent, GroupingConfig};

/// Cluster `corrs` via the compatibility graph.
///
/// Returns `None` if `deadline` passes during graph construction; the
/// caller then falls back to the greedy algorithm for this model.
pub fn cluster(
    corrs: &[Correspondence],
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &GroupingConfig,
    deadline: Instant,
) -> Option<Vec<Vec<usize>>> {
    let n = corrs.len();
    if Instant::now() >= deadline {
        return None;
    }

    // Dense adjacency; correspondence sets are at most a few hundred entries.
    let mut adj = vec![false; n * n];
    let mut degree = vec![0usize; n];
    for i in 0..n {
        // The deadline guards the O(n²) build, checked once per row.
        if Instant::now() >= deadline {
            return None;
        }
        for j in (i + 1)..n {
            if pair_consistent(&corrs[i], &corrs[j], scene, keypoints, config) {
                adj[i * n + j] = true;
                adj[j * n + i] = true;
                degree[i] += 1;
                degree[j] += 1;
            }
        }
    }

    let mut used = vec![false; n];
    let mut clusters = Vec::new();

    for seed in 0..n {
        if used[seed] || degree[seed] + 1 < config.gc_threshold {
            continue;
        }

        // Candidates: unused neighbors of the seed, densest first.
        let mut candidates: Vec<usize> = (0..n)
            .filter(|&v| !used[v] && adj[seed * n + v])
            .collect();
        candidates.sort_by(|&a, &b| degree[b].cmp(&degree[a]).then(a.cmp(&b)));

        let mut cluster = vec![seed];
        for v in candidates {
            if cluster.iter().all(|&u| adj[u * n + v]) {
                cluster.push(v);
            }
        }

        if cluster.len() >= config.gc_threshold {
            for &v in &cluster {
                used[v] = true;
            }
            cluster.sort_unstable();
            clusters.push(cluster);
        }
    }

    Some(clusters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;
    use std::time::Duration;

    /// Two rigid instances of a 3-point model in one scene, plus one stray
    /// correspondence, must split into two clusters.
    #[test]
    fn test_two_instances_split_into_two_clusters() {
        let model = PointCloud::from_points(vec![
            Vector3::new(0.0, 0.0, 0.0),
            Vector3::new(0.1, 0.0, 0.0),
            Vector3::new(0.0, 0.1, 0.0),
        ]);
        let mut scene_pts: Vec<Vector3<f64>> =
            model.points.iter().map(|p| p + Vector3::new(1.0, 0.0, 0.0)).collect();
        scene_pts.extend(model.points.iter().map(|p| p + Vector3::new(3.0, 0.5, 0.0)));
        scene_pts.push(Vector3::new(-7.0, 2.0, 1.0)); // stray
        let scene = PointCloud::from_points(scene_pts);

        let corrs = vec![
            Correspondence::new(0, 0, 0.1),
            Correspondence::new(1, 1, 0.1),
            Correspondence::new(2, 2, 0.1),
            Correspondence::new(3, 0, 0.2),
            Correspondence::new(4, 1, 0.2),
            Correspondence::new(5, 2, 0.2),
            Correspondence::new(6, 0, 0.9),
        ];

        let config = GroupingConfig::default();
        let deadline = Instant::now() + Duration::from_secs(10);
        let clusters = cluster(&corrs, &scene, &model, &config, deadline).unwrap();
        assert_eq!(clusters.len(), 2);
        assert!(clusters.iter().all(|c| c.len() == 3));
    }

    #[test]
    fn test_expired_deadline_reports_fallback() {
        let model = PointCloud::from_points(vec![Vector3::zeros(); 3]);
        let scene = model.clone();
        let corrs = vec![
            Correspondence::new(0, 0, 0.1),
            Correspondence::new(1, 1, 0.1),
            Correspondence::new(2, 2, 0.1),
        ];
        let past = Instant::now() - Duration::from_millis(1);
        assert!(cluster(&corrs, &scene, &model, &GroupingConfig::default(), past).is_none());
    }
}
