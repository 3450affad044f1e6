//! Greedy correspondence clustering, the latency fallback.
//!
//! Single pass in the pre-sorted correspondence order: each unused
//! correspondence seeds a cluster, and every later unused correspondence
//! joins if it is pairwise consistent with all current members. No
//! adjacency graph is built, so the cost is bounded by the cluster sizes
//! actually found rather than the full O(n²) edge set.

use crate::cloud::PointCloud;
use crate::types::Correspondence;

use super::{pair_consistent, GroupingConfig};

pub fn cluster(
    corrs: &[Correspondence],
    scene: &PointCloud,
    keypoints: &PointCloud,
    config: &GroupingConfig,
) -> Vec<Vec<usize>> {
    let n = corrs.len();
    let mut used = vec![false; n];
    let mut clusters = Vec::new();

    for seed in 0..n {
        if used[seed] {
            continue;
        }
        let mut cluster = vec![seed];
        for v in (seed + 1)..n {
            if used[v] {
                continue;
            }
            if cluster
                .iter()
                .all(|&u| pair_consistent(&corrs[u], &corrs[v], scene, keypoints, config))
            {
                cluster.push(v);
            }
        }
        if cluster.len() >= config.gc_threshold {
            for &v in &cluster {
                used[v] = true;
            }
            clusters.push(cluster);
        }
    }

    clusters
}
