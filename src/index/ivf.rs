//! Inverted-file clustering for the approximate index variant.
//!
//! Centroids are fitted with a short k-means run over the first added
//! batch; every stored vector is assigned to its nearest centroid's
//! posting list and searches probe only the closest lists.

use rand::{Rng, RngExt};
use serde::{Deserialize, Serialize};

use super::VectorId;
use crate::types::Vector;

const KMEANS_ITERATIONS: usize = 8;

/// Trained clustering state: centroids plus per-centroid posting lists.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct IvfState {
    centroids: Vec<Vector>,
    postings: Vec<Vec<VectorId>>,
}

impl IvfState {
    /// Fits `nlist` centroids to `sample` with k-means.
    ///
    /// The effective cluster count is capped by the sample size, so a
    /// small first batch trains a small but valid index.
    pub(crate) fn train(sample: &[Vector], nlist: usize, dimension: usize) -> Self {
        let nlist = nlist.min(sample.len()).max(1);
        let mut rng = rand::rng();
        let seeds = sample_indices(&mut rng, sample.len(), nlist);
        let mut centroids: Vec<Vector> = seeds.iter().map(|&i| sample[i].clone()).collect();

        for _ in 0..KMEANS_ITERATIONS {
            let mut sums = vec![vec![0.0f32; dimension]; nlist];
            let mut counts = vec![0usize; nlist];
            for vector in sample {
                let cluster = nearest(&centroids, vector);
                counts[cluster] += 1;
                for (accumulated, value) in sums[cluster].iter_mut().zip(vector.iter()) {
                    *accumulated += value;
                }
            }
            for (cluster, centroid) in centroids.iter_mut().enumerate() {
                if counts[cluster] > 0 {
                    for (value, sum) in centroid.iter_mut().zip(sums[cluster].iter()) {
                        *value = sum / counts[cluster] as f32;
                    }
                }
                // Empty clusters keep their previous centroid.
            }
        }

        Self {
            postings: vec![Vec::new(); centroids.len()],
            centroids,
        }
    }

    pub(crate) fn cluster_count(&self) -> usize {
        self.centroids.len()
    }

    /// Adds `id` to the posting list of its nearest centroid.
    pub(crate) fn assign(&mut self, id: VectorId, vector: &[f32]) {
        let cluster = nearest(&self.centroids, vector);
        self.postings[cluster].push(id);
    }

    /// Removes `id` from whichever posting list holds it.
    pub(crate) fn unassign(&mut self, id: VectorId) -> bool {
        for posting in &mut self.postings {
            if let Some(position) = posting.iter().position(|&entry| entry == id) {
                posting.swap_remove(position);
                return true;
            }
        }
        false
    }

    /// Ids stored in the `nprobe` posting lists closest to `query`.
    pub(crate) fn probe(&self, query: &[f32], nprobe: usize) -> Vec<VectorId> {
        let mut ranked: Vec<(f32, usize)> = self
            .centroids
            .iter()
            .enumerate()
            .map(|(cluster, centroid)| (l2_distance(query, centroid), cluster))
            .collect();
        ranked.sort_by(|a, b| a.0.total_cmp(&b.0));
        ranked
            .into_iter()
            .take(nprobe.max(1))
            .flat_map(|(_, cluster)| self.postings[cluster].iter().copied())
            .collect()
    }
}

/// Squared-free Euclidean distance. Always non-negative.
pub(crate) fn l2_distance(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}

fn nearest(centroids: &[Vector], vector: &[f32]) -> usize {
    let mut best = 0usize;
    let mut best_distance = f32::INFINITY;
    for (cluster, centroid) in centroids.iter().enumerate() {
        let distance = l2_distance(vector, centroid);
        if distance < best_distance {
            best_distance = distance;
            best = cluster;
        }
    }
    best
}

/// Partial Fisher-Yates draw of `amount` distinct indices from `0..len`.
fn sample_indices(rng: &mut impl Rng, len: usize, amount: usize) -> Vec<usize> {
    let amount = amount.min(len);
    let mut indices: Vec<usize> = (0..len).collect();
    for i in 0..amount {
        let j = rng.random_range(i..len);
        indices.swap(i, j);
    }
    indices.truncate(amount);
    indices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> Vec<Vector> {
        // Two well-separated blobs.
        vec![
            vec![0.0, 0.0],
            vec![0.1, 0.0],
            vec![0.0, 0.1],
            vec![10.0, 10.0],
            vec![10.1, 10.0],
            vec![10.0, 10.1],
        ]
    }

    #[test]
    fn training_caps_nlist_at_sample_size() {
        let sample = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let state = IvfState::train(&sample, 100, 2);
        assert_eq!(state.cluster_count(), 2);
    }

    #[test]
    fn probing_all_lists_sees_every_assignment() {
        let sample = corpus();
        let mut state = IvfState::train(&sample, 2, 2);
        for (id, vector) in sample.iter().enumerate() {
            state.assign(id, vector);
        }
        let mut seen = state.probe(&[5.0, 5.0], state.cluster_count());
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn narrow_probe_prefers_the_near_blob() {
        let sample = corpus();
        let mut state = IvfState::train(&sample, 2, 2);
        for (id, vector) in sample.iter().enumerate() {
            state.assign(id, vector);
        }
        let seen = state.probe(&[0.05, 0.05], 1);
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|&id| id < 3), "probed far blob: {seen:?}");
    }

    #[test]
    fn unassign_removes_exactly_one_id() {
        let sample = corpus();
        let mut state = IvfState::train(&sample, 2, 2);
        for (id, vector) in sample.iter().enumerate() {
            state.assign(id, vector);
        }
        assert!(state.unassign(4));
        assert!(!state.unassign(4));
        let seen = state.probe(&[5.0, 5.0], state.cluster_count());
        assert!(!seen.contains(&4));
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn l2_distance_is_non_negative_and_zero_on_self() {
        let v = vec![1.5, -2.0, 3.25];
        assert_eq!(l2_distance(&v, &v), 0.0);
        assert!(l2_distance(&v, &[0.0, 0.0, 0.0]) > 0.0);
    }
}
