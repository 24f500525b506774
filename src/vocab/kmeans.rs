//! Flat k-means clustering with k-means++ seeding.
//!
//! Assignment is data-parallel; centroid recomputation is a sequential
//! reduction that must finish before the next iteration starts.

use rand::prelude::*;
use rand::rngs::StdRng;
use rayon::prelude::*;
use tracing::{debug, warn};

use crate::descriptor::distance::squared_euclidean;
use crate::error::{Result, RetrovaError};

/// Below this sample count the parallel assignment path is not worth the
/// scheduling overhead.
const PARALLEL_THRESHOLD: usize = 1000;

/// Configuration for one k-means run.
#[derive(Debug, Clone)]
pub struct KMeansConfig {
    /// Maximum number of assignment/update iterations.
    pub max_iterations: usize,
    /// Stop when the mean centroid movement drops below this value.
    pub convergence_threshold: f32,
    /// Fixed seed for reproducible clustering; `None` draws from the
    /// thread-local generator.
    pub seed: Option<u64>,
    /// Use the worker pool for the assignment step on large sample sets.
    pub parallel: bool,
}

impl Default for KMeansConfig {
    fn default() -> Self {
        KMeansConfig {
            max_iterations: 100,
            convergence_threshold: 1e-6,
            seed: None,
            parallel: true,
        }
    }
}

/// The outcome of one k-means run.
#[derive(Debug, Clone)]
pub struct KMeansResult {
    /// Final centroids, `k` rows.
    pub centroids: Vec<Vec<f32>>,
    /// Index of the owning centroid for each input sample.
    pub assignments: Vec<usize>,
    /// Iterations actually executed.
    pub iterations_run: usize,
    /// Whether the convergence threshold was met before the iteration
    /// cap. A `false` here degrades quality but is not an error.
    pub converged: bool,
}

/// Partition `samples` into `k` clusters.
///
/// Fails with `InsufficientSamples` when there are fewer samples than
/// requested clusters. With exactly `k` distinct samples every sample
/// becomes its own centroid.
pub fn run(samples: &[&[f32]], k: usize, config: &KMeansConfig) -> Result<KMeansResult> {
    if k == 0 {
        return Err(RetrovaError::invalid_params("cluster count must be > 0"));
    }
    if samples.len() < k {
        return Err(RetrovaError::InsufficientSamples {
            needed: k,
            available: samples.len(),
        });
    }

    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    };

    let mut centroids = seed_centroids(samples, k, &mut rng);
    let mut assignments = Vec::new();
    let mut iterations_run = 0;
    let mut converged = false;

    for iteration in 0..config.max_iterations {
        iterations_run = iteration + 1;

        assignments = assign(samples, &centroids, config.parallel);

        let movement = update_centroids(samples, &assignments, &mut centroids);

        if movement < config.convergence_threshold {
            converged = true;
            debug!(iterations = iterations_run, k, "k-means converged");
            break;
        }
    }

    if !converged {
        warn!(
            iterations = iterations_run,
            k, "k-means hit the iteration cap without converging"
        );
        // The last update may have moved centroids; refresh assignments
        // so they are consistent with what we return.
        assignments = assign(samples, &centroids, config.parallel);
    }

    Ok(KMeansResult {
        centroids,
        assignments,
        iterations_run,
        converged,
    })
}

/// k-means++ seeding: the first centroid is drawn uniformly, each later
/// one with probability proportional to its squared distance from the
/// nearest centroid chosen so far.
fn seed_centroids(samples: &[&[f32]], k: usize, rng: &mut StdRng) -> Vec<Vec<f32>> {
    let mut centroids: Vec<Vec<f32>> = Vec::with_capacity(k);

    let first = rng.random_range(0..samples.len());
    centroids.push(samples[first].to_vec());

    // Squared distance from each sample to its nearest chosen centroid.
    let mut dist2: Vec<f32> = samples
        .iter()
        .map(|s| squared_euclidean(s, &centroids[0]))
        .collect();

    while centroids.len() < k {
        let total_weight: f32 = dist2.iter().sum();

        let next = if total_weight > 0.0 {
            let target = rng.random::<f32>() * total_weight;
            let mut cumsum = 0.0;
            let mut chosen = samples.len() - 1;
            for (i, &weight) in dist2.iter().enumerate() {
                cumsum += weight;
                if cumsum >= target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            // All remaining samples coincide with a centroid; fall back
            // to a uniform draw.
            rng.random_range(0..samples.len())
        };

        let chosen = samples[next].to_vec();
        for (i, sample) in samples.iter().enumerate() {
            let d = squared_euclidean(sample, &chosen);
            if d < dist2[i] {
                dist2[i] = d;
            }
        }
        centroids.push(chosen);
    }

    centroids
}

/// Assign each sample to its nearest centroid, ties to the lowest index.
fn assign(samples: &[&[f32]], centroids: &[Vec<f32>], parallel: bool) -> Vec<usize> {
    if parallel && samples.len() >= PARALLEL_THRESHOLD {
        samples
            .par_iter()
            .map(|s| nearest_centroid(s, centroids))
            .collect()
    } else {
        samples
            .iter()
            .map(|s| nearest_centroid(s, centroids))
            .collect()
    }
}

/// Index of the nearest centroid by squared Euclidean distance.
pub(crate) fn nearest_centroid(sample: &[f32], centroids: &[Vec<f32>]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;

    for (i, centroid) in centroids.iter().enumerate() {
        let dist = squared_euclidean(sample, centroid);
        if dist < best_dist {
            best_dist = dist;
            best = i;
        }
    }

    best
}

/// Recompute centroids as cluster means and return the mean Euclidean
/// movement. Empty clusters keep their previous centroid.
fn update_centroids(
    samples: &[&[f32]],
    assignments: &[usize],
    centroids: &mut [Vec<f32>],
) -> f32 {
    let k = centroids.len();
    let dim = centroids[0].len();

    let mut sums = vec![vec![0.0f64; dim]; k];
    let mut counts = vec![0usize; k];

    for (sample, &cluster) in samples.iter().zip(assignments.iter()) {
        counts[cluster] += 1;
        for (acc, &value) in sums[cluster].iter_mut().zip(sample.iter()) {
            *acc += f64::from(value);
        }
    }

    let mut total_movement = 0.0f32;
    for (i, centroid) in centroids.iter_mut().enumerate() {
        if counts[i] == 0 {
            continue;
        }
        let new: Vec<f32> = sums[i]
            .iter()
            .map(|&s| (s / counts[i] as f64) as f32)
            .collect();
        total_movement += squared_euclidean(centroid, &new).sqrt();
        *centroid = new;
    }

    total_movement / k as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_blobs() -> Vec<Vec<f32>> {
        let mut samples = Vec::new();
        for i in 0..20 {
            let jitter = (i % 5) as f32 * 0.01;
            samples.push(vec![0.0 + jitter, 0.0]);
            samples.push(vec![10.0 + jitter, 10.0]);
        }
        samples
    }

    fn as_refs(rows: &[Vec<f32>]) -> Vec<&[f32]> {
        rows.iter().map(|r| r.as_slice()).collect()
    }

    #[test]
    fn test_two_well_separated_clusters() {
        let rows = two_blobs();
        let samples = as_refs(&rows);
        let config = KMeansConfig {
            seed: Some(42),
            ..Default::default()
        };

        let result = run(&samples, 2, &config).unwrap();
        assert!(result.converged);
        assert_eq!(result.centroids.len(), 2);
        assert_eq!(result.assignments.len(), samples.len());

        // Samples from the same blob must land in the same cluster.
        for pair in result.assignments.chunks(2) {
            assert_ne!(pair[0], pair[1]);
        }
    }

    #[test]
    fn test_insufficient_samples() {
        let rows = vec![vec![1.0, 2.0], vec![3.0, 4.0]];
        let samples = as_refs(&rows);

        match run(&samples, 3, &KMeansConfig::default()) {
            Err(RetrovaError::InsufficientSamples { needed, available }) => {
                assert_eq!(needed, 3);
                assert_eq!(available, 2);
            }
            other => panic!("expected InsufficientSamples, got {other:?}"),
        }
    }

    #[test]
    fn test_exactly_k_samples_each_own_cluster() {
        let rows = vec![
            vec![0.0, 0.0],
            vec![5.0, 0.0],
            vec![0.0, 5.0],
            vec![5.0, 5.0],
        ];
        let samples = as_refs(&rows);
        let config = KMeansConfig {
            seed: Some(7),
            ..Default::default()
        };

        let result = run(&samples, 4, &config).unwrap();
        assert!(result.converged);

        let mut seen = result.assignments.clone();
        seen.sort_unstable();
        assert_eq!(seen, vec![0, 1, 2, 3]);

        // Each centroid coincides with its sample.
        for (sample, &cluster) in samples.iter().zip(result.assignments.iter()) {
            assert_eq!(&result.centroids[cluster], sample);
        }
    }

    #[test]
    fn test_zero_clusters_rejected() {
        let rows = vec![vec![1.0]];
        let samples = as_refs(&rows);
        assert!(run(&samples, 0, &KMeansConfig::default()).is_err());
    }

    #[test]
    fn test_seeded_runs_are_deterministic() {
        let rows = two_blobs();
        let samples = as_refs(&rows);
        let config = KMeansConfig {
            seed: Some(99),
            ..Default::default()
        };

        let a = run(&samples, 4, &config).unwrap();
        let b = run(&samples, 4, &config).unwrap();
        assert_eq!(a.centroids, b.centroids);
        assert_eq!(a.assignments, b.assignments);
    }
}
