//! Coordinate multisection: recursive axis-aligned quantile cuts.
//!
//! k is factored over the dimensions (k = k_1 * ... * k_D); dimension d is
//! cut into k_d weight-balanced slabs inside every block produced so far.
//! Quantiles come from a replicated histogram per block, so the cuts are
//! deterministic and need one all-reduce per dimension.

use std::sync::Arc;

use crate::algs::collective::{all_reduce, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector};
use crate::geometry::BoundingBox;
use crate::metrics::Metrics;
use crate::settings::Settings;

const HISTOGRAM_BUCKETS: usize = 1 << 11;

/// Split k into one factor per dimension, keeping the factors as even as
/// possible (largest prime factors assigned to the emptiest dimension).
pub fn balanced_factors(k: usize, dim: usize) -> Vec<usize> {
    let mut primes = Vec::new();
    let mut rest = k.max(1);
    let mut p = 2;
    while p * p <= rest {
        while rest % p == 0 {
            primes.push(p);
            rest /= p;
        }
        p += 1;
    }
    if rest > 1 {
        primes.push(rest);
    }
    primes.sort_unstable_by(|a, b| b.cmp(a));
    let mut factors = vec![1usize; dim];
    for prime in primes {
        let target = (0..dim).min_by_key(|&d| factors[d]).unwrap_or(0);
        factors[target] *= prime;
    }
    factors
}

/// Initial partition by weighted coordinate multisection (collective).
pub fn multisection_partition<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    settings: &Settings,
    _metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let dim = coords.len();
    let k = settings.num_blocks;
    let factors = balanced_factors(k, dim);
    let local_n = graph.local_n();

    let local_coords: Vec<Vec<f64>> = coords.iter().map(|c| c.local().to_vec()).collect();
    let bbox = BoundingBox::from_points(&local_coords).global(comm)?;

    let mut part = vec![0usize; local_n];
    let mut num_blocks = 1usize;
    for d in 0..dim {
        let cuts = factors[d];
        if cuts == 1 {
            continue;
        }
        // weighted histogram of dimension d, per current block
        let extent = (bbox.max[d] - bbox.min[d]).max(f64::MIN_POSITIVE);
        let bucket_of = |x: f64| -> usize {
            (((x - bbox.min[d]) / extent * HISTOGRAM_BUCKETS as f64) as usize)
                .min(HISTOGRAM_BUCKETS - 1)
        };
        let mut hist = vec![0.0f64; num_blocks * HISTOGRAM_BUCKETS];
        for i in 0..local_n {
            hist[part[i] * HISTOGRAM_BUCKETS + bucket_of(local_coords[d][i])] +=
                weights.local()[i];
        }
        all_reduce(comm, ReduceOp::Sum, &mut hist)?;

        // per block: thresholds at the j/cuts weight quantiles
        let mut thresholds = vec![HISTOGRAM_BUCKETS; num_blocks * (cuts - 1)];
        for b in 0..num_blocks {
            let row = &hist[b * HISTOGRAM_BUCKETS..(b + 1) * HISTOGRAM_BUCKETS];
            let total: f64 = row.iter().sum();
            let mut cum = 0.0;
            let mut next = 1usize;
            for (bucket, &w) in row.iter().enumerate() {
                cum += w;
                while next < cuts && cum >= total * next as f64 / cuts as f64 {
                    thresholds[b * (cuts - 1) + next - 1] = bucket;
                    next += 1;
                }
            }
        }

        for i in 0..local_n {
            let b = part[i];
            let bucket = bucket_of(local_coords[d][i]);
            let row = &thresholds[b * (cuts - 1)..(b + 1) * (cuts - 1)];
            let piece = row.partition_point(|&t| t < bucket);
            part[i] = b * cuts + piece;
        }
        num_blocks *= cuts;
    }
    debug_assert_eq!(num_blocks, k);
    DistVector::new(Arc::clone(graph.dist()), part)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{run_spmd, NoComm};
    use crate::algs::graph_utils::compute_imbalance;
    use crate::mesh_generation::structured_mesh_2d;

    #[test]
    fn factors_multiply_back_to_k() {
        assert_eq!(balanced_factors(8, 3).iter().product::<usize>(), 8);
        assert_eq!(balanced_factors(12, 2).iter().product::<usize>(), 12);
        assert_eq!(balanced_factors(7, 3).iter().product::<usize>(), 7);
        assert_eq!(balanced_factors(1, 2), vec![1, 1]);
        // 8 over three dimensions splits evenly
        assert_eq!(balanced_factors(8, 3), vec![2, 2, 2]);
    }

    #[test]
    fn multisection_of_a_grid_is_balanced() {
        let comm = NoComm;
        let (g, coords, w) = structured_mesh_2d(&comm, 16, 16).unwrap();
        let settings = Settings {
            num_blocks: 4,
            dimensions: 2,
            ..Settings::default()
        };
        let mut metrics = Metrics::new();
        let part =
            multisection_partition(&comm, &g, &coords, &w, &settings, &mut metrics).unwrap();
        let imb = compute_imbalance(&comm, &part, 4, None).unwrap();
        assert!(imb <= 0.1, "multisection imbalance {imb}");
        for &b in part.local() {
            assert!(b < 4);
        }
    }

    #[test]
    fn distributed_multisection_matches_block_count() {
        let results = run_spmd(3, |comm| {
            let (g, coords, w) = structured_mesh_2d(&comm, 12, 12).unwrap();
            let settings = Settings {
                num_blocks: 6,
                dimensions: 2,
                ..Settings::default()
            };
            let mut metrics = Metrics::new();
            let part =
                multisection_partition(&comm, &g, &coords, &w, &settings, &mut metrics)
                    .unwrap();
            part.local().iter().copied().collect::<Vec<_>>()
        });
        let mut seen = vec![false; 6];
        for row in results {
            for b in row {
                assert!(b < 6);
                seen[b] = true;
            }
        }
        assert!(seen.iter().all(|&s| s));
    }
}
