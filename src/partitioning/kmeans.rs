//! Balanced geometric k-means with per-block influence multipliers.
//!
//! The assignment step minimises the *effective* distance
//! `influence[b] * ||x - c_b||^2`; after every pass the influence of
//! overweight blocks grows and underweight blocks shrinks, pushing the
//! assignment towards the target block weights without touching the
//! geometry. Per-point Hamerly bounds (upper bound on the own-centre
//! distance, lower bound on the nearest-other distance) skip points whose
//! assignment cannot change; centres are pre-filtered by their minimum
//! possible effective distance to the local bounding box.
//!
//! Early iterations run on a doubling sample of the local points with
//! proportionally scaled targets; the final sampling round covers the full
//! set. Centres are seeded at weighted midpoints of contiguous curve
//! segments, one per target block, and per currently-known block in the
//! hierarchical variant.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::algs::collective::{
    all_gather_varlen, all_reduce, all_reduce_scalar, ReduceOp,
};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::DistVector;
use crate::geometry::hilbert::hilbert_point;
use crate::geometry::BoundingBox;
use crate::metrics::Metrics;
use crate::partitioning::comm_tree::CommTree;
use crate::partitioning::sfc::hilbert_indices;
use crate::settings::Settings;

/// Steele/Vigna SplitMix64 mixer for deterministic per-rank seeds.
#[inline]
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Partition the point set into `block_sizes.len()` blocks whose weights
/// approach the given targets within `settings.epsilon` (collective).
pub fn compute_partition<C: Communicator>(
    comm: &C,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    block_sizes: &[f64],
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let k = block_sizes.len();
    let local_n = weights.local().len();
    let parent = vec![0usize; local_n];
    let part = lloyd_loop(
        comm,
        coords,
        weights,
        &parent,
        &[k],
        block_sizes,
        None,
        settings,
        metrics,
    )?;
    DistVector::new(Arc::clone(weights.dist()), part)
}

/// Like [`compute_partition`], but centres start at the weighted centroids
/// of an existing partition instead of the curve seeds, so the result
/// stays close to `seed` while the balance constraint is enforced
/// (collective).
pub fn refine_partition_balance<C: Communicator>(
    comm: &C,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    seed: &DistVector<usize>,
    block_sizes: &[f64],
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let k = block_sizes.len();
    let local_n = weights.local().len();
    let coords_d: Vec<&[f64]> = coords.iter().map(|c| c.local()).collect();
    let sample: Vec<usize> = (0..local_n).collect();
    let mut centers = find_centers(
        comm,
        &coords_d,
        weights.local(),
        &sample,
        seed.local(),
        k,
    )?;
    // empty seed blocks fall back to the curve inverse
    let local_points: Vec<Vec<f64>> = coords_d.iter().map(|c| c.to_vec()).collect();
    let bbox = BoundingBox::from_points(&local_points).global(comm)?;
    let dim = coords.len();
    for j in 0..k {
        if centers[0][j].is_nan() {
            let point =
                hilbert_point((j as f64 + 0.5) / k as f64, dim, settings.sfc_resolution);
            for d in 0..dim {
                let extent = bbox.max[d] - bbox.min[d];
                centers[d][j] = bbox.min[d] + point[d] * extent;
            }
        }
    }
    let parent = vec![0usize; local_n];
    let part = lloyd_loop(
        comm,
        coords,
        weights,
        &parent,
        &[k],
        block_sizes,
        Some(centers),
        settings,
        metrics,
    )?;
    DistVector::new(Arc::clone(weights.dist()), part)
}

/// Partition level by level along a communication tree: at each level every
/// known block is split into its child count, children only competing for
/// the points of their parent (collective).
pub fn compute_hierarchical_partition<C: Communicator>(
    comm: &C,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    tree: &CommTree,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let local_n = weights.local().len();
    let total_weight = all_reduce_scalar(
        comm,
        ReduceOp::Sum,
        weights.local().iter().sum::<f64>(),
    )?;
    let mut parent = vec![0usize; local_n];
    for level in 0..tree.num_levels() {
        let grouping = tree.grouping(level);
        let balance = tree.balance(level);
        let block_sizes: Vec<f64> = balance.iter().map(|&b| b * total_weight).collect();
        parent = lloyd_loop(
            comm,
            coords,
            weights,
            &parent,
            &grouping,
            &block_sizes,
            None,
            settings,
            metrics,
        )?;
    }
    DistVector::new(Arc::clone(weights.dist()), parent)
}

/// Hamerly bound state, one entry per local point.
struct Bounds {
    /// Upper bound on the effective distance to the assigned centre.
    upper: Vec<f64>,
    /// Lower bound on the effective distance to the nearest other centre.
    lower: Vec<f64>,
}

/// One full Lloyd run over the current block structure. `parent[i]` is the
/// block each point belongs to before this run; `grouping[b]` is the number
/// of children block `b` splits into; `block_sizes` are the absolute child
/// targets. Returns the child assignment per local point.
#[allow(clippy::too_many_arguments)]
fn lloyd_loop<C: Communicator>(
    comm: &C,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    parent: &[usize],
    grouping: &[usize],
    block_sizes: &[f64],
    initial_centers: Option<Vec<Vec<f64>>>,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<Vec<usize>, MeshCarveError> {
    let dim = coords.len();
    let k: usize = grouping.iter().sum();
    debug_assert_eq!(block_sizes.len(), k);
    let local_n = weights.local().len();
    let global_n = all_reduce_scalar(comm, ReduceOp::Sum, local_n as u64)? as usize;
    let p = comm.size();

    let coords_d: Vec<&[f64]> = coords.iter().map(|c| c.local()).collect();
    let w = weights.local();
    for d in 0..dim {
        if coords_d[d].iter().any(|x| !x.is_finite()) {
            return Err(MeshCarveError::Input(format!(
                "non-finite coordinate in dimension {d}"
            )));
        }
    }

    // child id base per parent block
    let mut child_base = Vec::with_capacity(grouping.len());
    let mut base = 0usize;
    for &g in grouping {
        child_base.push(base);
        base += g;
    }
    let center_parent: Vec<usize> = grouping
        .iter()
        .enumerate()
        .flat_map(|(b, &g)| std::iter::repeat(b).take(g))
        .collect();

    let local_points: Vec<Vec<f64>> = coords_d.iter().map(|c| c.to_vec()).collect();
    let local_bbox = BoundingBox::from_points(&local_points);
    let global_bbox = local_bbox.global(comm)?;
    let diagonal = global_bbox.diagonal();
    let expected_block_diameter = (global_bbox.volume().max(f64::MIN_POSITIVE) / k as f64)
        .powf(1.0 / dim as f64);

    let mut centers = match initial_centers {
        Some(c) => c,
        None => {
            let h = hilbert_indices(comm, coords, settings.sfc_resolution)?;
            find_initial_centers_sfc(
                comm,
                &coords_d,
                w,
                &h,
                parent,
                grouping,
                &child_base,
                &global_bbox,
                settings,
            )?
        }
    };

    // sampling ramp-up
    let blocks_per_process = (k as f64 / p as f64).max(1.0);
    let min_nodes = ((settings.min_sampling_nodes as f64) * blocks_per_process).ceil() as usize;
    let min_nodes = min_nodes.max(1);
    let random_init = all_reduce_scalar(
        comm,
        ReduceOp::Min,
        u64::from(local_n > min_nodes),
    )? == 1;
    let mut local_indices: Vec<usize> = (0..local_n).collect();
    let mut samples: Vec<usize> = Vec::new();
    if random_init {
        let mut seed = settings.seed;
        crate::algs::collective::broadcast_scalar(comm, 0, &mut seed)?;
        let mut rng =
            SmallRng::seed_from_u64(splitmix64(seed ^ (comm.rank() as u64) << 17));
        fisher_yates(&mut local_indices, &mut rng);
        let denom = (settings.min_sampling_nodes * k).max(1);
        let rounds =
            ((global_n as f64 / denom as f64).log2().ceil() as usize).max(0) + 1;
        samples.push(min_nodes.min(local_n));
        for i in 1..rounds {
            samples.push((samples[i - 1] * 2).min(local_n));
        }
        if let Some(last) = samples.last_mut() {
            *last = local_n;
        }
    }
    let sampling_rounds = samples.len();

    let mut bounds = Bounds {
        upper: vec![f64::MAX; local_n],
        lower: vec![0.0; local_n],
    };
    let mut influence = vec![1.0f64; k];
    // every point starts on its parent's first child
    let mut assignment: Vec<usize> = parent.iter().map(|&b| child_base[b]).collect();

    let threshold = 0.002 * diagonal;
    let mut iter = 0usize;
    let mut delta = f64::MAX;
    let mut balanced = false;
    let mut imbalance = f64::MAX;
    let mut sample: Vec<usize> = Vec::new();
    let mut adjusted_sizes = block_sizes.to_vec();

    loop {
        if iter < sampling_rounds {
            sample = local_indices[..samples[iter]].to_vec();
            sample.sort_unstable();
            let global_sample =
                all_reduce_scalar(comm, ReduceOp::Sum, sample.len() as u64)? as f64;
            let ratio = global_sample / global_n as f64;
            for (a, &b) in adjusted_sizes.iter_mut().zip(block_sizes) {
                *a = b * ratio;
            }
        } else if iter == sampling_rounds {
            sample = (0..local_n).collect();
            adjusted_sizes.copy_from_slice(block_sizes);
        }

        imbalance = assign_blocks(
            comm,
            &coords_d,
            w,
            &sample,
            &centers,
            &center_parent,
            parent,
            &mut assignment,
            &adjusted_sizes,
            &local_bbox,
            &mut bounds,
            &mut influence,
            settings,
            metrics,
        )?;

        let new_centers = find_centers(comm, &coords_d, w, &sample, &assignment, k)?;
        let mut squared_deltas = vec![0.0f64; k];
        let old_influence = influence.clone();
        let mut erosion_min_ratio = f64::MAX;
        for j in 0..k {
            let empty = new_centers[0][j].is_nan();
            for d in 0..dim {
                let next = if empty { centers[d][j] } else { new_centers[d][j] };
                let diff = centers[d][j] - next;
                squared_deltas[j] += diff * diff;
                centers[d][j] = next;
            }
            if settings.erode_influence {
                let delta_j = squared_deltas[j].sqrt();
                let x = (delta_j / expected_block_diameter - 0.1).max(0.0);
                let erosion = 2.0 / (1.0 + (-x).exp()) - 1.0;
                influence[j] = ((1.0 - erosion) * influence[j].ln()).exp();
                let ratio = old_influence[j] / influence[j];
                if ratio < erosion_min_ratio {
                    erosion_min_ratio = ratio;
                }
            }
        }
        let deltas: Vec<f64> = squared_deltas.iter().map(|&s| s.sqrt()).collect();
        delta = deltas.iter().cloned().fold(0.0, f64::max);
        let delta_sq = delta * delta;
        let max_influence = influence.iter().cloned().fold(f64::MIN, f64::max);
        for &i in &sample {
            let cluster = assignment[i];
            if settings.erode_influence {
                bounds.upper[i] *= influence[cluster] / old_influence[cluster] + 1e-12;
                bounds.lower[i] *= erosion_min_ratio - 1e-12;
            }
            bounds.upper[i] += (2.0 * deltas[cluster]
                * (bounds.upper[i] / influence[cluster]).sqrt()
                + squared_deltas[cluster])
                * (influence[cluster] + 1e-10);
            let pure_sqrt = (bounds.lower[i] / max_influence).sqrt();
            if pure_sqrt < delta {
                bounds.lower[i] = 0.0;
            } else {
                let diff = (-2.0 * delta * pure_sqrt + delta_sq) * (max_influence + 1e-10);
                bounds.lower[i] = (bounds.lower[i] + diff).max(0.0);
            }
        }

        // balance against the full targets
        let mut block_w = vec![0.0f64; k];
        for &i in &sample {
            block_w[assignment[i]] += w[i];
        }
        all_reduce(comm, ReduceOp::Sum, &mut block_w)?;
        balanced = block_w
            .iter()
            .zip(&adjusted_sizes)
            .all(|(&bw, &target)| bw <= target * (1.0 + settings.epsilon));

        if !random_init {
            // the result vector is fully populated, recompute exactly
            let max_ratio = block_w
                .iter()
                .zip(block_sizes)
                .map(|(&bw, &t)| bw / t)
                .fold(0.0, f64::max);
            imbalance = max_ratio - 1.0;
        }
        metrics.kmeans_profiling.push((delta, imbalance));

        iter += 1;
        let keep_sampling = iter < sampling_rounds;
        let keep_iterating =
            iter < settings.max_kmeans_iterations && (delta > threshold || !balanced);
        if !(keep_sampling || keep_iterating) {
            break;
        }
    }
    if !balanced && iter >= settings.max_kmeans_iterations {
        log::warn!(
            "k-means hit its iteration cap (delta {delta:.3e}, imbalance {imbalance:.4})"
        );
        metrics.record_non_convergence("kmeans");
    }
    Ok(assignment)
}

/// One balance-constrained assignment pass over `sample`. Updates
/// `assignment`, the Hamerly bounds and the influence vector; returns the
/// reached imbalance.
#[allow(clippy::too_many_arguments)]
fn assign_blocks<C: Communicator>(
    comm: &C,
    coords_d: &[&[f64]],
    w: &[f64],
    sample: &[usize],
    centers: &[Vec<f64>],
    center_parent: &[usize],
    parent: &[usize],
    assignment: &mut [usize],
    target_sizes: &[f64],
    bbox: &BoundingBox,
    bounds: &mut Bounds,
    influence: &mut [f64],
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<f64, MeshCarveError> {
    let dim = coords_d.len();
    let k = target_sizes.len();
    debug_assert_eq!(influence.len(), k);

    // minimum possible effective distance per centre, from the local box
    let mut min_sq_dist = vec![0.0f64; k];
    for j in 0..k {
        let c: Vec<f64> = (0..dim).map(|d| centers[d][j]).collect();
        min_sq_dist[j] = bbox.min_sq_distance(&c);
    }
    let mut order: Vec<usize> = (0..k).collect();
    let mut effective_min = vec![0.0f64; k];
    let resort = |order: &mut Vec<usize>, effective_min: &mut Vec<f64>, influence: &[f64]| {
        for j in 0..k {
            effective_min[j] = min_sq_dist[j] * influence[j];
        }
        order.sort_unstable_by(|&a, &b| {
            effective_min[a]
                .partial_cmp(&effective_min[b])
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.cmp(&b))
        });
    };
    resort(&mut order, &mut effective_min, influence);

    let mut influence_grew = vec![false; k];
    let mut upper_cap = vec![1.0 + settings.influence_change_cap; k];
    let mut lower_cap = vec![1.0 - settings.influence_change_cap; k];

    let mut iter = 0usize;
    let mut imbalance;
    loop {
        let mut block_w = vec![0.0f64; k];
        for &i in sample {
            let old_cluster = assignment[i];
            if bounds.lower[i] <= bounds.upper[i] {
                // tighten the upper bound exactly
                let mut sq_to_own = 0.0;
                for d in 0..dim {
                    let diff = centers[d][old_cluster] - coords_d[d][i];
                    sq_to_own += diff * diff;
                }
                bounds.upper[i] = sq_to_own * influence[old_cluster];
                if bounds.lower[i] <= bounds.upper[i] {
                    // scan in ascending minimum-distance order; once even the
                    // box bound exceeds the second best, no later centre can
                    // improve the assignment
                    let mut best = old_cluster;
                    let mut best_value = f64::MAX;
                    let mut second_value = f64::MAX;
                    for &j in &order {
                        if effective_min[j] >= second_value {
                            break;
                        }
                        if center_parent[j] != parent[i] {
                            continue;
                        }
                        let mut sq = 0.0;
                        for d in 0..dim {
                            let diff = centers[d][j] - coords_d[d][i];
                            sq += diff * diff;
                        }
                        let eff = sq * influence[j];
                        if eff < best_value {
                            second_value = best_value;
                            best = j;
                            best_value = eff;
                        } else if eff < second_value {
                            second_value = eff;
                        }
                    }
                    bounds.upper[i] = best_value;
                    bounds.lower[i] = second_value;
                    assignment[i] = best;
                }
            }
            block_w[assignment[i]] += w[i];
        }

        all_reduce(comm, ReduceOp::Sum, &mut block_w)?;
        imbalance = block_w
            .iter()
            .zip(target_sizes)
            .map(|(&bw, &t)| bw / t)
            .fold(0.0, f64::max)
            - 1.0;

        iter += 1;
        if imbalance <= settings.epsilon - 1e-12 || iter >= settings.balance_iterations {
            break;
        }

        // influence step towards the targets
        let old_influence = influence.to_vec();
        let mut min_ratio = f64::MAX;
        for j in 0..k {
            let ratio = block_w[j] / target_sizes[j];
            if (ratio - 1.0).abs() < settings.epsilon && settings.freeze_balanced_influence {
                min_ratio = min_ratio.min(1.0);
                continue;
            }
            let stepped = influence[j] * ratio.powf(settings.influence_exponent);
            influence[j] = stepped
                .min(influence[j] * upper_cap[j])
                .max(influence[j] * lower_cap[j]);
            debug_assert!(influence[j] > 0.0);
            let influence_ratio = influence[j] / old_influence[j];
            min_ratio = min_ratio.min(influence_ratio);
            if settings.tighten_bounds && iter > 1 && (ratio > 1.0) != influence_grew[j] {
                // the adjustment switched direction, narrow the interval
                upper_cap[j] = 0.1 + 0.9 * upper_cap[j];
                lower_cap[j] = 0.1 + 0.9 * lower_cap[j];
            }
            influence_grew[j] = ratio > 1.0;
        }

        for &i in sample {
            let cluster = assignment[i];
            bounds.upper[i] *= influence[cluster] / old_influence[cluster] + 1e-12;
            bounds.lower[i] *= min_ratio - 1e-12;
        }
        resort(&mut order, &mut effective_min, influence);
    }
    metrics.num_balance_iters.push(iter);
    Ok(imbalance)
}

/// Weighted mean of the points assigned to each block over `sample`
/// (collective). Empty blocks come back as NaN so the caller can keep their
/// previous centre.
fn find_centers<C: Communicator>(
    comm: &C,
    coords_d: &[&[f64]],
    w: &[f64],
    sample: &[usize],
    assignment: &[usize],
    k: usize,
) -> Result<Vec<Vec<f64>>, MeshCarveError> {
    let dim = coords_d.len();
    let mut acc = vec![0.0f64; k * (dim + 1)];
    for &i in sample {
        let b = assignment[i];
        for d in 0..dim {
            acc[d * k + b] += coords_d[d][i] * w[i];
        }
        acc[dim * k + b] += w[i];
    }
    all_reduce(comm, ReduceOp::Sum, &mut acc)?;
    let mut centers = vec![vec![0.0f64; k]; dim];
    for j in 0..k {
        let weight = acc[dim * k + j];
        for d in 0..dim {
            centers[d][j] = if weight > 0.0 {
                acc[d * k + j] / weight
            } else {
                f64::NAN
            };
        }
    }
    Ok(centers)
}

/// Seed centres from the curve: one weighted-midpoint seed per child block,
/// inside its parent's contiguous curve range (collective).
#[allow(clippy::too_many_arguments)]
fn find_initial_centers_sfc<C: Communicator>(
    comm: &C,
    coords_d: &[&[f64]],
    w: &[f64],
    h: &[f64],
    parent: &[usize],
    grouping: &[usize],
    child_base: &[usize],
    global_bbox: &BoundingBox,
    settings: &Settings,
) -> Result<Vec<Vec<f64>>, MeshCarveError> {
    let dim = coords_d.len();
    let num_old = grouping.len();
    let k: usize = grouping.iter().sum();
    let local_n = w.len();

    // per-parent local weight, and this rank's exclusive offset per parent
    let mut local_block_w = vec![0.0f64; num_old];
    for i in 0..local_n {
        local_block_w[parent[i]] += w[i];
    }
    let rows = all_gather_varlen(comm, &local_block_w)?;
    let me = comm.rank();
    let mut offset = vec![0.0f64; num_old];
    let mut total = vec![0.0f64; num_old];
    for (rank, row) in rows.iter().enumerate() {
        for b in 0..num_old {
            if rank < me {
                offset[b] += row[b];
            }
            total[b] += row[b];
        }
    }

    // local points per parent, in curve order
    let mut by_parent: Vec<Vec<usize>> = vec![Vec::new(); num_old];
    for i in 0..local_n {
        by_parent[parent[i]].push(i);
    }
    for list in &mut by_parent {
        list.sort_unstable_by(|&a, &b| {
            h[a].partial_cmp(&h[b]).unwrap_or(std::cmp::Ordering::Equal)
        });
    }

    let mut acc = vec![0.0f64; k * dim];
    let mut found = vec![0.0f64; k];
    for b in 0..num_old {
        for j in 0..grouping[b] {
            let child = child_base[b] + j;
            if total[b] <= 0.0 {
                continue;
            }
            let target = (j as f64 + 0.5) / grouping[b] as f64 * total[b];
            if target < offset[b] || target >= offset[b] + local_block_w[b] {
                continue;
            }
            let mut cum = offset[b];
            for &i in &by_parent[b] {
                cum += w[i];
                if cum > target {
                    for d in 0..dim {
                        acc[d * k + child] = coords_d[d][i];
                    }
                    found[child] = 1.0;
                    break;
                }
            }
        }
    }
    all_reduce(comm, ReduceOp::Sum, &mut acc)?;
    all_reduce(comm, ReduceOp::Sum, &mut found)?;

    let mut centers = vec![vec![0.0f64; k]; dim];
    for j in 0..k {
        if found[j] > 0.0 {
            for d in 0..dim {
                centers[d][j] = acc[d * k + j] / found[j];
            }
        } else {
            // empty parent range: fall back to the curve inverse
            let point =
                hilbert_point((j as f64 + 0.5) / k as f64, dim, settings.sfc_resolution);
            for d in 0..dim {
                let extent = global_bbox.max[d] - global_bbox.min[d];
                centers[d][j] = global_bbox.min[d] + point[d] * extent;
            }
        }
    }
    Ok(centers)
}

/// Deterministic in-place Fisher–Yates shuffle.
fn fisher_yates(indices: &mut [usize], rng: &mut SmallRng) {
    let n = indices.len();
    for i in 0..n.saturating_sub(1) {
        let j = i + rng.gen_range(0..n - i);
        indices.swap(i, j);
    }
}
