//! Partitioning pipeline: seed method dispatch, balance enforcement,
//! multilevel refinement.
//!
//! The driver first redistributes along the space-filling curve so that
//! curve neighbours are co-located, obtains a seed partition with the
//! selected method, enforces the balance constraint with the k-means
//! engine, and finally runs multilevel refinement when the block count
//! matches the rank count. The returned partition vector is always aligned
//! with the caller's row distribution.

pub mod comm_tree;
pub mod kmeans;
pub mod multilevel;
pub mod multisection;
pub mod pixel;
pub mod refinement;
pub mod sfc;
pub mod spectral;

use std::sync::Arc;
use std::time::Instant;

use crate::algs::block_graph::block_graph;
use crate::algs::collective::{all_reduce_scalar, exchange_by_plan, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::algs::graph_utils::{compute_cut, compute_imbalance};
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector, Distribution, Redistributor};
use crate::halo::Halo;
use crate::metrics::Metrics;
use crate::partitioning::comm_tree::CommTree;
use crate::settings::{InitialPartitioningMethod, Settings};

/// Partition a distributed geometric graph into `settings.num_blocks`
/// balanced blocks (collective). `weights` of `None` means unit weights.
/// The result is aligned with `graph`'s row distribution.
pub fn partition_graph<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: Option<&DistVector<f64>>,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    partition_impl(comm, graph, coords, weights, None, None, settings, metrics)
}

/// As [`partition_graph`], splitting hierarchically along a communication
/// tree; the tree's leaf count must equal `settings.num_blocks`.
pub fn partition_graph_with_tree<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: Option<&DistVector<f64>>,
    tree: &CommTree,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    if tree.num_leaves() != settings.num_blocks {
        return Err(MeshCarveError::Config(format!(
            "commTree has {} leaves for numBlocks = {}",
            tree.num_leaves(),
            settings.num_blocks
        )));
    }
    partition_impl(comm, graph, coords, weights, None, Some(tree), settings, metrics)
}

/// One-shot repartitioning: the previous assignment seeds the centres so
/// the new partition stays close to it while balance is restored
/// (collective).
pub fn repartition<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: Option<&DistVector<f64>>,
    previous: &DistVector<usize>,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    graph.check_same_layout(previous.dist(), "previous partition")?;
    partition_impl(
        comm,
        graph,
        coords,
        weights,
        Some(previous),
        None,
        settings,
        metrics,
    )
}

#[allow(clippy::too_many_arguments)]
fn partition_impl<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: Option<&DistVector<f64>>,
    previous: Option<&DistVector<usize>>,
    tree: Option<&CommTree>,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    settings.validate()?;
    let k = settings.num_blocks;
    if coords.len() != settings.dimensions {
        return Err(MeshCarveError::Config(format!(
            "{} coordinate dimensions for dimensions = {}",
            coords.len(),
            settings.dimensions
        )));
    }
    for (d, c) in coords.iter().enumerate() {
        graph.check_same_layout(c.dist(), &format!("coordinate dimension {d}"))?;
    }
    if let Some(w) = weights {
        graph.check_same_layout(w.dist(), "node weights")?;
        if w.local().iter().any(|&x| !(x > 0.0)) {
            return Err(MeshCarveError::Input(
                "node weights must be positive".into(),
            ));
        }
    }
    let input_dist = Arc::clone(graph.dist());
    if k == 1 {
        return Ok(DistVector::from_constant(input_dist, 0));
    }

    let t_total = Instant::now();
    let weights = weights
        .cloned()
        .unwrap_or_else(|| DistVector::from_constant(Arc::clone(&input_dist), 1.0));
    let previous_local = previous.map(|p| p.local().to_vec());

    // 1. co-locate curve neighbours
    let t = Instant::now();
    let (graph, coords, weights, dist) =
        sfc::sfc_redistribute(comm, graph, coords, &weights, settings.sfc_resolution)?;
    metrics.time_sfc = Some(t.elapsed());

    // carry a previous assignment through the redistribution
    let previous = match previous_local {
        Some(local) => {
            let plan = Redistributor::new(comm, &input_dist, Arc::clone(&dist))?;
            Some(DistVector::new(
                Arc::clone(&dist),
                plan.apply(comm, &local)?,
            )?)
        }
        None => None,
    };

    // 2. seed + balance
    let t = Instant::now();
    let total_weight = all_reduce_scalar(
        comm,
        ReduceOp::Sum,
        weights.local().iter().sum::<f64>(),
    )?;
    let block_sizes = vec![total_weight / k as f64; k];
    let part = if let Some(tree) = tree {
        kmeans::compute_hierarchical_partition(
            comm, &coords, &weights, tree, settings, metrics,
        )?
    } else if let Some(prev) = &previous {
        kmeans::refine_partition_balance(
            comm,
            &coords,
            &weights,
            prev,
            &block_sizes,
            settings,
            metrics,
        )?
    } else {
        match settings.initial_partition {
            InitialPartitioningMethod::Sfc => {
                let seed = sfc::sfc_partition(
                    comm,
                    &coords,
                    &weights,
                    k,
                    settings.sfc_resolution,
                )?;
                kmeans::refine_partition_balance(
                    comm,
                    &coords,
                    &weights,
                    &seed,
                    &block_sizes,
                    settings,
                    metrics,
                )?
            }
            InitialPartitioningMethod::KMeans => kmeans::compute_partition(
                comm,
                &coords,
                &weights,
                &block_sizes,
                settings,
                metrics,
            )?,
            InitialPartitioningMethod::Pixel => {
                let seed =
                    pixel::pixeled_partition(comm, &graph, &coords, &weights, settings, metrics)?;
                kmeans::refine_partition_balance(
                    comm,
                    &coords,
                    &weights,
                    &seed,
                    &block_sizes,
                    settings,
                    metrics,
                )?
            }
            InitialPartitioningMethod::Spectral => {
                let seed = spectral::spectral_partition(
                    comm, &graph, &coords, &weights, settings, metrics,
                )?;
                kmeans::refine_partition_balance(
                    comm,
                    &coords,
                    &weights,
                    &seed,
                    &block_sizes,
                    settings,
                    metrics,
                )?
            }
            InitialPartitioningMethod::Multisection => {
                let seed = multisection::multisection_partition(
                    comm, &graph, &coords, &weights, settings, metrics,
                )?;
                kmeans::refine_partition_balance(
                    comm,
                    &coords,
                    &weights,
                    &seed,
                    &block_sizes,
                    settings,
                    metrics,
                )?
            }
        }
    };
    metrics.time_kmeans = Some(t.elapsed());
    metrics.preliminary_cut = Some(compute_cut(comm, &graph, &part)?);
    metrics.preliminary_imbalance =
        Some(compute_imbalance(comm, &part, k, Some(&weights))?);
    log::info!(
        "initial partition: cut {:?}, imbalance {:?}",
        metrics.preliminary_cut,
        metrics.preliminary_imbalance
    );

    // 3. multilevel local refinement
    let (graph, part, weights) = if !settings.no_refinement && k == comm.size() && k > 1 {
        let t = Instant::now();
        // move every block onto its rank so partition == ownership
        let p = comm.size();
        let mut gids_for: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
        for (lid, &b) in part.local().iter().enumerate() {
            gids_for[b].push(dist.local_to_global(lid) as u64);
        }
        let received = exchange_by_plan(comm, &gids_for)?;
        let mut owned: Vec<usize> =
            received.into_iter().flatten().map(|g| g as usize).collect();
        owned.sort_unstable();
        let by_block = Distribution::general(comm, owned, dist.global_n())?;
        let plan = Redistributor::new(comm, &dist, Arc::clone(&by_block))?;
        let graph = graph.redistribute(comm, Arc::clone(&by_block))?;
        let weights = DistVector::new(
            Arc::clone(&by_block),
            plan.apply(comm, weights.local())?,
        )?;
        let coords = coords
            .iter()
            .map(|c| DistVector::new(Arc::clone(&by_block), plan.apply(comm, c.local())?))
            .collect::<Result<Vec<_>, _>>()?;

        let halo = Halo::build(comm, &graph)?;
        let state = multilevel::multi_level_step(
            comm, graph, weights, coords, halo, settings, metrics,
        )?;
        metrics.time_multilevel = Some(t.elapsed());
        let part =
            DistVector::from_constant(Arc::clone(state.graph.dist()), comm.rank());
        (state.graph, part, state.weights)
    } else {
        if !settings.no_refinement && k != comm.size() {
            log::info!(
                "skipping local refinement: numBlocks {k} != {} ranks",
                comm.size()
            );
        }
        (graph, part, weights)
    };

    metrics.final_cut = Some(compute_cut(comm, &graph, &part)?);
    metrics.final_imbalance = Some(compute_imbalance(comm, &part, k, Some(&weights))?);
    let bg = block_graph(comm, &graph, &part, k)?;
    metrics.max_comm_volume = Some(bg.max_degree());
    metrics.total_comm_volume = Some(bg.total_edge_weight().round() as usize);
    metrics.time_total = Some(t_total.elapsed());

    // 4. hand the partition back on the caller's layout
    let plan = Redistributor::new(comm, part.dist(), input_dist)?;
    let local = plan.apply(comm, part.local())?;
    DistVector::new(Arc::clone(plan.new_dist()), local)
}
