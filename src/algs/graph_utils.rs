//! Partition quality measures on the distributed graph.

use bytemuck::Pod;
use rayon::prelude::*;

use crate::algs::collective::{all_reduce, all_reduce_scalar, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector};
use crate::halo::Halo;

/// Look up the value of a column index: local slice or halo copy.
#[inline]
pub fn col_value<T: Pod>(
    graph: &DistGraph,
    halo: &Halo,
    local: &[T],
    halo_values: &[T],
    gid: usize,
) -> T {
    match graph.dist().global_to_local(gid) {
        Some(lid) => local[lid],
        None => {
            let slot = halo
                .global_to_halo(gid)
                .expect("column index neither local nor in halo");
            halo_values[slot]
        }
    }
}

/// Global cut weight of a partition: the sum of edge weights crossing
/// blocks (collective; builds a throw-away halo for the partition values).
pub fn compute_cut<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    part: &DistVector<usize>,
) -> Result<f64, MeshCarveError> {
    graph.check_same_layout(part.dist(), "partition")?;
    let halo = Halo::build(comm, graph)?;
    compute_cut_with_halo(comm, graph, &halo, part)
}

/// Cut weight with a caller-provided halo (avoids rebuilding it in loops).
pub fn compute_cut_with_halo<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &DistVector<usize>,
) -> Result<f64, MeshCarveError> {
    let halo_part = halo.update(comm, graph.dist(), part.local())?;
    let local_cut: f64 = (0..graph.local_n())
        .into_par_iter()
        .map(|lid| {
            let own = part.local()[lid];
            let (cols, weights) = graph.row(lid);
            cols.iter()
                .zip(weights)
                .filter(|(&c, _)| col_value(graph, halo, part.local(), &halo_part, c) != own)
                .map(|(_, &w)| w)
                .sum::<f64>()
        })
        .sum();
    // both endpoints count every cut edge once
    let total = all_reduce_scalar(comm, ReduceOp::Sum, local_cut)?;
    Ok(total / 2.0)
}

/// Global per-block weights of a partition (collective).
pub fn block_weights<C: Communicator>(
    comm: &C,
    part: &DistVector<usize>,
    k: usize,
    weights: Option<&DistVector<f64>>,
) -> Result<Vec<f64>, MeshCarveError> {
    let mut sums = vec![0.0f64; k];
    for (lid, &b) in part.local().iter().enumerate() {
        if b >= k {
            return Err(MeshCarveError::Input(format!(
                "block id {b} out of range for k = {k}"
            )));
        }
        sums[b] += weights.map_or(1.0, |w| w.local()[lid]);
    }
    all_reduce(comm, ReduceOp::Sum, &mut sums)?;
    Ok(sums)
}

/// Global imbalance of a partition: `max_b w_b / opt - 1`, with `opt` the
/// ideal block weight (ceiling for unit weights, mean otherwise). Zero for a
/// perfectly balanced partition.
pub fn compute_imbalance<C: Communicator>(
    comm: &C,
    part: &DistVector<usize>,
    k: usize,
    weights: Option<&DistVector<f64>>,
) -> Result<f64, MeshCarveError> {
    let sums = block_weights(comm, part, k, weights)?;
    let total: f64 = sums.iter().sum();
    if total <= 0.0 {
        return Err(MeshCarveError::Input(
            "total node weight is zero".into(),
        ));
    }
    let opt = if weights.is_none() {
        (total / k as f64).ceil()
    } else {
        total / k as f64
    };
    let max = sums.iter().cloned().fold(0.0, f64::max);
    Ok((max - opt) / opt)
}

/// 1/0 flags marking vertices with a neighbour in a different block
/// (collective).
pub fn border_flags<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    part: &DistVector<usize>,
) -> Result<DistVector<u64>, MeshCarveError> {
    graph.check_same_layout(part.dist(), "partition")?;
    let halo = Halo::build(comm, graph)?;
    let halo_part = halo.update(comm, graph.dist(), part.local())?;
    let mut flags = vec![0u64; graph.local_n()];
    for lid in 0..graph.local_n() {
        let own = part.local()[lid];
        let (cols, _) = graph.row(lid);
        if cols
            .iter()
            .any(|&c| col_value(graph, &halo, part.local(), &halo_part, c) != own)
        {
            flags[lid] = 1;
        }
    }
    DistVector::new(std::sync::Arc::clone(graph.dist()), flags)
}

/// Local vertex (by local id) farthest from the given seed vertices in hop
/// distance, over the local subgraph. Ties resolve to the smallest id.
pub fn farthest_local_node(graph: &DistGraph, seeds: &[usize]) -> Option<usize> {
    let n = graph.local_n();
    if n == 0 {
        return None;
    }
    let dist_of = local_bfs(graph, seeds);
    let mut best: Option<(usize, usize)> = None;
    for (i, &d) in dist_of.iter().enumerate() {
        if d == usize::MAX {
            continue;
        }
        match best {
            Some((_, bd)) if bd >= d => {}
            _ => best = Some((i, d)),
        }
    }
    best.map(|(i, _)| i)
}

/// Hop distances from `seeds` (local ids) over local edges only;
/// unreachable vertices get `usize::MAX`.
pub fn local_bfs(graph: &DistGraph, seeds: &[usize]) -> Vec<usize> {
    let n = graph.local_n();
    let dist = graph.dist();
    let mut dist_of = vec![usize::MAX; n];
    let mut queue = std::collections::VecDeque::new();
    for &s in seeds {
        if s < n && dist_of[s] == usize::MAX {
            dist_of[s] = 0;
            queue.push_back(s);
        }
    }
    while let Some(u) = queue.pop_front() {
        let (cols, _) = graph.row(u);
        for &c in cols {
            if let Some(v) = dist.global_to_local(c) {
                if dist_of[v] == usize::MAX {
                    dist_of[v] = dist_of[u] + 1;
                    queue.push_back(v);
                }
            }
        }
    }
    dist_of
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{run_spmd, NoComm};
    use crate::dist::Distribution;
    use std::sync::Arc;

    /// Complete graph on n vertices, unit weights, replicated CSR.
    pub fn complete_graph(n: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
        let mut ia = vec![0];
        let mut ja = Vec::new();
        for u in 0..n {
            for v in 0..n {
                if u != v {
                    ja.push(v);
                }
            }
            ia.push(ja.len());
        }
        let values = vec![1.0; ja.len()];
        (ia, ja, values)
    }

    #[test]
    fn cut_of_complete_graph_mod_k() {
        // K100 over 10 ranks, partition i mod 10: cut = 10 * 10 * 90 / 2
        let results = run_spmd(10, |comm| {
            let dist = Distribution::block(&comm, 100);
            let (ia, ja, values) = complete_graph(100);
            let g = DistGraph::from_replicated(dist, &ia, &ja, &values).unwrap();
            let part_local: Vec<usize> =
                g.dist().owned_ids().iter().map(|&gid| gid % 10).collect();
            let part = DistVector::new(Arc::clone(g.dist()), part_local).unwrap();
            compute_cut(&comm, &g, &part).unwrap()
        });
        for cut in results {
            assert_eq!(cut, 4500.0);
        }
    }

    #[test]
    fn imbalance_of_balanced_and_degenerate_partitions() {
        let comm = NoComm;
        let n = 10_000;
        let k = 10;
        let dist = Distribution::serial(n);
        let balanced: Vec<usize> = (0..n).map(|i| i % k).collect();
        let part = DistVector::new(Arc::clone(&dist), balanced).unwrap();
        assert_eq!(compute_imbalance(&comm, &part, k, None).unwrap(), 0.0);

        let all_in_one = DistVector::from_constant(Arc::clone(&dist), 0usize);
        let imb = compute_imbalance(&comm, &all_in_one, k, None).unwrap();
        assert_eq!(imb, 9.0);

        // any partition has non-negative imbalance
        let skew: Vec<usize> = (0..n).map(|i| if i < 17 { 1 } else { i % k }).collect();
        let part = DistVector::new(dist, skew).unwrap();
        assert!(compute_imbalance(&comm, &part, k, None).unwrap() >= 0.0);
    }

    #[test]
    fn border_flags_mark_the_frontier() {
        let comm = NoComm;
        // path 0-1-2-3, split 0,1 | 2,3
        let dist = Distribution::serial(4);
        let ia = vec![0, 1, 3, 5, 6];
        let ja = vec![1, 0, 2, 1, 3, 2];
        let values = vec![1.0; 6];
        let g = DistGraph::new(dist, ia, ja, values).unwrap();
        let part =
            DistVector::new(Arc::clone(g.dist()), vec![0, 0, 1, 1]).unwrap();
        let flags = border_flags(&comm, &g, &part).unwrap();
        assert_eq!(flags.local(), &[0, 1, 1, 0]);
    }

    #[test]
    fn farthest_node_on_a_path() {
        let dist = Distribution::serial(4);
        let ia = vec![0, 1, 3, 5, 6];
        let ja = vec![1, 0, 2, 1, 3, 2];
        let values = vec![1.0; 6];
        let g = DistGraph::new(dist, ia, ja, values).unwrap();
        assert_eq!(farthest_local_node(&g, &[0]), Some(3));
        assert_eq!(farthest_local_node(&g, &[1, 2]), Some(0));
    }
}
