//! Block and process graphs: aggregated cut structure of a partition.
//!
//! Both graphs share one accumulation: walk the local edges, project the
//! endpoints (to block ids, or to owner ranks) and add the edge weight to
//! the projected pair. Every undirected edge is seen from both endpoints, so
//! the combined matrix is symmetric without a separate fix-up pass.

use hashbrown::HashMap;

use crate::algs::collective::{all_gather_varlen, all_reduce, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::algs::graph_utils::col_value;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector};
use crate::halo::Halo;

/// Replicated k-vertex weighted graph in CSR form. Isolated vertices carry a
/// unit self-loop so colouring and spectral routines never see isolates.
#[derive(Clone, Debug)]
pub struct BlockGraph {
    k: usize,
    ia: Vec<usize>,
    ja: Vec<usize>,
    values: Vec<f64>,
}

impl BlockGraph {
    /// Assemble from a dense k*k symmetric weight matrix (row-major);
    /// zero rows receive a unit self-loop.
    pub fn from_dense_weights(k: usize, dense: &[f64]) -> Self {
        Self::from_dense(k, dense)
    }

    /// Wrap an already-assembled replicated CSR.
    pub fn from_csr(k: usize, ia: Vec<usize>, ja: Vec<usize>, values: Vec<f64>) -> Self {
        debug_assert_eq!(ia.len(), k + 1);
        debug_assert_eq!(ja.len(), values.len());
        Self { k, ia, ja, values }
    }

    /// Assemble from a dense k*k weight accumulation (row-major).
    fn from_dense(k: usize, dense: &[f64]) -> Self {
        debug_assert_eq!(dense.len(), k * k);
        let mut ia = Vec::with_capacity(k + 1);
        let mut ja = Vec::new();
        let mut values = Vec::new();
        ia.push(0);
        for a in 0..k {
            let row = &dense[a * k..(a + 1) * k];
            let isolated = row.iter().all(|&w| w == 0.0);
            if isolated {
                ja.push(a);
                values.push(1.0);
            } else {
                for (b, &w) in row.iter().enumerate() {
                    if w > 0.0 {
                        ja.push(b);
                        values.push(w);
                    }
                }
            }
            ia.push(ja.len());
        }
        Self { k, ia, ja, values }
    }

    #[inline]
    pub fn k(&self) -> usize {
        self.k
    }

    /// Neighbour ids and weights of vertex `a` (may include a self-loop).
    #[inline]
    pub fn neighbors(&self, a: usize) -> (&[usize], &[f64]) {
        let (s, e) = (self.ia[a], self.ia[a + 1]);
        (&self.ja[s..e], &self.values[s..e])
    }

    /// Weight of entry (a, b), zero if absent.
    pub fn weight(&self, a: usize, b: usize) -> f64 {
        let (cols, weights) = self.neighbors(a);
        cols.iter()
            .position(|&c| c == b)
            .map_or(0.0, |j| weights[j])
    }

    /// Degree of `a` not counting a self-loop.
    pub fn degree(&self, a: usize) -> usize {
        let (cols, _) = self.neighbors(a);
        cols.iter().filter(|&&b| b != a).count()
    }

    /// Maximum degree over all vertices: the largest number of peers any
    /// block exchanges with.
    pub fn max_degree(&self) -> usize {
        (0..self.k).map(|a| self.degree(a)).max().unwrap_or(0)
    }

    /// Total inter-vertex edge weight (each undirected edge once).
    pub fn total_edge_weight(&self) -> f64 {
        let mut total = 0.0;
        for a in 0..self.k {
            let (cols, weights) = self.neighbors(a);
            for (&b, &w) in cols.iter().zip(weights) {
                if a < b {
                    total += w;
                }
            }
        }
        total
    }

    /// Undirected edges (a < b), excluding self-loops.
    pub fn edges(&self) -> Vec<(usize, usize, f64)> {
        let mut out = Vec::new();
        for a in 0..self.k {
            let (cols, weights) = self.neighbors(a);
            for (&b, &w) in cols.iter().zip(weights) {
                if a < b {
                    out.push((a, b, w));
                }
            }
        }
        out
    }

    /// Check `B(a,b) == B(b,a)` for every entry.
    pub fn is_symmetric(&self) -> bool {
        for a in 0..self.k {
            let (cols, weights) = self.neighbors(a);
            for (&b, &w) in cols.iter().zip(weights) {
                if self.weight(b, a) != w {
                    return false;
                }
            }
        }
        true
    }
}

/// Build the replicated block graph of `part` (collective): entry (a,b) is
/// the summed weight of edges crossing from block a to block b.
pub fn block_graph<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    part: &DistVector<usize>,
    k: usize,
) -> Result<BlockGraph, MeshCarveError> {
    graph.check_same_layout(part.dist(), "partition")?;
    let halo = Halo::build(comm, graph)?;
    block_graph_with_halo(comm, graph, &halo, part, k)
}

/// Block graph with a caller-provided halo.
pub fn block_graph_with_halo<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    halo: &Halo,
    part: &DistVector<usize>,
    k: usize,
) -> Result<BlockGraph, MeshCarveError> {
    let halo_part = halo.update(comm, graph.dist(), part.local())?;
    let mut dense = vec![0.0f64; k * k];
    for lid in 0..graph.local_n() {
        let a = part.local()[lid];
        if a >= k {
            return Err(MeshCarveError::Input(format!(
                "block id {a} out of range for k = {k}"
            )));
        }
        let (cols, weights) = graph.row(lid);
        for (&c, &w) in cols.iter().zip(weights) {
            let b = col_value(graph, halo, part.local(), &halo_part, c);
            if a != b {
                dense[a * k + b] += w;
            }
        }
    }
    all_reduce(comm, ReduceOp::Sum, &mut dense)?;
    Ok(BlockGraph::from_dense(k, &dense))
}

/// This rank's row of the process graph: edge weight to every peer rank
/// that shares at least one cut edge with it.
#[derive(Clone, Debug)]
pub struct ProcessGraphRow {
    pub rank: usize,
    /// (peer, summed weight of edges into the peer), sorted by peer.
    pub peers: Vec<(usize, f64)>,
}

/// Build the distributed process graph (one row per rank, collective): the
/// same accumulation as the block graph with p = owner rank. Rows without
/// peers receive a unit self-loop.
pub fn process_graph<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
) -> Result<ProcessGraphRow, MeshCarveError> {
    let dist = graph.dist();
    let me = comm.rank();
    let mut weight_to: HashMap<usize, f64> = HashMap::new();
    for &c in graph.ja() {
        if !dist.is_local(c) {
            *weight_to.entry(dist.owner_of(c)).or_insert(0.0) += 1.0;
        }
    }
    let mut peers: Vec<(usize, f64)> = weight_to.into_iter().collect();
    if peers.is_empty() {
        peers.push((me, 1.0));
    }
    peers.sort_unstable_by_key(|&(r, _)| r);
    Ok(ProcessGraphRow { rank: me, peers })
}

/// Replicate the process graph on every rank (collective), for the
/// schedule colouring.
pub fn replicate_process_graph<C: Communicator>(
    comm: &C,
    row: &ProcessGraphRow,
) -> Result<BlockGraph, MeshCarveError> {
    let p = comm.size();
    let flat: Vec<u64> = row
        .peers
        .iter()
        .flat_map(|&(peer, w)| [peer as u64, w.to_bits()])
        .collect();
    let rows = all_gather_varlen(comm, &flat)?;
    let mut dense = vec![0.0f64; p * p];
    for (rank, flat_row) in rows.iter().enumerate() {
        for pair in flat_row.chunks_exact(2) {
            let peer = pair[0] as usize;
            let w = f64::from_bits(pair[1]);
            if peer != rank {
                dense[rank * p + peer] += w;
            }
        }
    }
    // keep the matrix symmetric even when one side saw no cut edge yet
    for a in 0..p {
        for b in (a + 1)..p {
            let w = dense[a * p + b].max(dense[b * p + a]);
            dense[a * p + b] = w;
            dense[b * p + a] = w;
        }
    }
    Ok(BlockGraph::from_dense(p, &dense))
}
