//! Halo descriptors: the non-local neighbours a rank must import.
//!
//! A halo stores, per neighbouring rank, the sorted global indices this rank
//! requires (imports) and provides (exports), plus a `global -> halo slot`
//! map. Halo slots are assigned by ascending neighbour rank, then ascending
//! global id, and stay stable for the lifetime of the halo, so imported
//! values can be cached and re-fetched into the same layout.
//!
//! Two construction routes: [`Halo::build`] scans the local adjacency from
//! scratch; [`Halo::coarsen`] composes an existing halo with a fine→coarse
//! id map without further communication.

use bytemuck::{Pod, Zeroable};
use hashbrown::{HashMap, HashSet};

use crate::algs::collective::exchange_by_plan;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, Distribution};

/// Import/export lists against the neighbouring ranks.
#[derive(Clone, Debug, Default)]
pub struct Halo {
    /// Neighbour ranks, ascending.
    neighbors: Vec<usize>,
    /// Per neighbour: global ids imported from it, sorted.
    required: Vec<Vec<usize>>,
    /// Per neighbour: locally owned global ids exported to it, sorted.
    provided: Vec<Vec<usize>>,
    /// Global id -> halo slot, covering every required id.
    global2halo: HashMap<usize, usize>,
}

impl Halo {
    /// Scan the local rows of `graph` and build the halo of all non-local
    /// column indices (collective).
    pub fn build<C: Communicator>(
        comm: &C,
        graph: &DistGraph,
    ) -> Result<Halo, MeshCarveError> {
        let dist = graph.dist();
        let p = comm.size();
        let mut required_sets: Vec<HashSet<usize>> = (0..p).map(|_| HashSet::new()).collect();
        for &c in graph.ja() {
            if !dist.is_local(c) {
                required_sets[dist.owner_of(c)].insert(c);
            }
        }
        let mut required_by_rank: Vec<Vec<u64>> = required_sets
            .into_iter()
            .map(|s| {
                let mut v: Vec<u64> = s.into_iter().map(|g| g as u64).collect();
                v.sort_unstable();
                v
            })
            .collect();
        debug_assert!(required_by_rank[comm.rank()].is_empty());
        let provided_by_rank = exchange_by_plan(comm, &required_by_rank)?;
        let mut halo = Halo::default();
        for rank in 0..p {
            let req = std::mem::take(&mut required_by_rank[rank]);
            let prov = &provided_by_rank[rank];
            if req.is_empty() && prov.is_empty() {
                continue;
            }
            halo.neighbors.push(rank);
            halo.required
                .push(req.into_iter().map(|g| g as usize).collect());
            halo.provided
                .push(prov.iter().map(|&g| g as usize).collect());
        }
        halo.index_required();
        Ok(halo)
    }

    fn index_required(&mut self) {
        self.global2halo.clear();
        let mut slot = 0usize;
        for req in &self.required {
            for &gid in req {
                self.global2halo.insert(gid, slot);
                slot += 1;
            }
        }
    }

    /// Number of imported entries.
    pub fn halo_size(&self) -> usize {
        self.global2halo.len()
    }

    /// Halo slot of a global id, or `None` when the id is not imported.
    #[inline]
    pub fn global_to_halo(&self, gid: usize) -> Option<usize> {
        self.global2halo.get(&gid).copied()
    }

    pub fn neighbors(&self) -> &[usize] {
        &self.neighbors
    }

    /// Imported global ids in halo-slot order.
    pub fn required_flat(&self) -> Vec<usize> {
        self.required.iter().flatten().copied().collect()
    }

    /// Pull the values of every imported id from their owners (collective).
    /// The result is indexed by halo slot.
    pub fn update<C: Communicator, T: Pod>(
        &self,
        comm: &C,
        dist: &Distribution,
        local_values: &[T],
    ) -> Result<Vec<T>, MeshCarveError> {
        let p = comm.size();
        let mut sends: Vec<Vec<T>> = (0..p).map(|_| Vec::new()).collect();
        for (i, &rank) in self.neighbors.iter().enumerate() {
            for &gid in &self.provided[i] {
                let lid = dist.global_to_local(gid).ok_or_else(|| {
                    MeshCarveError::DistributionMismatch(format!(
                        "halo exports {gid}, which is not owned here"
                    ))
                })?;
                sends[rank].push(local_values[lid]);
            }
        }
        let recvs = exchange_by_plan(comm, &sends)?;
        let mut out = vec![T::zeroed(); self.halo_size()];
        let mut slot = 0usize;
        for (i, &rank) in self.neighbors.iter().enumerate() {
            let row = &recvs[rank];
            if row.len() != self.required[i].len() {
                return Err(MeshCarveError::Comm(format!(
                    "halo update from rank {rank}: expected {} values, got {}",
                    self.required[i].len(),
                    row.len()
                )));
            }
            for &v in row {
                out[slot] = v;
                slot += 1;
            }
        }
        Ok(out)
    }

    /// Compose this (fine) halo with a fine→coarse id map, producing the
    /// halo of the contracted graph. Purely local: both sides derive the
    /// same coarse lists from data they already hold.
    ///
    /// `fine_to_coarse` is the coarse id of every local fine vertex (aligned
    /// with `fine_dist`); `halo_coarse_ids` is the coarse id of every fine
    /// halo slot, as returned by [`Halo::update`] on `fine_to_coarse`.
    pub fn coarsen(
        &self,
        fine_dist: &Distribution,
        coarse_dist: &Distribution,
        fine_to_coarse: &[usize],
        halo_coarse_ids: &[usize],
    ) -> Result<Halo, MeshCarveError> {
        if fine_to_coarse.len() != fine_dist.local_n() {
            return Err(MeshCarveError::DistributionMismatch(
                "fine-to-coarse map is not aligned with the fine rows".into(),
            ));
        }
        if halo_coarse_ids.len() != self.halo_size() {
            return Err(MeshCarveError::DistributionMismatch(
                "halo coarse ids do not cover the fine halo".into(),
            ));
        }
        let mut coarse = Halo::default();
        for (i, &rank) in self.neighbors.iter().enumerate() {
            let mut req: Vec<usize> = self.required[i]
                .iter()
                .map(|&gid| halo_coarse_ids[self.global2halo[&gid]])
                .filter(|&cid| !coarse_dist.is_local(cid))
                .collect();
            req.sort_unstable();
            req.dedup();
            let mut prov: Vec<usize> = self.provided[i]
                .iter()
                .map(|&gid| {
                    let lid = fine_dist
                        .global_to_local(gid)
                        .expect("provided id owned by construction");
                    fine_to_coarse[lid]
                })
                .collect();
            prov.sort_unstable();
            prov.dedup();
            if req.is_empty() && prov.is_empty() {
                continue;
            }
            coarse.neighbors.push(rank);
            coarse.required.push(req);
            coarse.provided.push(prov);
        }
        coarse.index_required();
        Ok(coarse)
    }
}

/// Global ids of local vertices that have at least one non-local neighbour
/// (the border set of this rank).
pub fn nodes_with_nonlocal_neighbors(graph: &DistGraph) -> Vec<usize> {
    let dist = graph.dist();
    let mut out = Vec::new();
    for lid in 0..graph.local_n() {
        let (cols, _) = graph.row(lid);
        if cols.iter().any(|&c| !dist.is_local(c)) {
            out.push(dist.local_to_global(lid));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::run_spmd;

    /// Path graph 0-1-2-3 over two ranks.
    fn path4<C: Communicator>(comm: &C) -> DistGraph {
        let dist = Distribution::block(comm, 4);
        let ia = vec![0, 1, 3, 5, 6];
        let ja = vec![1, 0, 2, 1, 3, 2];
        let values = vec![1.0; 6];
        DistGraph::from_replicated(dist, &ia, &ja, &values).unwrap()
    }

    #[test]
    fn builds_required_and_provided_lists() {
        let results = run_spmd(2, |comm| {
            let g = path4(&comm);
            let halo = Halo::build(&comm, &g).unwrap();
            (
                halo.neighbors().to_vec(),
                halo.required_flat(),
                halo.halo_size(),
            )
        });
        // rank 0 owns {0,1}, needs 2; rank 1 owns {2,3}, needs 1
        assert_eq!(results[0], (vec![1], vec![2], 1));
        assert_eq!(results[1], (vec![0], vec![1], 1));
    }

    #[test]
    fn update_pulls_owner_values() {
        let results = run_spmd(2, |comm| {
            let g = path4(&comm);
            let halo = Halo::build(&comm, &g).unwrap();
            let local: Vec<u64> = g.dist().owned_ids().iter().map(|&g| (g * 10) as u64).collect();
            halo.update(&comm, g.dist(), &local).unwrap()
        });
        assert_eq!(results[0], vec![20]); // value of vertex 2
        assert_eq!(results[1], vec![10]); // value of vertex 1
    }

    #[test]
    fn border_set_is_the_cut_frontier() {
        let results = run_spmd(2, |comm| {
            let g = path4(&comm);
            nodes_with_nonlocal_neighbors(&g)
        });
        assert_eq!(results[0], vec![1]);
        assert_eq!(results[1], vec![2]);
    }

    #[test]
    fn coarsen_composes_with_id_map() {
        let results = run_spmd(2, |comm| {
            let g = path4(&comm);
            let halo = Halo::build(&comm, &g).unwrap();
            // contract pairs (0,1) -> 0 and (2,3) -> 1
            let fine_to_coarse: Vec<usize> = if comm.rank() == 0 {
                vec![0, 0]
            } else {
                vec![1, 1]
            };
            let owned_coarse = vec![comm.rank()];
            let coarse_dist = Distribution::general(&comm, owned_coarse, 2).unwrap();
            let halo_cids = halo.update(&comm, g.dist(), &fine_to_coarse).unwrap();
            let coarse = halo
                .coarsen(g.dist(), &coarse_dist, &fine_to_coarse, &halo_cids)
                .unwrap();
            (coarse.required_flat(), coarse.halo_size())
        });
        assert_eq!(results[0], (vec![1], 1));
        assert_eq!(results[1], (vec![0], 1));
    }
}
