//! Distributed dense vectors and the redistribution plan they share.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use crate::algs::collective::exchange_by_plan;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::distribution::Distribution;

/// A dense vector distributed by rows; the local slice is aligned with the
/// owned global indices of its distribution, ascending.
#[derive(Clone, Debug)]
pub struct DistVector<T> {
    dist: Arc<Distribution>,
    local: Vec<T>,
}

impl<T: Pod> DistVector<T> {
    pub fn new(dist: Arc<Distribution>, local: Vec<T>) -> Result<Self, MeshCarveError> {
        if local.len() != dist.local_n() {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "local vector has {} entries, distribution owns {}",
                local.len(),
                dist.local_n()
            )));
        }
        Ok(Self { dist, local })
    }

    /// Constant-filled vector over `dist`.
    pub fn from_constant(dist: Arc<Distribution>, value: T) -> Self {
        let local = vec![value; dist.local_n()];
        Self { dist, local }
    }

    #[inline]
    pub fn dist(&self) -> &Arc<Distribution> {
        &self.dist
    }

    #[inline]
    pub fn local(&self) -> &[T] {
        &self.local
    }

    #[inline]
    pub fn local_mut(&mut self) -> &mut [T] {
        &mut self.local
    }

    pub fn into_local(self) -> Vec<T> {
        self.local
    }

    /// Move the vector onto `new_dist` (collective). Use a shared
    /// [`Redistributor`] instead when several co-distributed vectors must be
    /// reordered identically.
    pub fn redistribute<C: Communicator>(
        &mut self,
        comm: &C,
        new_dist: Arc<Distribution>,
    ) -> Result<(), MeshCarveError> {
        let plan = Redistributor::new(comm, &self.dist, Arc::clone(&new_dist))?;
        self.local = plan.apply(comm, &self.local)?;
        self.dist = new_dist;
        Ok(())
    }
}

/// Exchange plan between two distributions of the same global size.
///
/// Built once, applied to any number of co-distributed vectors; every
/// application performs the identical reorder, which is what keeps graph,
/// coordinates, weights and partition aligned through a redistribution.
pub struct Redistributor {
    new_dist: Arc<Distribution>,
    /// Per target rank: old local indices to send, in send order.
    send_order: Vec<Vec<usize>>,
    /// Per source rank: new local indices where received entries land.
    recv_place: Vec<Vec<usize>>,
}

impl Redistributor {
    /// Build the plan (collective).
    pub fn new<C: Communicator>(
        comm: &C,
        old: &Distribution,
        new_dist: Arc<Distribution>,
    ) -> Result<Self, MeshCarveError> {
        if old.global_n() != new_dist.global_n() {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "redistribution between different global sizes: {} vs {}",
                old.global_n(),
                new_dist.global_n()
            )));
        }
        let p = comm.size();
        let mut send_order: Vec<Vec<usize>> = (0..p).map(|_| Vec::new()).collect();
        let mut send_gids: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
        for lid in 0..old.local_n() {
            let gid = old.local_to_global(lid);
            let target = new_dist.owner_of(gid);
            send_order[target].push(lid);
            send_gids[target].push(gid as u64);
        }
        let recv_gids = exchange_by_plan(comm, &send_gids)?;
        let mut recv_place = Vec::with_capacity(p);
        for row in &recv_gids {
            let mut places = Vec::with_capacity(row.len());
            for &gid in row {
                let lid = new_dist.global_to_local(gid as usize).ok_or_else(|| {
                    MeshCarveError::DistributionMismatch(format!(
                        "received global index {gid} not owned under the target layout"
                    ))
                })?;
                places.push(lid);
            }
            recv_place.push(places);
        }
        Ok(Self {
            new_dist,
            send_order,
            recv_place,
        })
    }

    #[inline]
    pub fn new_dist(&self) -> &Arc<Distribution> {
        &self.new_dist
    }

    /// Apply the plan to one co-distributed local slice (collective).
    pub fn apply<C: Communicator, T: Pod>(
        &self,
        comm: &C,
        old_local: &[T],
    ) -> Result<Vec<T>, MeshCarveError> {
        let sends: Vec<Vec<T>> = self
            .send_order
            .iter()
            .map(|idx| idx.iter().map(|&l| old_local[l]).collect())
            .collect();
        let recvs = exchange_by_plan(comm, &sends)?;
        let mut out = vec![T::zeroed(); self.new_dist.local_n()];
        for (row, places) in recvs.iter().zip(&self.recv_place) {
            for (&v, &at) in row.iter().zip(places) {
                out[at] = v;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::run_spmd;

    #[test]
    fn redistribute_block_to_general() {
        let results = run_spmd(2, |comm| {
            let old = Distribution::block(&comm, 6);
            // values equal their global index
            let local: Vec<u64> = old.owned_ids().iter().map(|&g| g as u64).collect();
            let mut v = DistVector::new(Arc::clone(&old), local).unwrap();
            // swap ownership parity: rank 0 takes odds, rank 1 evens
            let owned: Vec<usize> = (0..6).filter(|g| g % 2 != comm.rank()).collect();
            let new_dist = Distribution::general(&comm, owned, 6).unwrap();
            v.redistribute(&comm, Arc::clone(&new_dist)).unwrap();
            (new_dist.owned_ids(), v.into_local())
        });
        for (owned, vals) in results {
            let expect: Vec<u64> = owned.iter().map(|&g| g as u64).collect();
            assert_eq!(vals, expect);
        }
    }

    #[test]
    fn shared_plan_reorders_identically() {
        let results = run_spmd(3, |comm| {
            let old = Distribution::block(&comm, 9);
            let a: Vec<u64> = old.owned_ids().iter().map(|&g| g as u64).collect();
            let b: Vec<f64> = old.owned_ids().iter().map(|&g| g as f64 * 0.5).collect();
            let new_dist = Distribution::block_from_local_size(
                &comm,
                [2usize, 3, 4][comm.rank()],
            )
            .unwrap();
            let plan = Redistributor::new(&comm, &old, Arc::clone(&new_dist)).unwrap();
            let a2 = plan.apply(&comm, &a).unwrap();
            let b2 = plan.apply(&comm, &b).unwrap();
            (new_dist.owned_ids(), a2, b2)
        });
        for (owned, a2, b2) in results {
            for ((g, x), y) in owned.iter().zip(a2).zip(b2) {
                assert_eq!(x, *g as u64);
                assert_eq!(y, *g as f64 * 0.5);
            }
        }
    }
}
