//! Row distributions: who owns which global index.

use std::sync::Arc;

use hashbrown::HashMap;

use crate::algs::collective::all_gather_varlen;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;

/// Ownership layout of a global index space over the ranks of a
/// communicator.
///
/// `Block` layouts are contiguous and rank-ordered; owner lookups are
/// arithmetic. `General` layouts own arbitrary sorted index sets and carry a
/// replicated owner directory built collectively at construction (the column
/// space is replicated anyway, so this stays within the per-process memory
/// model).
#[derive(Debug)]
pub struct Distribution {
    global_n: usize,
    rank: usize,
    size: usize,
    kind: Kind,
}

#[derive(Debug)]
enum Kind {
    Block {
        /// Per-rank range starts; `offsets[size] == global_n`.
        offsets: Vec<usize>,
    },
    General {
        /// Sorted owned global indices.
        owned: Vec<usize>,
        global_to_local: HashMap<usize, usize>,
        /// Replicated owner per global index.
        owners: Vec<u32>,
    },
}

impl Distribution {
    /// Contiguous block distribution with near-equal ranges.
    pub fn block<C: Communicator>(comm: &C, global_n: usize) -> Arc<Self> {
        let size = comm.size();
        let offsets = (0..=size).map(|r| r * global_n / size).collect();
        Arc::new(Self {
            global_n,
            rank: comm.rank(),
            size,
            kind: Kind::Block { offsets },
        })
    }

    /// Block distribution from a prescribed local size on every rank
    /// (collective).
    pub fn block_from_local_size<C: Communicator>(
        comm: &C,
        local_n: usize,
    ) -> Result<Arc<Self>, MeshCarveError> {
        let sizes = all_gather_varlen(comm, &[local_n as u64])?;
        let mut offsets = Vec::with_capacity(comm.size() + 1);
        let mut at = 0usize;
        offsets.push(0);
        for row in &sizes {
            at += row[0] as usize;
            offsets.push(at);
        }
        Ok(Arc::new(Self {
            global_n: at,
            rank: comm.rank(),
            size: comm.size(),
            kind: Kind::Block { offsets },
        }))
    }

    /// General distribution from the sorted set of locally owned global
    /// indices (collective; the owned sets must partition `0..global_n`).
    pub fn general<C: Communicator>(
        comm: &C,
        owned: Vec<usize>,
        global_n: usize,
    ) -> Result<Arc<Self>, MeshCarveError> {
        debug_assert!(owned.windows(2).all(|w| w[0] < w[1]), "owned ids not sorted-unique");
        let owned_u64: Vec<u64> = owned.iter().map(|&g| g as u64).collect();
        let per_rank = all_gather_varlen(comm, &owned_u64)?;
        let mut owners = vec![u32::MAX; global_n];
        for (rank, ids) in per_rank.iter().enumerate() {
            for &gid in ids {
                let gid = gid as usize;
                if gid >= global_n {
                    return Err(MeshCarveError::DistributionMismatch(format!(
                        "owned index {gid} out of range for global size {global_n}"
                    )));
                }
                if owners[gid] != u32::MAX {
                    return Err(MeshCarveError::DistributionMismatch(format!(
                        "global index {gid} owned by ranks {} and {rank}",
                        owners[gid]
                    )));
                }
                owners[gid] = rank as u32;
            }
        }
        if let Some(gid) = owners.iter().position(|&o| o == u32::MAX) {
            return Err(MeshCarveError::DistributionMismatch(format!(
                "global index {gid} has no owner"
            )));
        }
        let global_to_local = owned
            .iter()
            .enumerate()
            .map(|(l, &g)| (g, l))
            .collect();
        Ok(Arc::new(Self {
            global_n,
            rank: comm.rank(),
            size: comm.size(),
            kind: Kind::General {
                owned,
                global_to_local,
                owners,
            },
        }))
    }

    /// A single-rank distribution owning everything (replicated layouts).
    pub fn serial(global_n: usize) -> Arc<Self> {
        Arc::new(Self {
            global_n,
            rank: 0,
            size: 1,
            kind: Kind::Block {
                offsets: vec![0, global_n],
            },
        })
    }

    #[inline]
    pub fn global_n(&self) -> usize {
        self.global_n
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of locally owned indices.
    pub fn local_n(&self) -> usize {
        match &self.kind {
            Kind::Block { offsets } => offsets[self.rank + 1] - offsets[self.rank],
            Kind::General { owned, .. } => owned.len(),
        }
    }

    /// Owner rank of a global index.
    pub fn owner_of(&self, gid: usize) -> usize {
        debug_assert!(gid < self.global_n);
        match &self.kind {
            Kind::Block { offsets } => {
                // partition_point returns the first offset > gid
                offsets.partition_point(|&o| o <= gid) - 1
            }
            Kind::General { owners, .. } => owners[gid] as usize,
        }
    }

    /// Local index of a global index, if owned here.
    pub fn global_to_local(&self, gid: usize) -> Option<usize> {
        match &self.kind {
            Kind::Block { offsets } => {
                let lo = offsets[self.rank];
                let hi = offsets[self.rank + 1];
                (gid >= lo && gid < hi).then(|| gid - lo)
            }
            Kind::General {
                global_to_local, ..
            } => global_to_local.get(&gid).copied(),
        }
    }

    /// Global index of a local index.
    pub fn local_to_global(&self, lid: usize) -> usize {
        debug_assert!(lid < self.local_n());
        match &self.kind {
            Kind::Block { offsets } => offsets[self.rank] + lid,
            Kind::General { owned, .. } => owned[lid],
        }
    }

    #[inline]
    pub fn is_local(&self, gid: usize) -> bool {
        self.global_to_local(gid).is_some()
    }

    /// Locally owned global indices, ascending.
    pub fn owned_ids(&self) -> Vec<usize> {
        match &self.kind {
            Kind::Block { offsets } => (offsets[self.rank]..offsets[self.rank + 1]).collect(),
            Kind::General { owned, .. } => owned.clone(),
        }
    }

    /// True if ranks own contiguous, rank-ordered ranges (required by the
    /// global prefix sum).
    pub fn is_block_like(&self) -> bool {
        match &self.kind {
            Kind::Block { .. } => true,
            Kind::General { owners, .. } => owners.windows(2).all(|w| w[0] <= w[1]),
        }
    }

    /// True if both layouts assign the same local range on this rank. Under
    /// SPMD a local comparison decides the global question.
    pub fn same_layout(&self, other: &Distribution) -> bool {
        if self.global_n != other.global_n || self.size != other.size {
            return false;
        }
        if self.local_n() != other.local_n() {
            return false;
        }
        (0..self.local_n()).all(|l| self.local_to_global(l) == other.local_to_global(l))
    }
}
