//! Collective operations layered over [`Communicator`] point-to-point.
//!
//! Every operation here is a synchronisation point: all ranks must reach the
//! same call in the same program order. Rank 0 acts as the root. Tags are
//! fixed per operation so that back-to-back collectives of different kinds
//! cannot interleave; within one kind, per-pair FIFO delivery keeps
//! consecutive calls ordered.

use bytemuck::Pod;

use crate::algs::communicator::{Communicator, Wait};
use crate::carve_error::MeshCarveError;

const ROOT: usize = 0;

const TAG_REDUCE_UP: u16 = 10;
const TAG_REDUCE_DOWN: u16 = 11;
const TAG_BCAST_LEN: u16 = 12;
const TAG_BCAST_DATA: u16 = 13;
const TAG_GATHER_SIZE: u16 = 14;
const TAG_GATHER_DATA: u16 = 15;
const TAG_SCATTER_SIZE: u16 = 16;
const TAG_SCATTER_DATA: u16 = 17;
const TAG_XCHG_SIZE: u16 = 18;
const TAG_XCHG_DATA: u16 = 19;

/// Element-wise reduction operator.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Min,
    Max,
}

/// Element types usable in reductions.
pub trait ReduceElem: Pod + Copy + PartialOrd {
    fn combine(op: ReduceOp, a: Self, b: Self) -> Self;
}

macro_rules! impl_reduce_elem {
    ($($t:ty),*) => {$(
        impl ReduceElem for $t {
            #[inline]
            fn combine(op: ReduceOp, a: Self, b: Self) -> Self {
                match op {
                    ReduceOp::Sum => a + b,
                    ReduceOp::Min => if b < a { b } else { a },
                    ReduceOp::Max => if b > a { b } else { a },
                }
            }
        }
    )*};
}

impl_reduce_elem!(f64, i64, u64, usize);

#[inline]
fn bytes_of<T: Pod>(v: &[T]) -> &[u8] {
    bytemuck::cast_slice(v)
}

#[inline]
fn vec_from_bytes<T: Pod>(b: &[u8]) -> Vec<T> {
    bytemuck::pod_collect_to_vec(b)
}

fn recv_exact<C: Communicator>(
    comm: &C,
    peer: usize,
    tag: u16,
    byte_len: usize,
) -> Result<Vec<u8>, MeshCarveError> {
    let mut buf = vec![0u8; byte_len];
    let handle = comm.irecv(peer, tag, &mut buf);
    handle
        .wait()
        .ok_or_else(|| MeshCarveError::Comm(format!("no data from rank {peer} (tag {tag})")))
}

/// All-reduce `values` element-wise with `op`; every rank ends up with the
/// combined vector. Lengths must agree across ranks.
pub fn all_reduce<C: Communicator, T: ReduceElem>(
    comm: &C,
    op: ReduceOp,
    values: &mut [T],
) -> Result<(), MeshCarveError> {
    let p = comm.size();
    if p == 1 {
        return Ok(());
    }
    let byte_len = std::mem::size_of_val(values);
    if comm.rank() == ROOT {
        for peer in 1..p {
            let bytes = recv_exact(comm, peer, TAG_REDUCE_UP, byte_len)?;
            let incoming: Vec<T> = vec_from_bytes(&bytes);
            if incoming.len() != values.len() {
                return Err(MeshCarveError::Comm(format!(
                    "all_reduce length mismatch: {} vs {} from rank {peer}",
                    values.len(),
                    incoming.len()
                )));
            }
            for (v, x) in values.iter_mut().zip(incoming) {
                *v = T::combine(op, *v, x);
            }
        }
        for peer in 1..p {
            comm.isend(peer, TAG_REDUCE_DOWN, bytes_of(values));
        }
    } else {
        comm.isend(ROOT, TAG_REDUCE_UP, bytes_of(values));
        let bytes = recv_exact(comm, ROOT, TAG_REDUCE_DOWN, byte_len)?;
        let combined: Vec<T> = vec_from_bytes(&bytes);
        values.copy_from_slice(&combined);
    }
    Ok(())
}

/// Scalar all-reduce convenience wrapper.
pub fn all_reduce_scalar<C: Communicator, T: ReduceElem>(
    comm: &C,
    op: ReduceOp,
    value: T,
) -> Result<T, MeshCarveError> {
    let mut v = [value];
    all_reduce(comm, op, &mut v)?;
    Ok(v[0])
}

/// Broadcast a vector from `root`; non-root contents are replaced.
pub fn broadcast_vec<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    values: &mut Vec<T>,
) -> Result<(), MeshCarveError> {
    let p = comm.size();
    if p == 1 {
        return Ok(());
    }
    if comm.rank() == root {
        let len = values.len() as u64;
        for peer in (0..p).filter(|&r| r != root) {
            comm.isend(peer, TAG_BCAST_LEN, &len.to_le_bytes());
            comm.isend(peer, TAG_BCAST_DATA, bytes_of(values));
        }
    } else {
        let bytes = recv_exact(comm, root, TAG_BCAST_LEN, 8)?;
        let len = u64::from_le_bytes(bytes.try_into().expect("8-byte length")) as usize;
        let bytes = recv_exact(comm, root, TAG_BCAST_DATA, len * std::mem::size_of::<T>())?;
        *values = vec_from_bytes(&bytes);
    }
    Ok(())
}

/// Broadcast a single Pod scalar from `root`.
pub fn broadcast_scalar<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    value: &mut T,
) -> Result<(), MeshCarveError> {
    let mut v = vec![*value];
    broadcast_vec(comm, root, &mut v)?;
    *value = v[0];
    Ok(())
}

/// Gather variable-length vectors at `root`. Returns `Some(rows)` (indexed
/// by rank) at the root and `None` elsewhere.
pub fn gather_varlen<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    local: &[T],
) -> Result<Option<Vec<Vec<T>>>, MeshCarveError> {
    let p = comm.size();
    if comm.rank() == root {
        let mut rows: Vec<Vec<T>> = (0..p).map(|_| Vec::new()).collect();
        rows[root] = local.to_vec();
        for peer in (0..p).filter(|&r| r != root) {
            let bytes = recv_exact(comm, peer, TAG_GATHER_SIZE, 8)?;
            let len = u64::from_le_bytes(bytes.try_into().expect("8-byte length")) as usize;
            if len > 0 {
                let bytes =
                    recv_exact(comm, peer, TAG_GATHER_DATA, len * std::mem::size_of::<T>())?;
                rows[peer] = vec_from_bytes(&bytes);
            }
        }
        Ok(Some(rows))
    } else {
        comm.isend(root, TAG_GATHER_SIZE, &(local.len() as u64).to_le_bytes());
        if !local.is_empty() {
            comm.isend(root, TAG_GATHER_DATA, bytes_of(local));
        }
        Ok(None)
    }
}

/// Scatter per-rank rows from `root`; every rank receives its row.
pub fn scatter_varlen<C: Communicator, T: Pod>(
    comm: &C,
    root: usize,
    rows: Option<&[Vec<T>]>,
) -> Result<Vec<T>, MeshCarveError> {
    let p = comm.size();
    if comm.rank() == root {
        let rows = rows.ok_or_else(|| {
            MeshCarveError::Comm("scatter_varlen: root called without rows".into())
        })?;
        if rows.len() != p {
            return Err(MeshCarveError::Comm(format!(
                "scatter_varlen: expected {p} rows, got {}",
                rows.len()
            )));
        }
        for peer in (0..p).filter(|&r| r != root) {
            comm.isend(peer, TAG_SCATTER_SIZE, &(rows[peer].len() as u64).to_le_bytes());
            if !rows[peer].is_empty() {
                comm.isend(peer, TAG_SCATTER_DATA, bytes_of(&rows[peer]));
            }
        }
        Ok(rows[root].clone())
    } else {
        let bytes = recv_exact(comm, root, TAG_SCATTER_SIZE, 8)?;
        let len = u64::from_le_bytes(bytes.try_into().expect("8-byte length")) as usize;
        if len == 0 {
            return Ok(Vec::new());
        }
        let bytes = recv_exact(comm, root, TAG_SCATTER_DATA, len * std::mem::size_of::<T>())?;
        Ok(vec_from_bytes(&bytes))
    }
}

/// Gather variable-length vectors onto every rank (gather at root, then
/// broadcast lengths and the concatenation).
pub fn all_gather_varlen<C: Communicator, T: Pod>(
    comm: &C,
    local: &[T],
) -> Result<Vec<Vec<T>>, MeshCarveError> {
    let p = comm.size();
    if p == 1 {
        return Ok(vec![local.to_vec()]);
    }
    let gathered = gather_varlen(comm, ROOT, local)?;
    let (mut lens, mut flat): (Vec<u64>, Vec<T>) = if let Some(rows) = gathered {
        let lens = rows.iter().map(|r| r.len() as u64).collect();
        let flat = rows.into_iter().flatten().collect();
        (lens, flat)
    } else {
        (Vec::new(), Vec::new())
    };
    broadcast_vec(comm, ROOT, &mut lens)?;
    broadcast_vec(comm, ROOT, &mut flat)?;
    let mut rows = Vec::with_capacity(p);
    let mut at = 0usize;
    for &len in &lens {
        let len = len as usize;
        rows.push(flat[at..at + len].to_vec());
        at += len;
    }
    Ok(rows)
}

/// Personalised all-to-all: `sends[r]` goes to rank `r`; returns the vector
/// received from each rank. `sends.len()` must equal the communicator size.
pub fn exchange_by_plan<C: Communicator, T: Pod>(
    comm: &C,
    sends: &[Vec<T>],
) -> Result<Vec<Vec<T>>, MeshCarveError> {
    let p = comm.size();
    let me = comm.rank();
    if sends.len() != p {
        return Err(MeshCarveError::Comm(format!(
            "exchange_by_plan: {} send lists for {p} ranks",
            sends.len()
        )));
    }
    let mut recvs: Vec<Vec<T>> = (0..p).map(|_| Vec::new()).collect();
    recvs[me] = sends[me].clone();
    if p == 1 {
        return Ok(recvs);
    }
    // Phase 1: sizes.
    for peer in (0..p).filter(|&r| r != me) {
        comm.isend(peer, TAG_XCHG_SIZE, &(sends[peer].len() as u64).to_le_bytes());
    }
    let mut incoming = vec![0usize; p];
    for peer in (0..p).filter(|&r| r != me) {
        let bytes = recv_exact(comm, peer, TAG_XCHG_SIZE, 8)?;
        incoming[peer] = u64::from_le_bytes(bytes.try_into().expect("8-byte length")) as usize;
    }
    // Phase 2: payloads.
    for peer in (0..p).filter(|&r| r != me) {
        if !sends[peer].is_empty() {
            comm.isend(peer, TAG_XCHG_DATA, bytes_of(&sends[peer]));
        }
    }
    for peer in (0..p).filter(|&r| r != me) {
        if incoming[peer] > 0 {
            let bytes =
                recv_exact(comm, peer, TAG_XCHG_DATA, incoming[peer] * std::mem::size_of::<T>())?;
            recvs[peer] = vec_from_bytes(&bytes);
        }
    }
    Ok(recvs)
}

/// Inclusive global prefix sum over a block-like distributed vector, shifted
/// by `offset`: result\[i\] = offset + sum of all values at global indices
/// <= i. Ranks must hold contiguous, rank-ordered index ranges.
pub fn global_prefix_sum_i64<C: Communicator>(
    comm: &C,
    local: &[i64],
    offset: i64,
) -> Result<Vec<i64>, MeshCarveError> {
    let mut prefix = Vec::with_capacity(local.len());
    let mut running = 0i64;
    for &v in local {
        running += v;
        prefix.push(running);
    }
    let my_offset = exclusive_rank_offset(comm, running)?;
    for v in &mut prefix {
        *v += my_offset + offset;
    }
    Ok(prefix)
}

/// Inclusive global prefix sum for f64 values (same contract as the i64
/// variant, without the shift).
pub fn global_prefix_sum_f64<C: Communicator>(
    comm: &C,
    local: &[f64],
) -> Result<Vec<f64>, MeshCarveError> {
    let mut prefix = Vec::with_capacity(local.len());
    let mut running = 0f64;
    for &v in local {
        running += v;
        prefix.push(running);
    }
    let my_offset = exclusive_rank_offset(comm, running)?;
    for v in &mut prefix {
        *v += my_offset;
    }
    Ok(prefix)
}

/// Sum of `local_total` over all ranks with lower rank than this one:
/// gather the per-rank totals at the root, prefix them, scatter back.
fn exclusive_rank_offset<C, T>(comm: &C, local_total: T) -> Result<T, MeshCarveError>
where
    C: Communicator,
    T: ReduceElem + Default,
{
    let p = comm.size();
    if p == 1 {
        return Ok(T::default());
    }
    let gathered = gather_varlen(comm, ROOT, &[local_total])?;
    let rows: Option<Vec<Vec<T>>> = if let Some(totals) = gathered {
        let mut offsets = Vec::with_capacity(p);
        let mut running = T::default();
        for row in &totals {
            offsets.push(vec![running]);
            running = T::combine(ReduceOp::Sum, running, row[0]);
        }
        Some(offsets)
    } else {
        None
    };
    let mine = scatter_varlen(comm, ROOT, rows.as_deref())?;
    Ok(mine[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{run_spmd, NoComm};

    #[test]
    fn all_reduce_sum_over_four_ranks() {
        let results = run_spmd(4, |comm| {
            let mut v = vec![comm.rank() as u64, 1u64];
            all_reduce(&comm, ReduceOp::Sum, &mut v).unwrap();
            v
        });
        for v in results {
            assert_eq!(v, vec![0 + 1 + 2 + 3, 4]);
        }
    }

    #[test]
    fn all_reduce_min_max() {
        let results = run_spmd(3, |comm| {
            let lo = all_reduce_scalar(&comm, ReduceOp::Min, comm.rank() as i64 - 1).unwrap();
            let hi = all_reduce_scalar(&comm, ReduceOp::Max, comm.rank() as i64).unwrap();
            (lo, hi)
        });
        for (lo, hi) in results {
            assert_eq!((lo, hi), (-1, 2));
        }
    }

    #[test]
    fn broadcast_replaces_non_root() {
        let results = run_spmd(3, |comm| {
            let mut v = if comm.rank() == 0 {
                vec![3.5f64, 4.5]
            } else {
                Vec::new()
            };
            broadcast_vec(&comm, 0, &mut v).unwrap();
            v
        });
        for v in results {
            assert_eq!(v, vec![3.5, 4.5]);
        }
    }

    #[test]
    fn gather_scatter_round_trip() {
        let results = run_spmd(3, |comm| {
            let local = vec![comm.rank() as u64; comm.rank() + 1];
            let rows = gather_varlen(&comm, 0, &local).unwrap();
            if comm.rank() == 0 {
                let rows = rows.unwrap();
                assert_eq!(rows[2], vec![2, 2, 2]);
                scatter_varlen(&comm, 0, Some(&rows)).unwrap()
            } else {
                scatter_varlen::<_, u64>(&comm, 0, None).unwrap()
            }
        });
        assert_eq!(results[1], vec![1, 1]);
        assert_eq!(results[2], vec![2, 2, 2]);
    }

    #[test]
    fn exchange_by_plan_transposes() {
        let results = run_spmd(3, |comm| {
            // rank r sends [r*10 + peer] to each peer
            let sends: Vec<Vec<u64>> = (0..comm.size())
                .map(|peer| vec![(comm.rank() * 10 + peer) as u64])
                .collect();
            exchange_by_plan(&comm, &sends).unwrap()
        });
        // rank 1 receives [r*10 + 1] from each r
        assert_eq!(results[1], vec![vec![1], vec![11], vec![21]]);
    }

    #[test]
    fn prefix_sum_matches_serial() {
        let per_rank: Vec<Vec<i64>> = vec![vec![1, 2, 3], vec![4, 5], vec![6]];
        let flat: Vec<i64> = per_rank.iter().flatten().copied().collect();
        let expect: Vec<i64> = flat
            .iter()
            .scan(0, |acc, &v| {
                *acc += v;
                Some(*acc)
            })
            .collect();
        let per_rank_clone = per_rank.clone();
        let results = run_spmd(3, move |comm| {
            global_prefix_sum_i64(&comm, &per_rank_clone[comm.rank()], 0).unwrap()
        });
        let got: Vec<i64> = results.into_iter().flatten().collect();
        assert_eq!(got, expect);
    }

    #[test]
    fn collectives_degenerate_on_one_rank() {
        let comm = NoComm;
        let mut v = vec![5u64];
        all_reduce(&comm, ReduceOp::Sum, &mut v).unwrap();
        assert_eq!(v, vec![5]);
        let rows = all_gather_varlen(&comm, &[1.0f64, 2.0]).unwrap();
        assert_eq!(rows, vec![vec![1.0, 2.0]]);
        let pfx = global_prefix_sum_i64(&comm, &[1, 1, 0, 1], -1).unwrap();
        assert_eq!(pfx, vec![0, 1, 1, 2]);
    }
}
