//! Distributed Fiduccia–Mattheyses refinement.
//!
//! One sweep walks the colour rounds of the communication schedule. In a
//! round, process p is paired with at most one partner q; the pair exchanges
//! a bounded BFS frontier around their common border, and both sides build
//! the identical replicated two-block subproblem: union of the two regions,
//! internal edges, and per-vertex fixed weights towards the two blocks from
//! edges leaving the region. Both twins then run the same deterministic FM
//! pass (gain priority with geometric tie-breaking, balance envelope on the
//! destination block, best-prefix rollback) and therefore arrive at the same
//! move sequence; each side commits the moves of the vertices it owns.
//!
//! Blocks are ranks here: the partition is carried as a target-rank value
//! per vertex, and the sweep ends by migrating every vertex to its block.

use std::collections::BinaryHeap;
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;

use crate::algs::collective::{all_reduce, exchange_by_plan, ReduceOp};
use crate::algs::coloring::CommSchedule;
use crate::algs::communicator::{Communicator, Wait};
use crate::carve_error::MeshCarveError;
use crate::dist::{DistVector, Distribution, Redistributor};
use crate::halo::Halo;
use crate::partitioning::multilevel::LevelState;
use crate::settings::Settings;

const TAG_FM_COUNTS: u16 = 30;
const TAG_FM_HEADERS: u16 = 31;
const TAG_FM_EDGES: u16 = 32;

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct VertexHeader {
    gid: u64,
    degree: u64,
    weight: f64,
    distance: f64,
}

#[repr(C)]
#[derive(Copy, Clone, Pod, Zeroable)]
struct EdgeRec {
    nbr: u64,
    part: u64,
    weight: f64,
}

/// One FM sweep over the whole schedule (collective). Returns the moved
/// state and the globally summed gain per colour round.
pub fn distributed_fm_step<C: Communicator>(
    comm: &C,
    state: LevelState,
    schedule: &CommSchedule,
    settings: &Settings,
) -> Result<(LevelState, Vec<i64>), MeshCarveError> {
    let me = comm.rank();
    let p = comm.size();
    let dist = Arc::clone(state.graph.dist());
    let local_n = state.graph.local_n();

    let halo = Halo::build(comm, &state.graph)?;
    let mut part_local: Vec<usize> = vec![me; local_n];
    let mut halo_part = halo.update(comm, &dist, &part_local)?;

    // distance from the block's geometric centre, for tie-breaking
    let distances: Vec<f64> = if settings.use_geometric_tie_breaking
        && !state.coords.is_empty()
        && local_n > 0
    {
        let dim = state.coords.len();
        let mut center = vec![0.0f64; dim];
        for (d, c) in state.coords.iter().enumerate() {
            center[d] = c.local().iter().sum::<f64>() / local_n as f64;
        }
        (0..local_n)
            .map(|i| {
                (0..dim)
                    .map(|d| {
                        let diff = state.coords[d].local()[i] - center[d];
                        diff * diff
                    })
                    .sum::<f64>()
                    .sqrt()
            })
            .collect()
    } else {
        vec![0.0; local_n]
    };

    let mut block_w = block_weights_by_part(comm, p, &part_local, state.weights.local())?;
    let total: f64 = block_w.iter().sum();
    let capacity = total / p as f64 * (1.0 + settings.epsilon);

    let mut gain_per_round = vec![0i64; schedule.len()];
    for (r, round) in schedule.iter().enumerate() {
        let partner = round[me];
        if partner != me {
            let gain = fm_pair_round(
                comm,
                &state,
                &halo,
                &mut part_local,
                &halo_part,
                &distances,
                &block_w,
                partner,
                capacity,
                settings,
            )?;
            if me < partner {
                gain_per_round[r] = gain;
            }
        }
        // resynchronise the shared view before the next colour
        halo_part = halo.update(comm, &dist, &part_local)?;
        block_w = block_weights_by_part(comm, p, &part_local, state.weights.local())?;
    }
    all_reduce(comm, ReduceOp::Sum, &mut gain_per_round)?;

    // migrate every vertex to its block's rank
    let mut gids_for: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
    for (lid, &target) in part_local.iter().enumerate() {
        gids_for[target].push(dist.local_to_global(lid) as u64);
    }
    let received = exchange_by_plan(comm, &gids_for)?;
    let mut owned: Vec<usize> = received.into_iter().flatten().map(|g| g as usize).collect();
    owned.sort_unstable();
    let new_dist = Distribution::general(comm, owned, dist.global_n())?;
    let plan = Redistributor::new(comm, &dist, Arc::clone(&new_dist))?;
    let graph = state.graph.redistribute(comm, Arc::clone(&new_dist))?;
    let weights = DistVector::new(
        Arc::clone(&new_dist),
        plan.apply(comm, state.weights.local())?,
    )?;
    let coords = state
        .coords
        .iter()
        .map(|c| DistVector::new(Arc::clone(&new_dist), plan.apply(comm, c.local())?))
        .collect::<Result<Vec<_>, _>>()?;
    let origin = DistVector::new(
        Arc::clone(&new_dist),
        plan.apply(comm, state.origin.local())?,
    )?;
    Ok((
        LevelState {
            graph,
            weights,
            coords,
            origin,
        },
        gain_per_round,
    ))
}

/// Global block weights keyed by the current part values (collective).
fn block_weights_by_part<C: Communicator>(
    comm: &C,
    p: usize,
    part_local: &[usize],
    weights: &[f64],
) -> Result<Vec<f64>, MeshCarveError> {
    let mut block_w = vec![0.0f64; p];
    for (i, &b) in part_local.iter().enumerate() {
        block_w[b] += weights[i];
    }
    all_reduce(comm, ReduceOp::Sum, &mut block_w)?;
    Ok(block_w)
}

/// One paired refinement between this rank and `partner`. Returns the kept
/// cut gain (identical on both twins).
#[allow(clippy::too_many_arguments)]
fn fm_pair_round<C: Communicator>(
    comm: &C,
    state: &LevelState,
    halo: &Halo,
    part_local: &mut [usize],
    halo_part: &[usize],
    distances: &[f64],
    block_w: &[f64],
    partner: usize,
    capacity: f64,
    settings: &Settings,
) -> Result<i64, MeshCarveError> {
    let me = comm.rank();
    let graph = &state.graph;
    let dist = graph.dist();

    let part_of = |gid: usize| -> usize {
        match dist.global_to_local(gid) {
            Some(l) => part_local[l],
            None => halo_part[halo.global_to_halo(gid).expect("column in halo")],
        }
    };

    // bounded BFS outward from the common border, staying in my block
    let mut in_region = vec![false; graph.local_n()];
    let mut frontier: Vec<usize> = (0..graph.local_n())
        .filter(|&i| {
            part_local[i] == me
                && graph.row(i).0.iter().any(|&c| part_of(c) == partner)
        })
        .collect();
    let border_size = frontier.len();
    let mut region: Vec<usize> = Vec::new();
    for i in &frontier {
        in_region[*i] = true;
    }
    for _ in 0..settings.border_depth.max(1) {
        region.extend_from_slice(&frontier);
        let mut next = Vec::new();
        for &i in &frontier {
            for &c in graph.row(i).0 {
                if let Some(l) = dist.global_to_local(c) {
                    if !in_region[l] && part_local[l] == me {
                        in_region[l] = true;
                        next.push(l);
                    }
                }
            }
        }
        frontier = next;
    }

    // exchange region sizes, then the regions themselves
    let mut headers: Vec<VertexHeader> = Vec::with_capacity(region.len());
    let mut edges: Vec<EdgeRec> = Vec::new();
    for &i in &region {
        let (cols, weights) = graph.row(i);
        headers.push(VertexHeader {
            gid: dist.local_to_global(i) as u64,
            degree: cols.len() as u64,
            weight: state.weights.local()[i],
            distance: distances[i],
        });
        for (&c, &w) in cols.iter().zip(weights) {
            edges.push(EdgeRec {
                nbr: c as u64,
                part: part_of(c) as u64,
                weight: w,
            });
        }
    }
    let counts = [border_size as u64, headers.len() as u64, edges.len() as u64];
    comm.isend(partner, TAG_FM_COUNTS, bytemuck::cast_slice(&counts));
    let mut buf = vec![0u8; 24];
    let got = comm
        .irecv(partner, TAG_FM_COUNTS, &mut buf)
        .wait()
        .ok_or_else(|| MeshCarveError::Comm(format!("no FM counts from rank {partner}")))?;
    let their_counts: Vec<u64> = bytemuck::pod_collect_to_vec(&got);
    let their_border = their_counts[0] as usize;

    if border_size < settings.min_border_nodes || their_border < settings.min_border_nodes {
        return Ok(0);
    }

    comm.isend(partner, TAG_FM_HEADERS, bytemuck::cast_slice(&headers));
    comm.isend(partner, TAG_FM_EDGES, bytemuck::cast_slice(&edges));
    let their_headers: Vec<VertexHeader> = {
        let mut buf = vec![0u8; their_counts[1] as usize * std::mem::size_of::<VertexHeader>()];
        let got = comm
            .irecv(partner, TAG_FM_HEADERS, &mut buf)
            .wait()
            .ok_or_else(|| MeshCarveError::Comm(format!("no FM headers from rank {partner}")))?;
        bytemuck::pod_collect_to_vec(&got)
    };
    let their_edges: Vec<EdgeRec> = {
        let mut buf = vec![0u8; their_counts[2] as usize * std::mem::size_of::<EdgeRec>()];
        let got = comm
            .irecv(partner, TAG_FM_EDGES, &mut buf)
            .wait()
            .ok_or_else(|| MeshCarveError::Comm(format!("no FM edges from rank {partner}")))?;
        bytemuck::pod_collect_to_vec(&got)
    };

    // replicated two-block subproblem, identical on both twins
    let block0 = me.min(partner);
    let block1 = me.max(partner);
    let sub = build_subproblem(
        &[
            (&headers[..], &edges[..], me),
            (&their_headers[..], &their_edges[..], partner),
        ],
        block0,
        block1,
    );
    let moves = fm_pass(
        &sub,
        block_w[block0],
        block_w[block1],
        capacity,
        settings,
    );

    // commit kept moves on the owner side
    let mut gain = 0.0;
    for &(idx, move_gain) in &moves {
        gain += move_gain;
        let v = &sub.verts[idx];
        if let Some(l) = dist.global_to_local(v.gid) {
            let from = part_local[l];
            part_local[l] = if from == block0 { block1 } else { block0 };
        }
    }
    Ok(gain.round() as i64)
}

struct SubVertex {
    gid: usize,
    weight: f64,
    distance: f64,
    /// 0 = block0, 1 = block1 at entry.
    side: u8,
    adj: Vec<(usize, f64)>,
    /// Fixed edge weight towards block0/block1 from outside the region.
    ext: [f64; 2],
}

struct Subproblem {
    verts: Vec<SubVertex>,
}

fn build_subproblem(
    sources: &[(&[VertexHeader], &[EdgeRec], usize); 2],
    block0: usize,
    block1: usize,
) -> Subproblem {
    // order by global id so both twins see the same indexing
    let mut verts: Vec<SubVertex> = Vec::new();
    let mut raw: Vec<(usize, &[EdgeRec])> = Vec::new();
    for &(headers, edges, rank) in sources {
        let side = u8::from(rank == block1);
        let mut at = 0usize;
        for h in headers {
            let deg = h.degree as usize;
            verts.push(SubVertex {
                gid: h.gid as usize,
                weight: h.weight,
                distance: h.distance,
                side,
                adj: Vec::new(),
                ext: [0.0; 2],
            });
            raw.push((verts.len() - 1, &edges[at..at + deg]));
            at += deg;
        }
    }
    let mut order: Vec<usize> = (0..verts.len()).collect();
    order.sort_unstable_by_key(|&i| verts[i].gid);
    let mut rank_of = vec![0usize; verts.len()];
    for (new_idx, &old_idx) in order.iter().enumerate() {
        rank_of[old_idx] = new_idx;
    }
    let mut sorted: Vec<SubVertex> = Vec::with_capacity(verts.len());
    for &old_idx in &order {
        sorted.push(SubVertex {
            gid: verts[old_idx].gid,
            weight: verts[old_idx].weight,
            distance: verts[old_idx].distance,
            side: verts[old_idx].side,
            adj: Vec::new(),
            ext: [0.0; 2],
        });
    }
    let index: HashMap<usize, usize> = sorted
        .iter()
        .enumerate()
        .map(|(i, v)| (v.gid, i))
        .collect();
    for &(old_idx, edge_list) in &raw {
        let i = rank_of[old_idx];
        for e in edge_list {
            let nbr = e.nbr as usize;
            if let Some(&j) = index.get(&nbr) {
                sorted[i].adj.push((j, e.weight));
            } else {
                let part = e.part as usize;
                if part == block0 {
                    sorted[i].ext[0] += e.weight;
                } else if part == block1 {
                    sorted[i].ext[1] += e.weight;
                }
            }
        }
    }
    Subproblem { verts: sorted }
}

#[derive(PartialEq)]
struct HeapEntry {
    gain: f64,
    lighter_dest: bool,
    distance: f64,
    idx: usize,
}

impl Eq for HeapEntry {}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.gain
            .total_cmp(&other.gain)
            .then(self.lighter_dest.cmp(&other.lighter_dest))
            .then(self.distance.total_cmp(&other.distance))
            .then(other.idx.cmp(&self.idx))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Deterministic FM pass: every vertex moves at most once; the kept result
/// is the prefix of the move sequence with the best positive cumulative
/// gain. Returns the kept moves as (vertex index, gain of the move).
fn fm_pass(
    sub: &Subproblem,
    w0: f64,
    w1: f64,
    capacity: f64,
    settings: &Settings,
) -> Vec<(usize, f64)> {
    let n = sub.verts.len();
    let mut side: Vec<u8> = sub.verts.iter().map(|v| v.side).collect();
    let mut locked = vec![false; n];
    let mut weights = [w0, w1];

    let gain_of = |v: usize, side: &[u8]| -> f64 {
        let s = side[v] as usize;
        let o = 1 - s;
        let mut towards = [0.0f64; 2];
        for &(j, w) in &sub.verts[v].adj {
            towards[side[j] as usize] += w;
        }
        towards[0] += sub.verts[v].ext[0];
        towards[1] += sub.verts[v].ext[1];
        towards[o] - towards[s]
    };

    let mut heap = BinaryHeap::new();
    let push = |heap: &mut BinaryHeap<HeapEntry>, v: usize, side: &[u8], weights: &[f64; 2]| {
        let s = side[v] as usize;
        let o = 1 - s;
        let lighter = !settings.gain_over_balance && weights[o] < weights[s];
        heap.push(HeapEntry {
            gain: gain_of(v, side),
            lighter_dest: lighter,
            distance: if settings.use_geometric_tie_breaking {
                sub.verts[v].distance
            } else {
                0.0
            },
            idx: v,
        });
    };
    for v in 0..n {
        push(&mut heap, v, &side, &weights);
    }

    let mut sequence: Vec<(usize, f64)> = Vec::new();
    let mut cumulative = 0.0;
    let mut best_cum = 0.0;
    let mut best_len = 0usize;
    while let Some(entry) = heap.pop() {
        let v = entry.idx;
        if locked[v] {
            continue;
        }
        let current_gain = gain_of(v, &side);
        if current_gain != entry.gain {
            // stale entry: reinsert with the fresh gain
            push(&mut heap, v, &side, &weights);
            continue;
        }
        let s = side[v] as usize;
        let o = 1 - s;
        if weights[o] + sub.verts[v].weight > capacity {
            // destination full; a later neighbour move may re-queue it
            continue;
        }
        side[v] = o as u8;
        weights[o] += sub.verts[v].weight;
        weights[s] -= sub.verts[v].weight;
        locked[v] = true;
        cumulative += current_gain;
        sequence.push((v, current_gain));
        if cumulative > best_cum {
            best_cum = cumulative;
            best_len = sequence.len();
        }
        for &(j, _) in &sub.verts[v].adj {
            if !locked[j] {
                push(&mut heap, j, &side, &weights);
            }
        }
    }
    sequence.truncate(best_len);
    sequence
}
