//! Multilevel engine: matching-based coarsening, projections, recursion.
//!
//! Coarsening contracts pairs found by local heavy-edge matching; several
//! contraction rounds run on purely local index maps before the single
//! global renumbering, which assigns contracted ids through a prefix sum
//! over the preserved vertices. The recursion owns one frame per level
//! (graph, weights, coords, halo, fine-to-coarse map) and unwinds by
//! projecting the refined coarse partition back and redistributing the fine
//! data to the ranks that now own it.
//!
//! Throughout this module the partition is carried implicitly: block id ==
//! owner rank. Refinement moves vertices between ranks, so the partition of
//! a level is its distribution, and `origin` records where each vertex
//! started.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::algs::block_graph::{process_graph, replicate_process_graph};
use crate::algs::collective::{
    all_reduce_scalar, exchange_by_plan, global_prefix_sum_i64, ReduceOp,
};
use crate::algs::coloring::{communication_schedule, validate_schedule, CommSchedule};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector, Distribution, Redistributor};
use crate::halo::Halo;
use crate::metrics::Metrics;
use crate::partitioning::refinement::distributed_fm_step;
use crate::settings::Settings;

/// Everything that travels through one multilevel recursion frame.
pub struct LevelState {
    pub graph: DistGraph,
    pub weights: DistVector<f64>,
    pub coords: Vec<DistVector<f64>>,
    /// Original owner of the vertex now stored at each local position.
    pub origin: DistVector<usize>,
}

/// Local heavy-edge matching: for every unmatched local vertex pick the
/// unmatched *local* neighbour maximising `w(u,v)^2 / (weight(u) weight(v))`.
/// Returns local index pairs.
pub fn max_local_matching(
    graph_ia: &[usize],
    graph_ja: &[usize],
    graph_values: &[f64],
    dist: &Distribution,
    node_weights: &[f64],
) -> Vec<(usize, usize)> {
    let local_n = graph_ia.len() - 1;
    let mut matching = Vec::new();
    let mut matched = vec![false; local_n];
    for u in 0..local_n {
        if matched[u] {
            continue;
        }
        let mut best: Option<(usize, f64)> = None;
        for j in graph_ia[u]..graph_ia[u + 1] {
            if let Some(v) = dist.global_to_local(graph_ja[j]) {
                if v != u && !matched[v] {
                    let rating =
                        graph_values[j] * graph_values[j] / (node_weights[u] * node_weights[v]);
                    if best.map_or(true, |(_, r)| rating > r) {
                        best = Some((v, rating));
                    }
                }
            }
        }
        if let Some((v, _)) = best {
            matching.push((u, v));
            matched[u] = true;
            matched[v] = true;
        }
    }
    matching
}

/// Output of [`coarsen`].
pub struct Coarsened {
    pub graph: DistGraph,
    /// Coarse global id per fine local vertex.
    pub fine_to_coarse: DistVector<usize>,
    /// Coarse ids of the fine halo slots.
    pub halo_coarse_ids: Vec<usize>,
}

/// Contract the graph by `iterations` rounds of local matching, then
/// renumber globally and assemble the coarse CSR (collective).
pub fn coarsen<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    node_weights: &DistVector<f64>,
    halo: &Halo,
    iterations: usize,
) -> Result<Coarsened, MeshCarveError> {
    let dist = graph.dist();
    let local_n = graph.local_n();

    let mut ia = graph.ia().to_vec();
    let mut ja = graph.ja().to_vec();
    let mut values = graph.values().to_vec();
    let mut weight_copy = node_weights.local().to_vec();
    let mut preserved = vec![true; local_n];
    let mut local_fine_to_coarse: Vec<usize> = (0..local_n).collect();

    for _ in 0..iterations.max(1) {
        let matching = max_local_matching(&ia, &ja, &values, dist, &weight_copy);
        let mut partner = vec![usize::MAX; local_n];
        for &(a, b) in &matching {
            partner[a] = b;
            partner[b] = a;
            // the smaller local index survives as the head
            preserved[a.max(b)] = false;
        }

        // rewire edges onto the heads, keeping local index space
        let mut outgoing: Vec<BTreeMap<usize, f64>> = vec![BTreeMap::new(); local_n];
        let mut new_map = vec![0usize; local_n];
        for i in 0..local_n {
            let coarse_node = if preserved[i] {
                new_map[i] = i;
                i
            } else if partner[i] != usize::MAX && preserved[partner[i]] {
                // freshly eliminated this round
                let head = partner[i];
                weight_copy[head] += weight_copy[i];
                new_map[i] = head;
                head
            } else {
                // eliminated in an earlier round: follow the old chain
                new_map[i] = local_fine_to_coarse[i];
                continue;
            };
            for j in ia[i]..ia[i + 1] {
                let mut target = ja[j];
                if let Some(lt) = dist.global_to_local(target) {
                    if !preserved[lt] {
                        // each round's CSR only references current heads
                        debug_assert!(partner[lt] != usize::MAX);
                        target = dist.local_to_global(partner[lt]);
                    }
                }
                *outgoing[coarse_node].entry(target).or_insert(0.0) += values[j];
            }
        }
        // resolve chains of this round's mapping
        for i in 0..local_n {
            let mut c = new_map[i];
            while new_map[c] != c {
                c = new_map[c];
            }
            local_fine_to_coarse[i] = c;
        }

        let mut next_ia = Vec::with_capacity(local_n + 1);
        let mut next_ja = Vec::new();
        let mut next_values = Vec::new();
        next_ia.push(0);
        for (i, edges) in outgoing.iter().enumerate() {
            let own_gid = dist.local_to_global(i);
            for (&t, &w) in edges {
                if t != own_gid {
                    next_ja.push(t);
                    next_values.push(w);
                }
            }
            next_ia.push(next_ja.len());
        }
        ia = next_ia;
        ja = next_ja;
        values = next_values;
    }

    // global renumbering: contracted id = prefix count of preserved vertices
    let preserved_i64: Vec<i64> = preserved.iter().map(|&p| i64::from(p)).collect();
    let prefix = global_prefix_sum_i64(comm, &preserved_i64, -1)?;
    let new_local_n = preserved.iter().filter(|&&p| p).count();
    let new_global_n = all_reduce_scalar(comm, ReduceOp::Sum, new_local_n as u64)? as usize;

    let mut fine_to_coarse = vec![0usize; local_n];
    for i in 0..local_n {
        fine_to_coarse[i] = prefix[local_fine_to_coarse[i]] as usize;
    }

    // coarse ids of the fine halo entries
    let halo_coarse_ids = halo.update(comm, dist, &fine_to_coarse)?;

    // assemble the coarse CSR over the preserved rows
    let owned_coarse: Vec<usize> = (0..local_n)
        .filter(|&i| preserved[i])
        .map(|i| fine_to_coarse[i])
        .collect();
    debug_assert!(owned_coarse.windows(2).all(|w| w[0] < w[1]));
    let coarse_dist = Distribution::general(comm, owned_coarse, new_global_n)?;

    let mut cia = Vec::with_capacity(new_local_n + 1);
    let mut cja = Vec::new();
    let mut cvalues = Vec::new();
    cia.push(0);
    for i in 0..local_n {
        if !preserved[i] {
            continue;
        }
        let own_coarse = fine_to_coarse[i];
        let mut edges: BTreeMap<usize, f64> = BTreeMap::new();
        for j in ia[i]..ia[i + 1] {
            let coarse_target = match dist.global_to_local(ja[j]) {
                Some(lt) => fine_to_coarse[lt],
                None => {
                    let slot = halo.global_to_halo(ja[j]).ok_or_else(|| {
                        MeshCarveError::DistributionMismatch(format!(
                            "column {} neither local nor in halo",
                            ja[j]
                        ))
                    })?;
                    halo_coarse_ids[slot]
                }
            };
            if coarse_target != own_coarse {
                *edges.entry(coarse_target).or_insert(0.0) += values[j];
            }
        }
        for (t, w) in edges {
            cja.push(t);
            cvalues.push(w);
        }
        cia.push(cja.len());
    }
    let coarse_graph = DistGraph::new(coarse_dist, cia, cja, cvalues)?;
    let fine_to_coarse = DistVector::new(Arc::clone(dist), fine_to_coarse)?;
    Ok(Coarsened {
        graph: coarse_graph,
        fine_to_coarse,
        halo_coarse_ids,
    })
}

/// Average fine values over each coarse vertex (local: contraction pairs
/// never cross ranks).
pub fn project_to_coarse_mean(
    input: &DistVector<f64>,
    fine_to_coarse: &DistVector<usize>,
    coarse_dist: &Arc<Distribution>,
) -> Result<DistVector<f64>, MeshCarveError> {
    let mut sum = vec![0.0f64; coarse_dist.local_n()];
    let mut count = vec![0usize; coarse_dist.local_n()];
    for (i, &c) in fine_to_coarse.local().iter().enumerate() {
        let cl = coarse_dist.global_to_local(c).ok_or_else(|| {
            MeshCarveError::DistributionMismatch(format!(
                "coarse image {c} of a local fine vertex is not local"
            ))
        })?;
        sum[cl] += input.local()[i];
        count[cl] += 1;
    }
    let local: Vec<f64> = sum
        .iter()
        .zip(&count)
        .map(|(&s, &c)| if c > 0 { s / c as f64 } else { 0.0 })
        .collect();
    DistVector::new(Arc::clone(coarse_dist), local)
}

/// Sum fine weights into each coarse vertex (local).
pub fn sum_to_coarse(
    input: &DistVector<f64>,
    fine_to_coarse: &DistVector<usize>,
    coarse_dist: &Arc<Distribution>,
) -> Result<DistVector<f64>, MeshCarveError> {
    let mut sum = vec![0.0f64; coarse_dist.local_n()];
    for (i, &c) in fine_to_coarse.local().iter().enumerate() {
        let cl = coarse_dist.global_to_local(c).ok_or_else(|| {
            MeshCarveError::DistributionMismatch(format!(
                "coarse image {c} of a local fine vertex is not local"
            ))
        })?;
        sum[cl] += input.local()[i];
    }
    DistVector::new(Arc::clone(coarse_dist), sum)
}

/// Spread coarse values back over the fine vertices: fine vertex i takes
/// the value of its coarse image c(i), fetched from whichever rank owns it
/// under `values.dist()` (collective).
pub fn project_to_fine_values<C: Communicator>(
    comm: &C,
    values: &DistVector<f64>,
    fine_to_coarse: &DistVector<usize>,
) -> Result<DistVector<f64>, MeshCarveError> {
    let coarse_dist = values.dist();
    let p = comm.size();
    let local_n = fine_to_coarse.local().len();
    let mut requests: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
    for &c in fine_to_coarse.local() {
        requests[coarse_dist.owner_of(c)].push(c as u64);
    }
    let incoming = exchange_by_plan(comm, &requests)?;
    let replies: Vec<Vec<f64>> = incoming
        .iter()
        .map(|req| {
            req.iter()
                .map(|&c| {
                    let cl = coarse_dist
                        .global_to_local(c as usize)
                        .expect("request routed to owner");
                    values.local()[cl]
                })
                .collect()
        })
        .collect();
    let answers = exchange_by_plan(comm, &replies)?;
    let mut cursor = vec![0usize; p];
    let mut out = vec![0.0f64; local_n];
    for (i, &c) in fine_to_coarse.local().iter().enumerate() {
        let owner = coarse_dist.owner_of(c);
        out[i] = answers[owner][cursor[owner]];
        cursor[owner] += 1;
    }
    DistVector::new(Arc::clone(fine_to_coarse.dist()), out)
}

/// For every fine local vertex, the rank that owns its coarse image after
/// refinement moved the coarse vertices around (collective).
fn fine_targets<C: Communicator>(
    comm: &C,
    coarse_origin: &DistVector<usize>,
    old_coarse_dist: &Arc<Distribution>,
    fine_to_coarse: &DistVector<usize>,
) -> Result<Vec<usize>, MeshCarveError> {
    let p = comm.size();
    let me = comm.rank();
    // tell the original owner of every coarse vertex where it lives now
    let mut sends: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
    let now_dist = coarse_origin.dist();
    for (lid, &orig) in coarse_origin.local().iter().enumerate() {
        sends[orig].push(now_dist.local_to_global(lid) as u64);
    }
    let received = exchange_by_plan(comm, &sends)?;
    let mut now_owner = vec![usize::MAX; old_coarse_dist.local_n()];
    for (rank, gids) in received.iter().enumerate() {
        for &gid in gids {
            let old_local = old_coarse_dist
                .global_to_local(gid as usize)
                .ok_or_else(|| {
                    MeshCarveError::DistributionMismatch(format!(
                        "coarse vertex {gid} reported to rank {me}, which never owned it"
                    ))
                })?;
            now_owner[old_local] = rank;
        }
    }
    fine_to_coarse
        .local()
        .iter()
        .map(|&c| {
            let old_local = old_coarse_dist.global_to_local(c).ok_or_else(|| {
                MeshCarveError::DistributionMismatch(format!(
                    "coarse image {c} of a local fine vertex is not local"
                ))
            })?;
            let target = now_owner[old_local];
            debug_assert!(target != usize::MAX, "coarse vertex {c} unaccounted for");
            Ok(target)
        })
        .collect()
}

/// One multilevel step: coarsen, recurse, project back, refine locally
/// (collective). The partition is the distribution itself (block == rank);
/// the returned state is rebalanced and its `origin` maps every vertex back
/// to the rank that held it at entry.
pub fn multi_level_step<C: Communicator>(
    comm: &C,
    graph: DistGraph,
    weights: DistVector<f64>,
    coords: Vec<DistVector<f64>>,
    halo: Halo,
    settings: &Settings,
    metrics: &mut Metrics,
) -> Result<LevelState, MeshCarveError> {
    graph.check_same_layout(weights.dist(), "node weights")?;
    for (d, c) in coords.iter().enumerate() {
        graph.check_same_layout(c.dist(), &format!("coordinate dimension {d}"))?;
    }
    let me = comm.rank();
    let origin = DistVector::from_constant(Arc::clone(graph.dist()), me);

    let mut state = LevelState {
        graph,
        weights,
        coords,
        origin,
    };

    let can_coarsen = settings.multi_level_rounds > 0
        && state.graph.global_n() > 2 * comm.size().max(1);
    if can_coarsen {
        log::debug!(
            "coarsening at {} vertices, {} rounds to go",
            state.graph.global_n(),
            settings.multi_level_rounds
        );
        let coarse = coarsen(
            comm,
            &state.graph,
            &state.weights,
            &halo,
            settings.coarsening_steps_between_refinement,
        )?;
        let coarse_dist = Arc::clone(coarse.graph.dist());
        let old_coarse_dist = Arc::clone(&coarse_dist);
        let coarse_weights =
            sum_to_coarse(&state.weights, &coarse.fine_to_coarse, &coarse_dist)?;
        let coarse_coords = state
            .coords
            .iter()
            .map(|c| project_to_coarse_mean(c, &coarse.fine_to_coarse, &coarse_dist))
            .collect::<Result<Vec<_>, _>>()?;
        let coarse_halo = halo.coarsen(
            state.graph.dist(),
            &coarse_dist,
            coarse.fine_to_coarse.local(),
            &coarse.halo_coarse_ids,
        )?;

        let mut deeper = settings.clone();
        deeper.multi_level_rounds = settings
            .multi_level_rounds
            .saturating_sub(settings.coarsening_steps_between_refinement.max(1));
        let coarse_state = multi_level_step(
            comm,
            coarse.graph,
            coarse_weights,
            coarse_coords,
            coarse_halo,
            &deeper,
            metrics,
        )?;

        // pull the refined coarse placement back to the fine level
        let targets = fine_targets(
            comm,
            &coarse_state.origin,
            &old_coarse_dist,
            &coarse.fine_to_coarse,
        )?;
        let old_fine_dist = Arc::clone(state.graph.dist());
        let p = comm.size();
        let mut gids_for: Vec<Vec<u64>> = (0..p).map(|_| Vec::new()).collect();
        for (lid, &t) in targets.iter().enumerate() {
            gids_for[t].push(old_fine_dist.local_to_global(lid) as u64);
        }
        let received = exchange_by_plan(comm, &gids_for)?;
        let mut owned: Vec<usize> =
            received.into_iter().flatten().map(|g| g as usize).collect();
        owned.sort_unstable();
        let new_dist = Distribution::general(comm, owned, old_fine_dist.global_n())?;
        let plan = Redistributor::new(comm, &old_fine_dist, Arc::clone(&new_dist))?;
        state.graph = state.graph.redistribute(comm, Arc::clone(&new_dist))?;
        state.weights =
            DistVector::new(Arc::clone(&new_dist), plan.apply(comm, state.weights.local())?)?;
        state.coords = state
            .coords
            .iter()
            .map(|c| {
                DistVector::new(Arc::clone(&new_dist), plan.apply(comm, c.local())?)
            })
            .collect::<Result<Vec<_>, _>>()?;
        state.origin =
            DistVector::new(Arc::clone(&new_dist), plan.apply(comm, state.origin.local())?)?;
    }

    // local refinement on this level
    let mut schedule = refreshed_schedule(comm, &state.graph)?;
    let mut gains_this_level: Vec<i64> = Vec::new();
    let mut refinement_round = 0usize;
    let mut no_gain_rounds = 0usize;
    loop {
        let (new_state, gain_per_round) =
            distributed_fm_step(comm, state, &schedule, settings)?;
        state = new_state;
        let gain: i64 = gain_per_round.iter().sum();
        gains_this_level.push(gain);
        log::debug!("refinement round {refinement_round}: gain {gain}");

        if settings.skip_no_gain_colors {
            let keep: Vec<bool> = gain_per_round.iter().map(|&g| g != 0).collect();
            schedule = schedule
                .into_iter()
                .zip(&keep)
                .filter(|(_, &k)| k)
                .map(|(r, _)| r)
                .collect();
            // pruning may orphan pairs that still share cut edges; fall back
            // to a fresh colouring when coverage is lost
            let row = process_graph(comm, &state.graph)?;
            let pg = replicate_process_graph(comm, &row)?;
            if validate_schedule(&schedule, &pg).is_err() {
                schedule = communication_schedule(&pg);
            }
        }

        refinement_round += 1;
        no_gain_rounds = if gain == 0 { no_gain_rounds + 1 } else { 0 };
        if settings.stop_after_no_gain_rounds > 0
            && no_gain_rounds >= settings.stop_after_no_gain_rounds
        {
            break;
        }
        if gain < settings.min_gain_for_next_round || schedule.is_empty() {
            break;
        }
    }
    metrics.fm_gain_per_round.push(gains_this_level);
    Ok(state)
}

/// Colouring of the current process graph (collective).
fn refreshed_schedule<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
) -> Result<CommSchedule, MeshCarveError> {
    let row = process_graph(comm, graph)?;
    let pg = replicate_process_graph(comm, &row)?;
    let schedule = communication_schedule(&pg);
    crate::debug_invariants!(validate_schedule(&schedule, &pg), "communication schedule");
    Ok(schedule)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{run_spmd, NoComm};
    use crate::mesh_generation::structured_mesh_2d;

    #[test]
    fn matching_pairs_are_disjoint() {
        let comm = NoComm;
        let (g, _, w) = structured_mesh_2d(&comm, 4, 4).unwrap();
        let matching =
            max_local_matching(g.ia(), g.ja(), g.values(), g.dist(), w.local());
        let mut seen = std::collections::HashSet::new();
        for &(a, b) in &matching {
            assert!(a != b);
            assert!(seen.insert(a), "vertex {a} matched twice");
            assert!(seen.insert(b), "vertex {b} matched twice");
        }
        assert!(!matching.is_empty());
    }

    #[test]
    fn matching_prefers_heavy_edges() {
        // triangle path 0-1-2 with a heavy (1,2) edge
        let dist = Distribution::serial(3);
        let ia = vec![0, 1, 3, 4];
        let ja = vec![1, 0, 2, 1];
        let values = vec![1.0, 1.0, 5.0, 5.0];
        let g = DistGraph::new(dist, ia, ja, values).unwrap();
        let w = [1.0, 1.0, 1.0];
        let matching = max_local_matching(g.ia(), g.ja(), g.values(), g.dist(), &w);
        assert_eq!(matching, vec![(1, 2)]);
    }

    #[test]
    fn coarsen_halves_a_grid() {
        let comm = NoComm;
        let (g, _, w) = structured_mesh_2d(&comm, 8, 8).unwrap();
        let halo = Halo::build(&comm, &g).unwrap();
        let coarse = coarsen(&comm, &g, &w, &halo, 1).unwrap();
        let n = coarse.graph.global_n();
        assert!(n >= 32 && n < 64, "coarse size {n}");
        coarse.graph.validate_local().unwrap();
        // every fine vertex maps into the coarse id range
        for &c in coarse.fine_to_coarse.local() {
            assert!(c < n);
        }
    }

    #[test]
    fn coarsen_preserves_total_weight() {
        let results = run_spmd(2, |comm| {
            let (g, _, w) = structured_mesh_2d(&comm, 8, 8).unwrap();
            let halo = Halo::build(&comm, &g).unwrap();
            let coarse = coarsen(&comm, &g, &w, &halo, 2).unwrap();
            let cw = sum_to_coarse(
                &w,
                &coarse.fine_to_coarse,
                &Arc::clone(coarse.graph.dist()),
            )
            .unwrap();
            let local: f64 = cw.local().iter().sum();
            all_reduce_scalar(&comm, ReduceOp::Sum, local).unwrap()
        });
        for total in results {
            assert_eq!(total, 64.0);
        }
    }

    #[test]
    fn project_round_trip_recovers_coarse_vector() {
        let comm = NoComm;
        let (g, _, w) = structured_mesh_2d(&comm, 6, 6).unwrap();
        let halo = Halo::build(&comm, &g).unwrap();
        let coarse = coarsen(&comm, &g, &w, &halo, 1).unwrap();
        let coarse_dist = Arc::clone(coarse.graph.dist());
        // an arbitrary coarse vector
        let x = DistVector::new(
            Arc::clone(&coarse_dist),
            (0..coarse_dist.local_n()).map(|i| i as f64 * 1.5).collect(),
        )
        .unwrap();
        let fine = project_to_fine_values(&comm, &x, &coarse.fine_to_coarse).unwrap();
        let back = project_to_coarse_mean(&fine, &coarse.fine_to_coarse, &coarse_dist).unwrap();
        for (a, b) in back.local().iter().zip(x.local()) {
            assert!((a - b).abs() < 1e-12);
        }
    }

    #[test]
    fn multilevel_step_improves_or_keeps_the_cut() {
        use crate::algs::graph_utils::compute_cut;
        let results = run_spmd(4, |comm| {
            let (g, coords, w) = structured_mesh_2d(&comm, 12, 12).unwrap();
            let halo = Halo::build(&comm, &g).unwrap();
            let part_before =
                DistVector::from_constant(Arc::clone(g.dist()), comm.rank());
            let cut_before = compute_cut(&comm, &g, &part_before).unwrap();
            let settings = Settings {
                num_blocks: 4,
                dimensions: 2,
                multi_level_rounds: 2,
                coarsening_steps_between_refinement: 1,
                use_geometric_tie_breaking: true,
                ..Settings::default()
            };
            let mut metrics = Metrics::new();
            let state =
                multi_level_step(&comm, g, w, coords, halo, &settings, &mut metrics).unwrap();
            let part_after =
                DistVector::from_constant(Arc::clone(state.graph.dist()), comm.rank());
            let cut_after = compute_cut(&comm, &state.graph, &part_after).unwrap();
            (cut_before, cut_after)
        });
        for (before, after) in results {
            assert!(after <= before, "cut went up: {before} -> {after}");
        }
    }
}
