//! Edge colouring of the process graph and the communication schedule
//! derived from it.
//!
//! A schedule is an ordered sequence of rounds; round `r` is a length-p
//! vector whose entry `i` names the partner of process `i` (or `i` itself
//! when idle). Invariants: partners pair up symmetrically within a round, no
//! pair repeats across rounds, and every edge of the process graph appears
//! in exactly one round.

use crate::algs::block_graph::BlockGraph;
use crate::carve_error::MeshCarveError;

/// One round per colour; `schedule[r][i]` is the partner of `i` in round `r`.
pub type CommSchedule = Vec<Vec<usize>>;

/// Greedy edge colouring of `graph`, heaviest edges first: every round is a
/// matching, every edge lands in exactly one round. Deterministic, local
/// (the graph is replicated). Self-loops are ignored.
pub fn communication_schedule(graph: &BlockGraph) -> CommSchedule {
    let p = graph.k();
    let mut edges = graph.edges();
    // heaviest first so busy pairs talk in early rounds; id order on ties
    edges.sort_unstable_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.0.cmp(&b.0))
            .then(a.1.cmp(&b.1))
    });
    let mut schedule: CommSchedule = Vec::new();
    for &(a, b, _) in &edges {
        // first round where both endpoints are idle
        let round = (0..schedule.len())
            .find(|&r| schedule[r][a] == a && schedule[r][b] == b)
            .unwrap_or_else(|| {
                schedule.push((0..p).collect());
                schedule.len() - 1
            });
        schedule[round][a] = b;
        schedule[round][b] = a;
    }
    schedule
}

/// Check the schedule invariants against `graph`: (a) involution within
/// each round, (b) no pair in two rounds, (c) every edge covered.
pub fn validate_schedule(
    schedule: &CommSchedule,
    graph: &BlockGraph,
) -> Result<(), MeshCarveError> {
    let p = graph.k();
    let mut seen = std::collections::HashSet::new();
    for (r, round) in schedule.iter().enumerate() {
        if round.len() != p {
            return Err(MeshCarveError::Input(format!(
                "round {r} has {} entries for {p} processes",
                round.len()
            )));
        }
        for (i, &j) in round.iter().enumerate() {
            if j >= p || round[j] != i {
                return Err(MeshCarveError::Input(format!(
                    "round {r}: partner({i}) = {j} but partner({j}) != {i}"
                )));
            }
            if i < j && !seen.insert((i, j)) {
                return Err(MeshCarveError::Input(format!(
                    "pair ({i},{j}) appears in two rounds"
                )));
            }
        }
    }
    for (a, b, _) in graph.edges() {
        if !seen.contains(&(a, b)) {
            return Err(MeshCarveError::Input(format!(
                "edge ({a},{b}) missing from the schedule"
            )));
        }
    }
    Ok(())
}

/// Drop the rounds listed in `skip` (by round index), keeping order. Used
/// when no-gain colours are pruned; callers re-validate coverage against the
/// current process graph before relying on completeness.
pub fn prune_rounds(schedule: &CommSchedule, skip: &[bool]) -> CommSchedule {
    schedule
        .iter()
        .zip(skip)
        .filter(|(_, &s)| !s)
        .map(|(round, _)| round.clone())
        .collect()
}
