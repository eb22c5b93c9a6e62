//! Communication schedule invariants over generated block graphs.

use mesh_carve::algs::block_graph::BlockGraph;
use mesh_carve::algs::coloring::{communication_schedule, validate_schedule};
use proptest::prelude::*;

/// Symmetric weight matrix from an edge probability mask.
fn block_graph_from_mask(k: usize, mask: &[bool]) -> BlockGraph {
    let mut dense = vec![0.0f64; k * k];
    let mut at = 0;
    for a in 0..k {
        for b in (a + 1)..k {
            if mask[at % mask.len()] {
                let w = (at % 7 + 1) as f64;
                dense[a * k + b] = w;
                dense[b * k + a] = w;
            }
            at += 1;
        }
    }
    BlockGraph::from_dense_weights(k, &dense)
}

proptest! {
    #[test]
    fn schedules_satisfy_all_three_invariants(
        k in 2usize..12,
        mask in proptest::collection::vec(any::<bool>(), 16..64),
    ) {
        let graph = block_graph_from_mask(k, &mask);
        let schedule = communication_schedule(&graph);
        // involution, uniqueness and coverage in one validation
        prop_assert!(validate_schedule(&schedule, &graph).is_ok());
        // every round entry is a valid process id
        for round in &schedule {
            prop_assert_eq!(round.len(), k);
            for (&i, j) in round.iter().enumerate().map(|(i, p)| (p, i)) {
                prop_assert!(i < k);
                prop_assert_eq!(round[i], j);
            }
        }
    }

    #[test]
    fn round_count_stays_near_the_degree_bound(
        k in 2usize..10,
        mask in proptest::collection::vec(any::<bool>(), 16..64),
    ) {
        let graph = block_graph_from_mask(k, &mask);
        let schedule = communication_schedule(&graph);
        let max_degree = graph.max_degree();
        // greedy edge colouring needs at most 2*Delta - 1 colours
        prop_assert!(
            schedule.len() <= (2 * max_degree).saturating_sub(1).max(max_degree),
            "{} rounds for max degree {max_degree}",
            schedule.len()
        );
    }
}

#[test]
fn complete_process_graph_gets_a_round_robin() {
    // complete graph on 4 vertices: 3 perfect-matching rounds
    let mut dense = vec![1.0f64; 16];
    for i in 0..4 {
        dense[i * 4 + i] = 0.0;
    }
    let graph = BlockGraph::from_dense_weights(4, &dense);
    let schedule = communication_schedule(&graph);
    validate_schedule(&schedule, &graph).unwrap();
    assert_eq!(schedule.len(), 3);
    for round in &schedule {
        // no idle process in a perfect matching
        assert!(round.iter().enumerate().all(|(i, &p)| p != i));
    }
}
