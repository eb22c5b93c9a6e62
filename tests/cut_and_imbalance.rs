//! Cut and imbalance measures on literal inputs.

use std::sync::Arc;

use mesh_carve::algs::communicator::{run_spmd, NoComm};
use mesh_carve::algs::graph_utils::{compute_cut, compute_imbalance};
use mesh_carve::dist::{DistGraph, DistVector, Distribution};

fn complete_graph(n: usize) -> (Vec<usize>, Vec<usize>, Vec<f64>) {
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
fn complete_graph_cut_under_modular_assignment() {
    // K100 over 10 ranks, blocks i mod 10: every vertex has 90 cross-block
    // neighbours, so the cut is 100 * 90 / 2 = 4500
    let results = run_spmd(10, |comm| {
        let dist = Distribution::block(&comm, 100);
        let (ia, ja, values) = complete_graph(100);
        let graph = DistGraph::from_replicated(dist, &ia, &ja, &values).unwrap();
        let part_local: Vec<usize> = graph.dist().owned_ids().iter().map(|&g| g % 10).collect();
        let part = DistVector::new(Arc::clone(graph.dist()), part_local).unwrap();
        compute_cut(&comm, &graph, &part).unwrap()
    });
    for cut in results {
        assert_eq!(cut, 4500.0);
    }
}

#[test]
fn imbalance_extremes_on_ten_thousand_vertices() {
    let comm = NoComm;
    let n = 10_000;
    let k = 10;
    let dist = Distribution::serial(n);

    let balanced: Vec<usize> = (0..n).map(|i| i % k).collect();
    let part = DistVector::new(Arc::clone(&dist), balanced).unwrap();
    assert_eq!(compute_imbalance(&comm, &part, k, None).unwrap(), 0.0);

    let one_block = DistVector::from_constant(Arc::clone(&dist), 0usize);
    assert_eq!(compute_imbalance(&comm, &one_block, k, None).unwrap(), 9.0);

    // arbitrary assignments never go negative
    let scrambled: Vec<usize> = (0..n).map(|i| (i * 7 + i / 13) % k).collect();
    let part = DistVector::new(dist, scrambled).unwrap();
    assert!(compute_imbalance(&comm, &part, k, None).unwrap() >= 0.0);
}

#[test]
fn weighted_imbalance_uses_node_weights() {
    let comm = NoComm;
    let dist = Distribution::serial(4);
    // two blocks, weights 1,1,1,3: assignment {0,1} vs {2,3} puts 2 against 4
    let part = DistVector::new(Arc::clone(&dist), vec![0, 0, 1, 1]).unwrap();
    let weights = DistVector::new(Arc::clone(&dist), vec![1.0, 1.0, 1.0, 3.0]).unwrap();
    let imb = compute_imbalance(&comm, &part, 2, Some(&weights)).unwrap();
    assert!((imb - (4.0 / 3.0 - 1.0)).abs() < 1e-12);
}

#[test]
fn cut_counts_edge_weights_once_per_edge() {
    let comm = NoComm;
    // weighted path 0-1-2 with weights 2.0 and 3.0, split after vertex 1
    let dist = Distribution::serial(3);
    let ia = vec![0, 1, 3, 4];
    let ja = vec![1, 0, 2, 1];
    let values = vec![2.0, 2.0, 3.0, 3.0];
    let graph = DistGraph::new(dist, ia, ja, values).unwrap();
    let part = DistVector::new(Arc::clone(graph.dist()), vec![0, 0, 1]).unwrap();
    assert_eq!(compute_cut(&comm, &graph, &part).unwrap(), 3.0);
}
