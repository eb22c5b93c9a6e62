//! End-to-end partitions of small structured meshes.

use mesh_carve::algs::communicator::NoComm;
use mesh_carve::algs::graph_utils::{compute_cut, compute_imbalance};
use mesh_carve::dist::DistGraph;
use mesh_carve::mesh_generation::{structured_mesh_2d, structured_mesh_3d};
use mesh_carve::metrics::Metrics;
use mesh_carve::partitioning::partition_graph;
use mesh_carve::settings::Settings;

/// Vertices of each block form a connected subgraph (local BFS per block).
fn blocks_are_connected(graph: &DistGraph, part: &[usize], k: usize) -> bool {
    for b in 0..k {
        let members: Vec<usize> = (0..graph.local_n()).filter(|&i| part[i] == b).collect();
        if members.is_empty() {
            return false;
        }
        let mut seen = vec![false; graph.local_n()];
        let mut queue = std::collections::VecDeque::new();
        seen[members[0]] = true;
        queue.push_back(members[0]);
        let mut reached = 1;
        while let Some(u) = queue.pop_front() {
            for &c in graph.row(u).0 {
                let v = graph.dist().global_to_local(c).unwrap();
                if part[v] == b && !seen[v] {
                    seen[v] = true;
                    reached += 1;
                    queue.push_back(v);
                }
            }
        }
        if reached != members.len() {
            return false;
        }
    }
    true
}

#[test]
fn regular_grid_into_four_blocks() {
    let comm = NoComm;
    let (graph, coords, _) = structured_mesh_2d(&comm, 8, 8).unwrap();
    let settings = Settings {
        num_blocks: 4,
        dimensions: 2,
        sfc_resolution: 11,
        epsilon: 0.05,
        ..Settings::default()
    };
    let mut metrics = Metrics::new();
    let part = partition_graph(&comm, &graph, &coords, None, &settings, &mut metrics).unwrap();

    let mut counts = [0usize; 4];
    for &b in part.local() {
        counts[b] += 1;
    }
    assert_eq!(counts, [16, 16, 16, 16], "blocks are not exactly balanced");
    let cut = compute_cut(&comm, &graph, &part).unwrap();
    assert!(cut <= 16.0, "cut {cut} above the two-straight-cuts bound");
    assert!(blocks_are_connected(&graph, part.local(), 4));
}

#[test]
fn small_cube_into_eight_blocks() {
    let comm = NoComm;
    let (graph, coords, _) = structured_mesh_3d(&comm, 16, 16, 16).unwrap();
    let settings = Settings {
        num_blocks: 8,
        dimensions: 3,
        sfc_resolution: 9,
        epsilon: 0.05,
        ..Settings::default()
    };
    let mut metrics = Metrics::new();
    let part = partition_graph(&comm, &graph, &coords, None, &settings, &mut metrics).unwrap();
    let imb = compute_imbalance(&comm, &part, 8, None).unwrap();
    assert!(imb <= 0.05 + 1e-9, "imbalance {imb}");
    let cut = compute_cut(&comm, &graph, &part).unwrap();
    // six-face bound for a cube split into octants
    assert!(cut <= 4.0 * 16.0 * 16.0, "cut {cut}");
}

#[test]
#[ignore = "full-size scenario, slow in debug builds"]
fn cube_32_into_eight_blocks() {
    let comm = NoComm;
    let (graph, coords, _) = structured_mesh_3d(&comm, 32, 32, 32).unwrap();
    let settings = Settings {
        num_blocks: 8,
        dimensions: 3,
        sfc_resolution: 11,
        epsilon: 0.05,
        ..Settings::default()
    };
    let mut metrics = Metrics::new();
    let part = partition_graph(&comm, &graph, &coords, None, &settings, &mut metrics).unwrap();
    let imb = compute_imbalance(&comm, &part, 8, None).unwrap();
    assert!(imb <= 0.05 + 1e-9, "imbalance {imb}");
    let cut = compute_cut(&comm, &graph, &part).unwrap();
    assert!(cut <= 4.0 * 32.0 * 32.0, "cut {cut}");
}
