//! Spectral initial partition on the pixel proxy graph.
//!
//! Recursive bisection: the Fiedler vector of the (replicated) pixel-graph
//! Laplacian orders the pixels, a density-weighted quantile splits them, and
//! the halves recurse until k parts exist. The eigenvector comes from a
//! fixed-iteration shifted power iteration with the constant vector
//! projected out, so every rank computes the identical result without
//! randomness.

use std::sync::Arc;

use crate::algs::block_graph::BlockGraph;
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector};
use crate::metrics::Metrics;
use crate::partitioning::pixel::pixeled_coarsen;
use crate::settings::Settings;

const POWER_ITERATIONS: usize = 80;

/// Initial partition by spectral bisection of the pixel graph (collective).
pub fn spectral_partition<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    settings: &Settings,
    _metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let k = settings.num_blocks;
    let pixels = pixeled_coarsen(comm, graph, coords, weights, settings.pixeled_side_len)?;
    let cube = pixels.num_pixels();
    let mut pixel_blocks = vec![0usize; cube];
    let all: Vec<usize> = (0..cube).collect();
    bisect(
        pixels.graph(),
        pixels.density(),
        &all,
        k,
        0,
        &mut pixel_blocks,
    );

    let dim = coords.len();
    let local_n = graph.local_n();
    let mut part = vec![0usize; local_n];
    for i in 0..local_n {
        let point: Vec<f64> = (0..dim).map(|d| coords[d].local()[i]).collect();
        part[i] = pixel_blocks[pixels.pixel_of(&point)];
    }
    DistVector::new(Arc::clone(graph.dist()), part)
}

/// Split `subset` into k parts, writing block ids starting at `base`.
fn bisect(
    graph: &BlockGraph,
    density: &[f64],
    subset: &[usize],
    k: usize,
    base: usize,
    out: &mut [usize],
) {
    if k <= 1 || subset.len() <= 1 {
        for &px in subset {
            out[px] = base;
        }
        return;
    }
    let k_left = k / 2;
    let fraction = k_left as f64 / k as f64;

    let fiedler = fiedler_vector(graph, subset);
    let mut order: Vec<usize> = (0..subset.len()).collect();
    order.sort_unstable_by(|&a, &b| {
        fiedler[a]
            .partial_cmp(&fiedler[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(subset[a].cmp(&subset[b]))
    });
    let total: f64 = subset.iter().map(|&px| density[px]).sum();
    let target = total * fraction;
    let mut cum = 0.0;
    let mut cut_at = 0usize;
    for (pos, &local) in order.iter().enumerate() {
        cum += density[subset[local]];
        cut_at = pos + 1;
        if cum >= target && cut_at < subset.len() {
            break;
        }
    }
    // guarantee both halves are non-empty
    cut_at = cut_at.clamp(1, subset.len() - 1);

    let left: Vec<usize> = order[..cut_at].iter().map(|&l| subset[l]).collect();
    let right: Vec<usize> = order[cut_at..].iter().map(|&l| subset[l]).collect();
    bisect(graph, density, &left, k_left, base, out);
    bisect(graph, density, &right, k - k_left, base + k_left, out);
}

/// Approximate Fiedler vector of the Laplacian of the subgraph induced by
/// `subset`: shifted power iteration with the constant component removed.
fn fiedler_vector(graph: &BlockGraph, subset: &[usize]) -> Vec<f64> {
    let n = subset.len();
    let mut local_index = vec![usize::MAX; graph.k()];
    for (i, &px) in subset.iter().enumerate() {
        local_index[px] = i;
    }
    // induced adjacency and weighted degree
    let mut adj: Vec<Vec<(usize, f64)>> = vec![Vec::new(); n];
    let mut degree = vec![0.0f64; n];
    for (i, &px) in subset.iter().enumerate() {
        let (cols, weights) = graph.neighbors(px);
        for (&c, &w) in cols.iter().zip(weights) {
            if c != px && local_index[c] != usize::MAX {
                adj[i].push((local_index[c], w));
                degree[i] += w;
            }
        }
    }
    let max_degree = degree.iter().cloned().fold(0.0, f64::max);
    let shift = 2.0 * max_degree + 1.0;

    // deterministic start, centred so the constant mode is absent
    let mut x: Vec<f64> = (0..n).map(|i| i as f64 - (n as f64 - 1.0) / 2.0).collect();
    normalize(&mut x);
    let mut y = vec![0.0f64; n];
    for _ in 0..POWER_ITERATIONS {
        // y = (shift I - L) x = (shift - deg) x + W x
        for i in 0..n {
            y[i] = (shift - degree[i]) * x[i];
        }
        for i in 0..n {
            for &(j, w) in &adj[i] {
                y[i] += w * x[j];
            }
        }
        project_out_constant(&mut y);
        normalize(&mut y);
        std::mem::swap(&mut x, &mut y);
    }
    x
}

fn project_out_constant(x: &mut [f64]) {
    let mean = x.iter().sum::<f64>() / x.len() as f64;
    for v in x.iter_mut() {
        *v -= mean;
    }
}

fn normalize(x: &mut [f64]) {
    let norm = x.iter().map(|&v| v * v).sum::<f64>().sqrt();
    if norm > 0.0 {
        for v in x.iter_mut() {
            *v /= norm;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::NoComm;
    use crate::algs::graph_utils::compute_imbalance;
    use crate::mesh_generation::structured_mesh_2d;

    #[test]
    fn fiedler_separates_a_path() {
        // path of 4 pixels: the Fiedler vector is monotone along the path
        let ia = vec![0, 1, 3, 5, 6];
        let ja = vec![1, 0, 2, 1, 3, 2];
        let values = vec![1.0; 6];
        let g = BlockGraph::from_csr(4, ia, ja, values);
        let subset: Vec<usize> = (0..4).collect();
        let f = fiedler_vector(&g, &subset);
        let increasing = f.windows(2).all(|w| w[0] <= w[1]);
        let decreasing = f.windows(2).all(|w| w[0] >= w[1]);
        assert!(
            increasing || decreasing,
            "Fiedler vector is not monotone along the path: {f:?}"
        );
    }

    #[test]
    fn spectral_partition_covers_all_blocks() {
        let comm = NoComm;
        let (g, coords, w) = structured_mesh_2d(&comm, 16, 16).unwrap();
        let settings = Settings {
            num_blocks: 4,
            dimensions: 2,
            pixeled_side_len: 8,
            ..Settings::default()
        };
        let mut metrics = Metrics::new();
        let part =
            spectral_partition(&comm, &g, &coords, &w, &settings, &mut metrics).unwrap();
        let mut seen = [false; 4];
        for &b in part.local() {
            assert!(b < 4);
            seen[b] = true;
        }
        assert!(seen.iter().all(|&s| s), "some block is empty");
        let imb = compute_imbalance(&comm, &part, 4, None).unwrap();
        assert!(imb <= 0.5, "spectral imbalance {imb}");
    }
}
