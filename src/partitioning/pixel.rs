//! Pixel proxy graph: a fixed-resolution grid summary of the input.
//!
//! Points are binned into a cartesian grid of side `L` per axis; the pixel
//! graph carries per-pixel density (summed node weight) and per-grid-edge
//! accumulated weight of input edges whose endpoints fall into adjacent
//! pixels. Grid edges that received nothing keep a floor weight of 0.01 so
//! no pixel is isolated. The grid is replicated; one D-dimensional pass
//! handles 2D and 3D alike.

use std::sync::Arc;

use crate::algs::block_graph::BlockGraph;
use crate::algs::collective::{all_reduce, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector};
use crate::geometry::hilbert::hilbert_index;
use crate::geometry::BoundingBox;
use crate::halo::Halo;
use crate::metrics::Metrics;
use crate::settings::Settings;

/// Floor weight for grid edges no input edge mapped onto.
pub const PIXEL_EDGE_FLOOR: f64 = 0.01;

/// Replicated pixel summary of a distributed geometric graph.
pub struct PixelGraph {
    side_len: usize,
    dim: usize,
    /// Summed node weight per pixel, row-major.
    density: Vec<f64>,
    /// Grid adjacency with accumulated edge weights.
    graph: BlockGraph,
    bbox: BoundingBox,
}

impl PixelGraph {
    pub fn num_pixels(&self) -> usize {
        self.density.len()
    }

    pub fn density(&self) -> &[f64] {
        &self.density
    }

    pub fn graph(&self) -> &BlockGraph {
        &self.graph
    }

    pub fn side_len(&self) -> usize {
        self.side_len
    }

    /// Pixel index of a point (scaled into the global bounding box).
    pub fn pixel_of(&self, point: &[f64]) -> usize {
        pixel_of(point, &self.bbox, self.side_len, self.dim)
    }

    /// Centre coordinates of a pixel in the unit cube.
    fn pixel_center_unit(&self, mut pixel: usize) -> Vec<f64> {
        let mut center = vec![0.0; self.dim];
        for d in (0..self.dim).rev() {
            center[d] = (pixel % self.side_len) as f64 + 0.5;
            pixel /= self.side_len;
        }
        center
            .iter()
            .map(|&c| c / self.side_len as f64)
            .collect()
    }
}

fn pixel_of(point: &[f64], bbox: &BoundingBox, side_len: usize, dim: usize) -> usize {
    let mut idx = 0usize;
    for d in 0..dim {
        let extent = bbox.max[d] - bbox.min[d];
        let unit = if extent > 0.0 {
            ((point[d] - bbox.min[d]) / extent).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let cell = ((unit * side_len as f64) as usize).min(side_len - 1);
        idx = idx * side_len + cell;
    }
    idx
}

/// Summarise the distributed graph into a pixel grid (collective).
pub fn pixeled_coarsen<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    side_len: usize,
) -> Result<PixelGraph, MeshCarveError> {
    let dim = coords.len();
    let cube = side_len.pow(dim as u32);
    if cube > graph.global_n() {
        log::warn!(
            "pixel grid has {cube} cells for {} vertices, not a coarsening",
            graph.global_n()
        );
    }
    let local_coords: Vec<Vec<f64>> = coords.iter().map(|c| c.local().to_vec()).collect();
    let bbox = BoundingBox::from_points(&local_coords).global(comm)?;

    // density from local points
    let mut density = vec![0.0f64; cube];
    let local_n = graph.local_n();
    let mut my_pixel = vec![0usize; local_n];
    for i in 0..local_n {
        let point: Vec<f64> = (0..dim).map(|d| local_coords[d][i]).collect();
        let px = pixel_of(&point, &bbox, side_len, dim);
        my_pixel[i] = px;
        density[px] += weights.local()[i];
    }
    all_reduce(comm, ReduceOp::Sum, &mut density)?;

    // inter-pixel edge accumulation: positive-direction grid edges only
    let halo = Halo::build(comm, graph)?;
    let halo_coords: Vec<Vec<f64>> = coords
        .iter()
        .map(|c| halo.update(comm, graph.dist(), c.local()))
        .collect::<Result<Vec<_>, _>>()?;
    let mut acc = vec![0.0f64; cube * dim];
    for i in 0..local_n {
        let (cols, edge_w) = graph.row(i);
        for (&c, &w) in cols.iter().zip(edge_w) {
            let other_px = match graph.dist().global_to_local(c) {
                Some(l) => my_pixel[l],
                None => {
                    let slot = halo.global_to_halo(c).expect("column in halo");
                    let point: Vec<f64> = (0..dim).map(|d| halo_coords[d][slot]).collect();
                    pixel_of(&point, &bbox, side_len, dim)
                }
            };
            let (lo, hi) = (my_pixel[i].min(other_px), my_pixel[i].max(other_px));
            if lo == hi {
                continue;
            }
            // keep only grid-adjacent pixel pairs; one axis, distance one
            if let Some(axis) = adjacent_axis(lo, hi, side_len, dim) {
                // halve: the symmetric CSR visits each edge from both ends
                acc[lo * dim + axis] += w / 2.0;
            }
        }
    }
    all_reduce(comm, ReduceOp::Sum, &mut acc)?;

    // assemble the grid CSR with the floor on untouched edges
    let mut ia = vec![0usize];
    let mut ja = Vec::new();
    let mut values = Vec::new();
    let strides: Vec<usize> = (0..dim)
        .map(|d| side_len.pow((dim - 1 - d) as u32))
        .collect();
    for px in 0..cube {
        let mut row: Vec<(usize, f64)> = Vec::with_capacity(2 * dim);
        for d in 0..dim {
            let coord = px / strides[d] % side_len;
            if coord > 0 {
                let nb = px - strides[d];
                let w = acc[nb * dim + d];
                row.push((nb, if w > 0.0 { w } else { PIXEL_EDGE_FLOOR }));
            }
            if coord + 1 < side_len {
                let nb = px + strides[d];
                let w = acc[px * dim + d];
                row.push((nb, if w > 0.0 { w } else { PIXEL_EDGE_FLOOR }));
            }
        }
        row.sort_unstable_by_key(|&(nb, _)| nb);
        for (nb, w) in row {
            ja.push(nb);
            values.push(w);
        }
        ia.push(ja.len());
    }
    let graph = BlockGraph::from_csr(cube, ia, ja, values);
    Ok(PixelGraph {
        side_len,
        dim,
        density,
        graph,
        bbox,
    })
}

/// Axis along which two pixels are grid neighbours, if any.
fn adjacent_axis(lo: usize, hi: usize, side_len: usize, dim: usize) -> Option<usize> {
    let mut lo_pos = vec![0usize; dim];
    let mut hi_pos = vec![0usize; dim];
    let (mut l, mut h) = (lo, hi);
    for d in (0..dim).rev() {
        lo_pos[d] = l % side_len;
        hi_pos[d] = h % side_len;
        l /= side_len;
        h /= side_len;
    }
    let mut axis = None;
    for d in 0..dim {
        match hi_pos[d].abs_diff(lo_pos[d]) {
            0 => {}
            1 if axis.is_none() => axis = Some(d),
            _ => return None,
        }
    }
    axis
}

/// Initial partition through the pixel proxy: pixels are sliced into k
/// density-balanced ranges along the curve through pixel centres, then each
/// point inherits its pixel's block (collective).
pub fn pixeled_partition<C: Communicator>(
    comm: &C,
    graph: &DistGraph,
    coords: &[DistVector<f64>],
    weights: &DistVector<f64>,
    settings: &Settings,
    _metrics: &mut Metrics,
) -> Result<DistVector<usize>, MeshCarveError> {
    let k = settings.num_blocks;
    let pixels = pixeled_coarsen(comm, graph, coords, weights, settings.pixeled_side_len)?;
    let pixel_blocks = slice_pixels_by_curve(&pixels, k, settings.sfc_resolution)?;

    let dim = coords.len();
    let local_n = graph.local_n();
    let mut part = vec![0usize; local_n];
    for i in 0..local_n {
        let point: Vec<f64> = (0..dim).map(|d| coords[d].local()[i]).collect();
        part[i] = pixel_blocks[pixels.pixel_of(&point)];
    }
    DistVector::new(Arc::clone(graph.dist()), part)
}

/// Assign every pixel a block by slicing the curve order of pixel centres
/// into k density-balanced ranges (replicated input, purely local).
pub fn slice_pixels_by_curve(
    pixels: &PixelGraph,
    k: usize,
    resolution: u32,
) -> Result<Vec<usize>, MeshCarveError> {
    let cube = pixels.num_pixels();
    let zero = vec![0.0; pixels.dim];
    let one = vec![1.0; pixels.dim];
    let mut order: Vec<usize> = (0..cube).collect();
    let mut h = vec![0.0f64; cube];
    for px in 0..cube {
        h[px] = hilbert_index(&pixels.pixel_center_unit(px), &zero, &one, resolution)?;
    }
    order.sort_unstable_by(|&a, &b| {
        h[a].partial_cmp(&h[b]).unwrap_or(std::cmp::Ordering::Equal)
    });
    let total: f64 = pixels.density.iter().sum();
    if total <= 0.0 {
        return Err(MeshCarveError::Input("total point weight is zero".into()));
    }
    let per_block = total / k as f64;
    let mut blocks = vec![0usize; cube];
    let mut cum = 0.0;
    for &px in &order {
        let b = ((cum + pixels.density[px] * 0.5) / per_block) as usize;
        blocks[px] = b.min(k - 1);
        cum += pixels.density[px];
    }
    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algs::communicator::{run_spmd, NoComm};
    use crate::algs::graph_utils::compute_imbalance;
    use crate::mesh_generation::{structured_mesh_2d, structured_mesh_3d};

    #[test]
    fn pixel_graph_has_cube_vertices_and_no_isolates() {
        let comm = NoComm;
        let (g, coords, w) = structured_mesh_3d(&comm, 8, 8, 8).unwrap();
        let side = 4;
        let pixels = pixeled_coarsen(&comm, &g, &coords, &w, side).unwrap();
        assert_eq!(pixels.num_pixels(), 64);
        for px in 0..64 {
            let (cols, weights) = pixels.graph().neighbors(px);
            assert!(!cols.is_empty(), "pixel {px} is isolated");
            for &w in weights {
                assert!(w >= PIXEL_EDGE_FLOOR);
            }
        }
        // total density equals total node weight
        let total: f64 = pixels.density().iter().sum();
        assert_eq!(total, 512.0);
    }

    #[test]
    fn empty_pixels_fall_back_to_the_floor_weight() {
        let comm = NoComm;
        // 2D mesh summarised into a 3D-sized... keep 2D: an 8x8 mesh into a
        // 6x6 grid leaves no pixel empty, so shrink the mesh instead
        let (g, coords, w) = structured_mesh_2d(&comm, 4, 4).unwrap();
        let pixels = pixeled_coarsen(&comm, &g, &coords, &w, 8).unwrap();
        // 64 pixels for 16 points: most pixels are empty, none isolated
        let empty = pixels.density().iter().filter(|&&d| d == 0.0).count();
        assert!(empty > 0);
        for px in 0..pixels.num_pixels() {
            let (cols, _) = pixels.graph().neighbors(px);
            assert!(!cols.is_empty());
        }
    }

    #[test]
    fn pixel_partition_is_roughly_balanced() {
        let results = run_spmd(2, |comm| {
            let (g, coords, w) = structured_mesh_2d(&comm, 16, 16).unwrap();
            let settings = Settings {
                num_blocks: 4,
                dimensions: 2,
                pixeled_side_len: 8,
                ..Settings::default()
            };
            let mut metrics = Metrics::new();
            let part =
                pixeled_partition(&comm, &g, &coords, &w, &settings, &mut metrics).unwrap();
            compute_imbalance(&comm, &part, 4, None).unwrap()
        });
        for imb in results {
            assert!(imb <= 0.35, "pixel imbalance {imb}");
        }
    }

    #[test]
    fn accumulated_edges_exceed_the_floor() {
        let comm = NoComm;
        let (g, coords, w) = structured_mesh_2d(&comm, 8, 8).unwrap();
        let pixels = pixeled_coarsen(&comm, &g, &coords, &w, 4).unwrap();
        // a 4x4 grid over an 8x8 mesh: every pixel holds a 2x2 point patch,
        // adjacent patches share 2 unit edges
        let (cols, weights) = pixels.graph().neighbors(0);
        assert!(!cols.is_empty());
        for &w in weights {
            assert!(w > PIXEL_EDGE_FLOOR, "expected accumulated weight, got {w}");
        }
    }
}
