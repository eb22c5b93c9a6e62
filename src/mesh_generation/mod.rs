//! Structured and random mesh generators for benchmarks and tests.
//!
//! Vertices are laid out x-major (`gid = (x * ny + y) * nz + z`); every rank
//! builds its own rows straight from the block distribution, so no
//! replicated adjacency is ever materialised.

use std::sync::Arc;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;
use crate::dist::{DistGraph, DistVector, Distribution};

type Mesh = (DistGraph, Vec<DistVector<f64>>, DistVector<f64>);

/// Structured 2D grid mesh with unit edge and node weights.
pub fn structured_mesh_2d<C: Communicator>(
    comm: &C,
    nx: usize,
    ny: usize,
) -> Result<Mesh, MeshCarveError> {
    if nx < 2 || ny < 2 {
        return Err(MeshCarveError::Config(format!(
            "structured mesh needs at least 2 points per axis, got {nx}x{ny}"
        )));
    }
    build_grid(comm, &[nx, ny], |_| 0.0)
}

/// Structured 3D grid mesh with unit edge and node weights.
pub fn structured_mesh_3d<C: Communicator>(
    comm: &C,
    nx: usize,
    ny: usize,
    nz: usize,
) -> Result<Mesh, MeshCarveError> {
    if nx < 2 || ny < 2 || nz < 2 {
        return Err(MeshCarveError::Config(format!(
            "structured mesh needs at least 2 points per axis, got {nx}x{ny}x{nz}"
        )));
    }
    build_grid(comm, &[nx, ny, nz], |_| 0.0)
}

/// Random 3D mesh: grid adjacency with per-point coordinate jitter, so the
/// geometry is irregular while the graph stays symmetric. The jitter is a
/// pure function of `(seed, gid)`; every rank derives identical positions.
pub fn random_mesh_3d<C: Communicator>(
    comm: &C,
    nx: usize,
    ny: usize,
    nz: usize,
    seed: u64,
) -> Result<Mesh, MeshCarveError> {
    if nx < 2 || ny < 2 || nz < 2 {
        return Err(MeshCarveError::Config(format!(
            "random mesh needs at least 2 points per axis, got {nx}x{ny}x{nz}"
        )));
    }
    build_grid(comm, &[nx, ny, nz], move |gid| {
        let mut rng = SmallRng::seed_from_u64(seed ^ (gid as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        rng.gen_range(-0.35..0.35)
    })
}

fn build_grid<C: Communicator>(
    comm: &C,
    extents: &[usize],
    jitter: impl Fn(usize) -> f64,
) -> Result<Mesh, MeshCarveError> {
    let dim = extents.len();
    let global_n: usize = extents.iter().product();
    let dist = Distribution::block(comm, global_n);

    let mut ia = Vec::with_capacity(dist.local_n() + 1);
    let mut ja = Vec::new();
    ia.push(0);
    let mut coords: Vec<Vec<f64>> = vec![Vec::with_capacity(dist.local_n()); dim];
    for gid in dist.owned_ids() {
        let pos = unflatten(gid, extents);
        for d in 0..dim {
            coords[d].push(pos[d] as f64 + jitter(gid * dim + d));
        }
        let mut row = Vec::with_capacity(2 * dim);
        for d in 0..dim {
            if pos[d] > 0 {
                let mut q = pos.clone();
                q[d] -= 1;
                row.push(flatten(&q, extents));
            }
            if pos[d] + 1 < extents[d] {
                let mut q = pos.clone();
                q[d] += 1;
                row.push(flatten(&q, extents));
            }
        }
        row.sort_unstable();
        ja.extend_from_slice(&row);
        ia.push(ja.len());
    }
    let values = vec![1.0; ja.len()];
    let graph = DistGraph::new(Arc::clone(&dist), ia, ja, values)?;
    let coords = coords
        .into_iter()
        .map(|c| DistVector::new(Arc::clone(&dist), c))
        .collect::<Result<Vec<_>, _>>()?;
    let weights = DistVector::from_constant(dist, 1.0);
    Ok((graph, coords, weights))
}

fn unflatten(gid: usize, extents: &[usize]) -> Vec<usize> {
    let mut pos = vec![0; extents.len()];
    let mut rest = gid;
    for d in (0..extents.len()).rev() {
        pos[d] = rest % extents[d];
        rest /= extents[d];
    }
    pos
}

fn flatten(pos: &[usize], extents: &[usize]) -> usize {
    let mut gid = 0;
    for d in 0..extents.len() {
        gid = gid * extents[d] + pos[d];
    }
    gid
}
