//! Hilbert space-filling curve in 2 and 3 dimensions.
//!
//! Points are scaled into the unit cube spanned by `min`/`max`, quantised to
//! `resolution` bits per axis, and mapped to a scalar in [0,1) along the
//! curve. The inverse recovers the cell centre, so a round trip moves a
//! point by at most one cell extent per axis: 2^-resolution of the scaled
//! range. Everything here is purely local.
//!
//! The cell transform is the Gray-code formulation: interleave the axis
//! bits after applying the per-level rotation/inversion rules; the inverse
//! mirrors the same rules.

use crate::carve_error::MeshCarveError;

/// Largest supported resolution: D * bits must fit a u64 index.
pub const MAX_RESOLUTION: u32 = 21;

/// Hilbert index of `point` in [0,1), for the box spanned by `min`/`max`.
///
/// Degenerate axes (min == max) collapse to cell 0. Non-finite coordinates
/// are an input error.
pub fn hilbert_index(
    point: &[f64],
    min: &[f64],
    max: &[f64],
    resolution: u32,
) -> Result<f64, MeshCarveError> {
    let dim = point.len();
    debug_assert!(dim == 2 || dim == 3, "curve is defined for 2 or 3 dimensions");
    debug_assert!(resolution >= 1 && resolution <= MAX_RESOLUTION);
    let cells = 1u64 << resolution;
    let mut axes = [0u64; 3];
    for d in 0..dim {
        if !point[d].is_finite() {
            return Err(MeshCarveError::Input(format!(
                "non-finite coordinate {} in dimension {d}",
                point[d]
            )));
        }
        let extent = max[d] - min[d];
        let unit = if extent > 0.0 {
            ((point[d] - min[d]) / extent).clamp(0.0, 1.0)
        } else {
            0.0
        };
        axes[d] = ((unit * cells as f64) as u64).min(cells - 1);
    }
    axes_to_transpose(&mut axes[..dim], resolution);
    let index = transpose_to_index(&axes[..dim], resolution);
    let total = 1u64 << (resolution * dim as u32);
    Ok(index as f64 / total as f64)
}

/// Inverse map: centre of the curve cell containing `index`, in the unit
/// cube. `dim` must be 2 or 3.
pub fn hilbert_point(index: f64, dim: usize, resolution: u32) -> Vec<f64> {
    debug_assert!(dim == 2 || dim == 3);
    debug_assert!(resolution >= 1 && resolution <= MAX_RESOLUTION);
    let cells = 1u64 << resolution;
    let total = 1u64 << (resolution * dim as u32);
    let h = ((index.clamp(0.0, 1.0) * total as f64) as u64).min(total - 1);
    let mut axes = [0u64; 3];
    index_to_transpose(h, &mut axes[..dim], resolution);
    transpose_to_axes(&mut axes[..dim], resolution);
    (0..dim)
        .map(|d| (axes[d] as f64 + 0.5) / cells as f64)
        .collect()
}

/// Axis cells -> transposed Hilbert form (per-level rotations and
/// inversions, then Gray encoding).
fn axes_to_transpose(x: &mut [u64], bits: u32) {
    let n = x.len();
    let m = 1u64 << (bits - 1);
    // inverse undo of the rotations, most significant level first
    let mut q = m;
    while q > 1 {
        let p = q - 1;
        for i in 0..n {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                let t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q >>= 1;
    }
    // Gray encode
    for i in 1..n {
        x[i] ^= x[i - 1];
    }
    let mut t = 0u64;
    let mut q = m;
    while q > 1 {
        if x[n - 1] & q != 0 {
            t ^= q - 1;
        }
        q >>= 1;
    }
    for v in x.iter_mut() {
        *v ^= t;
    }
}

/// Transposed Hilbert form -> axis cells (inverse of
/// [`axes_to_transpose`]).
fn transpose_to_axes(x: &mut [u64], bits: u32) {
    let n = x.len();
    let m = 2u64 << (bits - 1);
    // Gray decode
    let mut t = x[n - 1] >> 1;
    for i in (1..n).rev() {
        x[i] ^= x[i - 1];
    }
    x[0] ^= t;
    // redo the rotations, least significant level first
    let mut q = 2u64;
    while q != m {
        let p = q - 1;
        for i in (0..n).rev() {
            if x[i] & q != 0 {
                x[0] ^= p;
            } else {
                t = (x[0] ^ x[i]) & p;
                x[0] ^= t;
                x[i] ^= t;
            }
        }
        q <<= 1;
    }
}

/// Interleave the transposed axes into a single index, most significant bit
/// of axis 0 first.
fn transpose_to_index(x: &[u64], bits: u32) -> u64 {
    let mut h = 0u64;
    for b in (0..bits).rev() {
        for v in x {
            h = (h << 1) | ((v >> b) & 1);
        }
    }
    h
}

/// De-interleave an index back into transposed axes.
fn index_to_transpose(h: u64, x: &mut [u64], bits: u32) {
    let n = x.len();
    for v in x.iter_mut() {
        *v = 0;
    }
    let mut at = bits as usize * n;
    for b in (0..bits).rev() {
        for v in x.iter_mut() {
            at -= 1;
            *v |= ((h >> at) & 1) << b;
        }
    }
}
