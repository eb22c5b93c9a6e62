//! Geometric helpers shared by the partitioning phases.

pub mod hilbert;

use crate::algs::collective::{all_reduce, ReduceOp};
use crate::algs::communicator::Communicator;
use crate::carve_error::MeshCarveError;

/// Axis-aligned bounding box in D dimensions.
#[derive(Clone, Debug)]
pub struct BoundingBox {
    pub min: Vec<f64>,
    pub max: Vec<f64>,
}

impl BoundingBox {
    /// Box of the local point set; `coords[d]` holds the d-th component of
    /// every point. Empty point sets produce an inverted box that is the
    /// identity under [`BoundingBox::merge`] semantics of min/max reduction.
    pub fn from_points(coords: &[Vec<f64>]) -> Self {
        let dim = coords.len();
        let mut min = vec![f64::INFINITY; dim];
        let mut max = vec![f64::NEG_INFINITY; dim];
        for d in 0..dim {
            for &x in &coords[d] {
                if x < min[d] {
                    min[d] = x;
                }
                if x > max[d] {
                    max[d] = x;
                }
            }
        }
        Self { min, max }
    }

    /// Merge the local boxes of all ranks (collective).
    pub fn global<C: Communicator>(
        &self,
        comm: &C,
    ) -> Result<BoundingBox, MeshCarveError> {
        let mut min = self.min.clone();
        let mut max = self.max.clone();
        all_reduce(comm, ReduceOp::Min, &mut min)?;
        all_reduce(comm, ReduceOp::Max, &mut max)?;
        Ok(BoundingBox { min, max })
    }

    #[inline]
    pub fn dim(&self) -> usize {
        self.min.len()
    }

    /// Squared distance from `point` to the box; zero when inside.
    pub fn min_sq_distance(&self, point: &[f64]) -> f64 {
        let mut d2 = 0.0;
        for d in 0..self.dim() {
            let gap = if point[d] < self.min[d] {
                self.min[d] - point[d]
            } else if point[d] > self.max[d] {
                point[d] - self.max[d]
            } else {
                0.0
            };
            d2 += gap * gap;
        }
        d2
    }

    /// Euclidean length of the box diagonal.
    pub fn diagonal(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(&lo, &hi)| (hi - lo) * (hi - lo))
            .sum::<f64>()
            .sqrt()
    }

    /// Box volume (product of extents).
    pub fn volume(&self) -> f64 {
        self.min
            .iter()
            .zip(&self.max)
            .map(|(&lo, &hi)| (hi - lo).max(0.0))
            .product()
    }
}

/// Squared Euclidean distance between two points of equal dimension.
#[inline]
pub fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(&x, &y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn box_distance_inside_is_zero() {
        let b = BoundingBox {
            min: vec![0.0, 0.0],
            max: vec![1.0, 1.0],
        };
        assert_eq!(b.min_sq_distance(&[0.5, 0.5]), 0.0);
        assert_eq!(b.min_sq_distance(&[2.0, 0.5]), 1.0);
        assert!((b.diagonal() - 2f64.sqrt()).abs() < 1e-12);
    }

    #[test]
    fn from_points_covers_extremes() {
        let coords = vec![vec![0.0, 3.0, -1.0], vec![2.0, 5.0, 4.0]];
        let b = BoundingBox::from_points(&coords);
        assert_eq!(b.min, vec![-1.0, 2.0]);
        assert_eq!(b.max, vec![3.0, 5.0]);
    }
}
