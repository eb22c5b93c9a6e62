//! Distributed substrate: row distributions, dense vectors and CSR graphs.
//!
//! Every distributed object is co-distributed with the graph rows; a process
//! owns a set of global row indices and stores only those. The column space
//! is always replicated, so local rows may reference any global column.

pub mod distribution;
pub mod graph;
pub mod vector;

pub use distribution::Distribution;
pub use graph::DistGraph;
pub use vector::{DistVector, Redistributor};
