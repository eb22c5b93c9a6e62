//! # mesh-carve
//!
//! mesh-carve partitions very large graphs embedded in geometric space into
//! k balanced blocks with small edge cut, as the domain-decomposition stage
//! of parallel simulations. The graph and its coordinates are distributed
//! over P SPMD ranks and stay distributed throughout.
//!
//! ## Pipeline
//! 1. **Space-filling curve**: points are ordered along a Hilbert curve and
//!    redistributed so neighbours on the curve are co-located
//!    ([`partitioning::sfc`]).
//! 2. **Balanced k-means**: cluster centres seeded from the curve, with
//!    per-block influence multipliers enforcing the balance constraint
//!    ([`partitioning::kmeans`]).
//! 3. **Multilevel refinement**: matching-based coarsening, partition
//!    projection and distributed Fiduccia–Mattheyses rounds driven by an
//!    edge-coloured communication schedule ([`partitioning::multilevel`],
//!    [`partitioning::refinement`]).
//!
//! ## Execution backends
//! The core talks to a [`algs::communicator::Communicator`]: `NoComm` for
//! serial runs, `ThreadComm` for threads-as-ranks (the test harness), and
//! `MpiComm` behind the `mpi-support` feature.
//!
//! ## Determinism
//! Given the same input, rank count and seed, every backend produces the
//! same partition; all randomness derives from a seed broadcast from rank 0.

pub mod algs;
pub mod carve_error;
pub mod dist;
pub mod geometry;
pub mod halo;
pub mod io;
pub mod mesh_generation;
pub mod metrics;
pub mod partitioning;
pub mod settings;

/// The most-used types and entry points in one import.
pub mod prelude {
    pub use crate::algs::communicator::{Communicator, NoComm, ThreadComm};
    #[cfg(feature = "mpi-support")]
    pub use crate::algs::communicator::MpiComm;
    pub use crate::carve_error::MeshCarveError;
    pub use crate::dist::{DistGraph, DistVector, Distribution};
    pub use crate::halo::Halo;
    pub use crate::metrics::Metrics;
    pub use crate::partitioning::{partition_graph, repartition};
    pub use crate::settings::{InitialPartitioningMethod, Settings};
}
