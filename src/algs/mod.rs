//! Algorithms on the distributed substrate: communication, collectives,
//! graph measures, block/process graphs and the communication schedule.

pub mod block_graph;
pub mod collective;
pub mod coloring;
pub mod communicator;
pub mod graph_utils;
