//! Compute module - numerical core of the swarm search algorithm.

pub(crate) mod batch;
pub(crate) mod env;
pub(crate) mod model;
pub(crate) mod swarm;
mod tree;
pub(crate) mod walkers;

pub use batch::*;
pub use env::*;
pub use model::*;
pub use swarm::*;
pub use tree::*;
pub use walkers::*;
