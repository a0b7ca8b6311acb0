//! Fractal swarm sampling - population-based stochastic search with cloning.
//!
//! A batch of candidate states ("walkers") is evolved over discrete epochs:
//! a model perturbs each walker through an environment step, and a balancing
//! operation clones walkers toward regions combining high reward and high
//! diversity. A prunable history DAG records every accepted transition, and
//! a distributed layer exchanges elite walkers across independent swarms
//! through a parameter server.
//!
//! # Architecture
//!
//! The crate is split into three modules:
//!
//! - `schema`: Configuration types for swarm and distributed runs
//! - `compute`: The numerical core (batch states, walkers, swarm loop,
//!   history tree, bundled samplers and benchmark environments)
//! - `distributed`: Elite exchange across swarms (export swarms, the
//!   parameter-server actor and the asynchronous driver)
//!
//! # Example
//!
//! ```rust
//! use fractal_swarm::{
//!     compute::{Function, GaussianModel, Swarm},
//!     schema::{SwarmConfig, WalkersConfig},
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! // Minimize the sphere function with 16 walkers for 50 epochs.
//! let config = SwarmConfig {
//!     n_walkers: 16,
//!     max_epochs: 50,
//!     walkers: WalkersConfig {
//!         minimize: true,
//!         ..WalkersConfig::default()
//!     },
//!     ..SwarmConfig::default()
//! };
//!
//! let model = GaussianModel::new(0.5)?;
//! let env = Function::sphere(2)?;
//! let mut swarm = Swarm::new(model, env, config)?;
//!
//! swarm.run(10)?;
//! println!("best reward: {:?}", swarm.best_reward());
//! # Ok(())
//! # }
//! ```

pub mod compute;
pub mod distributed;
pub mod schema;

// Re-export commonly used types
pub use compute::{BatchState, CloneRecord, HistoryTree, Swarm, SwarmState, Walkers};
pub use distributed::{DistributedExport, ExportSwarm, ExportedWalkers, ParamServer};
pub use schema::{DistributedConfig, SwarmConfig, WalkersConfig};
