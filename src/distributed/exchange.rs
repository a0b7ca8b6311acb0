//! Elite-walker exchange between independent swarms.

use serde::{Deserialize, Serialize};

use crate::compute::batch::{StructuralError, fields};
use crate::compute::swarm::{Environment, Model, Swarm, SwarmError};
use crate::compute::walkers::WalkerSnapshot;
use crate::schema::{ConfigError, ExchangeConfig};

/// Failures of the distributed exchange protocol.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    /// The wrapped swarm failed while stepping.
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    /// An import/export batch was rejected instead of silently adjusted.
    #[error("rejected walker batch: {0}")]
    InvalidBatch(String),
    /// The parameter server actor is gone.
    #[error("parameter server is unavailable")]
    ServerUnavailable,
}

impl From<StructuralError> for ExchangeError {
    fn from(err: StructuralError) -> Self {
        ExchangeError::Swarm(SwarmError::from(err))
    }
}

/// A small batch of elite walkers shared between swarms.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExportedWalkers {
    walkers: Vec<WalkerSnapshot>,
}

impl ExportedWalkers {
    /// A batch with no walkers, used to seed the first exchange round.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Wrap a list of walker snapshots.
    pub fn from_walkers(walkers: Vec<WalkerSnapshot>) -> Self {
        Self { walkers }
    }

    /// Number of walkers in the batch.
    pub fn len(&self) -> usize {
        self.walkers.len()
    }

    /// Whether the batch holds no walkers.
    pub fn is_empty(&self) -> bool {
        self.walkers.is_empty()
    }

    /// The carried walker snapshots.
    pub fn walkers(&self) -> &[WalkerSnapshot] {
        &self.walkers
    }

    /// The best walker of the batch for the given direction.
    pub fn best(&self, minimize: bool) -> Option<&WalkerSnapshot> {
        if minimize {
            self.walkers
                .iter()
                .min_by(|a, b| a.reward.total_cmp(&b.reward))
        } else {
            self.walkers
                .iter()
                .max_by(|a, b| a.reward.total_cmp(&b.reward))
        }
    }

    /// The best reward of the batch for the given direction.
    pub fn best_reward(&self, minimize: bool) -> Option<f32> {
        self.best(minimize).map(|w| w.reward)
    }

    /// Check that all rows share one shape and carry finite rewards.
    pub fn validate_uniform(&self) -> Result<(), ExchangeError> {
        let Some(first) = self.walkers.first() else {
            return Ok(());
        };
        for (i, walker) in self.walkers.iter().enumerate() {
            if walker.state.len() != first.state.len()
                || walker.observ.len() != first.observ.len()
            {
                return Err(ExchangeError::InvalidBatch(format!(
                    "walker {i} has shape ({}, {}), batch shape is ({}, {})",
                    walker.state.len(),
                    walker.observ.len(),
                    first.state.len(),
                    first.observ.len()
                )));
            }
            if !walker.reward.is_finite() {
                return Err(ExchangeError::InvalidBatch(format!(
                    "walker {i} carries a non-finite reward"
                )));
            }
        }
        Ok(())
    }
}

/// Wraps one swarm as an independently schedulable exchange unit.
///
/// Each [`run_exchange_step`](Self::run_exchange_step) merges imported elites
/// into the local population, runs the configured number of local epochs and
/// returns the local elites for redistribution.
pub struct ExportSwarm<M: Model, E: Environment> {
    swarm: Swarm<M, E>,
    config: ExchangeConfig,
}

impl<M: Model, E: Environment> ExportSwarm<M, E> {
    /// Wrap a swarm with the given exchange behavior.
    pub fn new(swarm: Swarm<M, E>, config: ExchangeConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let n_walkers = swarm.config().n_walkers;
        if config.n_import > n_walkers {
            return Err(ConfigError::InvalidExchange(format!(
                "n_import {} exceeds the population of {n_walkers}",
                config.n_import
            )));
        }
        if config.n_export > n_walkers {
            return Err(ConfigError::InvalidExchange(format!(
                "n_export {} exceeds the population of {n_walkers}",
                config.n_export
            )));
        }
        Ok(Self { swarm, config })
    }

    /// The wrapped swarm.
    pub fn swarm(&self) -> &Swarm<M, E> {
        &self.swarm
    }

    /// Whether lower rewards are better.
    pub fn minimize(&self) -> bool {
        self.swarm.minimize()
    }

    /// Best walker found locally so far.
    pub fn best(&self) -> Option<&WalkerSnapshot> {
        self.swarm.best()
    }

    /// Restart the wrapped swarm's episode.
    pub fn reset(&mut self) -> Result<(), SwarmError> {
        self.swarm.reset()
    }

    /// Run one import/step/export cycle.
    ///
    /// Imported walkers replace the lowest-virtual-reward locals; the local
    /// swarm then advances `epochs_per_exchange` epochs (restarting its
    /// episode if it hits a terminal state, with the best snapshot carried
    /// across), and the local elite is returned.
    pub fn run_exchange_step(
        &mut self,
        import: ExportedWalkers,
    ) -> Result<ExportedWalkers, ExchangeError> {
        if self.swarm.env_state().n_walkers() == 0 {
            self.swarm.reset()?;
        }
        self.import_walkers(&import)?;
        for _ in 0..self.config.epochs_per_exchange {
            if self.swarm.state().is_terminal() {
                let best = self.swarm.best().cloned();
                self.swarm.reset()?;
                if let Some(best) = best {
                    self.swarm.walkers_mut().consider_best(&best);
                }
            }
            self.swarm.step_epoch()?;
        }
        self.export_walkers()
    }

    fn import_walkers(&mut self, import: &ExportedWalkers) -> Result<(), ExchangeError> {
        if import.is_empty() {
            return Ok(());
        }
        if import.len() > self.config.n_import {
            return Err(ExchangeError::InvalidBatch(format!(
                "import batch of {} exceeds n_import {}",
                import.len(),
                self.config.n_import
            )));
        }
        let state_dim = self.swarm.env_state().f32_width(fields::STATES)?;
        let obs_dim = self.swarm.env_state().f32_width(fields::OBSERVS)?;
        for (i, walker) in import.walkers().iter().enumerate() {
            if walker.state.len() != state_dim || walker.observ.len() != obs_dim {
                return Err(ExchangeError::InvalidBatch(format!(
                    "imported walker {i} has shape ({}, {}), expected ({state_dim}, {obs_dim})",
                    walker.state.len(),
                    walker.observ.len()
                )));
            }
        }

        let slots = self.swarm.walkers().worst_virtual_indices(import.len());
        for (&slot, walker) in slots.iter().zip(import.walkers()) {
            self.swarm.import_walker(slot, walker)?;
        }
        if self.config.import_best
            && let Some(best) = import.best(self.minimize())
        {
            let accepted = self.swarm.walkers_mut().consider_best(best);
            if accepted {
                log::debug!("imported walker became local best: {}", best.reward);
            }
        }
        Ok(())
    }

    fn export_walkers(&self) -> Result<ExportedWalkers, ExchangeError> {
        let indices = self
            .swarm
            .walkers()
            .top_reward_indices(self.swarm.env_state(), self.config.n_export)?;
        let mut rows = Vec::with_capacity(self.config.n_export);
        for index in indices {
            rows.push(self.swarm.walker_snapshot(index)?);
        }
        if self.config.export_best
            && let Some(best) = self.swarm.best()
            && !rows.iter().any(|row| row == best)
        {
            if rows.len() >= self.config.n_export {
                rows.pop();
            }
            rows.push(best.clone());
        }
        Ok(ExportedWalkers::from_walkers(rows))
    }
}
