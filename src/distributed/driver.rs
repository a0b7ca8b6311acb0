//! Asynchronous driver coordinating many export swarms through one server.

use tokio::task::JoinSet;

use crate::compute::swarm::{Environment, Model, Swarm, SwarmError};
use crate::compute::walkers::WalkerSnapshot;
use crate::distributed::exchange::{ExchangeError, ExportSwarm, ExportedWalkers};
use crate::distributed::server::ParamServerHandle;
use crate::schema::{ConfigError, DistributedConfig, ServerConfig};

/// Failures of the distributed driver.
#[derive(Debug, thiserror::Error)]
pub enum DistributedError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Swarm(#[from] SwarmError),
    #[error(transparent)]
    Exchange(#[from] ExchangeError),
    #[error("worker task failed: {0}")]
    Worker(String),
}

/// Outcome of a completed distributed run.
#[derive(Debug, Clone)]
pub struct DistributedReport {
    /// Serviced exchange steps; equals `max_iters * n_swarms` on a normal
    /// completion.
    pub steps_completed: usize,
    /// Best walker seen by the server.
    pub best: Option<WalkerSnapshot>,
}

/// Runs `n_swarms` independent swarms that cross-pollinate elites through a
/// parameter server.
///
/// Swarms are built from a factory so each worker constructs its own
/// instance. Every swarm has exactly one exchange step in flight at a time;
/// whichever finishes first is serviced first, so slow workers never block
/// fast ones. The run completes after exactly `max_iters * n_swarms` steps.
pub struct DistributedExport<M, E, F>
where
    M: Model + 'static,
    E: Environment + 'static,
    F: Fn() -> Result<Swarm<M, E>, ConfigError>,
{
    factory: F,
    config: DistributedConfig,
    server: Option<ParamServerHandle>,
}

impl<M, E, F> DistributedExport<M, E, F>
where
    M: Model + 'static,
    E: Environment + 'static,
    F: Fn() -> Result<Swarm<M, E>, ConfigError>,
{
    /// Create a driver from a swarm factory and configuration.
    pub fn new(factory: F, config: DistributedConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            server: None,
        })
    }

    /// Driver configuration.
    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// Best walker seen by the server, once a run has started.
    pub async fn get_best(&self) -> Option<WalkerSnapshot> {
        match &self.server {
            Some(server) => server.best().await,
            None => None,
        }
    }

    /// Run the asynchronous exchange loop to completion.
    ///
    /// Reports the server-side best through `log` every `print_every`
    /// serviced steps (0 disables reporting).
    pub async fn run(&mut self, print_every: usize) -> Result<DistributedReport, DistributedError> {
        let n_swarms = self.config.n_swarms;
        let budget = self.config.max_iters * n_swarms;

        let mut lanes = Vec::with_capacity(n_swarms);
        let mut minimize = false;
        for _ in 0..n_swarms {
            let swarm = (self.factory)()?;
            minimize = swarm.minimize();
            lanes.push(ExportSwarm::new(swarm, self.config.exchange.clone())?);
        }

        let server = ParamServerHandle::spawn(ServerConfig {
            max_len: self.config.max_len,
            n_import: self.config.exchange.n_import,
            minimize,
            add_global_best: self.config.add_global_best,
            seed: None,
        })?;
        self.server = Some(server.clone());

        // One in-flight exchange step per swarm; steps are CPU-bound, so they
        // run on the blocking pool.
        let mut in_flight: JoinSet<(
            usize,
            ExportSwarm<M, E>,
            Result<ExportedWalkers, ExchangeError>,
        )> = JoinSet::new();
        let mut issued = 0;
        for (index, mut lane) in lanes.into_iter().enumerate() {
            if issued >= budget {
                break;
            }
            issued += 1;
            in_flight.spawn_blocking(move || {
                let export = lane.run_exchange_step(ExportedWalkers::empty());
                (index, lane, export)
            });
        }

        let mut completed = 0;
        while let Some(joined) = in_flight.join_next().await {
            let (index, mut lane, export) =
                joined.map_err(|e| DistributedError::Worker(e.to_string()))?;
            completed += 1;
            let import = server.exchange_walkers(export?).await?;

            if issued < budget {
                issued += 1;
                in_flight.spawn_blocking(move || {
                    let export = lane.run_exchange_step(import);
                    (index, lane, export)
                });
            }

            if print_every > 0 && completed % print_every == 0 {
                let best = server.best().await;
                log::info!(
                    "exchange step {completed}/{budget}: best reward {:?}",
                    best.map(|b| b.reward)
                );
            }
        }

        let best = server.best().await;
        log::info!(
            "distributed run complete: {completed} steps, best reward {:?}",
            best.as_ref().map(|b| b.reward)
        );
        Ok(DistributedReport {
            steps_completed: completed,
            best,
        })
    }
}
