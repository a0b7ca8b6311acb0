//! Parameter server: merges and redistributes exported walkers.

use rand::prelude::*;
use tokio::sync::{mpsc, oneshot};

use crate::compute::walkers::WalkerSnapshot;
use crate::distributed::exchange::{ExchangeError, ExportedWalkers};
use crate::schema::{ConfigError, ServerConfig};

/// Bounded, ranked buffer of exported walker batches.
///
/// Every operation takes `&mut self`, so each exchange is atomic with respect
/// to its caller; concurrent access goes through [`ParamServerHandle`].
#[derive(Debug)]
pub struct ParamServer {
    config: ServerConfig,
    buffer: Vec<ExportedWalkers>,
    best: Option<WalkerSnapshot>,
    rng: StdRng,
}

impl ParamServer {
    /// Create a server with an empty buffer.
    pub fn new(config: ServerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Ok(Self {
            config,
            buffer: Vec::new(),
            best: None,
            rng,
        })
    }

    /// Drop all buffered batches and the global best.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.best = None;
    }

    /// Number of buffered batches.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the buffer holds no batches.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Best walker ever received.
    pub fn best(&self) -> Option<&WalkerSnapshot> {
        self.best.as_ref()
    }

    /// Fold an export batch into the buffer and sample a fresh import batch.
    ///
    /// The incoming batch is validated, ranked by its best reward, and the
    /// worst-ranked batch is evicted once the buffer exceeds `max_len`. The
    /// returned import batch holds `n_import` walkers sampled uniformly from
    /// the buffer, with the global best stamped into slot 0 when
    /// `add_global_best` is set.
    pub fn exchange_walkers(
        &mut self,
        export: ExportedWalkers,
    ) -> Result<ExportedWalkers, ExchangeError> {
        if !export.is_empty() {
            export.validate_uniform()?;
            if let Some(batch_best) = export.best(self.config.minimize)
                && batch_best.improves(self.best.as_ref(), self.config.minimize)
            {
                self.best = Some(batch_best.clone());
            }
            self.insert_ranked(export);
        }
        Ok(self.sample_import())
    }

    fn insert_ranked(&mut self, export: ExportedWalkers) {
        let minimize = self.config.minimize;
        self.buffer.push(export);
        // Best-first; the tail is the eviction end for either direction.
        self.buffer.sort_by(|a, b| {
            let ka = a.best_reward(minimize).unwrap_or(f32::NAN);
            let kb = b.best_reward(minimize).unwrap_or(f32::NAN);
            if minimize {
                ka.total_cmp(&kb)
            } else {
                kb.total_cmp(&ka)
            }
        });
        self.buffer.truncate(self.config.max_len);
    }

    fn sample_import(&mut self) -> ExportedWalkers {
        let mut rows: Vec<WalkerSnapshot> = Vec::with_capacity(self.config.n_import);
        if !self.buffer.is_empty() {
            for _ in 0..self.config.n_import {
                let batch = &self.buffer[self.rng.gen_range(0..self.buffer.len())];
                let walkers = batch.walkers();
                rows.push(walkers[self.rng.gen_range(0..walkers.len())].clone());
            }
        }
        if self.config.add_global_best
            && let Some(best) = &self.best
        {
            match rows.first_mut() {
                Some(slot) => *slot = best.clone(),
                None => rows.push(best.clone()),
            }
        }
        ExportedWalkers::from_walkers(rows)
    }
}

enum ServerRequest {
    Exchange(
        ExportedWalkers,
        oneshot::Sender<Result<ExportedWalkers, ExchangeError>>,
    ),
    Best(oneshot::Sender<Option<WalkerSnapshot>>),
    Reset(oneshot::Sender<()>),
}

/// Handle to a [`ParamServer`] running as a message-passing actor.
///
/// A single task owns the server state; requests are serviced one at a time,
/// which serializes `exchange_walkers` calls from concurrent workers without
/// locking. Must be spawned inside a tokio runtime.
#[derive(Clone)]
pub struct ParamServerHandle {
    tx: mpsc::Sender<ServerRequest>,
}

impl ParamServerHandle {
    /// Spawn the server actor and return a handle to it.
    pub fn spawn(config: ServerConfig) -> Result<Self, ConfigError> {
        let mut server = ParamServer::new(config)?;
        let (tx, mut rx) = mpsc::channel::<ServerRequest>(32);
        tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                match request {
                    ServerRequest::Exchange(batch, reply) => {
                        let _ = reply.send(server.exchange_walkers(batch));
                    }
                    ServerRequest::Best(reply) => {
                        let _ = reply.send(server.best().cloned());
                    }
                    ServerRequest::Reset(reply) => {
                        server.reset();
                        let _ = reply.send(());
                    }
                }
            }
        });
        Ok(Self { tx })
    }

    /// Atomically fold an export batch in and receive an import batch.
    pub async fn exchange_walkers(
        &self,
        export: ExportedWalkers,
    ) -> Result<ExportedWalkers, ExchangeError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ServerRequest::Exchange(export, reply))
            .await
            .map_err(|_| ExchangeError::ServerUnavailable)?;
        response.await.map_err(|_| ExchangeError::ServerUnavailable)?
    }

    /// Best walker ever received by the server.
    pub async fn best(&self) -> Option<WalkerSnapshot> {
        let (reply, response) = oneshot::channel();
        if self.tx.send(ServerRequest::Best(reply)).await.is_err() {
            return None;
        }
        response.await.ok().flatten()
    }

    /// Drop all server state.
    pub async fn reset(&self) -> Result<(), ExchangeError> {
        let (reply, response) = oneshot::channel();
        self.tx
            .send(ServerRequest::Reset(reply))
            .await
            .map_err(|_| ExchangeError::ServerUnavailable)?;
        response.await.map_err(|_| ExchangeError::ServerUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(reward: f32) -> WalkerSnapshot {
        WalkerSnapshot {
            state: vec![reward],
            observ: vec![reward],
            reward,
        }
    }

    fn batch(rewards: &[f32]) -> ExportedWalkers {
        ExportedWalkers::from_walkers(rewards.iter().map(|&r| snapshot(r)).collect())
    }

    fn test_server(max_len: usize, minimize: bool) -> ParamServer {
        ParamServer::new(ServerConfig {
            max_len,
            minimize,
            seed: Some(31),
            ..ServerConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn test_buffer_never_exceeds_max_len() {
        let mut server = test_server(3, false);
        for i in 0..20 {
            server.exchange_walkers(batch(&[i as f32])).unwrap();
            assert!(server.len() <= 3);
        }
        assert_eq!(server.len(), 3);
    }

    #[test]
    fn test_eviction_drops_worst_for_maximize() {
        let mut server = test_server(2, false);
        server.exchange_walkers(batch(&[1.0])).unwrap();
        server.exchange_walkers(batch(&[3.0])).unwrap();
        server.exchange_walkers(batch(&[2.0])).unwrap();

        let kept: Vec<f32> = server
            .buffer
            .iter()
            .map(|b| b.best_reward(false).unwrap())
            .collect();
        assert_eq!(kept, vec![3.0, 2.0]);
    }

    #[test]
    fn test_eviction_drops_worst_for_minimize() {
        let mut server = test_server(2, true);
        server.exchange_walkers(batch(&[1.0])).unwrap();
        server.exchange_walkers(batch(&[3.0])).unwrap();
        server.exchange_walkers(batch(&[2.0])).unwrap();

        let kept: Vec<f32> = server
            .buffer
            .iter()
            .map(|b| b.best_reward(true).unwrap())
            .collect();
        assert_eq!(kept, vec![1.0, 2.0]);
    }

    #[test]
    fn test_tracks_global_best() {
        let mut server = test_server(5, false);
        server.exchange_walkers(batch(&[1.0, 4.0])).unwrap();
        server.exchange_walkers(batch(&[2.0])).unwrap();
        assert_eq!(server.best().unwrap().reward, 4.0);
    }

    #[test]
    fn test_global_best_stamped_into_imports() {
        let mut server = test_server(5, false);
        server.exchange_walkers(batch(&[1.0])).unwrap();
        server.exchange_walkers(batch(&[9.0])).unwrap();

        let import = server.exchange_walkers(batch(&[2.0])).unwrap();
        assert_eq!(import.len(), server.config().n_import);
        assert_eq!(import.walkers()[0].reward, 9.0);
    }

    #[test]
    fn test_empty_exchange_returns_empty_import() {
        let mut server = test_server(5, false);
        let import = server.exchange_walkers(ExportedWalkers::empty()).unwrap();
        assert!(import.is_empty());
    }

    #[test]
    fn test_rejects_ragged_batch() {
        let mut server = test_server(5, false);
        let ragged = ExportedWalkers::from_walkers(vec![
            snapshot(1.0),
            WalkerSnapshot {
                state: vec![0.0, 0.0],
                observ: vec![0.0],
                reward: 2.0,
            },
        ]);
        let err = server.exchange_walkers(ragged);
        assert!(matches!(err, Err(ExchangeError::InvalidBatch(_))));
        assert!(server.is_empty());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut server = test_server(5, false);
        server.exchange_walkers(batch(&[1.0])).unwrap();
        server.reset();
        assert!(server.is_empty());
        assert!(server.best().is_none());
    }

    #[tokio::test]
    async fn test_actor_serializes_concurrent_exchanges() {
        let handle = ParamServerHandle::spawn(ServerConfig {
            max_len: 4,
            minimize: false,
            seed: Some(32),
            ..ServerConfig::default()
        })
        .unwrap();

        let mut tasks = tokio::task::JoinSet::new();
        for i in 0..16 {
            let handle = handle.clone();
            tasks.spawn(async move { handle.exchange_walkers(batch(&[i as f32])).await });
        }
        while let Some(result) = tasks.join_next().await {
            result.unwrap().unwrap();
        }

        let best = handle.best().await.unwrap();
        assert_eq!(best.reward, 15.0);
    }
}
