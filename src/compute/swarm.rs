//! Swarm epoch loop: model step, environment step, balancing, history.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::compute::batch::{BatchState, StructuralError, fields};
use crate::compute::tree::{HistoryTree, NodeId, Payload, TreeError};
use crate::compute::walkers::{WalkerSnapshot, Walkers};
use crate::schema::{ConfigError, SwarmConfig};

/// Runtime failures of a swarm run.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    /// Shape or batch-size mismatch between pipeline stages. Fatal.
    #[error(transparent)]
    Structural(#[from] StructuralError),
    /// A model, environment or critic failed. Propagated, never retried.
    #[error("collaborator failure: {0}")]
    Collaborator(String),
    /// History bookkeeping referenced an unknown node.
    #[error(transparent)]
    History(#[from] TreeError),
}

/// Produces actions from the current observations.
pub trait Model: Send {
    /// Sample a batch of actions (and optionally per-action durations) for
    /// the walkers described by `env_state`.
    fn sample(&mut self, env_state: &BatchState) -> Result<BatchState, SwarmError>;
}

/// Steps a batch of walkers through the problem dynamics.
pub trait Environment: Send {
    /// Start a new episode of `batch_size` walkers.
    fn reset(&mut self, batch_size: usize) -> Result<BatchState, SwarmError>;

    /// Apply `model_state`'s actions to `env_state`, returning the next
    /// states, observations, rewards and boundary flags.
    fn step(
        &mut self,
        model_state: &BatchState,
        env_state: &BatchState,
    ) -> Result<BatchState, SwarmError>;
}

/// Optional per-walker score merged into the virtual reward.
pub trait Critic: Send {
    /// Evaluate the current batch, one scalar per walker.
    fn evaluate(&mut self, env_state: &BatchState) -> Result<Vec<f32>, SwarmError>;
}

/// Why a run stopped before exhausting its epoch budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopCondition {
    /// Every walker is out of bounds.
    AllOutOfBounds,
    /// The best reward crossed the configured limit.
    RewardLimit,
}

/// Lifecycle of a swarm run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwarmState {
    /// Constructed or reset; no epoch has run.
    Initialized,
    /// At least one epoch has run.
    Running,
    /// Stopped early.
    Terminated(StopCondition),
    /// The epoch budget ran out.
    Exhausted,
}

impl SwarmState {
    /// Whether the run can make no further progress.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SwarmState::Terminated(_) | SwarmState::Exhausted)
    }
}

/// One population of walkers driven through epochs of perturbation and
/// balancing.
pub struct Swarm<M: Model, E: Environment> {
    model: M,
    env: E,
    critic: Option<Box<dyn Critic>>,
    walkers: Walkers,
    tree: Option<HistoryTree>,
    walker_leaves: Vec<NodeId>,
    config: SwarmConfig,
    env_state: BatchState,
    epoch: usize,
    state: SwarmState,
}

impl<M: Model, E: Environment> Swarm<M, E> {
    /// Build a swarm from its collaborators and configuration.
    pub fn new(model: M, env: E, config: SwarmConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let walkers = Walkers::new(config.n_walkers, config.walkers.clone());
        let tree = config.tree.enabled.then(HistoryTree::new);
        let walker_leaves = vec![0; config.n_walkers];
        Ok(Self {
            model,
            env,
            critic: None,
            walkers,
            tree,
            walker_leaves,
            config,
            env_state: BatchState::new(0),
            epoch: 0,
            state: SwarmState::Initialized,
        })
    }

    /// Attach a critic whose scores multiply into the virtual reward.
    pub fn with_critic(mut self, critic: impl Critic + 'static) -> Self {
        self.critic = Some(Box::new(critic));
        self
    }

    /// Current epoch count.
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SwarmState {
        self.state
    }

    /// Swarm configuration.
    pub fn config(&self) -> &SwarmConfig {
        &self.config
    }

    /// Whether lower rewards are better.
    pub fn minimize(&self) -> bool {
        self.config.walkers.minimize
    }

    /// The walker scoring layer.
    pub fn walkers(&self) -> &Walkers {
        &self.walkers
    }

    pub(crate) fn walkers_mut(&mut self) -> &mut Walkers {
        &mut self.walkers
    }

    /// The current batch state, if an episode has started.
    pub fn env_state(&self) -> &BatchState {
        &self.env_state
    }

    /// The recorded history, when enabled.
    pub fn tree(&self) -> Option<&HistoryTree> {
        self.tree.as_ref()
    }

    /// History leaf id currently assigned to each walker.
    pub fn walker_leaves(&self) -> &[NodeId] {
        &self.walker_leaves
    }

    /// Best walker found so far.
    pub fn best(&self) -> Option<&WalkerSnapshot> {
        self.walkers.best()
    }

    /// Best reward found so far.
    pub fn best_reward(&self) -> Option<f32> {
        self.walkers.best().map(|b| b.reward)
    }

    /// State row of the best walker found so far.
    pub fn best_state(&self) -> Option<&[f32]> {
        self.walkers.best().map(|b| b.state.as_slice())
    }

    /// Observation row of the best walker found so far.
    pub fn best_obs(&self) -> Option<&[f32]> {
        self.walkers.best().map(|b| b.observ.as_slice())
    }

    /// Start a fresh episode: reset the environment, walkers and history.
    ///
    /// The best-walker cache is cleared; callers that need it across resets
    /// snapshot it first (see the distributed exchange layer).
    pub fn reset(&mut self) -> Result<(), SwarmError> {
        let state = self.env.reset(self.config.n_walkers)?;
        self.validate_env_state(&state)?;
        self.env_state = state;
        self.walkers.reset(self.config.n_walkers);
        self.walkers.update_best(&self.env_state)?;
        self.epoch = 0;
        self.state = SwarmState::Initialized;
        if let Some(tree) = &mut self.tree {
            tree.reset();
            self.walker_leaves = vec![tree.root(); self.config.n_walkers];
        }
        Ok(())
    }

    /// Advance one epoch: sample actions, step the environment, balance,
    /// record history and check termination.
    ///
    /// A no-op once the swarm is in a terminal state.
    pub fn step_epoch(&mut self) -> Result<(), SwarmError> {
        if self.state.is_terminal() {
            return Ok(());
        }
        self.state = SwarmState::Running;

        let model_state = self.model.sample(&self.env_state)?;
        self.validate_model_state(&model_state)?;

        let mut next = self.env.step(&model_state, &self.env_state)?;
        self.validate_env_state(&next)?;

        let critic_scores = match &mut self.critic {
            Some(critic) => Some(critic.evaluate(&next)?),
            None => None,
        };

        // Score and capture the best on the pre-balance state: a high-reward
        // walker with low diversity can be cloned over below.
        self.walkers
            .calculate_virtual_reward(&next, critic_scores.as_deref())?;
        self.walkers.update_best(&next)?;

        let payloads = if self.tree.is_some() {
            Some(self.collect_payloads(&next, &model_state)?)
        } else {
            None
        };

        let record = self.walkers.balance(&mut next)?;

        if let (Some(tree), Some(payloads)) = (&mut self.tree, payloads) {
            let epoch = self.epoch + 1;
            let mut appended: HashMap<usize, NodeId> = HashMap::new();
            let mut new_leaves = vec![tree.root(); self.config.n_walkers];
            for (i, leaf) in new_leaves.iter_mut().enumerate() {
                let src = if record.cloned(i) {
                    record.companion(i)
                } else {
                    i
                };
                *leaf = match appended.get(&src) {
                    Some(&id) => id,
                    None => {
                        let id =
                            tree.append(self.walker_leaves[src], payloads[src].clone(), epoch)?;
                        appended.insert(src, id);
                        id
                    }
                };
            }
            self.walker_leaves = new_leaves;
            if self.config.tree.prune {
                tree.prune(&self.walker_leaves);
            }
        }

        self.env_state = next;
        self.epoch += 1;
        log::debug!(
            "epoch {}: {} cloned, best {:?}",
            self.epoch,
            record.num_clones(),
            self.best_reward()
        );

        self.check_termination()?;
        Ok(())
    }

    /// Run epochs until a terminal state, reporting progress through `log`
    /// every `report_interval` epochs.
    pub fn run(&mut self, report_interval: usize) -> Result<SwarmState, SwarmError> {
        self.reset()?;
        let interval = report_interval.max(1);
        while !self.state.is_terminal() {
            self.step_epoch()?;
            if self.epoch % interval == 0 {
                log::info!(
                    "epoch {}/{}: best reward {:?}",
                    self.epoch,
                    self.config.max_epochs,
                    self.best_reward()
                );
            }
        }
        log::info!(
            "finished in state {:?} after {} epochs, best reward {:?}",
            self.state,
            self.epoch,
            self.best_reward()
        );
        Ok(self.state)
    }

    /// Snapshot one walker's state, observation and reward.
    pub fn walker_snapshot(&self, index: usize) -> Result<WalkerSnapshot, SwarmError> {
        Ok(WalkerSnapshot {
            state: self.env_state.row(fields::STATES, index)?.to_vec(),
            observ: self.env_state.row(fields::OBSERVS, index)?.to_vec(),
            reward: self.env_state.scalar(fields::REWARDS, index)?,
        })
    }

    /// Overwrite one walker with an externally produced snapshot.
    pub(crate) fn import_walker(
        &mut self,
        index: usize,
        snapshot: &WalkerSnapshot,
    ) -> Result<(), SwarmError> {
        self.env_state
            .set_row(fields::STATES, index, &snapshot.state)?;
        self.env_state
            .set_row(fields::OBSERVS, index, &snapshot.observ)?;
        self.env_state
            .set_row(fields::REWARDS, index, &[snapshot.reward])?;
        self.env_state.set_flag(fields::OOBS, index, false)?;
        self.env_state.set_flag(fields::TERMINALS, index, false)?;
        Ok(())
    }

    fn collect_payloads(
        &self,
        next: &BatchState,
        model_state: &BatchState,
    ) -> Result<Vec<Payload>, SwarmError> {
        let n = self.config.n_walkers;
        let mut payloads = vec![Payload::new(); n];
        for name in &self.config.tree.record_fields {
            let source = if next.has_field(name) {
                next
            } else if model_state.has_field(name) {
                model_state
            } else {
                continue;
            };
            for (i, payload) in payloads.iter_mut().enumerate() {
                payload.insert(name.clone(), source.row(name, i)?.to_vec());
            }
        }
        Ok(payloads)
    }

    fn validate_env_state(&self, state: &BatchState) -> Result<(), StructuralError> {
        if state.n_walkers() != self.config.n_walkers {
            return Err(StructuralError::BatchSize {
                name: "environment output".into(),
                expected: self.config.n_walkers,
                found: state.n_walkers(),
            });
        }
        state.require_f32(fields::STATES, None)?;
        state.require_f32(fields::OBSERVS, None)?;
        state.require_f32(fields::REWARDS, Some(1))?;
        state.require_bool(fields::OOBS)?;
        state.require_bool(fields::TERMINALS)?;
        Ok(())
    }

    fn validate_model_state(&self, state: &BatchState) -> Result<(), StructuralError> {
        if state.n_walkers() != self.config.n_walkers {
            return Err(StructuralError::BatchSize {
                name: "model output".into(),
                expected: self.config.n_walkers,
                found: state.n_walkers(),
            });
        }
        state.require_f32(fields::ACTIONS, None)?;
        if state.has_field(fields::DT) {
            state.require_f32(fields::DT, Some(1))?;
        }
        Ok(())
    }

    fn check_termination(&mut self) -> Result<(), SwarmError> {
        let oobs = self.env_state.bool_data(fields::OOBS)?;
        if oobs.iter().all(|&oob| oob) {
            self.state = SwarmState::Terminated(StopCondition::AllOutOfBounds);
            return Ok(());
        }
        if let (Some(limit), Some(best)) = (self.config.reward_limit, self.walkers.best()) {
            let crossed = if self.minimize() {
                best.reward <= limit
            } else {
                best.reward >= limit
            };
            if crossed {
                self.state = SwarmState::Terminated(StopCondition::RewardLimit);
                return Ok(());
            }
        }
        if self.epoch >= self.config.max_epochs {
            self.state = SwarmState::Exhausted;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute::env::Function;
    use crate::compute::model::GaussianModel;
    use crate::schema::{TreeConfig, WalkersConfig};

    fn test_config(n_walkers: usize, max_epochs: usize) -> SwarmConfig {
        SwarmConfig {
            n_walkers,
            max_epochs,
            reward_limit: None,
            walkers: WalkersConfig {
                minimize: true,
                seed: Some(11),
                ..WalkersConfig::default()
            },
            tree: TreeConfig::default(),
        }
    }

    fn sphere_swarm(n_walkers: usize, max_epochs: usize) -> Swarm<GaussianModel, Function> {
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let env = Function::sphere(2).unwrap().with_seed(6);
        Swarm::new(model, env, test_config(n_walkers, max_epochs)).unwrap()
    }

    #[test]
    fn test_run_exhausts_epoch_budget() {
        let mut swarm = sphere_swarm(16, 20);
        let state = swarm.run(100).unwrap();
        assert_eq!(state, SwarmState::Exhausted);
        assert_eq!(swarm.epoch(), 20);
        assert!(swarm.best_reward().is_some());
        assert_eq!(swarm.best_state().unwrap().len(), 2);
    }

    #[test]
    fn test_minimize_improves_over_epochs() {
        let mut swarm = sphere_swarm(32, 1000);
        swarm.reset().unwrap();
        let initial = swarm.best_reward().unwrap();
        for _ in 0..50 {
            swarm.step_epoch().unwrap();
        }
        let final_best = swarm.best_reward().unwrap();
        assert!(final_best <= initial);
    }

    #[test]
    fn test_reward_limit_terminates() {
        let mut config = test_config(16, 1000);
        // The sphere in [-10, 10]^2 rarely starts below 1.0, but the swarm
        // should find it quickly.
        config.reward_limit = Some(1.0);
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let env = Function::sphere(2).unwrap().with_seed(6);
        let mut swarm = Swarm::new(model, env, config).unwrap();
        let state = swarm.run(1000).unwrap();
        if state == SwarmState::Terminated(StopCondition::RewardLimit) {
            assert!(swarm.best_reward().unwrap() <= 1.0);
            assert!(swarm.epoch() < 1000);
        } else {
            assert_eq!(state, SwarmState::Exhausted);
        }
    }

    struct StuckEnv;

    impl Environment for StuckEnv {
        fn reset(&mut self, batch_size: usize) -> Result<BatchState, SwarmError> {
            let mut state = BatchState::new(batch_size);
            state.set_f32(fields::STATES, 1, vec![0.0; batch_size])?;
            state.set_f32(fields::OBSERVS, 1, vec![0.0; batch_size])?;
            state.set_f32(fields::REWARDS, 1, vec![0.0; batch_size])?;
            state.set_bool(fields::OOBS, vec![false; batch_size])?;
            state.set_bool(fields::TERMINALS, vec![false; batch_size])?;
            Ok(state)
        }

        fn step(
            &mut self,
            _model_state: &BatchState,
            env_state: &BatchState,
        ) -> Result<BatchState, SwarmError> {
            let n = env_state.n_walkers();
            let mut next = env_state.clone();
            next.set_bool(fields::OOBS, vec![true; n])?;
            Ok(next)
        }
    }

    #[test]
    fn test_all_out_of_bounds_terminates() {
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let mut swarm = Swarm::new(model, StuckEnv, test_config(4, 100)).unwrap();
        let state = swarm.run(100).unwrap();
        assert_eq!(state, SwarmState::Terminated(StopCondition::AllOutOfBounds));
        assert_eq!(swarm.epoch(), 1);
    }

    struct ShrinkingEnv;

    impl Environment for ShrinkingEnv {
        fn reset(&mut self, batch_size: usize) -> Result<BatchState, SwarmError> {
            StuckEnv.reset(batch_size)
        }

        fn step(
            &mut self,
            _model_state: &BatchState,
            _env_state: &BatchState,
        ) -> Result<BatchState, SwarmError> {
            StuckEnv.reset(1)
        }
    }

    #[test]
    fn test_batch_size_mismatch_is_structural() {
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let mut swarm = Swarm::new(model, ShrinkingEnv, test_config(4, 100)).unwrap();
        swarm.reset().unwrap();
        let err = swarm.step_epoch();
        assert!(matches!(err, Err(SwarmError::Structural(_))));
    }

    struct FailingModel;

    impl Model for FailingModel {
        fn sample(&mut self, _env_state: &BatchState) -> Result<BatchState, SwarmError> {
            Err(SwarmError::Collaborator("sampler exploded".into()))
        }
    }

    #[test]
    fn test_collaborator_error_propagates() {
        let env = Function::sphere(2).unwrap().with_seed(6);
        let mut swarm = Swarm::new(FailingModel, env, test_config(4, 100)).unwrap();
        swarm.reset().unwrap();
        let err = swarm.step_epoch();
        assert!(matches!(err, Err(SwarmError::Collaborator(_))));
        // History appended before the failure stays valid: here none, but the
        // swarm itself remains queryable.
        assert_eq!(swarm.epoch(), 0);
    }

    struct FlatCritic;

    impl Critic for FlatCritic {
        fn evaluate(&mut self, env_state: &BatchState) -> Result<Vec<f32>, SwarmError> {
            Ok(vec![1.0; env_state.n_walkers()])
        }
    }

    #[test]
    fn test_critic_is_consulted_each_epoch() {
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let env = Function::sphere(2).unwrap().with_seed(6);
        let mut swarm = Swarm::new(model, env, test_config(8, 10))
            .unwrap()
            .with_critic(FlatCritic);
        let state = swarm.run(100).unwrap();
        assert_eq!(state, SwarmState::Exhausted);
        assert!(swarm.best_reward().is_some());
    }

    #[test]
    fn test_history_records_linear_chain_for_single_walker() {
        let mut config = test_config(1, 5);
        config.tree = TreeConfig {
            enabled: true,
            ..TreeConfig::default()
        };
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let env = Function::sphere(2).unwrap().with_seed(6);
        let mut swarm = Swarm::new(model, env, config).unwrap();
        swarm.run(100).unwrap();

        let tree = swarm.tree().unwrap();
        let leaf = swarm.walker_leaves()[0];
        let branch: Vec<_> = tree.iterate_branch(leaf).unwrap().collect();
        // Root plus one node per epoch; a single walker never clones.
        assert_eq!(branch.len(), 6);
        for node in &branch[1..] {
            assert!(node.payload.contains_key("states"));
            assert!(node.payload.contains_key("actions"));
        }
    }

    #[test]
    fn test_history_prunes_to_live_branches() {
        let mut config = test_config(8, 10);
        config.tree = TreeConfig {
            enabled: true,
            ..TreeConfig::default()
        };
        let model = GaussianModel::new(0.5).unwrap().with_seed(5);
        let env = Function::sphere(2).unwrap().with_seed(6);
        let mut swarm = Swarm::new(model, env, config).unwrap();
        swarm.run(100).unwrap();

        let tree = swarm.tree().unwrap();
        // Every stored node lies on a branch of some live leaf.
        let mut on_live_branch = std::collections::HashSet::new();
        for &leaf in swarm.walker_leaves() {
            on_live_branch.extend(tree.branch_ids(leaf).unwrap());
        }
        assert_eq!(on_live_branch.len(), tree.len());

        // And every live leaf reconstructs from the root.
        for &leaf in swarm.walker_leaves() {
            let branch: Vec<_> = tree.iterate_branch(leaf).unwrap().collect();
            assert_eq!(branch[0].id, tree.root());
        }
    }
}
