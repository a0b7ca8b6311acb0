//! Walker scoring and balancing.
//!
//! Computes the virtual reward (normalized reward x normalized diversity),
//! decides which walkers clone onto a randomly drawn companion, and tracks
//! the best solution found so far.

use rand::prelude::*;
use serde::{Deserialize, Serialize};

use crate::compute::batch::{BatchState, CloneRecord, StructuralError, fields};
use crate::schema::WalkersConfig;

/// A persisted copy of one walker's state, observation and reward.
///
/// Used for the best-walker cache and as the row type of exchange batches.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalkerSnapshot {
    /// Environment state row.
    pub state: Vec<f32>,
    /// Observation row.
    pub observ: Vec<f32>,
    /// Cumulative reward.
    pub reward: f32,
}

impl WalkerSnapshot {
    /// Whether this snapshot strictly improves on `other` for the given
    /// optimization direction. A missing `other` is always improved upon.
    pub fn improves(&self, other: Option<&WalkerSnapshot>, minimize: bool) -> bool {
        match other {
            None => true,
            Some(best) => {
                if minimize {
                    self.reward < best.reward
                } else {
                    self.reward > best.reward
                }
            }
        }
    }
}

/// Scores a batch of walkers and redistributes them through cloning.
#[derive(Debug)]
pub struct Walkers {
    config: WalkersConfig,
    n_walkers: usize,
    rng: StdRng,
    virtual_rewards: Vec<f32>,
    clone_probs: Vec<f32>,
    best: Option<WalkerSnapshot>,
}

impl Walkers {
    /// Create a walker set of the given batch size.
    pub fn new(n_walkers: usize, config: WalkersConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            n_walkers,
            rng,
            virtual_rewards: vec![0.0; n_walkers],
            clone_probs: vec![0.0; n_walkers],
            best: None,
        }
    }

    /// Reallocate and zero all per-walker fields; clears the best-walker cache.
    pub fn reset(&mut self, n_walkers: usize) {
        self.n_walkers = n_walkers;
        self.virtual_rewards = vec![0.0; n_walkers];
        self.clone_probs = vec![0.0; n_walkers];
        self.best = None;
    }

    /// Batch size this walker set operates on.
    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    /// Whether lower rewards are better.
    pub fn minimize(&self) -> bool {
        self.config.minimize
    }

    /// Virtual rewards from the latest scoring pass.
    pub fn virtual_rewards(&self) -> &[f32] {
        &self.virtual_rewards
    }

    /// Clone probabilities from the latest balancing pass.
    pub fn clone_probs(&self) -> &[f32] {
        &self.clone_probs
    }

    /// Best walker found so far, if any.
    pub fn best(&self) -> Option<&WalkerSnapshot> {
        self.best.as_ref()
    }

    /// Offer an externally produced snapshot to the best-walker cache.
    ///
    /// Accepted only on strict improvement; returns whether it was accepted.
    pub fn consider_best(&mut self, candidate: &WalkerSnapshot) -> bool {
        if candidate.improves(self.best.as_ref(), self.config.minimize) {
            self.best = Some(candidate.clone());
            true
        } else {
            false
        }
    }

    /// Compute the virtual reward of every walker from the given state.
    ///
    /// Rewards are normalized to `[0, 1]` against the batch min/max (with the
    /// minimize direction folded in by negating first), diversity is the
    /// normalized Euclidean distance to one uniformly drawn companion, and
    /// the two are combined as `reward^reward_scale * distance^distance_scale`.
    /// Out-of-bounds and terminal walkers score 0. An optional critic vector
    /// multiplies into the result.
    pub fn calculate_virtual_reward(
        &mut self,
        state: &BatchState,
        critic: Option<&[f32]>,
    ) -> Result<&[f32], StructuralError> {
        let n = self.check_batch(state)?;
        state.require_f32(fields::REWARDS, Some(1))?;
        let rewards = state.f32_data(fields::REWARDS)?;
        let observs = state.f32_data(fields::OBSERVS)?;
        let width = state.f32_width(fields::OBSERVS)?;
        let oobs = state.bool_data(fields::OOBS)?;
        let terminals = state.bool_data(fields::TERMINALS)?;
        if let Some(scores) = critic
            && scores.len() != n
        {
            return Err(StructuralError::BatchSize {
                name: "critic".into(),
                expected: n,
                found: scores.len(),
            });
        }

        let oriented: Vec<f32> = if self.config.minimize {
            rewards.iter().map(|r| -r).collect()
        } else {
            rewards.to_vec()
        };
        let norm_rewards = normalize_unit(&oriented, self.config.eps);

        let mut distances = vec![0.0f32; n];
        if n > 1 {
            for (i, distance) in distances.iter_mut().enumerate() {
                let j = companion_excluding(&mut self.rng, i, n);
                *distance = euclidean(
                    &observs[i * width..(i + 1) * width],
                    &observs[j * width..(j + 1) * width],
                );
            }
        }
        let norm_distances = normalize_unit(&distances, self.config.eps);

        for i in 0..n {
            let alive = !oobs[i] && !terminals[i];
            let mut score = if alive {
                norm_rewards[i].powf(self.config.reward_scale)
                    * norm_distances[i].powf(self.config.distance_scale)
            } else {
                0.0
            };
            if let Some(scores) = critic {
                score *= scores[i];
            }
            self.virtual_rewards[i] = score;
        }
        Ok(&self.virtual_rewards)
    }

    /// Decide which walkers clone onto a companion and apply the decision.
    ///
    /// Each walker draws one companion uniformly (excluding itself) and clones
    /// with probability `(vr_companion - vr_self) / max(vr_self, eps)`,
    /// clamped to `[0, 1]`. Dead walkers always clone onto an alive companion.
    /// Cloned walkers become exact row copies of their companion across every
    /// field of `state`. Degenerate batches (single walker, or nothing alive)
    /// make this a no-op.
    pub fn balance(&mut self, state: &mut BatchState) -> Result<CloneRecord, StructuralError> {
        let n = self.check_batch(state)?;
        let oobs = state.bool_data(fields::OOBS)?;
        let terminals = state.bool_data(fields::TERMINALS)?;
        let dead: Vec<bool> = oobs
            .iter()
            .zip(terminals)
            .map(|(&oob, &terminal)| oob || terminal)
            .collect();
        let any_alive = dead.iter().any(|&d| !d);

        self.clone_probs.iter_mut().for_each(|p| *p = 0.0);
        if n < 2 || !any_alive {
            return Ok(CloneRecord::no_op(n));
        }

        let mut will_clone = vec![false; n];
        let mut companions = vec![0usize; n];
        for i in 0..n {
            let j = companion_excluding(&mut self.rng, i, n);
            companions[i] = j;
            let vr_i = self.virtual_rewards[i];
            let vr_j = self.virtual_rewards[j];
            let p = ((vr_j - vr_i) / vr_i.max(self.config.eps)).clamp(0.0, 1.0);
            self.clone_probs[i] = p;
            // A dead companion has virtual reward 0, so p clamps to 0 and the
            // draw below never selects it as a source.
            will_clone[i] = if dead[i] && !dead[j] {
                true
            } else {
                self.rng.gen_bool(p as f64)
            };
        }

        let record = CloneRecord::new(will_clone, companions)?;
        state.apply_clones(&record)?;
        Ok(record)
    }

    /// Update the best-walker cache from the in-bounds walkers of `state`.
    ///
    /// Returns whether an update occurred. Comparison is strict, per the
    /// minimize/maximize direction.
    pub fn update_best(&mut self, state: &BatchState) -> Result<bool, StructuralError> {
        let n = self.check_batch(state)?;
        state.require_f32(fields::REWARDS, Some(1))?;
        let rewards = state.f32_data(fields::REWARDS)?;
        let oobs = state.bool_data(fields::OOBS)?;

        let mut candidate: Option<usize> = None;
        for i in 0..n {
            if oobs[i] {
                continue;
            }
            candidate = match candidate {
                None => Some(i),
                Some(c) => {
                    let better = if self.config.minimize {
                        rewards[i] < rewards[c]
                    } else {
                        rewards[i] > rewards[c]
                    };
                    Some(if better { i } else { c })
                }
            };
        }

        let Some(idx) = candidate else {
            return Ok(false);
        };
        let snapshot = WalkerSnapshot {
            state: state.row(fields::STATES, idx)?.to_vec(),
            observ: state.row(fields::OBSERVS, idx)?.to_vec(),
            reward: rewards[idx],
        };
        if snapshot.improves(self.best.as_ref(), self.config.minimize) {
            self.best = Some(snapshot);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Indices of the `k` lowest-virtual-reward walkers, worst first.
    pub fn worst_virtual_indices(&self, k: usize) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.n_walkers).collect();
        order.sort_by(|&a, &b| self.virtual_rewards[a].total_cmp(&self.virtual_rewards[b]));
        order.truncate(k.min(self.n_walkers));
        order
    }

    /// Indices of the `k` best walkers of `state` by raw reward, best first.
    pub fn top_reward_indices(
        &self,
        state: &BatchState,
        k: usize,
    ) -> Result<Vec<usize>, StructuralError> {
        let rewards = state.f32_data(fields::REWARDS)?;
        let mut order: Vec<usize> = (0..state.n_walkers()).collect();
        if self.config.minimize {
            order.sort_by(|&a, &b| rewards[a].total_cmp(&rewards[b]));
        } else {
            order.sort_by(|&a, &b| rewards[b].total_cmp(&rewards[a]));
        }
        order.truncate(k.min(state.n_walkers()));
        Ok(order)
    }

    fn check_batch(&self, state: &BatchState) -> Result<usize, StructuralError> {
        if state.n_walkers() != self.n_walkers {
            return Err(StructuralError::Incompatible(format!(
                "state holds {} walkers, walker set holds {}",
                state.n_walkers(),
                self.n_walkers
            )));
        }
        Ok(self.n_walkers)
    }
}

/// Draw a companion for walker `i` uniformly from `0..n`, excluding `i`.
fn companion_excluding(rng: &mut StdRng, i: usize, n: usize) -> usize {
    let j = rng.gen_range(0..n - 1);
    if j >= i { j + 1 } else { j }
}

/// Scale values to `[0, 1]` against their min/max.
///
/// A degenerate batch (zero or near-zero range) maps every element to the
/// constant 1.0 so that downstream products fall back to the other factor.
fn normalize_unit(values: &[f32], eps: f32) -> Vec<f32> {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let range = max - min;
    if !range.is_finite() || range <= eps {
        return vec![1.0; values.len()];
    }
    values.iter().map(|v| (v - min) / range).collect()
}

/// Euclidean distance between two observation rows.
fn euclidean(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f32>()
        .sqrt()
}
