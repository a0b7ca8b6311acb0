//! Bounded-function environment for benchmark optimization.

use std::fmt;
use std::sync::Arc;

use rand::prelude::*;

use crate::compute::batch::{BatchState, StructuralError, fields};
use crate::compute::swarm::{Environment, SwarmError};
use crate::schema::ConfigError;

/// Rectangular domain bounds, one `[low, high]` interval per dimension.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Bounds {
    low: Vec<f32>,
    high: Vec<f32>,
}

impl Bounds {
    /// Create bounds from per-dimension intervals.
    pub fn new(low: Vec<f32>, high: Vec<f32>) -> Result<Self, ConfigError> {
        if low.is_empty() || low.len() != high.len() {
            return Err(ConfigError::InvalidBounds(format!(
                "low has {} dimensions, high has {}",
                low.len(),
                high.len()
            )));
        }
        for (i, (&lo, &hi)) in low.iter().zip(&high).enumerate() {
            if !(lo < hi) {
                return Err(ConfigError::InvalidBounds(format!(
                    "dimension {i}: low {lo} is not below high {hi}"
                )));
            }
        }
        Ok(Self { low, high })
    }

    /// Create bounds sharing one `[low, high]` interval across `dim` dimensions.
    pub fn from_scalars(low: f32, high: f32, dim: usize) -> Result<Self, ConfigError> {
        Self::new(vec![low; dim], vec![high; dim])
    }

    /// Number of dimensions.
    pub fn dim(&self) -> usize {
        self.low.len()
    }

    /// Lower bound per dimension.
    pub fn low(&self) -> &[f32] {
        &self.low
    }

    /// Upper bound per dimension.
    pub fn high(&self) -> &[f32] {
        &self.high
    }

    /// Whether `point` lies inside the bounds (inclusive).
    pub fn contains(&self, point: &[f32]) -> bool {
        point.len() == self.dim()
            && point
                .iter()
                .zip(self.low.iter().zip(&self.high))
                .all(|(&x, (&lo, &hi))| x >= lo && x <= hi)
    }

    /// Sample one point uniformly inside the bounds.
    pub fn sample(&self, rng: &mut StdRng) -> Vec<f32> {
        self.low
            .iter()
            .zip(&self.high)
            .map(|(&lo, &hi)| rng.gen_range(lo..=hi))
            .collect()
    }
}

/// Batched objective evaluated one walker row at a time.
pub type ObjectiveFn = dyn Fn(&[f32]) -> f32 + Send + Sync;

/// Refines the in-bounds check; returns `true` when the point is *outside*
/// the custom domain.
pub type DomainCheckFn = dyn Fn(&[f32], f32) -> bool + Send + Sync;

/// Environment evaluating an arbitrary function over a bounded domain.
///
/// Actions are interpreted as perturbations added to the current points, or
/// as the new points themselves when built with
/// [`Function::with_absolute_actions`]. Walkers leaving the bounds (or the
/// custom domain, when one is set) are flagged out of bounds.
pub struct Function {
    function: Arc<ObjectiveFn>,
    bounds: Bounds,
    custom_domain_check: Option<Arc<DomainCheckFn>>,
    actions_as_perturbations: bool,
    rng: StdRng,
}

impl Function {
    /// Wrap an objective function over the given bounds.
    pub fn new<F>(function: F, bounds: Bounds) -> Self
    where
        F: Fn(&[f32]) -> f32 + Send + Sync + 'static,
    {
        Self {
            function: Arc::new(function),
            bounds,
            custom_domain_check: None,
            actions_as_perturbations: true,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic generator for reset sampling.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Treat actions as the new points instead of perturbations.
    pub fn with_absolute_actions(mut self) -> Self {
        self.actions_as_perturbations = false;
        self
    }

    /// Restrict the domain beyond the rectangular bounds.
    pub fn with_domain_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&[f32], f32) -> bool + Send + Sync + 'static,
    {
        self.custom_domain_check = Some(Arc::new(check));
        self
    }

    /// Domain bounds.
    pub fn bounds(&self) -> &Bounds {
        &self.bounds
    }

    /// Number of dimensions of the optimized function.
    pub fn n_dims(&self) -> usize {
        self.bounds.dim()
    }

    /// The sphere benchmark `sum(x_i^2)` on `[-10, 10]^dim`.
    pub fn sphere(dim: usize) -> Result<Self, ConfigError> {
        let bounds = Bounds::from_scalars(-10.0, 10.0, dim)?;
        Ok(Self::new(
            |x: &[f32]| x.iter().map(|v| v * v).sum(),
            bounds,
        ))
    }

    /// The Rastrigin benchmark on `[-5.12, 5.12]^dim`.
    pub fn rastrigin(dim: usize) -> Result<Self, ConfigError> {
        let bounds = Bounds::from_scalars(-5.12, 5.12, dim)?;
        Ok(Self::new(
            |x: &[f32]| {
                10.0 * x.len() as f32
                    + x.iter()
                        .map(|v| v * v - 10.0 * (2.0 * std::f32::consts::PI * v).cos())
                        .sum::<f32>()
            },
            bounds,
        ))
    }

    fn out_of_bounds(&self, point: &[f32], reward: f32) -> bool {
        if !self.bounds.contains(point) {
            return true;
        }
        match &self.custom_domain_check {
            Some(check) => check(point, reward),
            None => false,
        }
    }

    fn states_from_points(
        &self,
        points: Vec<f32>,
        batch_size: usize,
    ) -> Result<BatchState, SwarmError> {
        let dim = self.n_dims();
        let mut rewards = Vec::with_capacity(batch_size);
        let mut oobs = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            let point = &points[i * dim..(i + 1) * dim];
            let reward = (self.function)(point);
            rewards.push(reward);
            oobs.push(self.out_of_bounds(point, reward));
        }

        let mut state = BatchState::new(batch_size);
        state.set_f32(fields::STATES, dim, points.clone())?;
        state.set_f32(fields::OBSERVS, dim, points)?;
        state.set_f32(fields::REWARDS, 1, rewards)?;
        state.set_bool(fields::OOBS, oobs)?;
        state.set_bool(fields::TERMINALS, vec![false; batch_size])?;
        Ok(state)
    }
}

impl Environment for Function {
    fn reset(&mut self, batch_size: usize) -> Result<BatchState, SwarmError> {
        let dim = self.n_dims();
        let mut points = Vec::with_capacity(batch_size * dim);
        for _ in 0..batch_size {
            points.extend(self.bounds.sample(&mut self.rng));
        }
        let mut state = self.states_from_points(points, batch_size)?;
        // Fresh episodes start in bounds regardless of where sampling landed.
        state.set_bool(fields::OOBS, vec![false; batch_size])?;
        Ok(state)
    }

    fn step(
        &mut self,
        model_state: &BatchState,
        env_state: &BatchState,
    ) -> Result<BatchState, SwarmError> {
        env_state.ensure_batch_size(model_state)?;
        let n = env_state.n_walkers();
        let dim = self.n_dims();
        model_state.require_f32(fields::ACTIONS, Some(dim))?;
        env_state.require_f32(fields::OBSERVS, Some(dim))?;
        let actions = model_state.f32_data(fields::ACTIONS)?;
        let observs = env_state.f32_data(fields::OBSERVS)?;

        let points: Vec<f32> = if self.actions_as_perturbations {
            observs.iter().zip(actions).map(|(o, a)| o + a).collect()
        } else {
            actions.to_vec()
        };
        self.states_from_points(points, n)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("bounds", &self.bounds)
            .field("actions_as_perturbations", &self.actions_as_perturbations)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_validation() {
        assert!(Bounds::new(vec![0.0], vec![1.0]).is_ok());
        assert!(Bounds::new(vec![0.0], vec![1.0, 2.0]).is_err());
        assert!(Bounds::new(vec![1.0], vec![0.0]).is_err());
        assert!(Bounds::new(vec![], vec![]).is_err());
    }

    #[test]
    fn test_bounds_contains_and_sample() {
        let bounds = Bounds::from_scalars(-1.0, 1.0, 2).unwrap();
        assert!(bounds.contains(&[0.0, 0.5]));
        assert!(!bounds.contains(&[0.0, 1.5]));
        assert!(!bounds.contains(&[0.0]));

        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..16 {
            assert!(bounds.contains(&bounds.sample(&mut rng)));
        }
    }

    #[test]
    fn test_reset_shapes() {
        let mut env = Function::sphere(3).unwrap().with_seed(1);
        let state = env.reset(5).unwrap();
        assert_eq!(state.n_walkers(), 5);
        assert_eq!(state.f32_width(fields::OBSERVS).unwrap(), 3);
        assert_eq!(state.bool_data(fields::OOBS).unwrap(), &[false; 5]);
    }

    #[test]
    fn test_step_perturbs_and_scores() {
        let mut env = Function::sphere(2).unwrap().with_seed(1);
        let mut env_state = BatchState::new(1);
        env_state
            .set_f32(fields::OBSERVS, 2, vec![1.0, 2.0])
            .unwrap();
        let mut model_state = BatchState::new(1);
        model_state
            .set_f32(fields::ACTIONS, 2, vec![0.5, -1.0])
            .unwrap();

        let next = env.step(&model_state, &env_state).unwrap();
        assert_eq!(next.row(fields::OBSERVS, 0).unwrap(), &[1.5, 1.0]);
        let expected = 1.5f32 * 1.5 + 1.0;
        assert!((next.scalar(fields::REWARDS, 0).unwrap() - expected).abs() < 1e-6);
        assert!(!next.bool_data(fields::OOBS).unwrap()[0]);
    }

    #[test]
    fn test_step_flags_out_of_bounds() {
        let mut env = Function::sphere(1).unwrap();
        let mut env_state = BatchState::new(1);
        env_state.set_f32(fields::OBSERVS, 1, vec![9.5]).unwrap();
        let mut model_state = BatchState::new(1);
        model_state.set_f32(fields::ACTIONS, 1, vec![5.0]).unwrap();

        let next = env.step(&model_state, &env_state).unwrap();
        assert!(next.bool_data(fields::OOBS).unwrap()[0]);
    }

    #[test]
    fn test_custom_domain_check() {
        // Reject the right half-plane even though it is inside the bounds.
        let mut env = Function::sphere(1)
            .unwrap()
            .with_domain_check(|point, _reward| point[0] > 0.0);
        let mut env_state = BatchState::new(1);
        env_state.set_f32(fields::OBSERVS, 1, vec![-1.0]).unwrap();
        let mut model_state = BatchState::new(1);
        model_state.set_f32(fields::ACTIONS, 1, vec![2.0]).unwrap();

        let next = env.step(&model_state, &env_state).unwrap();
        assert!(next.bool_data(fields::OOBS).unwrap()[0]);
    }

    #[test]
    fn test_absolute_actions() {
        let mut env = Function::sphere(1).unwrap().with_absolute_actions();
        let mut env_state = BatchState::new(1);
        env_state.set_f32(fields::OBSERVS, 1, vec![5.0]).unwrap();
        let mut model_state = BatchState::new(1);
        model_state.set_f32(fields::ACTIONS, 1, vec![2.0]).unwrap();

        let next = env.step(&model_state, &env_state).unwrap();
        assert_eq!(next.row(fields::OBSERVS, 0).unwrap(), &[2.0]);
    }

    #[test]
    fn test_action_width_mismatch_is_structural() {
        let mut env = Function::sphere(2).unwrap();
        let mut env_state = BatchState::new(1);
        env_state
            .set_f32(fields::OBSERVS, 2, vec![0.0, 0.0])
            .unwrap();
        let mut model_state = BatchState::new(1);
        model_state.set_f32(fields::ACTIONS, 3, vec![0.0; 3]).unwrap();

        let err = env.step(&model_state, &env_state);
        assert!(matches!(
            err,
            Err(SwarmError::Structural(StructuralError::FieldWidth { .. }))
        ));
    }

    #[test]
    fn test_rastrigin_zero_at_origin() {
        let env = Function::rastrigin(2).unwrap();
        let value = (env.function)(&[0.0, 0.0]);
        assert!(value.abs() < 1e-5);
    }
}
