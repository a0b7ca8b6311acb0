//! Action samplers for perturbing walker batches.

use rand::prelude::*;
use rand_distr::Normal;

use crate::compute::batch::{BatchState, fields};
use crate::compute::env::Bounds;
use crate::compute::swarm::{Model, SwarmError};
use crate::schema::ConfigError;

/// Samples perturbation actions from `Normal(0, std_dev)` per dimension.
///
/// Optionally samples a per-walker duration uniformly from a configured
/// range, exposed through the `dt` field.
#[derive(Debug)]
pub struct GaussianModel {
    normal: Normal<f32>,
    dt_range: Option<(f32, f32)>,
    rng: StdRng,
}

impl GaussianModel {
    /// Create a sampler with the given standard deviation.
    pub fn new(std_dev: f32) -> Result<Self, ConfigError> {
        let normal = Normal::new(0.0, std_dev)
            .map_err(|_| ConfigError::InvalidModel(format!("invalid std_dev {std_dev}")))?;
        Ok(Self {
            normal,
            dt_range: None,
            rng: StdRng::from_entropy(),
        })
    }

    /// Use a deterministic generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }

    /// Sample a duration per action uniformly from `[low, high]`.
    pub fn with_dt_range(mut self, low: f32, high: f32) -> Result<Self, ConfigError> {
        if !(low > 0.0 && low <= high) {
            return Err(ConfigError::InvalidModel(format!(
                "invalid dt range [{low}, {high}]"
            )));
        }
        self.dt_range = Some((low, high));
        Ok(self)
    }
}

impl Model for GaussianModel {
    fn sample(&mut self, env_state: &BatchState) -> Result<BatchState, SwarmError> {
        let n = env_state.n_walkers();
        let width = env_state.f32_width(fields::OBSERVS)?;

        let actions: Vec<f32> = (0..n * width)
            .map(|_| self.normal.sample(&mut self.rng))
            .collect();
        let mut model_state = BatchState::new(n);
        model_state.set_f32(fields::ACTIONS, width, actions)?;

        if let Some((low, high)) = self.dt_range {
            let dts: Vec<f32> = (0..n).map(|_| self.rng.gen_range(low..=high)).collect();
            model_state.set_f32(fields::DT, 1, dts)?;
        }
        Ok(model_state)
    }
}

/// Samples actions uniformly inside a bounded domain.
///
/// Pairs with environments that treat actions as new points rather than
/// perturbations.
#[derive(Debug)]
pub struct UniformModel {
    bounds: Bounds,
    rng: StdRng,
}

impl UniformModel {
    /// Create a sampler over the given bounds.
    pub fn new(bounds: Bounds) -> Self {
        Self {
            bounds,
            rng: StdRng::from_entropy(),
        }
    }

    /// Use a deterministic generator.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = StdRng::seed_from_u64(seed);
        self
    }
}

impl Model for UniformModel {
    fn sample(&mut self, env_state: &BatchState) -> Result<BatchState, SwarmError> {
        let n = env_state.n_walkers();
        let dim = self.bounds.dim();
        let mut actions = Vec::with_capacity(n * dim);
        for _ in 0..n {
            actions.extend(self.bounds.sample(&mut self.rng));
        }
        let mut model_state = BatchState::new(n);
        model_state.set_f32(fields::ACTIONS, dim, actions)?;
        Ok(model_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed_state(n: usize, width: usize) -> BatchState {
        let mut state = BatchState::new(n);
        state
            .set_f32(fields::OBSERVS, width, vec![0.0; n * width])
            .unwrap();
        state
    }

    #[test]
    fn test_gaussian_shapes() {
        let mut model = GaussianModel::new(1.0).unwrap().with_seed(3);
        let out = model.sample(&observed_state(4, 2)).unwrap();
        assert_eq!(out.n_walkers(), 4);
        assert_eq!(out.f32_width(fields::ACTIONS).unwrap(), 2);
        assert!(!out.has_field(fields::DT));
    }

    #[test]
    fn test_gaussian_dt_sampling() {
        let mut model = GaussianModel::new(0.5)
            .unwrap()
            .with_dt_range(1.0, 3.0)
            .unwrap()
            .with_seed(3);
        let out = model.sample(&observed_state(8, 1)).unwrap();
        for i in 0..8 {
            let dt = out.scalar(fields::DT, i).unwrap();
            assert!((1.0..=3.0).contains(&dt));
        }
    }

    #[test]
    fn test_gaussian_rejects_bad_params() {
        assert!(GaussianModel::new(-1.0).is_err());
        assert!(
            GaussianModel::new(1.0)
                .unwrap()
                .with_dt_range(0.0, 1.0)
                .is_err()
        );
    }

    #[test]
    fn test_uniform_stays_in_bounds() {
        let bounds = Bounds::from_scalars(-2.0, 2.0, 3).unwrap();
        let mut model = UniformModel::new(bounds.clone()).with_seed(9);
        let out = model.sample(&observed_state(6, 3)).unwrap();
        for i in 0..6 {
            assert!(bounds.contains(out.row(fields::ACTIONS, i).unwrap()));
        }
    }
}
