//! Benchmarks for the swarm scoring and balancing hot path.

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

use fractal_swarm::{
    compute::{BatchState, Function, GaussianModel, Swarm, Walkers, fields},
    schema::{SwarmConfig, WalkersConfig},
};

fn bench_epoch_step(c: &mut Criterion) {
    let mut group = c.benchmark_group("epoch_step");

    for n_walkers in [32, 128, 512, 2048] {
        let config = SwarmConfig {
            n_walkers,
            max_epochs: usize::MAX,
            walkers: WalkersConfig {
                minimize: true,
                seed: Some(1),
                ..WalkersConfig::default()
            },
            ..SwarmConfig::default()
        };

        let model = GaussianModel::new(0.5).unwrap().with_seed(2);
        let env = Function::sphere(8).unwrap().with_seed(3);
        let mut swarm = Swarm::new(model, env, config).unwrap();
        swarm.reset().unwrap();

        group.bench_with_input(
            BenchmarkId::from_parameter(n_walkers),
            &n_walkers,
            |b, _| {
                b.iter(|| {
                    swarm.step_epoch().unwrap();
                    black_box(swarm.epoch());
                });
            },
        );
    }

    group.finish();
}

fn bench_balance_only(c: &mut Criterion) {
    let mut group = c.benchmark_group("balance_only");

    for n_walkers in [128, 1024, 8192] {
        let dim = 8;
        let mut state = BatchState::new(n_walkers);
        let observs: Vec<f32> = (0..n_walkers * dim)
            .map(|i| (i % 97) as f32 * 0.1)
            .collect();
        let rewards: Vec<f32> = (0..n_walkers).map(|i| (i % 31) as f32).collect();
        state.set_f32(fields::STATES, dim, observs.clone()).unwrap();
        state.set_f32(fields::OBSERVS, dim, observs).unwrap();
        state.set_f32(fields::REWARDS, 1, rewards).unwrap();
        state.set_bool(fields::OOBS, vec![false; n_walkers]).unwrap();
        state
            .set_bool(fields::TERMINALS, vec![false; n_walkers])
            .unwrap();

        let mut walkers = Walkers::new(
            n_walkers,
            WalkersConfig {
                seed: Some(4),
                ..WalkersConfig::default()
            },
        );

        group.bench_with_input(
            BenchmarkId::from_parameter(n_walkers),
            &n_walkers,
            |b, _| {
                b.iter(|| {
                    let mut scratch = state.clone();
                    walkers.calculate_virtual_reward(&scratch, None).unwrap();
                    black_box(walkers.balance(&mut scratch).unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_epoch_step, bench_balance_only);
criterion_main!(benches);
