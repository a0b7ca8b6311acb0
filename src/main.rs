//! Fractal swarm CLI - Optimize benchmark functions from JSON configuration.

use std::fs;
use std::path::PathBuf;
use std::time::Instant;

use fractal_swarm::{
    compute::{Function, GaussianModel, Swarm},
    schema::SwarmConfig,
};

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        eprintln!("Usage: {} <config.json> [function] [dim]", args[0]);
        eprintln!();
        eprintln!("Run a fractal swarm search over a benchmark function.");
        eprintln!();
        eprintln!("Arguments:");
        eprintln!("  config.json  Path to swarm configuration file");
        eprintln!("  function     Benchmark: sphere | rastrigin (default: sphere)");
        eprintln!("  dim          Problem dimensions (default: 2)");
        eprintln!();
        eprintln!("Example configuration is generated with --example flag.");
        std::process::exit(1);
    }

    if args[1] == "--example" {
        print_example_config();
        return;
    }

    let config_path = PathBuf::from(&args[1]);
    let function = args.get(2).map(String::as_str).unwrap_or("sphere");
    let dim: usize = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(2);

    // Load configuration
    let config_str = fs::read_to_string(&config_path).unwrap_or_else(|e| {
        eprintln!("Error reading config file: {}", e);
        std::process::exit(1);
    });

    let config: SwarmConfig = serde_json::from_str(&config_str).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        std::process::exit(1);
    });

    let env = match function {
        "sphere" => Function::sphere(dim),
        "rastrigin" => Function::rastrigin(dim),
        other => {
            eprintln!("Unknown benchmark function: {}", other);
            std::process::exit(1);
        }
    }
    .unwrap_or_else(|e| {
        eprintln!("Error building environment: {}", e);
        std::process::exit(1);
    });

    let model = GaussianModel::new(0.5).unwrap_or_else(|e| {
        eprintln!("Error building model: {}", e);
        std::process::exit(1);
    });

    println!("Fractal Swarm Search");
    println!("====================");
    println!("Function: {} ({} dims)", function, dim);
    println!("Walkers: {}", config.n_walkers);
    println!("Epochs: {}", config.max_epochs);
    println!("Minimize: {}", config.walkers.minimize);
    println!();

    let max_epochs = config.max_epochs;
    let mut swarm = Swarm::new(model, env, config).unwrap_or_else(|e| {
        eprintln!("Error building swarm: {}", e);
        std::process::exit(1);
    });

    println!("Running search...");
    let start = Instant::now();

    swarm.reset().unwrap_or_else(|e| {
        eprintln!("Error resetting swarm: {}", e);
        std::process::exit(1);
    });
    println!(
        "Initial best reward: {:.6}",
        swarm.best_reward().unwrap_or(f32::NAN)
    );

    let report_every = (max_epochs / 10).max(1);
    while !swarm.state().is_terminal() {
        if let Err(e) = swarm.step_epoch() {
            eprintln!("Run failed at epoch {}: {}", swarm.epoch(), e);
            std::process::exit(1);
        }

        if swarm.epoch() % report_every == 0 {
            let elapsed = start.elapsed().as_secs_f32();
            let epochs_per_sec = swarm.epoch() as f32 / elapsed;
            println!(
                "  Epoch {}/{}: best={:.6}, {:.1} epochs/s",
                swarm.epoch(),
                max_epochs,
                swarm.best_reward().unwrap_or(f32::NAN),
                epochs_per_sec
            );
        }
    }

    let elapsed = start.elapsed();

    println!();
    println!("Finished in state {:?}", swarm.state());
    println!(
        "Best reward: {:.6}",
        swarm.best_reward().unwrap_or(f32::NAN)
    );
    if let Some(best) = swarm.best_state() {
        println!("Best state: {:?}", best);
    }
    println!(
        "Time: {:.2}s ({:.1} epochs/s)",
        elapsed.as_secs_f32(),
        swarm.epoch() as f32 / elapsed.as_secs_f32()
    );
}

fn print_example_config() {
    let config = SwarmConfig::default();

    println!("Example configuration (config.json):");
    println!("{}", serde_json::to_string_pretty(&config).unwrap());
}
