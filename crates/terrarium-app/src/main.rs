//! Headless driver: runs a terrarium for a fixed number of ticks and logs
//! population telemetry at a configurable interval.
//!
//! Configuration comes from the environment:
//! `TERRARIUM_SEED`, `TERRARIUM_TICKS`, `TERRARIUM_WIDTH`,
//! `TERRARIUM_LOG_INTERVAL`, and `RUST_LOG` for the tracing filter.

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use terrarium_core::{Simulation, TerrariumConfig};

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .with_context(|| format!("{name} must be an unsigned integer, got {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() -> Result<()> {
    init_tracing();

    let ticks = env_u64("TERRARIUM_TICKS", 2_000)?;
    let log_interval = env_u64("TERRARIUM_LOG_INTERVAL", 100)?.max(1);
    let mut config = TerrariumConfig {
        habitat_width: env_u64("TERRARIUM_WIDTH", 100)? as u32,
        ..TerrariumConfig::default()
    };
    if let Ok(raw) = std::env::var("TERRARIUM_SEED") {
        let seed = raw
            .parse()
            .with_context(|| format!("TERRARIUM_SEED must be an unsigned integer, got {raw:?}"))?;
        config.rng_seed = Some(seed);
    }

    let mut simulation =
        Simulation::new(config).context("failed to construct the simulation")?;
    info!(
        width = simulation.habitat().width(),
        organisms = simulation.organism_count(),
        food = simulation.food_count(),
        "terrarium seeded"
    );

    for _ in 0..ticks {
        let summary = simulation.step();
        if summary.tick.0 % log_interval == 0 {
            info!(
                tick = summary.tick.0,
                organisms = summary.organisms,
                food = summary.food,
                births = summary.births,
                deaths = summary.deaths,
                food_spawned = summary.food_spawned,
                avg_energy = f64::from(summary.average_energy),
                avg_age = f64::from(summary.average_age),
                occupied = simulation.habitat().occupied_cells(),
                "tick complete"
            );
            if let Some(traits) = simulation.trait_averages() {
                debug!(
                    evolving = traits.organisms,
                    speed = f64::from(traits.speed),
                    sight = f64::from(traits.sight),
                    size = f64::from(traits.size),
                    red = f64::from(traits.red),
                    green = f64::from(traits.green),
                    blue = f64::from(traits.blue),
                    "evolving trait averages"
                );
            }
        }
        if summary.organisms == 0 {
            warn!(tick = summary.tick.0, "population extinct, stopping early");
            break;
        }
    }

    info!(
        tick = simulation.tick().0,
        organisms = simulation.organism_count(),
        food = simulation.food_count(),
        "run finished"
    );
    Ok(())
}
