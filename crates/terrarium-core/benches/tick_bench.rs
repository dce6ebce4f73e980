use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use terrarium_core::{Simulation, TerrariumConfig};

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn bench_config() -> TerrariumConfig {
    TerrariumConfig {
        habitat_width: env_u64("TERRARIUM_BENCH_WIDTH", 100) as u32,
        rng_seed: Some(env_u64("TERRARIUM_BENCH_SEED", 0xC0FFEE)),
        history_capacity: 0,
        ..TerrariumConfig::default()
    }
}

fn bench_tick(c: &mut Criterion) {
    let ticks = env_u64("TERRARIUM_BENCH_TICKS", 25);

    c.bench_function("tick_pipeline", |b| {
        b.iter_batched(
            || Simulation::new(bench_config()).expect("bench config is valid"),
            |mut simulation| {
                for _ in 0..ticks {
                    black_box(simulation.step());
                }
                simulation
            },
            BatchSize::LargeInput,
        );
    });

    c.bench_function("render_board", |b| {
        let mut simulation = Simulation::new(bench_config()).expect("bench config is valid");
        for _ in 0..ticks {
            simulation.step();
        }
        b.iter(|| black_box(simulation.render_board()));
    });
}

criterion_group!(benches, bench_tick);
criterion_main!(benches);
