use std::time::{Instant, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing_subscriber::EnvFilter;

use merkle_puzzles::{lookup, solve, PuzzleStore, DEFAULT_PUZZLE_COUNT};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Process-seeded RNG, reseeded from the wall clock at every startup
    let clock = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("system clock is before the unix epoch")?
        .as_secs();
    let mut rng = StdRng::seed_from_u64(clock);

    // Alice fills her table
    let started = Instant::now();
    let store = PuzzleStore::generate_all(DEFAULT_PUZZLE_COUNT, &mut rng)
        .context("puzzle generation failed")?;
    let elapsed = started.elapsed().as_secs_f64();

    // Bob brute-forces one puzzle, Alice looks the identifier up
    let solution = solve(&store, &mut rng).context("brute force exhausted the weak keyspace")?;
    let secret = lookup(&store, &solution.id)
        .context("no stored puzzle matches the recovered identifier")?;

    println!("Shared secret between Bob and Alice will be: {secret}");
    println!("{} puzzles were generated in {elapsed:.3}s", store.len());
    println!("Average generations per second: {:.0} G/s", store.len() as f64 / elapsed);

    Ok(())
}
