/// ------------amgas Example: dot product -------------------------
/// Stores one (x, y) element pair per partition of a cyclic allocation,
/// initializes every element with an action counted by an AND-gate, then
/// folds the per-element products into a sum reduction on node 0.
///
/// usage: dot_product [dim] [seed]
/// --------------------------------------------------------------------
use amgas::driver::dot_product::{self, DotConfig};
use std::time::Instant;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let defaults = DotConfig::default();
    let cfg = DotConfig {
        dim: args.get(1).and_then(|s| s.parse().ok()).unwrap_or(defaults.dim),
        seed: args.get(2).and_then(|s| s.parse().ok()).unwrap_or(defaults.seed),
    };

    let world = amgas::WorldBuilder::new().build();
    dot_product::register(&world)?;

    let timer = Instant::now();
    let report = dot_product::run(&world, &cfg)?;
    println!(
        "dim {} over {} nodes: distributed {} serial {} ({}) in {:?}",
        cfg.dim,
        world.num_nodes(),
        report.distributed,
        report.serial,
        if report.agrees(1e-9) { "match" } else { "MISMATCH" },
        timer.elapsed()
    );
    Ok(())
}
