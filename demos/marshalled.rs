/// ------------amgas Example: marshalling cost -------------------------
/// Times a synchronous call whose arguments are typed values (Fixed marshalling)
/// against the same call carrying an opaque buffer (Raw marshalling).
///
/// usage: marshalled [iterations] [buffer_len] [target_node]
/// --------------------------------------------------------------------
use amgas::driver::marshalled::{self, MarshalledConfig};

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let defaults = MarshalledConfig::default();
    let cfg = MarshalledConfig {
        iterations: args.get(1).and_then(|s| s.parse().ok()).unwrap_or(defaults.iterations),
        buffer_len: args.get(2).and_then(|s| s.parse().ok()).unwrap_or(defaults.buffer_len),
        target: args.get(3).and_then(|s| s.parse().ok()).unwrap_or(defaults.target),
    };

    let world = amgas::WorldBuilder::new().build();
    marshalled::register(&world)?;
    let report = marshalled::run(&world, &cfg)?;
    println!(
        "{} calls to node {}: fixed (int, long) {:?} per call, raw {} bytes {:?} per call",
        report.iterations, cfg.target, report.fixed, cfg.buffer_len, report.raw
    );
    Ok(())
}
