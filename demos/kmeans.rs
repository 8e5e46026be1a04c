/// ------------amgas Example: k-means -------------------------
/// Clusters randomly generated 2-D points with Lloyd iterations.
/// The points are partitioned cyclically across the nodes; each iteration
/// broadcasts the centroids, runs an assignment action against every partition,
/// and reduces the per-cluster sums and counts back on node 0.
/// The distributed result is cross-checked against a serial run over the same points.
///
/// usage: kmeans [partitions] [points_per_partition] [k] [max_iterations] [seed]
/// --------------------------------------------------------------------
use amgas::driver::kmeans::{self, KmeansConfig};
use std::time::Instant;

fn arg<T: std::str::FromStr>(args: &[String], i: usize, default: T) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args: Vec<String> = std::env::args().collect();
    let defaults = KmeansConfig::default();
    let cfg = KmeansConfig {
        partitions: arg(&args, 1, defaults.partitions),
        points_per_partition: arg(&args, 2, defaults.points_per_partition),
        k: arg(&args, 3, defaults.k),
        max_iterations: arg(&args, 4, defaults.max_iterations),
        seed: arg(&args, 5, defaults.seed),
        ..defaults
    };

    let world = amgas::WorldBuilder::new().build();
    kmeans::register(&world)?;

    let timer = Instant::now();
    let report = kmeans::run(&world, &cfg)?;
    let elapsed = timer.elapsed();
    println!(
        "{} nodes, {} partitions x {} points, k = {}: {} iterations ({}) in {:?}",
        world.num_nodes(),
        cfg.partitions,
        cfg.points_per_partition,
        cfg.k,
        report.iterations,
        if report.converged { "converged" } else { "iteration limit" },
        elapsed
    );
    for (i, (c, n)) in report.centers.iter().zip(&report.counts).enumerate() {
        println!("  center {}: ({:.3}, {:.3}) with {} points", i, c[0], c[1], n);
    }

    let points: Vec<kmeans::Point> = (0..cfg.partitions)
        .flat_map(|i| kmeans::generate_points(cfg.seed, i, cfg.points_per_partition, cfg.range))
        .collect();
    let (serial, iterations) = kmeans::lloyd_serial(&points, &points[..cfg.k], cfg.max_iterations);
    let max_diff = serial
        .iter()
        .zip(&report.centers)
        .map(|(s, d)| (s[0] - d[0]).abs().max((s[1] - d[1]).abs()))
        .fold(0.0f32, f32::max);
    println!(
        "serial run: {} iterations, largest centroid difference {}",
        iterations, max_diff
    );
    Ok(())
}
