//! Distributed k-means (Lloyd iterations) over 2-D points.
//!
//! Points are packed little endian `f32` pairs, stored in a cyclic allocation of `partitions` blocks.
//! Every node holds a replica of the current centroids in its own partition of a second cyclic allocation.
//! One iteration is:
//! 1. broadcast the centroids into every replica
//! 2. invoke the assignment action against each data partition; each assigns its points to the nearest
//!    centroid and contributes its per-cluster position sums and counts to two reductions
//! 3. divide sums by counts on the driver; a cluster that attracted no points keeps its previous centroid
//!
//! The run stops once an iteration leaves every centroid unchanged, or after `max_iterations`.
use crate::action::{handler, ActionContext, ActionDescriptor, ActionId, Args, Marshalling, ParamType, Value};
use crate::dispatcher::InvocationRequest;
use crate::driver::{f32_pairs, write_f32_pairs};
use crate::gas::GlobalAddress;
use crate::lco::LcoAddr;
use crate::world::World;
use crate::RegistryError;

use anyhow::{anyhow, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const GENERATE: ActionId = ActionId(100);
pub const SET_CENTERS: ActionId = ActionId(101);
pub const ASSIGN: ActionId = ActionId(102);

pub type Point = [f32; 2];

#[derive(Debug, Clone, PartialEq)]
pub struct KmeansConfig {
    /// number of data partitions, spread round-robin over the nodes
    pub partitions: usize,
    pub points_per_partition: usize,
    /// number of clusters, at most `points_per_partition`
    pub k: usize,
    pub max_iterations: usize,
    /// coordinates are drawn uniformly from `[0, range)`
    pub range: f32,
    pub seed: u64,
}

impl Default for KmeansConfig {
    fn default() -> Self {
        KmeansConfig {
            partitions: 4,
            points_per_partition: 10_000,
            k: 8,
            max_iterations: 20,
            range: 100_000.0,
            seed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KmeansReport {
    pub centers: Vec<Point>,
    /// points assigned to each center during the last iteration
    pub counts: Vec<u32>,
    pub iterations: usize,
    pub converged: bool,
}

/// The points of partition `index`, as the generation action writes them
pub fn generate_points(seed: u64, index: usize, count: usize, range: f32) -> Vec<Point> {
    let mut rng = StdRng::seed_from_u64(seed.wrapping_add(index as u64));
    (0..count)
        .map(|_| [rng.gen_range(0.0..range), rng.gen_range(0.0..range)])
        .collect()
}

/// Index of the center closest to `p`, ties go to the lower index
pub fn nearest(p: &Point, centers: &[Point]) -> usize {
    let mut best = 0;
    let mut best_dist = f32::INFINITY;
    for (i, c) in centers.iter().enumerate() {
        let dx = p[0] - c[0];
        let dy = p[1] - c[1];
        let dist = dx * dx + dy * dy;
        if dist < best_dist {
            best = i;
            best_dist = dist;
        }
    }
    best
}

/// Per-cluster coordinate sums and point counts of `points` against `centers`
pub fn assign(points: &[Point], centers: &[Point]) -> (Vec<[f64; 2]>, Vec<u32>) {
    let mut sums = vec![[0.0f64; 2]; centers.len()];
    let mut counts = vec![0u32; centers.len()];
    for p in points {
        let c = nearest(p, centers);
        sums[c][0] += p[0] as f64;
        sums[c][1] += p[1] as f64;
        counts[c] += 1;
    }
    (sums, counts)
}

#[allow(clippy::ptr_arg)]
pub fn sum_positions(acc: &mut Vec<[f64; 2]>, other: &Vec<[f64; 2]>) {
    if acc.len() < other.len() {
        acc.resize(other.len(), [0.0; 2]);
    }
    for (a, o) in acc.iter_mut().zip(other) {
        a[0] += o[0];
        a[1] += o[1];
    }
}

#[allow(clippy::ptr_arg)]
pub fn sum_counts(acc: &mut Vec<u32>, other: &Vec<u32>) {
    if acc.len() < other.len() {
        acc.resize(other.len(), 0);
    }
    for (a, o) in acc.iter_mut().zip(other) {
        *a += o;
    }
}

/// New centroids from the reduced sums and counts, an empty cluster keeps its previous centroid
pub fn update_centroids(prev: &[Point], sums: &[[f64; 2]], counts: &[u32]) -> Vec<Point> {
    prev.iter()
        .enumerate()
        .map(|(i, old)| match (sums.get(i), counts.get(i)) {
            (Some(sum), Some(&count)) if count > 0 => [
                (sum[0] / count as f64) as f32,
                (sum[1] / count as f64) as f32,
            ],
            _ => *old,
        })
        .collect()
}

/// Single node Lloyd iterations over `points`, returning the centers and the iterations taken
pub fn lloyd_serial(points: &[Point], initial: &[Point], max_iterations: usize) -> (Vec<Point>, usize) {
    let mut centers = initial.to_vec();
    for iteration in 1..=max_iterations {
        let (sums, counts) = assign(points, &centers);
        let next = update_centroids(&centers, &sums, &counts);
        if next == centers {
            return (centers, iteration);
        }
        centers = next;
    }
    (centers, max_iterations)
}

fn generate_action() -> ActionDescriptor {
    ActionDescriptor::new(
        GENERATE,
        Marshalling::Fixed,
        vec![ParamType::ULong, ParamType::SizeT, ParamType::Float],
        handler(|ctx: ActionContext, args: Args| async move {
            let seed: u64 = args.get(0)?;
            let index: usize = args.get(1)?;
            let range: f32 = args.get(2)?;
            ctx.with_target(|bytes| {
                let points = generate_points(seed, index, bytes.len() / 8, range);
                write_f32_pairs(&points, bytes);
            })?;
            Ok(vec![])
        }),
    )
    .with_name("kmeans::generate")
    .pinned()
}

fn set_centers_action() -> ActionDescriptor {
    ActionDescriptor::new(
        SET_CENTERS,
        Marshalling::Raw,
        vec![ParamType::Pointer, ParamType::SizeT],
        handler(|ctx: ActionContext, args: Args| async move {
            let (replicas, centers): (GlobalAddress, Vec<Point>) = crate::deserialize(args.bytes()?)?;
            let gas = ctx.gas();
            let mine = gas.partition(replicas, ctx.node())?;
            if mine.len() != centers.len() * 8 {
                bail!(
                    "replica of {} bytes cannot hold {} centers",
                    mine.len(),
                    centers.len()
                );
            }
            gas.with_pinned(mine, |bytes| write_f32_pairs(&centers, bytes))?;
            Ok(vec![])
        }),
    )
    .with_name("kmeans::set_centers")
}

fn assign_action() -> ActionDescriptor {
    ActionDescriptor::new(
        ASSIGN,
        Marshalling::Fixed,
        vec![ParamType::Addr, ParamType::Lco, ParamType::Lco],
        handler(|ctx: ActionContext, args: Args| async move {
            let replicas: GlobalAddress = args.get(0)?;
            let positions: LcoAddr = args.get(1)?;
            let counts: LcoAddr = args.get(2)?;
            let gas = ctx.gas();
            // the local replica is copied out before the data block is pinned
            let centers = gas.with_pinned(gas.partition(replicas, ctx.node())?, |bytes| f32_pairs(bytes))?;
            let (sums, hits) = ctx.with_target(|bytes| assign(&f32_pairs(bytes), &centers))?;
            ctx.lco_set(positions, &sums).await?;
            ctx.lco_set(counts, &hits).await?;
            Ok(vec![])
        }),
    )
    .with_name("kmeans::assign")
    .pinned()
}

/// Register the k-means actions on every node of `world`
pub fn register(world: &World) -> Result<(), RegistryError> {
    world.register_action(generate_action())?;
    world.register_action(set_centers_action())?;
    world.register_action(assign_action())
}

/// Cluster `cfg.partitions * cfg.points_per_partition` generated points into `cfg.k` clusters
#[tracing::instrument(skip(world))]
pub fn run(world: &World, cfg: &KmeansConfig) -> anyhow::Result<KmeansReport> {
    if cfg.k == 0 || cfg.k > cfg.points_per_partition {
        bail!(
            "k must be in 1..={} (points per partition), got {}",
            cfg.points_per_partition,
            cfg.k
        );
    }
    if !(cfg.range > 0.0) {
        bail!("coordinate range must be positive, got {}", cfg.range);
    }
    let gas = world.gas();
    let data = gas.allocate_cyclic(cfg.partitions, cfg.points_per_partition * 8)?;
    let replicas = gas.allocate_cyclic(world.num_nodes(), cfg.k * 8)?;
    let res = cluster(world, cfg, data, replicas);
    world.wait_all();
    gas.deallocate(replicas)?;
    gas.deallocate(data)?;
    res
}

fn cluster(
    world: &World,
    cfg: &KmeansConfig,
    data: GlobalAddress,
    replicas: GlobalAddress,
) -> anyhow::Result<KmeansReport> {
    let gas = world.gas();
    let generated = world.new_and_gate(cfg.partitions);
    for i in 0..cfg.partitions {
        let args = Args::Fixed(vec![
            Value::ULong(cfg.seed),
            Value::SizeT(i as u64),
            Value::Float(cfg.range),
        ]);
        world.invoke(InvocationRequest::new(gas.partition(data, i)?, GENERATE, args).with_lco(generated.addr()))?;
    }
    world.block_on(generated.wait())?;
    generated.delete()?;

    let first = world.block_on(world.memget(gas.offset(data, 0, cfg.k * 8)?))?;
    let mut centers = f32_pairs(&first);
    let mut counts = vec![0; cfg.k];
    tracing::debug!("initial centers {:?}", centers);

    for iteration in 1..=cfg.max_iterations {
        let payload = crate::serialize(&(replicas, &centers))?;
        world.block_on(world.broadcast(SET_CENTERS, Args::Raw(payload)))?;

        let k = cfg.k;
        let positions = world.new_reduction::<Vec<[f64; 2]>>(
            cfg.partitions,
            move |acc| *acc = vec![[0.0; 2]; k],
            sum_positions,
        );
        let hits = world.new_reduction::<Vec<u32>>(cfg.partitions, move |acc| *acc = vec![0; k], sum_counts);
        let done = world.new_and_gate(cfg.partitions);
        for i in 0..cfg.partitions {
            let args = Args::Fixed(vec![
                Value::Addr(replicas),
                Value::Lco(positions.addr()),
                Value::Lco(hits.addr()),
            ]);
            world.invoke(InvocationRequest::new(gas.partition(data, i)?, ASSIGN, args).with_lco(done.addr()))?;
        }
        // every assignment awaits its own contributions, so the reductions are complete once the gate is
        world.block_on(done.wait())?;
        world.block_on(positions.wait())?;
        world.block_on(hits.wait())?;
        let sums = positions.get()?;
        counts = hits.get()?;
        done.delete()?;
        positions.delete()?;
        hits.delete()?;
        let total: u32 = counts.iter().sum();
        if total as usize != cfg.partitions * cfg.points_per_partition {
            return Err(anyhow!(
                "assigned {} points, expected {}",
                total,
                cfg.partitions * cfg.points_per_partition
            ));
        }

        let next = update_centroids(&centers, &sums, &counts);
        tracing::debug!("iteration {}: {:?}", iteration, next);
        if next == centers {
            return Ok(KmeansReport {
                centers,
                counts,
                iterations: iteration,
                converged: true,
            });
        }
        centers = next;
    }
    Ok(KmeansReport {
        centers,
        counts,
        iterations: cfg.max_iterations,
        converged: false,
    })
}
