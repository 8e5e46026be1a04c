//! Distributed dot product of two vectors.
//!
//! Element `i` of both vectors lives in partition `i` of a cyclic allocation, as an `(x, y)` pair of
//! little endian `f64`. An initialization wave writes every pair and fires an AND-gate; a product wave
//! then runs against every partition, each result folded into a sum reduction as it arrives.
use crate::action::{handler, ActionContext, ActionDescriptor, ActionId, Args, Marshalling, ParamType, Value};
use crate::dispatcher::InvocationRequest;
use crate::driver::f64_pair;
use crate::world::World;
use crate::RegistryError;

use anyhow::{anyhow, bail};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub const INIT: ActionId = ActionId(200);
pub const PRODUCT: ActionId = ActionId(201);

#[derive(Debug, Clone, PartialEq)]
pub struct DotConfig {
    pub dim: usize,
    pub seed: u64,
}

impl Default for DotConfig {
    fn default() -> Self {
        DotConfig { dim: 1024, seed: 0 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DotReport {
    pub distributed: f64,
    /// the same sum computed in order on the driver
    pub serial: f64,
}

impl DotReport {
    /// Whether both sums agree up to a relative tolerance
    pub fn agrees(&self, tolerance: f64) -> bool {
        let scale = self.serial.abs().max(1.0);
        (self.distributed - self.serial).abs() <= tolerance * scale
    }
}

/// The two input vectors for `cfg`
pub fn vectors(cfg: &DotConfig) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    (0..cfg.dim).map(|_| (rng.gen::<f64>(), rng.gen::<f64>())).unzip()
}

fn init_action() -> ActionDescriptor {
    ActionDescriptor::new(
        INIT,
        Marshalling::Fixed,
        vec![ParamType::Double, ParamType::Double],
        handler(|ctx: ActionContext, args: Args| async move {
            let x: f64 = args.get(0)?;
            let y: f64 = args.get(1)?;
            ctx.with_target(|bytes| {
                bytes[..8].copy_from_slice(&x.to_le_bytes());
                bytes[8..16].copy_from_slice(&y.to_le_bytes());
            })?;
            Ok(vec![])
        }),
    )
    .with_name("dot_product::init")
    .pinned()
}

fn product_action() -> ActionDescriptor {
    ActionDescriptor::new(
        PRODUCT,
        Marshalling::Fixed,
        vec![],
        handler(|ctx: ActionContext, _args: Args| async move {
            let (x, y) = ctx
                .with_target(|bytes| f64_pair(bytes))?
                .ok_or_else(|| anyhow!("element at {:?} is not an (x, y) pair", ctx.target()))?;
            crate::serialize(&(x * y))
        }),
    )
    .with_name("dot_product::product")
    .pinned()
}

/// Register the dot product actions on every node of `world`
pub fn register(world: &World) -> Result<(), RegistryError> {
    world.register_action(init_action())?;
    world.register_action(product_action())
}

#[tracing::instrument(skip(world))]
pub fn run(world: &World, cfg: &DotConfig) -> anyhow::Result<DotReport> {
    if cfg.dim == 0 {
        bail!("dimension must be positive");
    }
    let gas = world.gas();
    let (xs, ys) = vectors(cfg);
    let elements = gas.allocate_cyclic(cfg.dim, 16)?;

    let res = (|| {
        let ready = world.new_and_gate(cfg.dim);
        for (i, (x, y)) in xs.iter().zip(&ys).enumerate() {
            let args = Args::Fixed(vec![Value::Double(*x), Value::Double(*y)]);
            world.invoke(InvocationRequest::new(gas.partition(elements, i)?, INIT, args).with_lco(ready.addr()))?;
        }
        world.block_on(ready.wait())?;
        ready.delete()?;

        let sum = world.new_reduction::<f64>(cfg.dim, |acc| *acc = 0.0, |acc, x| *acc += x);
        for i in 0..cfg.dim {
            world.invoke(
                InvocationRequest::new(gas.partition(elements, i)?, PRODUCT, Args::none()).with_lco(sum.addr()),
            )?;
        }
        world.block_on(sum.wait())?;
        let distributed = sum.get()?;
        sum.delete()?;
        Ok::<_, anyhow::Error>(distributed)
    })();
    world.wait_all();
    gas.deallocate(elements)?;

    let serial = xs.iter().zip(&ys).map(|(x, y)| x * y).sum();
    let report = DotReport {
        distributed: res?,
        serial,
    };
    tracing::debug!("{:?}", report);
    Ok(report)
}
