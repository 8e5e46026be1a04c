//! Cost of the two argument marshalling modes for a synchronous call.
//!
//! The same call is issued repeatedly, once with typed positional arguments and once with an opaque
//! buffer, and the average round trip of each is reported.
use crate::action::{handler, ActionContext, ActionDescriptor, ActionId, Args, Marshalling, ParamType, Value};
use crate::gas::NodeId;
use crate::world::World;
use crate::RegistryError;

use anyhow::bail;
use std::time::{Duration, Instant};

pub const FIXED: ActionId = ActionId(300);
pub const RAW: ActionId = ActionId(301);

#[derive(Debug, Clone, PartialEq)]
pub struct MarshalledConfig {
    pub iterations: usize,
    /// size of the Raw buffer
    pub buffer_len: usize,
    pub target: NodeId,
}

impl Default for MarshalledConfig {
    fn default() -> Self {
        MarshalledConfig {
            iterations: 50,
            buffer_len: 1024,
            target: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MarshalledReport {
    /// average round trip of a Fixed `(Int, Long)` call
    pub fixed: Duration,
    /// average round trip of a Raw call carrying the buffer
    pub raw: Duration,
    pub iterations: usize,
}

fn fixed_action() -> ActionDescriptor {
    ActionDescriptor::new(
        FIXED,
        Marshalling::Fixed,
        vec![ParamType::Int, ParamType::Long],
        handler(|_ctx: ActionContext, args: Args| async move {
            let a: i32 = args.get(0)?;
            let b: i64 = args.get(1)?;
            crate::serialize(&(a as i64 + b))
        }),
    )
    .with_name("marshalled::fixed")
}

fn raw_action() -> ActionDescriptor {
    ActionDescriptor::new(
        RAW,
        Marshalling::Raw,
        vec![ParamType::Pointer, ParamType::SizeT],
        handler(|_ctx: ActionContext, args: Args| async move {
            let len = args.bytes()?.len() as u64;
            crate::serialize(&len)
        }),
    )
    .with_name("marshalled::raw")
}

/// Register the marshalling actions on every node of `world`
pub fn register(world: &World) -> Result<(), RegistryError> {
    world.register_action(fixed_action())?;
    world.register_action(raw_action())
}

#[tracing::instrument(skip(world))]
pub fn run(world: &World, cfg: &MarshalledConfig) -> anyhow::Result<MarshalledReport> {
    if cfg.iterations == 0 {
        bail!("at least one iteration is needed");
    }
    let mut fixed = Duration::ZERO;
    for i in 0..cfg.iterations {
        let args = Args::Fixed(vec![Value::Int(i as i32), Value::Long(1 << 40)]);
        let start = Instant::now();
        let res = world.block_on(world.call_sync(cfg.target, FIXED, args))?;
        fixed += start.elapsed();
        let sum: i64 = crate::deserialize(&res)?;
        if sum != i as i64 + (1 << 40) {
            bail!("fixed call {} returned {}", i, sum);
        }
    }

    let buffer: Vec<u8> = (0..cfg.buffer_len).map(|i| i as u8).collect();
    let mut raw = Duration::ZERO;
    for i in 0..cfg.iterations {
        let start = Instant::now();
        let res = world.block_on(world.call_sync(cfg.target, RAW, Args::Raw(buffer.clone())))?;
        raw += start.elapsed();
        let len: u64 = crate::deserialize(&res)?;
        if len as usize != cfg.buffer_len {
            bail!("raw call {} saw {} of {} bytes", i, len, cfg.buffer_len);
        }
    }

    let report = MarshalledReport {
        fixed: fixed / cfg.iterations as u32,
        raw: raw / cfg.iterations as u32,
        iterations: cfg.iterations,
    };
    tracing::info!("{:?}", report);
    Ok(report)
}
