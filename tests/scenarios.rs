use amgas::driver::kmeans::{sum_counts, sum_positions, update_centroids};
use amgas::{
    handler, ActionDescriptor, ActionId, Args, Continuation, DispatchError, GasError, GlobalAddress,
    InvocationRequest, LcoError, Marshalling, ParamType, RegistryError, Value, World, WorldBuilder,
};
use futures::FutureExt;
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;

const ECHO: ActionId = ActionId(1);
const ADD: ActionId = ActionId(2);
const FAIL: ActionId = ActionId(3);
const PANIC: ActionId = ActionId(4);
const STORE: ActionId = ActionId(5);
const DOUBLE: ActionId = ActionId(6);
const RECORD: ActionId = ActionId(7);
const TOUCH: ActionId = ActionId(8);
const HOLD: ActionId = ActionId(9);
const PEEK: ActionId = ActionId(10);

fn world(nodes: usize) -> World {
    WorldBuilder::new()
        .with_nodes(nodes)
        .with_threads(2)
        .with_heap_size(1 << 20)
        .build()
}

fn raw_params() -> Vec<ParamType> {
    vec![ParamType::Pointer, ParamType::SizeT]
}

fn register_common(world: &World) {
    world
        .register_action(ActionDescriptor::new(
            ECHO,
            Marshalling::Raw,
            raw_params(),
            handler(|_ctx, args| async move { Ok(args.into_bytes()?) }),
        ))
        .unwrap();
    world
        .register_action(ActionDescriptor::new(
            ADD,
            Marshalling::Fixed,
            vec![ParamType::Int, ParamType::Long],
            handler(|_ctx, args| async move {
                let a: i32 = args.get(0)?;
                let b: i64 = args.get(1)?;
                amgas::serialize(&(a as i64 + b))
            }),
        ))
        .unwrap();
    world
        .register_action(ActionDescriptor::new(
            FAIL,
            Marshalling::Fixed,
            vec![],
            handler(|ctx, _args| async move {
                Err(anyhow::anyhow!("refused on node {}", ctx.node()))
            }),
        ))
        .unwrap();
    world
        .register_action(ActionDescriptor::new(
            PANIC,
            Marshalling::Fixed,
            vec![],
            handler(|ctx, _args| async move {
                if ctx.node() > 0 {
                    panic!("handler blew up on node {}", ctx.node());
                }
                Ok(vec![])
            }),
        ))
        .unwrap();
}

#[test]
#[serial]
fn and_gate_fires_once_and_rejects_overflow() {
    let world = world(4);
    let gate = world.new_and_gate(4);
    for node in 0..4 {
        assert_eq!(world.block_on(world.node(node).lco_signal(gate.addr())), Ok(()));
    }
    assert!(gate.is_complete());
    assert_eq!(world.block_on(gate.wait()), Ok(()));
    assert_eq!(
        world.block_on(world.node(3).lco_signal(gate.addr())),
        Err(DispatchError::Lco(LcoError::OverflowSignal {
            addr: gate.addr(),
            expected: 4
        }))
    );
    assert_eq!(gate.arrived(), 4);
    gate.delete().unwrap();
    assert_eq!(
        world.block_on(world.node(1).lco_signal(gate.addr())),
        Err(DispatchError::Lco(LcoError::Deleted(gate.addr())))
    );
}

#[test]
#[serial]
fn and_gate_delete_requires_completion() {
    let world = world(2);
    let gate = world.new_and_gate(2);
    world.block_on(world.node(1).lco_signal(gate.addr())).unwrap();
    assert_eq!(
        gate.delete(),
        Err(LcoError::ObjectInUse {
            waiters: 0,
            outstanding: 1
        })
    );
    assert!(!gate.is_complete());
    assert_eq!(gate.wait().now_or_never(), None);
    gate.signal().unwrap();
    assert_eq!(world.block_on(gate.wait()), Ok(()));
    gate.delete().unwrap();
}

#[test]
#[serial]
fn reduction_is_order_independent() {
    let world = world(3);
    for order in [[0usize, 1, 2], [2, 0, 1], [1, 2, 0]] {
        let values = [2.0f64, 3.0, 5.0];
        let sum = world.new_reduction::<f64>(3, |acc| *acc = 0.0, |acc, x| *acc += x);
        for i in order {
            world
                .block_on(world.node(i).lco_set(sum.addr(), &values[i]))
                .unwrap();
        }
        world.block_on(sum.wait()).unwrap();
        assert_eq!(sum.get(), Ok(10.0));
        sum.delete().unwrap();
    }
}

#[test]
#[serial]
fn reduction_get_before_completion() {
    let world = world(2);
    let max = world.new_reduction::<i64>(2, |acc| *acc = i64::MIN, |acc, x| *acc = (*acc).max(*x));
    max.set(&-4).unwrap();
    assert_eq!(
        max.get(),
        Err(LcoError::NotReady {
            arrived: 1,
            expected: 2
        })
    );
    world.block_on(world.node(1).lco_set(max.addr(), &-9i64)).unwrap();
    world.block_on(max.wait()).unwrap();
    assert_eq!(max.get(), Ok(-4));
}

#[test]
#[serial]
fn future_receives_one_invocation_result() {
    let world = world(2);
    register_common(&world);
    let sum = world.new_future::<i64>();
    assert!(matches!(sum.get(), Err(LcoError::NotReady { arrived: 0, expected: 1 })));
    let args = Args::Fixed(vec![Value::Int(7), Value::Long(1 << 33)]);
    world
        .invoke(InvocationRequest::new(1, ADD, args).with_lco(sum.addr()))
        .unwrap();
    world.block_on(sum.wait()).unwrap();
    assert_eq!(sum.get(), Ok(7 + (1 << 33)));
    assert!(matches!(
        world.block_on(world.node(1).lco_set(sum.addr(), &0i64)),
        Err(DispatchError::Lco(LcoError::OverflowSignal { expected: 1, .. }))
    ));
    assert!(matches!(
        sum.set(&0),
        Err(LcoError::OverflowSignal { expected: 1, .. })
    ));
    assert_eq!(sum.get(), Ok(7 + (1 << 33)));
    sum.delete().unwrap();

    let refused = world.new_future::<i64>();
    world
        .invoke(InvocationRequest::new(1, FAIL, Args::none()).with_lco(refused.addr()))
        .unwrap();
    assert!(matches!(
        world.block_on(refused.wait()),
        Err(LcoError::FailedArrivals { .. })
    ));
    assert!(matches!(refused.get(), Err(LcoError::FailedArrivals { .. })));
    world.wait_all();
    refused.delete().unwrap();
}

#[test]
#[serial]
fn kmeans_partials_combine_across_nodes() {
    let world = world(3);
    let positions = world.new_reduction::<Vec<[f64; 2]>>(2, |acc| *acc = vec![[0.0; 2]], sum_positions);
    let counts = world.new_reduction::<Vec<u32>>(2, |acc| *acc = vec![0], sum_counts);
    let node1 = world.node(1);
    let node2 = world.node(2);
    world
        .block_on(node1.lco_set(positions.addr(), &vec![[10.0f64, 20.0]]))
        .unwrap();
    world.block_on(node1.lco_set(counts.addr(), &vec![3u32])).unwrap();
    world
        .block_on(node2.lco_set(positions.addr(), &vec![[5.0f64, 0.0]]))
        .unwrap();
    world.block_on(node2.lco_set(counts.addr(), &vec![1u32])).unwrap();
    world.block_on(positions.wait()).unwrap();
    world.block_on(counts.wait()).unwrap();
    let centers = update_centroids(&[[0.0, 0.0]], &positions.get().unwrap(), &counts.get().unwrap());
    assert_eq!(centers, vec![[3.75, 5.0]]);
}

#[test]
#[serial]
fn broadcast_fills_every_replica() {
    let world = world(3);
    world
        .register_action(ActionDescriptor::new(
            STORE,
            Marshalling::Raw,
            raw_params(),
            handler(|ctx, args| async move {
                let (base, values): (GlobalAddress, Vec<f64>) = amgas::deserialize(args.bytes()?)?;
                let gas = ctx.gas();
                gas.with_pinned(gas.partition(base, ctx.node())?, |bytes| {
                    for (v, out) in values.iter().zip(bytes.chunks_exact_mut(8)) {
                        out.copy_from_slice(&v.to_le_bytes());
                    }
                })?;
                Ok(vec![ctx.node() as u8])
            }),
        ))
        .unwrap();
    let base = world.gas().allocate_cyclic(3, 16).unwrap();
    let payload = amgas::serialize(&(base, vec![1.5f64, 2.5])).unwrap();
    let results = world.block_on(world.broadcast(STORE, Args::Raw(payload))).unwrap();
    assert_eq!(results, vec![vec![0], vec![1], vec![2]]);
    for node in 0..3 {
        let gas = world.node(node).gas();
        let copy = gas.partition(base, node).unwrap();
        assert_eq!(copy.node(), node);
        let values = gas
            .with_pinned(copy, |bytes| {
                bytes
                    .chunks_exact(8)
                    .map(|c| f64::from_le_bytes(c.try_into().unwrap()))
                    .collect::<Vec<_>>()
            })
            .unwrap();
        assert_eq!(values, vec![1.5, 2.5]);
    }
    world.gas().deallocate(base).unwrap();
}

#[test]
#[serial]
fn fixed_and_raw_arguments_arrive_intact() {
    let world = world(2);
    register_common(&world);
    let res = world
        .block_on(world.call_sync(0, ADD, Args::Fixed(vec![Value::Int(7), Value::Long(1 << 33)])))
        .unwrap();
    assert_eq!(amgas::deserialize::<i64>(&res).unwrap(), 7 + (1 << 33));

    let buffer: Vec<u8> = (0..1024).map(|i| (i % 251) as u8).collect();
    let res = world
        .block_on(world.call_sync(1, ECHO, Args::Raw(buffer.clone())))
        .unwrap();
    assert_eq!(res.len(), 1024);
    assert_eq!(res, buffer);

    assert!(matches!(
        world.block_on(world.call_sync(1, ADD, Args::Fixed(vec![Value::Long(7), Value::Long(1)]))),
        Err(DispatchError::Registry(RegistryError::ArgumentMismatch { index: 0, .. }))
    ));
}

#[test]
#[serial]
fn continuation_receives_result() {
    let world = world(3);
    let seen = Arc::new(Mutex::new(vec![]));
    world
        .register_action(ActionDescriptor::new(
            DOUBLE,
            Marshalling::Fixed,
            vec![ParamType::Int],
            handler(|_ctx, args| async move {
                let x: i32 = args.get(0)?;
                amgas::serialize(&(x * 2))
            }),
        ))
        .unwrap();
    let record = seen.clone();
    world
        .register_action(ActionDescriptor::new(
            RECORD,
            Marshalling::Raw,
            raw_params(),
            handler(move |ctx, args| {
                let record = record.clone();
                async move {
                    let x: i32 = amgas::deserialize(args.bytes()?)?;
                    record.lock().push((ctx.node(), x));
                    Ok(vec![])
                }
            }),
        ))
        .unwrap();
    world
        .invoke(
            InvocationRequest::new(1, DOUBLE, Args::Fixed(vec![Value::Int(21)]))
                .with_continuation(Continuation::new(2, RECORD)),
        )
        .unwrap();
    world.wait_all();
    assert_eq!(*seen.lock(), vec![(2, 42)]);

    // a continuation without explicit arguments must accept the raw result
    assert!(world
        .invoke(
            InvocationRequest::new(1, DOUBLE, Args::Fixed(vec![Value::Int(1)]))
                .with_continuation(Continuation::new(2, DOUBLE)),
        )
        .is_err());
}

#[test]
#[serial]
fn ambiguous_completion_is_rejected() {
    let world = world(2);
    register_common(&world);
    let gate = world.new_and_gate(1);
    assert_eq!(
        world.invoke(
            InvocationRequest::new(1, ECHO, Args::Raw(vec![]))
                .with_lco(gate.addr())
                .with_continuation(Continuation::new(0, ECHO)),
        ),
        Err(DispatchError::AmbiguousCompletion)
    );
    assert_eq!(gate.arrived(), 0);
}

#[test]
#[serial]
fn handler_failures_reach_the_caller() {
    let world = world(2);
    register_common(&world);
    match world.block_on(world.call_sync(1, FAIL, Args::none())) {
        Err(DispatchError::RemoteExecution { node, cause }) => {
            assert_eq!(node, 1);
            assert!(cause.contains("refused on node 1"), "{}", cause);
        }
        other => panic!("unexpected {:?}", other),
    }
    match world.block_on(world.call_sync(1, PANIC, Args::none())) {
        Err(DispatchError::RemoteExecution { node, cause }) => {
            assert_eq!(node, 1);
            assert!(cause.contains("handler blew up"), "{}", cause);
        }
        other => panic!("unexpected {:?}", other),
    }
    // the node keeps serving after a panic
    assert_eq!(
        world.block_on(world.call_sync(1, ECHO, Args::Raw(vec![9]))),
        Ok(vec![9])
    );
}

#[test]
#[serial]
fn failed_invocation_counts_as_failed_arrival() {
    let world = world(2);
    register_common(&world);
    let gate = world.new_and_gate(2);
    world
        .invoke(InvocationRequest::new(1, FAIL, Args::none()).with_lco(gate.addr()))
        .unwrap();
    world
        .invoke(InvocationRequest::new(0, ECHO, Args::Raw(vec![])).with_lco(gate.addr()))
        .unwrap();
    match world.block_on(gate.wait()) {
        Err(LcoError::FailedArrivals { addr, causes }) => {
            assert_eq!(addr, gate.addr());
            assert_eq!(causes.len(), 1);
            assert!(causes[0].contains("refused on node 1"), "{:?}", causes);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert!(gate.is_complete());
    gate.delete().unwrap();
}

#[test]
#[serial]
fn broadcast_reports_unreachable_nodes() {
    let world = world(3);
    register_common(&world);
    assert_eq!(
        world.block_on(world.broadcast(ECHO, Args::Raw(vec![1]))),
        Ok(vec![vec![1], vec![1], vec![1]])
    );
    world.disconnect(2);
    assert_eq!(
        world.block_on(world.broadcast(ECHO, Args::Raw(vec![1]))),
        Err(DispatchError::PartialBroadcast { unreached: vec![2] })
    );
    assert_eq!(
        world.block_on(world.call_sync(2, ECHO, Args::Raw(vec![]))),
        Err(DispatchError::Unreachable(2))
    );
}

#[test]
#[serial]
fn memget_and_memput_reach_the_owner() {
    let world = world(2);
    let gas = world.gas();
    let remote = gas.allocate_local_at(1, 16).unwrap();
    assert_eq!(remote.node(), 1);
    world
        .block_on(world.memput(remote, (0..16).collect()))
        .unwrap();
    assert_eq!(
        world.block_on(world.memget(gas.offset(remote, 4, 4).unwrap())),
        Ok(vec![4, 5, 6, 7])
    );
    assert!(matches!(
        world.block_on(world.memput(remote, vec![0; 3])),
        Err(DispatchError::Gas(GasError::OutOfRange { .. }))
    ));
    assert!(matches!(
        gas.pin(remote),
        Err(GasError::NotLocal { caller: 0, .. })
    ));
    gas.deallocate(remote).unwrap();
    assert!(matches!(
        world.block_on(world.memget(remote)),
        Err(DispatchError::Gas(GasError::InvalidAddress { .. }))
    ));
}

#[test]
#[serial]
fn pinned_actions_run_at_the_owner() {
    let world = world(4);
    world
        .register_action(
            ActionDescriptor::new(
                TOUCH,
                Marshalling::Fixed,
                vec![],
                handler(|ctx, _args| async move {
                    let node = ctx.node() as u8;
                    ctx.with_target(|bytes| bytes.fill(node))?;
                    Ok(vec![])
                }),
            )
            .pinned(),
        )
        .unwrap();
    let gas = world.gas();
    let base = gas.allocate_cyclic(8, 4).unwrap();
    let gate = world.new_and_gate(8);
    for i in 0..8 {
        world
            .invoke(
                InvocationRequest::new(gas.partition(base, i).unwrap(), TOUCH, Args::none())
                    .with_lco(gate.addr()),
            )
            .unwrap();
    }
    world.block_on(gate.wait()).unwrap();
    for i in 0..8 {
        let part = gas.partition(base, i).unwrap();
        assert_eq!(part.node(), i % 4);
        assert_eq!(world.block_on(world.memget(part)), Ok(vec![(i % 4) as u8; 4]));
    }
    assert!(world.invoke(InvocationRequest::new(1, TOUCH, Args::none())).is_err());
    gas.deallocate(base).unwrap();
}

#[test]
#[serial]
fn pinned_handlers_share_a_block_across_suspension() {
    let world = world(2);
    let gas = world.gas();
    let base = gas.allocate_cyclic(2, 8).unwrap();
    let block = gas.partition(base, 1).unwrap();
    let ready = world.new_and_gate(1);
    let signal = ready.addr();
    let gate = ready.clone();
    world
        .register_action(
            ActionDescriptor::new(
                HOLD,
                Marshalling::Fixed,
                vec![],
                handler(move |ctx, _args| {
                    let gate = gate.clone();
                    async move {
                        // keeps its pin while suspended on the gate
                        let mut pinned = ctx.pin_target()?;
                        pinned.write(|bytes| bytes[0] = 1)?;
                        gate.wait().await?;
                        Ok(vec![pinned.read(|bytes| bytes[1])?])
                    }
                }),
            )
            .pinned(),
        )
        .unwrap();
    world
        .register_action(
            ActionDescriptor::new(
                PEEK,
                Marshalling::Fixed,
                vec![],
                handler(move |ctx, _args| async move {
                    let mut pinned = ctx.pin_target()?;
                    pinned.write(|bytes| bytes[1] = 2)?;
                    ctx.lco_signal(signal).await?;
                    Ok(pinned.to_vec()?)
                }),
            )
            .pinned(),
        )
        .unwrap();

    let (held, peeked) = world.block_on(async {
        futures::join!(
            world.call_sync(block, HOLD, Args::none()),
            world.call_sync(block, PEEK, Args::none())
        )
    });
    assert_eq!(held, Ok(vec![2]));
    assert_eq!(peeked.unwrap()[1], 2);
    assert!(ready.is_complete());
    world.wait_all();
    ready.delete().unwrap();
    gas.deallocate(base).unwrap();
}

#[test]
#[serial]
fn duplicate_registration_keeps_the_first_handler() {
    let world = world(2);
    register_common(&world);
    assert_eq!(
        world.register_action(ActionDescriptor::new(
            ECHO,
            Marshalling::Raw,
            raw_params(),
            handler(|_ctx, _args| async move { Ok(vec![0]) }),
        )),
        Err(RegistryError::DuplicateAction(ECHO))
    );
    assert_eq!(
        world.block_on(world.call_sync(1, ECHO, Args::Raw(vec![5, 6]))),
        Ok(vec![5, 6])
    );
    assert_eq!(
        world.block_on(world.call_sync(1, ActionId(999), Args::none())),
        Err(DispatchError::Registry(RegistryError::UnknownAction(ActionId(999))))
    );
}
