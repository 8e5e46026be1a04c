/// ------------amgas Example: Hello World -------------------------
/// Registers a single action, invokes it on every node and
/// waits for all of them through an AND-gate.
/// --------------------------------------------------------------------
use amgas::{handler, ActionDescriptor, ActionId, Args, InvocationRequest, Marshalling, ParamType, Value};

const HELLO: ActionId = ActionId(0);

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let world = amgas::WorldBuilder::new().build();
    world.register_action(
        ActionDescriptor::new(
            HELLO,
            Marshalling::Fixed,
            vec![ParamType::Int],
            handler(|ctx, args| async move {
                let from: i32 = args.get(0)?;
                println!(
                    "Hello from node {} of {} (sent by node {}) on thread {:?}",
                    ctx.node(),
                    ctx.num_nodes(),
                    from,
                    std::thread::current().id()
                );
                Ok(vec![])
            }),
        )
        .with_name("hello"),
    )?;

    let gate = world.new_and_gate(world.num_nodes());
    for node in 0..world.num_nodes() {
        let req = InvocationRequest::new(node, HELLO, Args::Fixed(vec![Value::Int(world.my_node() as i32)]));
        world.invoke(req.with_lco(gate.addr()))?;
    }
    world.block_on(gate.wait())?;
    gate.delete()?;
    Ok(())
}
