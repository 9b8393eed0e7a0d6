mod config;

use arbor_bridge::{connect, Router};
use arbor_core::{telemetry, Dispatcher, Node, Payload};
use config::EchoNodeConfig;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    telemetry::init_tracing("info,arbor_core=info,arbor_bridge=info,echo_node=info");

    let cfg = EchoNodeConfig::load();
    info!(target = "echo_node", server = %cfg.server_addr, "Starting echo node");

    let (router, router_task) = Router::spawn(Dispatcher::new());
    let handle = connect(&router, cfg.server_addr.as_str(), cfg.link.clone()).await?;
    let base = handle.address.clone();
    info!(target = "echo_node", address = %base, "Joined bridge");

    // [base]
    // ├── echo    answers `echo` with the request body
    // ├── ticks   topic; `subscribe` to receive `tick`
    // └── caller  issues the startup request
    let echo = Node::new().with_listener("echo", |event, ctx| {
        let reply = Payload::from_map(event.data.as_map().clone()).with("command", "echoResponse");
        if let Err(e) = ctx.respond(event, reply) {
            warn!(target = "echo_node", error = %e, "echo reply failed");
        }
    });
    let setup_base = base.clone();
    router
        .call(move |d| -> arbor_core::Result<()> {
            d.add_child(&setup_base, "echo", echo)?;
            d.add_child(&setup_base, "ticks", Node::topic())?;
            d.add_child(&setup_base, "caller", Node::new())?;
            Ok(())
        })
        .await??;

    let caller = base.child("caller")?;
    let target = cfg.echo_target.clone();
    router
        .call(move |d| {
            d.chain(&caller, target, Payload::new("echo").with("text", "hello"), |reply, _| {
                if reply.is_error() {
                    warn!(target = "echo_node", details = ?reply.data.details(), "Echo request failed");
                } else {
                    info!(target = "echo_node", from = %reply.sender, "Echo answered");
                }
            })
        })
        .await??;

    let ticks = base.child("ticks")?;
    let mut interval = tokio::time::interval(cfg.tick_interval);
    let mut count: u64 = 0;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                count += 1;
                let topic = ticks.clone();
                let sent = router
                    .call(move |d| d.notify(&topic, Payload::new("tick").with("count", count), &[]))
                    .await??;
                if sent > 0 {
                    info!(target = "echo_node", count, subscribers = sent, "Tick published");
                }
            }
            _ = handle.closed() => {
                warn!(target = "echo_node", "Bridge connection lost");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                info!(target = "echo_node", "Shutting down");
                break;
            }
        }
    }

    router.shutdown().await?;
    let _ = router_task.await;
    Ok(())
}
