use std::net::SocketAddr;

use arbor_bridge::{Router, TcpEndpointServer};
use arbor_core::{Address, Dispatcher, EndpointConfig, LinkConfig, Node, Payload};
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    fmt()
        .compact()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let root = Address::new(["root"])?;
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::new(), root.clone());
    // Peers may reach the built-in services and each other; ARBOR_ALLOW adds more.
    let allow = vec![root.child("services")?];
    dispatcher.add_child(&root, "endpoint", Node::endpoint(EndpointConfig::new(allow, LinkConfig::default())))?;

    // Built-in service so a fresh deployment can be checked end to end.
    let services = Node::new()
        .with_listener("echo", |event, ctx| {
            let reply = Payload::from_map(event.data.as_map().clone()).with("command", "echoResponse");
            if let Err(e) = ctx.respond(event, reply) {
                tracing::warn!(error = %e, "echo reply failed");
            }
        })
        .with_listener("time", |event, ctx| {
            let now = chrono::Utc::now().timestamp_millis();
            if let Err(e) = ctx.respond(event, Payload::new("timeResponse").with("ts", now)) {
                tracing::warn!(error = %e, "time reply failed");
            }
        });
    dispatcher.add_child(&root, "services", services)?;

    let (router, router_task) = Router::spawn(dispatcher);

    let addr: SocketAddr = std::env::var("ARBOR_BRIDGE_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:7300".into())
        .parse()?;
    let endpoint = root.child("endpoint")?;
    let server = TcpEndpointServer::bind(addr, router.clone(), endpoint).await?;
    tracing::info!("Arbor bridge listening on {}", server.local_addr()?);

    let serve = server.spawn();
    tokio::select! {
        result = serve => {
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Shutting down");
        }
    }

    router.shutdown().await?;
    let _ = router_task.await;
    Ok(())
}

