//! Bridge integration test helpers

#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use arbor_bridge::{Router, RouterHandle, TcpEndpointServer};
use arbor_core::{Address, Dispatcher, EndpointConfig, Event, LinkConfig, LivenessConfig, Node, Payload};
use tokio::sync::oneshot;

pub const WAIT: Duration = Duration::from_secs(5);

pub fn addr(segments: &[&str]) -> Address {
    Address::new(segments.iter().copied()).expect("valid address")
}

pub fn link_config() -> LinkConfig {
    LinkConfig::default().with_liveness(LivenessConfig::new(Duration::from_millis(100), 5))
}

/// root
/// ├── endpoint   (allows root/services and peers under root/endpoint)
/// └── services   (answers `echo`)
pub fn server_tree() -> Dispatcher {
    let root = addr(&["root"]);
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::new(), root.clone());
    dispatcher
        .add_child(
            &root,
            "endpoint",
            Node::endpoint(EndpointConfig::new(vec![addr(&["root", "services"])], link_config())),
        )
        .expect("endpoint");
    dispatcher
        .add_child(
            &root,
            "services",
            Node::new().with_listener("echo", |event, ctx| {
                let text = event.data.get("text").cloned().unwrap_or_default();
                ctx.respond(event, Payload::new("echoResponse").with("text", text))
                    .expect("respond");
            }),
        )
        .expect("services");
    dispatcher
}

/// Start an endpoint server on an ephemeral localhost port and return its router and address
pub async fn start_tcp_server() -> (RouterHandle, SocketAddr, TcpEndpointServer) {
    let (router, _task) = Router::spawn(server_tree());
    let server = TcpEndpointServer::bind(
        (std::net::Ipv4Addr::LOCALHOST, 0),
        router.clone(),
        addr(&["root", "endpoint"]),
    )
    .await
    .expect("bind test listener");
    let local = server.local_addr().expect("local addr");
    (router, local, server)
}

/// Chains `data` from `from` to `to` on `router` and waits for the correlated reply.
pub async fn request(router: &RouterHandle, from: Address, to: Address, data: Payload) -> Event {
    let (tx, rx) = oneshot::channel();
    router
        .call(move |dispatcher| {
            dispatcher.chain(&from, to, data, move |event, _| {
                let _ = tx.send(event.clone());
            })
        })
        .await
        .expect("router alive")
        .expect("chain accepted");
    tokio::time::timeout(WAIT, rx)
        .await
        .expect("reply in time")
        .expect("callback kept")
}

/// Polls `check` until it holds or the wait expires.
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
