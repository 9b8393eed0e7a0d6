//! In-process links.
//!
//! Two routers in one process (e.g. a main tree and a worker tree) are joined
//! by a pair of unbounded channels. Events cross as values: binary segments are
//! reference counted, so they are handed over without copying.

use arbor_core::{Accepted, Address, ArborError, Event, LinkConfig, LinkEvent, LinkId, Transport};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::driver::{mount_connector, spawn_ticker, ConnectorHandle};
use crate::router::RouterHandle;
use crate::Result;

pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
}

impl Transport for ChannelTransport {
    fn write_bytes(&mut self, frame: Bytes) -> arbor_core::Result<()> {
        self.send(LinkEvent::Bytes(frame))
    }

    fn write_event(&mut self, event: &Event) -> arbor_core::Result<()> {
        self.send(LinkEvent::Event(event.clone()))
    }

    fn close(&mut self) {
        self.cancel.cancel();
    }
}

impl ChannelTransport {
    fn send(&self, event: LinkEvent) -> arbor_core::Result<()> {
        self.tx
            .send(event)
            .map_err(|_| ArborError::Transport("in-process peer has gone".into()))
    }
}

/// One side of an in-process pipe.
pub struct ChannelEnd {
    pub transport: ChannelTransport,
    inbound: mpsc::UnboundedReceiver<LinkEvent>,
    cancel: CancellationToken,
}

/// Builds two connected ends. Closing either end closes both.
pub fn pipe() -> (ChannelEnd, ChannelEnd) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    (
        ChannelEnd {
            transport: ChannelTransport {
                tx: b_tx,
                cancel: cancel.clone(),
            },
            inbound: a_rx,
            cancel: cancel.clone(),
        },
        ChannelEnd {
            transport: ChannelTransport {
                tx: a_tx,
                cancel: cancel.clone(),
            },
            inbound: b_rx,
            cancel,
        },
    )
}

/// Forwards what the peer wrote into `link` until the pipe closes.
fn spawn_pump(
    mut inbound: mpsc::UnboundedReceiver<LinkEvent>,
    router: RouterHandle,
    link: LinkId,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                event = inbound.recv() => match event {
                    Some(event) => {
                        if router.deliver(link, event).await.is_err() {
                            return;
                        }
                    }
                    None => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
        debug!(link = %link, "In-process pipe closed");
        let _ = router.deliver(link, LinkEvent::Closed).await;
    })
}

/// Joins `client` to the endpoint at `endpoint` on `server`.
///
/// The server side is mounted as an accepted connection; the client gets a
/// connector root and is registered when this returns.
pub async fn link_in_process(
    server: &RouterHandle,
    endpoint: Address,
    client: &RouterHandle,
    config: LinkConfig,
) -> Result<(Accepted, ConnectorHandle)> {
    let (server_end, client_end) = pipe();

    let ChannelEnd {
        transport,
        inbound,
        cancel,
    } = server_end;
    let accepted = server
        .call(move |dispatcher| dispatcher.accept(&endpoint, Box::new(transport)))
        .await??;
    spawn_pump(inbound, server.clone(), accepted.link, cancel.clone());
    spawn_ticker(server.clone(), accepted.link, &accepted.liveness, cancel);

    let ChannelEnd {
        transport,
        inbound,
        cancel,
    } = client_end;
    let pump = client.clone();
    let ticker_cancel = cancel.clone();
    let connector = mount_connector(client, Box::new(transport), config, cancel.clone(), move |link, liveness| {
        spawn_pump(inbound, pump.clone(), link, cancel);
        spawn_ticker(pump, link, liveness, ticker_cancel);
    })
    .await?;
    Ok((accepted, connector))
}
