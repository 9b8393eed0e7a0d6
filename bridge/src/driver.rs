// Pieces shared by the TCP and in-process drivers
use arbor_core::{Address, Link, LinkConfig, LinkEvent, LinkId, LinkNotice, LivenessConfig, Node, Role, Transport};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::router::RouterHandle;
use crate::{BridgeError, Result};

/// A connector mounted as the root of a router, registered with its peer.
#[derive(Debug, Clone)]
pub struct ConnectorHandle {
    pub address: Address,
    pub link: LinkId,
    cancel: CancellationToken,
}

impl ConnectorHandle {
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the link has shut down.
    pub async fn closed(&self) {
        self.cancel.cancelled().await;
    }
}

/// Feeds `Tick`s to `link` until `cancel` fires. No task is started when liveness is off.
pub(crate) fn spawn_ticker(
    router: RouterHandle,
    link: LinkId,
    liveness: &LivenessConfig,
    cancel: CancellationToken,
) -> Option<JoinHandle<()>> {
    if !liveness.enabled() {
        return None;
    }
    let period = liveness.interval;
    Some(tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if router.deliver(link, LinkEvent::Tick).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!(link = %link, "Ticker stopped");
    }))
}

/// Mounts a connector over `transport` as the router's root and waits for registration.
///
/// `start` runs once the link is in the tree; drivers use it to begin pumping
/// inbound traffic. On timeout the link is terminated.
pub(crate) async fn mount_connector<F>(
    router: &RouterHandle,
    transport: Box<dyn Transport>,
    config: LinkConfig,
    cancel: CancellationToken,
    start: F,
) -> Result<ConnectorHandle>
where
    F: FnOnce(LinkId, &LivenessConfig),
{
    let (ready_tx, ready_rx) = oneshot::channel();
    let mut ready = Some(ready_tx);
    let timeout = config.registration_timeout;
    let liveness = config.liveness.clone();

    let link = Link::connector(transport, config).with_observer(move |notice: &LinkNotice| {
        if let Some(tx) = ready.take() {
            let _ = tx.send(notice.clone());
        }
    });
    let id = link.id();
    router
        .call(move |dispatcher| {
            dispatcher.set_root(Node::with_role(Role::Link(link)), Address::root());
        })
        .await?;
    start(id, &liveness);

    match tokio::time::timeout(timeout, ready_rx).await {
        Ok(Ok(LinkNotice::Registered(address))) => {
            info!(link = %id, address = %address, "Connector registered");
            Ok(ConnectorHandle {
                address,
                link: id,
                cancel,
            })
        }
        Ok(Ok(LinkNotice::Closed(reason))) => Err(BridgeError::Registration(reason.to_string())),
        Ok(Err(_)) => Err(BridgeError::RouterGone),
        Err(_) => {
            warn!(link = %id, timeout_ms = timeout.as_millis() as u64, "No registration from peer");
            let _ = router
                .call(|dispatcher| dispatcher.terminate(&Address::root()))
                .await;
            Err(BridgeError::Registration(format!(
                "no register within {} ms",
                timeout.as_millis()
            )))
        }
    }
}
