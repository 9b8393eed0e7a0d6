// TCP endpoint server and connector
use std::net::SocketAddr;
use std::sync::Arc;

use arbor_core::{Address, LinkConfig, LinkId};
use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::driver::{mount_connector, ConnectorHandle};
use crate::router::RouterHandle;
use crate::socket;
use crate::Result;

/// One accepted peer.
#[derive(Debug, Clone)]
pub struct Session {
    pub address: Address,
    pub peer: SocketAddr,
    cancel: CancellationToken,
}

impl Session {
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Accepts TCP peers and mounts each one under the endpoint node at `endpoint`.
pub struct TcpEndpointServer {
    listener: TcpListener,
    router: RouterHandle,
    endpoint: Address,
    sessions: Arc<DashMap<LinkId, Session>>,
}

impl TcpEndpointServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A, router: RouterHandle, endpoint: Address) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, endpoint = %endpoint, "Endpoint listening");
        Ok(Self {
            listener,
            router,
            endpoint,
            sessions: Arc::new(DashMap::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Live sessions keyed by link; entries disappear when their link closes.
    pub fn sessions(&self) -> Arc<DashMap<LinkId, Session>> {
        self.sessions.clone()
    }

    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.serve())
    }

    /// Accept loop; returns only when the listener or the router fails.
    pub async fn serve(self) -> Result<()> {
        loop {
            let (stream, peer) = self.listener.accept().await?;
            if let Err(e) = self.admit(stream, peer).await {
                warn!(peer = %peer, error = %e, "Connection refused");
                if self.router.is_closed() {
                    return Err(e);
                }
            }
        }
    }

    async fn admit(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let (transport, driver) = socket::split(stream)?;
        let cancel = driver.cancel_token();
        let endpoint = self.endpoint.clone();
        let accepted = self
            .router
            .call(move |dispatcher| dispatcher.accept(&endpoint, Box::new(transport)))
            .await??;
        driver.spawn(self.router.clone(), accepted.link, &accepted.liveness);
        info!(peer = %peer, address = %accepted.address, link = %accepted.link, "Peer connected");

        self.sessions.insert(
            accepted.link,
            Session {
                address: accepted.address,
                peer,
                cancel: cancel.clone(),
            },
        );
        let sessions = self.sessions.clone();
        let link = accepted.link;
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Some((_, session)) = sessions.remove(&link) {
                info!(peer = %session.peer, address = %session.address, "Peer disconnected");
            }
        });
        Ok(())
    }
}

/// Dials `addr`, mounts a connector as the router's root and waits for the
/// peer to assign it an address.
pub async fn connect<A: ToSocketAddrs>(router: &RouterHandle, addr: A, config: LinkConfig) -> Result<ConnectorHandle> {
    let stream = TcpStream::connect(addr).await?;
    let (transport, driver) = socket::split(stream)?;
    let peer = driver.peer();
    let cancel = driver.cancel_token();
    info!(peer = %peer, "Connected; awaiting registration");

    let pump = router.clone();
    mount_connector(router, Box::new(transport), config, cancel, move |link, liveness| {
        driver.spawn(pump, link, liveness);
    })
    .await
}
