//! Connection-boundary protocol.
//!
//! A [`Link`] sits in the tree where the address space crosses a process or
//! socket boundary. It owns the outbound half of a transport, enforces the
//! connection's [`Restrictions`] on inbound traffic, runs the registration
//! handshake and the ping/pong heartbeat, and funnels every way a connection
//! can end through a single idempotent shutdown.
//!
//! ```text
//! Unregistered --register--> Registered --(terminate | closed | error | timeout)--> Closing --> Closed
//! ```

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;
use tracing::{debug, info, warn};

use crate::address::Address;
use crate::codec::{self, FrameCodec};
use crate::config::LinkConfig;
use crate::event::Event;
use crate::node::{destination_unreached, Outbox};
use crate::restrictions::Restrictions;
use crate::value::{Payload, Value};
use crate::Result;

/// Outbound half of a connection.
///
/// Inbound traffic is not pulled through this trait; drivers push it into the
/// dispatcher as [`LinkEvent`]s.
#[cfg_attr(test, mockall::automock)]
pub trait Transport: Send {
    fn write_bytes(&mut self, frame: Bytes) -> Result<()>;

    /// Transports that can hand events over without serialising override this.
    fn write_event(&mut self, event: &Event) -> Result<()> {
        let frame = codec::encode(event)?;
        self.write_bytes(frame)
    }

    /// Stops the connection. Called at most once per link.
    fn close(&mut self);
}

/// Something that happened on the inbound side of a transport.
#[derive(Debug)]
pub enum LinkEvent {
    /// Raw stream bytes; may hold partial or several frames.
    Bytes(Bytes),
    /// An already decoded event (in-process transports).
    Event(Event),
    /// Heartbeat timer fired.
    Tick,
    Closed,
    Error(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Unregistered,
    Registered,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// Dials out and is told its address by the peer.
    Connector,
    /// Spawned by an endpoint for an inbound connection.
    Accepted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u64);

impl LinkId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link-{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloseReason {
    #[error("terminated by peer")]
    Terminated,
    #[error("closed locally")]
    Local,
    #[error("transport closed")]
    TransportClosed,
    #[error("transport error: {0}")]
    TransportError(String),
    #[error("liveness timeout after {0} missed pings")]
    LivenessTimeout(u32),
    #[error("write failed: {0}")]
    WriteFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkNotice {
    Registered(Address),
    Closed(CloseReason),
}

pub type LinkObserver = Box<dyn FnMut(&LinkNotice) + Send>;

pub struct Link {
    id: LinkId,
    kind: LinkKind,
    state: LinkState,
    transport: Box<dyn Transport>,
    config: LinkConfig,
    base: Restrictions,
    restrictions: Restrictions,
    missed: u32,
    buffer: BytesMut,
    codec: FrameCodec,
    held: VecDeque<Event>,
    observer: Option<LinkObserver>,
    session_expire: Option<Duration>,
}

impl fmt::Debug for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("restrictions", &self.restrictions)
            .field("missed", &self.missed)
            .field("held", &self.held.len())
            .finish()
    }
}

impl Link {
    pub fn connector(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        let base = Restrictions::new(config.allow.iter().cloned());
        Self::build(LinkKind::Connector, transport, config, base)
    }

    /// Connection spawned by an endpoint; `base` is the endpoint's allow-list.
    pub fn accepted(transport: Box<dyn Transport>, config: LinkConfig, mut base: Restrictions) -> Self {
        for address in &config.allow {
            base.add(address.clone());
        }
        Self::build(LinkKind::Accepted, transport, config, base)
    }

    fn build(kind: LinkKind, transport: Box<dyn Transport>, config: LinkConfig, base: Restrictions) -> Self {
        Self {
            id: LinkId::next(),
            kind,
            state: LinkState::Unregistered,
            transport,
            restrictions: base.clone(),
            base,
            config,
            missed: 0,
            buffer: BytesMut::new(),
            codec: FrameCodec::default(),
            held: VecDeque::new(),
            observer: None,
            session_expire: None,
        }
    }

    pub fn with_observer<F>(mut self, observer: F) -> Self
    where
        F: FnMut(&LinkNotice) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
        self
    }

    pub fn id(&self) -> LinkId {
        self.id
    }

    pub fn kind(&self) -> LinkKind {
        self.kind
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    /// Widens the allow-list for the lifetime of the link.
    pub fn allow(&mut self, address: Address) {
        self.base.add(address.clone());
        self.restrictions.add(address);
    }

    pub fn deny(&mut self, address: &Address) {
        self.base.remove(address);
        self.restrictions.remove(address);
    }

    pub fn missed_pings(&self) -> u32 {
        self.missed
    }

    pub fn held(&self) -> usize {
        self.held.len()
    }

    /// Session lifetime advertised by the peer at registration.
    pub fn session_expire(&self) -> Option<Duration> {
        self.session_expire
    }

    pub(crate) fn attached(&mut self, own: &Address) {
        self.adopt(own);
        match self.kind {
            LinkKind::Connector => {
                debug!(link = %self.id, "Connector attached; requesting registration");
                if let Err(e) = self.transport.write_event(&Event::control(Payload::new("register"))) {
                    warn!(link = %self.id, error = %e, "Could not request registration");
                    self.finish(CloseReason::WriteFailed(e.to_string()));
                }
            }
            LinkKind::Accepted => {
                self.state = LinkState::Registered;
                let mut data = BTreeMap::new();
                data.insert("address".to_string(), Value::from(own));
                if let Some(expire) = self.config.session_expire {
                    data.insert(
                        "sessionExpireTimeout".to_string(),
                        Value::from(expire.as_millis() as u64),
                    );
                }
                let register = Event::control(Payload::new("register").with_data(data));
                if let Err(e) = self.transport.write_event(&register) {
                    warn!(link = %self.id, error = %e, "Could not announce registration");
                    self.finish(CloseReason::WriteFailed(e.to_string()));
                    return;
                }
                self.observe(LinkNotice::Registered(own.clone()));
            }
        }
    }

    pub(crate) fn readdressed(&mut self, own: &Address) {
        self.adopt(own);
    }

    pub(crate) fn detached(&mut self) {
        if self.state == LinkState::Registered {
            if let Err(e) = self.transport.write_event(&Event::control(Payload::new("terminate"))) {
                debug!(link = %self.id, error = %e, "Could not send terminate");
            }
        }
        if !self.held.is_empty() {
            warn!(link = %self.id, count = self.held.len(), "Dropping held events on detach");
            self.held.clear();
        }
        self.finish(CloseReason::Local);
    }

    // Effective restrictions: the static allow-list plus the link's own subtree.
    fn adopt(&mut self, own: &Address) {
        self.restrictions = self.base.clone();
        if !own.is_empty() {
            self.restrictions.add(own.clone());
        }
    }

    /// Whether `destination` is served by the local subtree rather than the peer.
    pub(crate) fn routes_locally(&self, own: &Address, destination: &Address) -> bool {
        match self.kind {
            LinkKind::Connector => !own.is_empty() && own.is_parent_of(destination),
            LinkKind::Accepted => false,
        }
    }

    pub(crate) fn send_remote(&mut self, own: &Address, event: Event, outbox: &mut Outbox) {
        match self.state {
            LinkState::Registered => {
                if let Err(e) = self.transport.write_event(&event) {
                    warn!(link = %self.id, destination = %event.destination, error = %e, "Write failed");
                    self.shutdown(CloseReason::WriteFailed(e.to_string()), own, outbox);
                }
            }
            LinkState::Unregistered => {
                if self.held.len() >= self.config.max_held {
                    warn!(link = %self.id, max_held = self.config.max_held, "Hold queue full; event not sent");
                    destination_unreached(event, outbox);
                } else {
                    debug!(link = %self.id, destination = %event.destination, "Holding event until registered");
                    self.held.push_back(event);
                }
            }
            LinkState::Closing | LinkState::Closed => {
                debug!(link = %self.id, destination = %event.destination, "Link closed; event not sent");
                destination_unreached(event, outbox);
            }
        }
    }

    /// Feeds one inbound occurrence through the state machine.
    ///
    /// Returns the adopted address when this event completed registration.
    pub(crate) fn on_event(&mut self, event: LinkEvent, own: &Address, outbox: &mut Outbox) -> Option<Address> {
        match event {
            LinkEvent::Bytes(bytes) => self.on_bytes(bytes, own, outbox),
            LinkEvent::Event(event) => self.receive(event, own, outbox),
            LinkEvent::Tick => {
                self.tick(own, outbox);
                None
            }
            LinkEvent::Closed => {
                self.shutdown(CloseReason::TransportClosed, own, outbox);
                None
            }
            LinkEvent::Error(message) => {
                warn!(link = %self.id, error = %message, "Transport error");
                self.shutdown(CloseReason::TransportError(message), own, outbox);
                None
            }
        }
    }

    fn on_bytes(&mut self, bytes: Bytes, own: &Address, outbox: &mut Outbox) -> Option<Address> {
        self.buffer.extend_from_slice(&bytes);
        let mut own = own.clone();
        let mut registered = None;
        while self.state != LinkState::Closed {
            match self.codec.decode(&mut self.buffer) {
                Ok(Some(event)) => {
                    if let Some(address) = self.receive(event, &own, outbox) {
                        own = address.clone();
                        registered = Some(address);
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(link = %self.id, error = %e, "Dropping malformed frame"),
            }
        }
        registered
    }

    fn receive(&mut self, event: Event, own: &Address, outbox: &mut Outbox) -> Option<Address> {
        match event.command() {
            "ping" => {
                let pong = self.heartbeat("pong", own);
                self.write(pong, own, outbox);
            }
            "pong" => self.missed = 0,
            "register" | "registerResponse" => match self.kind {
                LinkKind::Connector => return self.register(&event, own, outbox),
                LinkKind::Accepted => debug!(link = %self.id, "Ignoring register from connector side"),
            },
            "terminate" => self.shutdown(CloseReason::Terminated, own, outbox),
            _ => self.forward(event, own, outbox),
        }
        None
    }

    fn register(&mut self, event: &Event, own: &Address, outbox: &mut Outbox) -> Option<Address> {
        if self.state != LinkState::Unregistered {
            warn!(link = %self.id, address = %own, "Duplicate registration ignored");
            return None;
        }
        let data = event.data.data();
        let Some(address) = data.and_then(|d| d.get("address")).and_then(Value::as_address) else {
            warn!(link = %self.id, data = %event.data, "Registration without a usable address");
            return None;
        };
        self.session_expire = data
            .and_then(|d| d.get("sessionExpireTimeout"))
            .and_then(Value::as_u64)
            .map(Duration::from_millis);

        info!(link = %self.id, address = %address, "Registered");
        self.state = LinkState::Registered;
        self.missed = 0;
        self.adopt(&address);
        self.observe(LinkNotice::Registered(address.clone()));

        for mut held in self.held.drain(..) {
            held.sender = held.sender.rebase(own, &address);
            outbox.push(held);
        }
        Some(address)
    }

    fn forward(&mut self, event: Event, own: &Address, outbox: &mut Outbox) {
        if self.state != LinkState::Registered {
            warn!(link = %self.id, command = event.command(), "Event before registration discarded");
            return;
        }
        // A peer may only speak for its own subtree.
        if self.kind == LinkKind::Accepted && !own.is_parent_of(&event.sender) {
            warn!(
                link = %self.id,
                own = %own,
                sender = %event.sender,
                command = event.command(),
                "Sender outside the connection's subtree; event dropped"
            );
            return;
        }
        if !self.restrictions.check(&event.destination) {
            warn!(
                link = %self.id,
                sender = %event.sender,
                destination = %event.destination,
                command = event.command(),
                "Restricted destination; event dropped"
            );
            if !event.is_response && event.req_id().is_some() {
                match event.error_response(format!("Destination {} is restricted", event.destination)) {
                    Ok(reply) => self.write(reply, own, outbox),
                    Err(e) => warn!(link = %self.id, error = %e, "Could not build restriction response"),
                }
            }
            return;
        }
        outbox.push(event);
    }

    fn tick(&mut self, own: &Address, outbox: &mut Outbox) {
        if self.state != LinkState::Registered {
            return;
        }
        if self.missed >= self.config.liveness.threshold {
            warn!(link = %self.id, missed = self.missed, "Peer stopped answering pings");
            self.shutdown(CloseReason::LivenessTimeout(self.missed), own, outbox);
            return;
        }
        let ping = self.heartbeat("ping", own);
        self.write(ping, own, outbox);
        self.missed += 1;
    }

    fn heartbeat(&self, command: &str, own: &Address) -> Event {
        let mut data = BTreeMap::new();
        data.insert("address".to_string(), Value::from(own));
        data.insert("ts".to_string(), Value::from(chrono::Utc::now().timestamp_millis()));
        Event::control(Payload::new(command).with_data(data))
    }

    fn write(&mut self, event: Event, own: &Address, outbox: &mut Outbox) {
        if let Err(e) = self.transport.write_event(&event) {
            warn!(link = %self.id, command = event.command(), error = %e, "Write failed");
            self.shutdown(CloseReason::WriteFailed(e.to_string()), own, outbox);
        }
    }

    /// Cooperative close: tells the peer, then shuts down.
    pub(crate) fn terminate(&mut self, own: &Address, outbox: &mut Outbox) {
        if self.state == LinkState::Registered {
            if let Err(e) = self.transport.write_event(&Event::control(Payload::new("terminate"))) {
                debug!(link = %self.id, error = %e, "Could not send terminate");
            }
        }
        self.shutdown(CloseReason::Local, own, outbox);
    }

    /// Every teardown path ends here; repeated calls are no-ops.
    pub(crate) fn shutdown(&mut self, reason: CloseReason, own: &Address, outbox: &mut Outbox) {
        if !self.finish(reason) {
            return;
        }
        for event in self.held.drain(..) {
            destination_unreached(event, outbox);
        }
        if self.kind == LinkKind::Accepted {
            match Event::new(own.clone(), own.parent(), Payload::new("closeConnection")) {
                Ok(event) => outbox.push(event),
                Err(e) => warn!(link = %self.id, error = %e, "Could not notify endpoint"),
            }
        }
    }

    fn finish(&mut self, reason: CloseReason) -> bool {
        if matches!(self.state, LinkState::Closing | LinkState::Closed) {
            debug!(link = %self.id, reason = %reason, "Link already closed");
            return false;
        }
        info!(link = %self.id, kind = ?self.kind, reason = %reason, "Closing link");
        self.state = LinkState::Closing;
        self.transport.close();
        self.state = LinkState::Closed;
        self.buffer.clear();
        self.observe(LinkNotice::Closed(reason));
        true
    }

    fn observe(&mut self, notice: LinkNotice) {
        if let Some(observer) = self.observer.as_mut() {
            observer(&notice);
        }
    }
}
