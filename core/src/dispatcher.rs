//! Root owner and dispatch loop.
//!
//! A [`Dispatcher`] owns the root [`Node`] of one tree. [`Dispatcher::dispatch`]
//! drains a FIFO outbox: events emitted while a handler runs are routed after
//! that handler returns, before `dispatch` itself returns.

use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::debug;

use crate::address::Address;
use crate::config::LivenessConfig;
use crate::event::Event;
use crate::link::{LinkEvent, LinkId, Transport};
use crate::node::{destination_unreached, Context, Node, Outbox};
use crate::value::Payload;
use crate::{ArborError, Result};

pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(10);

/// A connection mounted under an endpoint by [`Dispatcher::accept`].
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    pub link: LinkId,
    pub address: Address,
    /// Heartbeat settings the driver should tick the link with.
    pub liveness: LivenessConfig,
}

pub struct Dispatcher {
    root: Option<Node>,
    keep_alive: Option<JoinHandle<()>>,
    keep_alive_period: Duration,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_keep_alive(DEFAULT_KEEP_ALIVE)
    }

    pub fn with_keep_alive(period: Duration) -> Self {
        Self {
            root: None,
            keep_alive: None,
            keep_alive_period: period,
        }
    }

    /// Attaches `root` at `address`, replacing (and returning) any previous root.
    pub fn set_root(&mut self, mut root: Node, address: Address) -> Option<Node> {
        let previous = self.remove_root();
        debug!(address = %address, role = root.role().name(), "Setting root");
        root.attach(address);
        self.root = Some(root);
        self.start_keep_alive();
        previous
    }

    pub fn remove_root(&mut self) -> Option<Node> {
        self.stop_keep_alive();
        let mut root = self.root.take()?;
        root.detach();
        Some(root)
    }

    pub fn root(&self) -> Option<&Node> {
        self.root.as_ref()
    }

    pub fn root_mut(&mut self) -> Option<&mut Node> {
        self.root.as_mut()
    }

    pub fn has_root(&self) -> bool {
        self.root.is_some()
    }

    pub fn keep_alive_running(&self) -> bool {
        self.keep_alive.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn dispatch(&mut self, event: Event) {
        self.dispatch_at(event, 0);
    }

    /// Hop `0` starts at the root's depth.
    pub fn dispatch_at(&mut self, event: Event, hop: usize) {
        let mut outbox = Outbox::new();
        outbox.push_at(event, hop);
        self.drain(&mut outbox);
    }

    /// Routes everything in `outbox`, including whatever the handlers add to it.
    pub fn drain(&mut self, outbox: &mut Outbox) {
        let Some(root) = self.root.as_mut() else {
            if !outbox.is_empty() {
                debug!(dropped = outbox.len(), "No root; events dropped");
            }
            outbox.clear();
            return;
        };
        while let Some((event, hop)) = outbox.pop() {
            route(root, event, hop, outbox);
        }
    }

    /// Runs `f` against the node at `address`, then routes what it emitted.
    pub fn with_node<R, F>(&mut self, address: &Address, f: F) -> Result<R>
    where
        F: FnOnce(&mut Node, &mut Outbox) -> Result<R>,
    {
        let mut outbox = Outbox::new();
        let result = match self.node_mut(address) {
            Some(node) => f(node, &mut outbox),
            None => Err(ArborError::DestinationUnreachable(address.clone())),
        };
        self.drain(&mut outbox);
        result
    }

    pub fn node(&self, address: &Address) -> Option<&Node> {
        self.root.as_ref()?.find(address)
    }

    pub fn node_mut(&mut self, address: &Address) -> Option<&mut Node> {
        self.root.as_mut()?.find_mut(address)
    }

    pub fn send(&mut self, from: &Address, to: Address, data: Payload) -> Result<()> {
        self.with_node(from, |node, outbox| node.send(to, data, outbox))
    }

    pub fn send_traced(&mut self, from: &Address, to: Address, data: Payload) -> Result<()> {
        self.with_node(from, |node, outbox| node.send_traced(to, data, true, outbox))
    }

    pub fn chain<F>(&mut self, from: &Address, to: Address, data: Payload, callback: F) -> Result<u64>
    where
        F: FnOnce(&Event, &mut Context<'_>) + Send + 'static,
    {
        self.with_node(from, |node, outbox| node.chain(to, data, callback, outbox))
    }

    pub fn clear_chain(&mut self, at: &Address, req_id: u64) -> Result<bool> {
        self.with_node(at, |node, _| Ok(node.clear_chain(req_id)))
    }

    pub fn clear_chain_by_destination(&mut self, at: &Address, destination: &Address) -> Result<usize> {
        self.with_node(at, |node, _| Ok(node.clear_chain_by_destination(destination)))
    }

    pub fn add_child(&mut self, parent: &Address, id: impl Into<String>, child: Node) -> Result<bool> {
        self.with_node(parent, |node, _| node.add_child(id, child))
    }

    pub fn del_child(&mut self, parent: &Address, id: &str) -> Result<Option<Node>> {
        self.with_node(parent, |node, _| Ok(node.del_child(id)))
    }

    pub fn set_listener<F>(&mut self, at: &Address, command: impl Into<String>, listener: F) -> Result<()>
    where
        F: FnMut(&Event, &mut Context<'_>) + Send + 'static,
    {
        self.with_node(at, |node, _| {
            node.set_listener(command, listener);
            Ok(())
        })
    }

    pub fn remove_listener(&mut self, at: &Address, command: &str) -> Result<bool> {
        self.with_node(at, |node, _| Ok(node.remove_listener(command)))
    }

    /// Sends `data` from the topic at `topic` to every subscriber not in `except`.
    pub fn notify(&mut self, topic: &Address, data: Payload, except: &[Address]) -> Result<usize> {
        self.with_node(topic, |node, outbox| node.notify(data, except, outbox))
    }

    /// Mounts a connection for `transport` under the endpoint at `endpoint`.
    pub fn accept(&mut self, endpoint: &Address, transport: Box<dyn Transport>) -> Result<Accepted> {
        self.with_node(endpoint, |node, _| node.accept(transport))
    }

    /// Hands an inbound transport occurrence to the link it belongs to.
    pub fn deliver(&mut self, link: LinkId, event: LinkEvent) -> Result<()> {
        let mut outbox = Outbox::new();
        let result = match self.root.as_mut().and_then(|root| root.find_link_mut(link)) {
            Some(node) => node.on_link_event(event, &mut outbox),
            None => Err(ArborError::UnknownLink(link)),
        };
        self.drain(&mut outbox);
        result
    }

    /// Closes the link at `address`, telling the peer first.
    pub fn terminate(&mut self, address: &Address) -> Result<()> {
        self.with_node(address, |node, outbox| {
            let own = node.address().cloned().ok_or(ArborError::DetachedNode)?;
            let link = node.link_mut().ok_or_else(|| ArborError::NotALink(own.clone()))?;
            link.terminate(&own, outbox);
            Ok(())
        })
    }

    fn start_keep_alive(&mut self) {
        if self.keep_alive.is_some() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let period = self.keep_alive_period;
                self.keep_alive = Some(handle.spawn(async move {
                    let mut interval = tokio::time::interval(period);
                    loop {
                        interval.tick().await;
                    }
                }));
            }
            Err(_) => debug!("No tokio runtime; keep-alive timer not started"),
        }
    }

    fn stop_keep_alive(&mut self) {
        if let Some(handle) = self.keep_alive.take() {
            handle.abort();
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop_keep_alive();
    }
}

fn route(root: &mut Node, event: Event, hop: usize, outbox: &mut Outbox) {
    let Some(own) = root.address() else {
        return;
    };
    let hop = if hop == 0 { own.len() } else { hop };
    if root.link().is_none() && !own.is_parent_of(&event.destination) {
        destination_unreached(event, outbox);
        return;
    }
    let destination = event.destination.clone();
    root.dispatch(&destination, hop, event, outbox);
}
