// Endpoint role: accepts inbound links and mounts one connection child per peer
use tracing::{debug, info};

use crate::address::Address;
use crate::config::{EndpointConfig, LinkConfig};
use crate::event::Event;
use crate::link::{Link, Transport};
use crate::node::Context;
use crate::restrictions::Restrictions;

#[derive(Debug)]
pub struct Endpoint {
    base: Restrictions,
    restrictions: Restrictions,
    counter: u64,
    link: LinkConfig,
}

impl Endpoint {
    pub fn new(config: EndpointConfig) -> Self {
        let base = Restrictions::new(config.allow);
        Self {
            restrictions: base.clone(),
            base,
            counter: 0,
            link: config.link,
        }
    }

    /// Restrictions cloned into every new connection.
    pub fn restrictions(&self) -> &Restrictions {
        &self.restrictions
    }

    pub fn allow(&mut self, address: Address) {
        self.base.add(address.clone());
        self.restrictions.add(address);
    }

    pub fn deny(&mut self, address: &Address) {
        self.base.remove(address);
        self.restrictions.remove(address);
    }

    /// Connections accepted so far; also the id the next one will get.
    pub fn accepted(&self) -> u64 {
        self.counter
    }

    pub(crate) fn attached(&mut self, own: &Address) {
        self.restrictions = self.base.clone();
        self.restrictions.add(own.clone());
    }

    /// Builds the connection for a new peer under the next sequential id.
    pub(crate) fn spawn(&mut self, transport: Box<dyn Transport>) -> (String, Link) {
        let id = self.counter.to_string();
        self.counter += 1;
        let link = Link::accepted(transport, self.link.clone(), self.restrictions.clone());
        debug!(child = %id, link = %link.id(), "Spawning connection");
        (id, link)
    }

    pub(crate) fn handle(&mut self, event: &Event, ctx: &mut Context<'_>) -> bool {
        match event.command() {
            "closeConnection" | "sessionExpired" => {
                if event.sender.parent() != *ctx.address() {
                    debug!(sender = %event.sender, "Close notice from a non-child ignored");
                    return true;
                }
                if let Some(id) = event.sender.last() {
                    let id = id.to_string();
                    if ctx.del_child(&id).is_some() {
                        info!(address = %event.sender, reason = event.command(), "Connection removed");
                    }
                }
                ctx.clear_chain_by_destination(&event.sender);
                true
            }
            _ => false,
        }
    }
}

