// Subscribable node role
use tracing::debug;

use crate::address::Address;
use crate::event::Event;

/// Subscriber list fed by `subscribe` / `unsubscribe` events.
///
/// Fan-out goes through `Dispatcher::notify`.
#[derive(Debug, Default, Clone)]
pub struct Topic {
    subscribers: Vec<Address>,
}

impl Topic {
    pub fn subscribe(&mut self, address: Address) -> bool {
        if self.subscribers.contains(&address) {
            return false;
        }
        self.subscribers.push(address);
        true
    }

    pub fn unsubscribe(&mut self, address: &Address) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|a| a != address);
        before != self.subscribers.len()
    }

    pub fn subscribers(&self) -> impl Iterator<Item = &Address> {
        self.subscribers.iter()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.subscribers.clear();
    }

    pub(crate) fn handle(&mut self, event: &Event) -> bool {
        let changed = match event.command() {
            "subscribe" => self.subscribe(event.sender.clone()),
            "unsubscribe" => self.unsubscribe(&event.sender),
            _ => return false,
        };
        debug!(
            subscriber = %event.sender,
            command = event.command(),
            changed,
            subscribers = self.subscribers.len(),
            "Subscription updated"
        );
        true
    }
}
