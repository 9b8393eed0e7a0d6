//! Node tree and dispatch engine.
//!
//! A [`Node`] owns its children by path segment, a map of command listeners and
//! the request correlations it is waiting on. Routing walks the tree one
//! segment per hop; connection-boundary nodes ([`Role::Link`]) intercept the
//! walk and forward the event out of process instead.
//!
//! Nodes hold no pointer back to their dispatcher. Every operation that emits
//! events takes the [`Outbox`] of the dispatch in progress; the dispatcher
//! drains it after the current handler returns.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;

use tracing::{debug, info, warn};

use crate::address::{validate_segment, Address};
use crate::config::{EndpointConfig, LinkConfig};
use crate::dispatcher::Accepted;
use crate::endpoint::Endpoint;
use crate::event::Event;
use crate::link::{Link, LinkEvent, LinkId, LinkState, Transport};
use crate::topic::Topic;
use crate::value::Payload;
use crate::{ArborError, Result};

/// Handler registered for a command name.
pub type Listener = Box<dyn FnMut(&Event, &mut Context<'_>) + Send>;

/// One-shot handler for a correlated response.
pub type ChainCallback = Box<dyn FnOnce(&Event, &mut Context<'_>) + Send>;

/// Largest integer the JSON metadata carries exactly.
pub const MAX_JSON_SAFE_ID: u64 = (1 << 53) - 1;

/// Events waiting to be dispatched, with the hop index to resume at.
#[derive(Debug, Default)]
pub struct Outbox {
    queue: VecDeque<(Event, usize)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an event for dispatch from the root.
    pub fn push(&mut self, event: Event) {
        self.queue.push_back((event, 0));
    }

    pub fn push_at(&mut self, event: Event, hop: usize) {
        self.queue.push_back((event, hop));
    }

    pub fn pop(&mut self) -> Option<(Event, usize)> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = Event> + '_ {
        self.queue.drain(..).map(|(event, _)| event)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
    }
}

/// What to do when the request id counter passes its limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WrapBehavior {
    /// Restart at zero. Ids still pending from the previous cycle may collide.
    Wrap,
    /// Refuse further `chain` calls with [`ArborError::RequestIdsExhausted`].
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIdPolicy {
    pub limit: u64,
    pub on_wrap: WrapBehavior,
}

impl Default for RequestIdPolicy {
    fn default() -> Self {
        Self {
            limit: MAX_JSON_SAFE_ID,
            on_wrap: WrapBehavior::Wrap,
        }
    }
}

struct Chained {
    callback: ChainCallback,
    destination: Address,
}

#[derive(Default)]
struct Pending {
    next: u64,
    policy: RequestIdPolicy,
    entries: HashMap<u64, Chained>,
}

impl Pending {
    fn allocate(&mut self) -> Result<u64> {
        if self.next > self.policy.limit {
            match self.policy.on_wrap {
                WrapBehavior::Fail => {
                    return Err(ArborError::RequestIdsExhausted(self.policy.limit));
                }
                WrapBehavior::Wrap => {
                    warn!(
                        limit = self.policy.limit,
                        pending = self.entries.len(),
                        "Request id counter wrapped to zero"
                    );
                    self.next = 0;
                }
            }
        }
        let id = self.next;
        self.next += 1;
        if self.entries.contains_key(&id) {
            warn!(req_id = id, "Request id reused while still pending; older callback replaced");
        }
        Ok(id)
    }

    /// Removes and returns the callback only when `sender` is the expected peer.
    fn take_matching(&mut self, id: u64, sender: &Address) -> Option<ChainCallback> {
        match self.entries.get(&id) {
            Some(chained) if chained.destination == *sender => {
                self.entries.remove(&id).map(|c| c.callback)
            }
            Some(chained) => {
                debug!(
                    req_id = id,
                    expected = %chained.destination,
                    actual = %sender,
                    "Correlated response from unexpected sender ignored"
                );
                None
            }
            None => None,
        }
    }

    fn clear(&mut self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    fn clear_by_destination(&mut self, destination: &Address) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, c| c.destination != *destination);
        before - self.entries.len()
    }
}

/// Handle given to listeners and chain callbacks: the node's own address, its
/// children and correlations, and the outbox of the dispatch in progress.
pub struct Context<'a> {
    address: &'a Address,
    children: &'a mut BTreeMap<String, Node>,
    pending: &'a mut Pending,
    outbox: &'a mut Outbox,
}

impl<'a> Context<'a> {
    pub fn address(&self) -> &Address {
        self.address
    }

    pub fn send(&mut self, destination: Address, data: Payload) -> Result<()> {
        self.send_traced(destination, data, false)
    }

    pub fn send_traced(&mut self, destination: Address, data: Payload, trace: bool) -> Result<()> {
        let event = Event::with_flags(self.address.clone(), destination, data, false, trace)?;
        self.outbox.push(event);
        Ok(())
    }

    pub fn chain<F>(&mut self, destination: Address, data: Payload, callback: F) -> Result<u64>
    where
        F: FnOnce(&Event, &mut Context<'_>) + Send + 'static,
    {
        chain_from(
            self.address,
            self.pending,
            self.outbox,
            destination,
            data,
            Box::new(callback),
            false,
        )
    }

    pub fn clear_chain(&mut self, id: u64) -> bool {
        self.pending.clear(id)
    }

    pub fn clear_chain_by_destination(&mut self, destination: &Address) -> usize {
        self.pending.clear_by_destination(destination)
    }

    /// Replies to `to`, carrying its request id.
    pub fn respond(&mut self, to: &Event, data: Payload) -> Result<()> {
        let reply = to.response(data)?;
        self.outbox.push(reply);
        Ok(())
    }

    /// Queues an already built event for dispatch from the root.
    pub fn dispatch(&mut self, event: Event) {
        self.outbox.push(event);
    }

    pub fn add_child(&mut self, id: impl Into<String>, node: Node) -> Result<bool> {
        insert_child(self.children, Some(self.address), id.into(), node)
    }

    pub fn del_child(&mut self, id: &str) -> Option<Node> {
        remove_child(self.children, Some(self.address), id)
    }

    pub fn child(&self, id: &str) -> Option<&Node> {
        self.children.get(id)
    }

    pub fn child_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.children.get_mut(id)
    }
}

/// Behaviour layered on a plain node.
#[derive(Debug, Default)]
pub enum Role {
    #[default]
    Plain,
    /// Accepts inbound links and spawns one connection child per peer.
    Endpoint(Endpoint),
    /// Connection boundary: a connector or an accepted connection.
    Link(Link),
    /// Keeps subscribers and fans payloads out to them.
    Topic(Topic),
}

impl Role {
    pub fn name(&self) -> &'static str {
        match self {
            Role::Plain => "plain",
            Role::Endpoint(_) => "endpoint",
            Role::Link(_) => "link",
            Role::Topic(_) => "topic",
        }
    }

    fn attached(&mut self, address: &Address) {
        match self {
            Role::Endpoint(endpoint) => endpoint.attached(address),
            Role::Link(link) => link.attached(address),
            Role::Plain | Role::Topic(_) => {}
        }
    }

    fn readdressed(&mut self, address: &Address) {
        match self {
            Role::Endpoint(endpoint) => endpoint.attached(address),
            Role::Link(link) => link.readdressed(address),
            Role::Plain | Role::Topic(_) => {}
        }
    }

    fn detached(&mut self) {
        match self {
            Role::Link(link) => link.detached(),
            Role::Topic(topic) => topic.clear(),
            Role::Plain | Role::Endpoint(_) => {}
        }
    }

    /// Built-in commands; true when the event was consumed.
    fn handle(&mut self, event: &Event, ctx: &mut Context<'_>) -> bool {
        match self {
            Role::Endpoint(endpoint) => endpoint.handle(event, ctx),
            Role::Topic(topic) => topic.handle(event),
            Role::Plain | Role::Link(_) => false,
        }
    }
}

#[derive(Default)]
pub struct Node {
    address: Option<Address>,
    children: BTreeMap<String, Node>,
    listeners: HashMap<String, Listener>,
    pending: Pending,
    role: Role,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .field("role", &self.role.name())
            .field("children", &self.children.keys().collect::<Vec<_>>())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .field("pending", &self.pending.entries.len())
            .finish()
    }
}

impl Node {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_role(role: Role) -> Self {
        Self {
            role,
            ..Self::default()
        }
    }

    pub fn endpoint(config: EndpointConfig) -> Self {
        Self::with_role(Role::Endpoint(Endpoint::new(config)))
    }

    pub fn connector(transport: Box<dyn Transport>, config: LinkConfig) -> Self {
        Self::with_role(Role::Link(Link::connector(transport, config)))
    }

    pub fn topic() -> Self {
        Self::with_role(Role::Topic(Topic::default()))
    }

    pub fn with_listener<F>(mut self, command: impl Into<String>, listener: F) -> Self
    where
        F: FnMut(&Event, &mut Context<'_>) + Send + 'static,
    {
        self.set_listener(command, listener);
        self
    }

    pub fn with_request_id_policy(mut self, mut policy: RequestIdPolicy) -> Self {
        policy.limit = policy.limit.min(u64::MAX - 1);
        self.pending.policy = policy;
        self
    }

    pub fn address(&self) -> Option<&Address> {
        self.address.as_ref()
    }

    pub fn is_attached(&self) -> bool {
        self.address.is_some()
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut Role {
        &mut self.role
    }

    pub fn link(&self) -> Option<&Link> {
        match &self.role {
            Role::Link(link) => Some(link),
            _ => None,
        }
    }

    pub fn link_mut(&mut self) -> Option<&mut Link> {
        match &mut self.role {
            Role::Link(link) => Some(link),
            _ => None,
        }
    }

    pub fn as_endpoint(&self) -> Option<&Endpoint> {
        match &self.role {
            Role::Endpoint(endpoint) => Some(endpoint),
            _ => None,
        }
    }

    pub fn as_topic(&self) -> Option<&Topic> {
        match &self.role {
            Role::Topic(topic) => Some(topic),
            _ => None,
        }
    }

    /// Makes the node live at `address`, together with every existing child.
    ///
    /// Attaching a live node moves it (and its subtree) to the new address.
    pub fn attach(&mut self, address: Address) {
        if self.address.is_some() {
            self.readdress(address);
            return;
        }
        self.role.attached(&address);
        for (id, child) in self.children.iter_mut() {
            child.attach(address.join(id));
        }
        self.address = Some(address);
    }

    fn readdress(&mut self, address: Address) {
        self.role.readdressed(&address);
        for (id, child) in self.children.iter_mut() {
            child.readdress(address.join(id));
        }
        self.address = Some(address);
    }

    /// Detaches the subtree, clears listeners and correlations. Safe to repeat.
    pub fn detach(&mut self) {
        let Some(address) = self.address.take() else {
            debug!("Node already detached");
            return;
        };
        debug!(address = %address, role = self.role.name(), "Detaching node");
        for child in self.children.values_mut() {
            child.detach();
        }
        self.role.detached();
        self.listeners.clear();
        self.pending.entries.clear();
    }

    /// Adds a child at `id`; an existing child with that id is kept and `false` returned.
    pub fn add_child(&mut self, id: impl Into<String>, node: Node) -> Result<bool> {
        insert_child(&mut self.children, self.address.as_ref(), id.into(), node)
    }

    pub fn del_child(&mut self, id: &str) -> Option<Node> {
        remove_child(&mut self.children, self.address.as_ref(), id)
    }

    pub fn get_child(&self, id: &str) -> Option<&Node> {
        self.children.get(id)
    }

    pub fn get_child_mut(&mut self, id: &str) -> Option<&mut Node> {
        self.children.get_mut(id)
    }

    pub fn children(&self) -> impl Iterator<Item = (&str, &Node)> {
        self.children.iter().map(|(id, node)| (id.as_str(), node))
    }

    pub fn set_listener<F>(&mut self, command: impl Into<String>, listener: F)
    where
        F: FnMut(&Event, &mut Context<'_>) + Send + 'static,
    {
        self.listeners.insert(command.into(), Box::new(listener));
    }

    pub fn remove_listener(&mut self, command: &str) -> bool {
        self.listeners.remove(command).is_some()
    }

    pub fn has_listener(&self, command: &str) -> bool {
        self.listeners.contains_key(command)
    }

    pub fn send(&self, destination: Address, data: Payload, outbox: &mut Outbox) -> Result<()> {
        self.send_traced(destination, data, false, outbox)
    }

    pub fn send_traced(
        &self,
        destination: Address,
        data: Payload,
        trace: bool,
        outbox: &mut Outbox,
    ) -> Result<()> {
        let address = self.address.as_ref().ok_or(ArborError::DetachedNode)?;
        let event = Event::with_flags(address.clone(), destination, data, false, trace)?;
        outbox.push(event);
        Ok(())
    }

    /// Sends a request and remembers `callback` until `destination` answers with the same id.
    pub fn chain<F>(
        &mut self,
        destination: Address,
        data: Payload,
        callback: F,
        outbox: &mut Outbox,
    ) -> Result<u64>
    where
        F: FnOnce(&Event, &mut Context<'_>) + Send + 'static,
    {
        self.chain_traced(destination, data, callback, false, outbox)
    }

    pub fn chain_traced<F>(
        &mut self,
        destination: Address,
        data: Payload,
        callback: F,
        trace: bool,
        outbox: &mut Outbox,
    ) -> Result<u64>
    where
        F: FnOnce(&Event, &mut Context<'_>) + Send + 'static,
    {
        let address = self.address.as_ref().ok_or(ArborError::DetachedNode)?;
        chain_from(
            address,
            &mut self.pending,
            outbox,
            destination,
            data,
            Box::new(callback),
            trace,
        )
    }

    pub fn clear_chain(&mut self, id: u64) -> bool {
        self.pending.clear(id)
    }

    /// Drops every correlation waiting on `destination`, e.g. after the peer disconnected.
    pub fn clear_chain_by_destination(&mut self, destination: &Address) -> usize {
        self.pending.clear_by_destination(destination)
    }

    pub fn pending_chains(&self) -> usize {
        self.pending.entries.len()
    }

    pub fn is_pending(&self, id: u64) -> bool {
        self.pending.entries.contains_key(&id)
    }

    /// Routes `event` one hop further along `destination`.
    pub fn dispatch(
        &mut self,
        destination: &Address,
        hop: usize,
        event: Event,
        outbox: &mut Outbox,
    ) {
        let mut hop = hop;
        if let Role::Link(link) = &mut self.role {
            let Some(own) = self.address.as_ref() else {
                warn!(destination = %destination, "Detached link received event");
                return;
            };
            // An unregistered root connector still serves its own children.
            let local = link.routes_locally(own, destination)
                || (own.is_empty()
                    && destination
                        .get(0)
                        .is_some_and(|id| self.children.contains_key(id)));
            if !local {
                link.send_remote(own, event, outbox);
                return;
            }
            hop = own.len();
        }

        if hop == destination.len() {
            if event.trace {
                info!(command = event.command(), at = %destination, "EVENT TRACE: HANDLING");
            }
            self.handle(event, outbox);
            return;
        }

        match destination.get(hop).and_then(|id| self.children.get_mut(id)) {
            Some(child) => {
                if event.trace {
                    info!(
                        command = event.command(),
                        at = %destination.segments()[..hop].join(","),
                        "EVENT TRACE: PASSING"
                    );
                }
                child.dispatch(destination, hop + 1, event, outbox);
            }
            None => {
                if event.trace {
                    info!(
                        command = event.command(),
                        at = %destination.segments()[..hop.min(destination.len())].join(","),
                        "EVENT TRACE: STUCK"
                    );
                }
                destination_unreached(event, outbox);
            }
        }
    }

    /// Terminal handling: pending correlation, then listener, then role, then default.
    pub fn handle(&mut self, event: Event, outbox: &mut Outbox) {
        let Node {
            address,
            children,
            listeners,
            pending,
            role,
        } = self;
        let Some(address) = address.as_ref() else {
            default_handler(None, &event);
            return;
        };
        let mut ctx = Context {
            address,
            children,
            pending,
            outbox,
        };

        if let Some(req_id) = event.req_id() {
            if let Some(callback) = ctx.pending.take_matching(req_id, &event.sender) {
                callback(&event, &mut ctx);
                return;
            }
        }
        if let Some(listener) = listeners.get_mut(event.command()) {
            listener(&event, &mut ctx);
            return;
        }
        if role.handle(&event, &mut ctx) {
            return;
        }
        default_handler(Some(address), &event);
    }

    pub fn find(&self, target: &Address) -> Option<&Node> {
        let own = self.address.as_ref()?;
        if !own.is_parent_of(target) {
            return None;
        }
        let mut node = self;
        for segment in &target.segments()[own.len()..] {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    pub fn find_mut(&mut self, target: &Address) -> Option<&mut Node> {
        let depth = {
            let own = self.address.as_ref()?;
            if !own.is_parent_of(target) {
                return None;
            }
            own.len()
        };
        let mut node = self;
        for segment in &target.segments()[depth..] {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    pub(crate) fn find_link_mut(&mut self, id: LinkId) -> Option<&mut Node> {
        if matches!(&self.role, Role::Link(link) if link.id() == id) {
            return Some(self);
        }
        self.children
            .values_mut()
            .find_map(|child| child.find_link_mut(id))
    }

    pub(crate) fn on_link_event(&mut self, event: LinkEvent, outbox: &mut Outbox) -> Result<()> {
        let own = self.address.clone().ok_or(ArborError::DetachedNode)?;
        let Role::Link(link) = &mut self.role else {
            return Err(ArborError::NotALink(own));
        };
        if link.state() == LinkState::Closed {
            return Err(ArborError::LinkClosed(link.id()));
        }
        if let Some(registered) = link.on_event(event, &own, outbox) {
            self.readdress(registered);
        }
        Ok(())
    }

    pub(crate) fn accept(&mut self, transport: Box<dyn Transport>) -> Result<Accepted> {
        let own = self.address.clone().ok_or(ArborError::DetachedNode)?;
        let Role::Endpoint(endpoint) = &mut self.role else {
            return Err(ArborError::NotAnEndpoint(own));
        };
        let (id, link) = endpoint.spawn(transport);
        let link_id = link.id();
        let liveness = link.config().liveness.clone();

        if !insert_child(&mut self.children, Some(&own), id.clone(), Node::with_role(Role::Link(link)))? {
            return Err(ArborError::Transport(format!("connection id {id} already in use")));
        }
        let closed = self
            .children
            .get(&id)
            .and_then(Node::link)
            .is_some_and(|link| link.state() == LinkState::Closed);
        if closed {
            remove_child(&mut self.children, Some(&own), &id);
            return Err(ArborError::LinkClosed(link_id));
        }

        let address = own.join(&id);
        info!(address = %address, link = %link_id, "Accepted connection");
        Ok(Accepted {
            link: link_id,
            address,
            liveness,
        })
    }

    pub(crate) fn notify(&self, data: Payload, except: &[Address], outbox: &mut Outbox) -> Result<usize> {
        let own = self.address.as_ref().ok_or(ArborError::DetachedNode)?;
        let Role::Topic(topic) = &self.role else {
            return Err(ArborError::NotATopic(own.clone()));
        };
        let mut sent = 0;
        for subscriber in topic.subscribers().filter(|s| !except.contains(s)) {
            outbox.push(Event::new(own.clone(), subscriber.clone(), data.clone())?);
            sent += 1;
        }
        Ok(sent)
    }
}

fn chain_from(
    address: &Address,
    pending: &mut Pending,
    outbox: &mut Outbox,
    destination: Address,
    data: Payload,
    callback: ChainCallback,
    trace: bool,
) -> Result<u64> {
    let mut event = Event::with_flags(address.clone(), destination.clone(), data, false, trace)?;
    let id = pending.allocate()?;
    event.stamp_req_id(id);
    pending.entries.insert(
        id,
        Chained {
            callback,
            destination,
        },
    );
    outbox.push(event);
    Ok(id)
}

fn insert_child(
    children: &mut BTreeMap<String, Node>,
    parent: Option<&Address>,
    id: String,
    mut node: Node,
) -> Result<bool> {
    validate_segment(&id)?;
    if children.contains_key(&id) {
        warn!(parent = %describe(parent), child = %id, "Node already exists");
        return Ok(false);
    }
    if let Some(parent) = parent {
        node.attach(parent.join(&id));
    }
    children.insert(id, node);
    Ok(true)
}

fn remove_child(
    children: &mut BTreeMap<String, Node>,
    parent: Option<&Address>,
    id: &str,
) -> Option<Node> {
    match children.remove(id) {
        Some(mut node) => {
            node.detach();
            Some(node)
        }
        None => {
            warn!(parent = %describe(parent), child = %id, "Node doesn't exist");
            None
        }
    }
}

/// Answers an undeliverable request with an error response; responses are only logged.
pub(crate) fn destination_unreached(event: Event, outbox: &mut Outbox) {
    if event.is_response {
        warn!(
            destination = %event.destination,
            command = event.command(),
            "Response destination is not present; dropped"
        );
        return;
    }
    debug!(destination = %event.destination, command = event.command(), "Destination unreachable");
    match event.error_response(format!("Node {} is not present", event.destination)) {
        Ok(reply) => outbox.push(reply),
        Err(e) => warn!(error = %e, "Could not build unreachable response"),
    }
}

fn default_handler(address: Option<&Address>, event: &Event) {
    match address {
        Some(address) => warn!(
            address = %address,
            command = event.command(),
            data = %event.data,
            "DEFAULT HANDLER: no listener for command"
        ),
        None => warn!(
            sender = %event.sender,
            destination = %event.destination,
            data = %event.data,
            "Detached node received event"
        ),
    }
}

fn describe(address: Option<&Address>) -> String {
    address.map(ToString::to_string).unwrap_or_else(|| "<detached>".into())
}
