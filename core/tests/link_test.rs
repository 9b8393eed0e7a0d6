mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use arbor_core::codec;
use arbor_core::{
    Address, ArborError, CloseReason, Dispatcher, EndpointConfig, Event, Link, LinkConfig,
    LinkEvent, LinkId, LinkNotice, LinkState, LivenessConfig, Node, Payload, Result, Role, Value,
};
use bytes::Bytes;
use common::{addr, Inbox, Wire};

fn config() -> LinkConfig {
    LinkConfig::default()
        .with_liveness(LivenessConfig::new(Duration::from_millis(10), 2))
        .with_allow(Vec::new())
}

fn register_event(address: &Address) -> Event {
    let mut data = std::collections::BTreeMap::new();
    data.insert("address".to_string(), Value::from(address));
    Event::new(Address::root(), Address::root(), Payload::new("register").with_data(data))
        .expect("register event")
}

fn root_link(dispatcher: &Dispatcher) -> LinkId {
    dispatcher.root().and_then(Node::link).map(Link::id).expect("root is a link")
}

// root
// ├── public
// ├── private
// └── endpoint   (accepts links, allows root/public)
fn server() -> Result<Dispatcher> {
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::new(), addr(&["root"]));
    let root = addr(&["root"]);
    dispatcher.add_child(&root, "public", Node::new())?;
    dispatcher.add_child(&root, "private", Node::new())?;
    dispatcher.add_child(
        &root,
        "endpoint",
        Node::endpoint(EndpointConfig::new(vec![addr(&["root", "public"])], config())),
    )?;
    Ok(dispatcher)
}

#[test]
fn connector_registers_and_readdresses_subtree() -> Result<()> {
    let wire = Wire::new();
    let notices = Arc::new(Mutex::new(Vec::new()));
    let seen = notices.clone();
    let link = Link::connector(wire.boxed(), config()).with_observer(move |notice| {
        seen.lock().unwrap().push(notice.clone());
    });

    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::with_role(Role::Link(link)), Address::root());
    dispatcher.add_child(&Address::root(), "svc", Node::new())?;
    assert_eq!(wire.commands(), vec!["register"]);

    let assigned = addr(&["root", "endpoint", "0"]);
    dispatcher.deliver(root_link(&dispatcher), LinkEvent::Event(register_event(&assigned)))?;

    let root = dispatcher.root().unwrap();
    assert_eq!(root.address(), Some(&assigned));
    assert_eq!(root.link().unwrap().state(), LinkState::Registered);
    assert_eq!(
        root.get_child("svc").unwrap().address(),
        Some(&addr(&["root", "endpoint", "0", "svc"]))
    );
    assert_eq!(*notices.lock().unwrap(), vec![LinkNotice::Registered(assigned.clone())]);

    // A second announcement changes nothing.
    dispatcher.deliver(
        root_link(&dispatcher),
        LinkEvent::Event(register_event(&addr(&["elsewhere"]))),
    )?;
    assert_eq!(dispatcher.root().unwrap().address(), Some(&assigned));
    Ok(())
}

#[test]
fn connector_holds_outbound_events_until_registered() -> Result<()> {
    let wire = Wire::new();
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::connector(wire.boxed(), config()), Address::root());
    dispatcher.add_child(&Address::root(), "svc", Node::new())?;

    dispatcher.send(&addr(&["svc"]), addr(&["root", "public"]), Payload::new("hello"))?;
    assert_eq!(wire.commands(), vec!["register"]);
    assert_eq!(dispatcher.root().unwrap().link().unwrap().held(), 1);

    wire.take();
    dispatcher.deliver(
        root_link(&dispatcher),
        LinkEvent::Event(register_event(&addr(&["root", "endpoint", "0"]))),
    )?;

    let flushed = wire.take();
    assert_eq!(flushed.len(), 1);
    assert_eq!(flushed[0].command(), "hello");
    assert_eq!(flushed[0].sender, addr(&["root", "endpoint", "0", "svc"]));
    assert_eq!(dispatcher.root().unwrap().link().unwrap().held(), 0);
    Ok(())
}

#[test]
fn unregistered_connector_still_serves_local_children() -> Result<()> {
    let wire = Wire::new();
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::connector(wire.boxed(), config()), Address::root());
    let inbox = Inbox::new();
    let seen = inbox.clone();
    dispatcher.add_child(
        &Address::root(),
        "svc",
        Node::new().with_listener("local", move |event, _| seen.push(event)),
    )?;
    dispatcher.add_child(&Address::root(), "other", Node::new())?;

    dispatcher.send(&addr(&["other"]), addr(&["svc"]), Payload::new("local"))?;
    assert_eq!(inbox.len(), 1);
    assert_eq!(wire.commands(), vec!["register"]);
    Ok(())
}

#[test]
fn hold_queue_overflow_is_answered_as_unreachable() -> Result<()> {
    let wire = Wire::new();
    let mut cfg = config();
    cfg.max_held = 1;
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::connector(wire.boxed(), cfg), Address::root());
    dispatcher.add_child(&Address::root(), "svc", Node::new())?;

    let errors = Inbox::new();
    let seen = errors.clone();
    let svc = addr(&["svc"]);
    dispatcher.chain(&svc, addr(&["remote"]), Payload::new("first"), |_, _| {})?;
    dispatcher.chain(&svc, addr(&["remote"]), Payload::new("second"), move |event, _| {
        seen.push(event)
    })?;

    assert_eq!(errors.commands(), vec!["secondResponse"]);
    assert!(errors.events()[0].is_error());
    Ok(())
}

#[test]
fn connector_discards_inbound_events_before_registration() -> Result<()> {
    let wire = Wire::new();
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::connector(wire.boxed(), config()), Address::root());
    let inbox = Inbox::new();
    let seen = inbox.clone();
    dispatcher.add_child(
        &Address::root(),
        "svc",
        Node::new().with_listener("hello", move |event, _| seen.push(event)),
    )?;

    let early = Event::new(addr(&["peer"]), addr(&["svc"]), Payload::new("hello"))?;
    dispatcher.deliver(root_link(&dispatcher), LinkEvent::Event(early))?;
    assert_eq!(inbox.len(), 0);
    Ok(())
}

#[test]
fn endpoint_assigns_sequential_ids_and_announces_them() -> Result<()> {
    let mut dispatcher = server()?;
    let endpoint = addr(&["root", "endpoint"]);

    let first_wire = Wire::new();
    let second_wire = Wire::new();
    let first = dispatcher.accept(&endpoint, first_wire.boxed())?;
    let second = dispatcher.accept(&endpoint, second_wire.boxed())?;

    assert_eq!(first.address, addr(&["root", "endpoint", "0"]));
    assert_eq!(second.address, addr(&["root", "endpoint", "1"]));
    assert_ne!(first.link, second.link);

    let register = first_wire.last().expect("register written");
    assert_eq!(register.command(), "register");
    let announced = register.data.data().and_then(|d| d.get("address")).and_then(Value::as_address);
    assert_eq!(announced, Some(first.address.clone()));

    let restrictions = dispatcher.node(&first.address).unwrap().link().unwrap().restrictions().clone();
    assert!(restrictions.check(&addr(&["root", "public", "x"])));
    assert!(restrictions.check(&addr(&["root", "endpoint", "0", "peer"])));
    assert!(!restrictions.check(&addr(&["root", "private"])));
    Ok(())
}

#[test]
fn accept_on_plain_node_is_refused() -> Result<()> {
    let mut dispatcher = server()?;
    let result = dispatcher.accept(&addr(&["root", "public"]), Wire::new().boxed());
    assert!(matches!(result, Err(ArborError::NotAnEndpoint(_))));
    Ok(())
}

#[test]
fn inbound_events_respect_restrictions() -> Result<()> {
    let mut dispatcher = server()?;
    let public = Inbox::new();
    let private = Inbox::new();
    let (seen_public, seen_private) = (public.clone(), private.clone());
    dispatcher.set_listener(&addr(&["root", "public"]), "hello", move |e, _| seen_public.push(e))?;
    dispatcher.set_listener(&addr(&["root", "private"]), "hello", move |e, _| seen_private.push(e))?;

    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;
    wire.take();
    let peer = accepted.address.child("peer")?;

    let allowed = Event::new(peer.clone(), addr(&["root", "public"]), Payload::new("hello"))?;
    dispatcher.deliver(accepted.link, LinkEvent::Event(allowed))?;
    assert_eq!(public.len(), 1);

    // Restricted request carrying a reqId: error written back to the peer.
    let mut request = Event::new(peer.clone(), addr(&["root", "private"]), Payload::new("hello"))?;
    request.data.set_req_id(7);
    dispatcher.deliver(accepted.link, LinkEvent::Event(request.clone()))?;
    assert_eq!(private.len(), 0);
    let written = wire.take();
    assert_eq!(written.len(), 1);
    assert_eq!(written[0].command(), "helloResponse");
    assert!(written[0].is_error());
    assert_eq!(written[0].req_id(), Some(7));
    assert_eq!(written[0].destination, peer);

    // Restricted response: dropped silently.
    let response = Event::new(addr(&["root", "private"]), peer.clone(), Payload::new("hello"))?
        .response(Payload::new("helloResponse"))?;
    assert_eq!(response.destination, addr(&["root", "private"]));
    dispatcher.deliver(accepted.link, LinkEvent::Event(response))?;
    assert!(wire.take().is_empty());
    assert_eq!(private.len(), 0);
    Ok(())
}

#[test]
fn peer_cannot_speak_for_a_sibling() -> Result<()> {
    let mut dispatcher = server()?;
    let endpoint = addr(&["root", "endpoint"]);
    let public = Inbox::new();
    let seen = public.clone();
    dispatcher.set_listener(&addr(&["root", "public"]), "hello", move |e, _| seen.push(e))?;

    let first_wire = Wire::new();
    let first = dispatcher.accept(&endpoint, first_wire.boxed())?;
    let second = dispatcher.accept(&endpoint, Wire::new().boxed())?;

    let forged_close = Event::new(second.address.clone(), endpoint.clone(), Payload::new("closeConnection"))?;
    dispatcher.deliver(first.link, LinkEvent::Bytes(codec::encode(&forged_close)?))?;
    assert!(dispatcher.node(&second.address).is_some());
    assert_eq!(
        dispatcher.node(&second.address).and_then(Node::link).map(Link::state),
        Some(LinkState::Registered)
    );

    let spoofed = Event::new(addr(&["root", "private"]), addr(&["root", "public"]), Payload::new("hello"))?;
    dispatcher.deliver(first.link, LinkEvent::Event(spoofed))?;
    assert_eq!(public.len(), 0);

    let genuine = Event::new(first.address.child("app")?, addr(&["root", "public"]), Payload::new("hello"))?;
    dispatcher.deliver(first.link, LinkEvent::Event(genuine))?;
    assert_eq!(public.len(), 1);
    Ok(())
}

#[test]
fn local_request_to_remote_peer_round_trips() -> Result<()> {
    let mut dispatcher = server()?;
    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;
    wire.take();
    let peer = accepted.address.child("peer")?;

    let reply = Inbox::new();
    let seen = reply.clone();
    dispatcher.chain(&addr(&["root", "public"]), peer.clone(), Payload::new("work"), move |e, _| {
        seen.push(e)
    })?;

    let outbound = wire.take();
    assert_eq!(outbound.len(), 1);
    assert_eq!(outbound[0].destination, peer);

    let answer = outbound[0].response(Payload::new("workResponse").with("ok", true))?;
    dispatcher.deliver(accepted.link, LinkEvent::Bytes(codec::encode(&answer)?))?;
    assert_eq!(reply.commands(), vec!["workResponse"]);
    Ok(())
}

#[test]
fn split_frames_are_reassembled() -> Result<()> {
    let mut dispatcher = server()?;
    let inbox = Inbox::new();
    let seen = inbox.clone();
    dispatcher.set_listener(&addr(&["root", "public"]), "blob", move |e, _| seen.push(e))?;

    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;
    let event = Event::new(
        accepted.address.child("peer")?,
        addr(&["root", "public"]),
        Payload::new("blob").with("raw", vec![1u8, 2, 3, 4]),
    )?;
    let mut stream = codec::encode_sequence([&event, &event])?;
    let head: Bytes = stream.split_to(7);

    dispatcher.deliver(accepted.link, LinkEvent::Bytes(head))?;
    assert_eq!(inbox.len(), 0);
    dispatcher.deliver(accepted.link, LinkEvent::Bytes(stream))?;
    assert_eq!(inbox.len(), 2);
    let raw = inbox.events()[1].data.get("raw").and_then(Value::as_bytes).cloned();
    assert_eq!(raw, Some(Bytes::from_static(&[1, 2, 3, 4])));
    Ok(())
}

#[test]
fn ping_is_answered_and_pong_resets_missed_count() -> Result<()> {
    let mut dispatcher = server()?;
    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;
    wire.take();

    dispatcher.deliver(accepted.link, LinkEvent::Tick)?;
    assert_eq!(wire.commands(), vec!["ping"]);
    let link = |d: &Dispatcher| d.node(&accepted.address).unwrap().link().unwrap().missed_pings();
    assert_eq!(link(&dispatcher), 1);

    let pong = Event::new(Address::root(), Address::root(), Payload::new("pong"))?;
    dispatcher.deliver(accepted.link, LinkEvent::Event(pong))?;
    assert_eq!(link(&dispatcher), 0);

    wire.take();
    let ping = Event::new(Address::root(), Address::root(), Payload::new("ping"))?;
    dispatcher.deliver(accepted.link, LinkEvent::Event(ping))?;
    let pong = wire.last().expect("pong written");
    assert_eq!(pong.command(), "pong");
    let address = pong.data.data().and_then(|d| d.get("address")).and_then(Value::as_address);
    assert_eq!(address, Some(accepted.address.clone()));
    Ok(())
}

#[test]
fn missed_pings_tear_the_connection_down() -> Result<()> {
    let mut dispatcher = server()?;
    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;

    dispatcher.deliver(accepted.link, LinkEvent::Tick)?;
    dispatcher.deliver(accepted.link, LinkEvent::Tick)?;
    assert!(dispatcher.node(&accepted.address).is_some());

    dispatcher.deliver(accepted.link, LinkEvent::Tick)?;
    assert!(dispatcher.node(&accepted.address).is_none());
    assert_eq!(wire.close_count(), 1);
    assert_eq!(
        wire.commands().iter().filter(|c| c.as_str() == "ping").count(),
        2
    );

    let late = dispatcher.deliver(accepted.link, LinkEvent::Tick);
    assert!(matches!(late, Err(ArborError::UnknownLink(id)) if id == accepted.link));
    Ok(())
}

#[test]
fn every_teardown_path_closes_once() -> Result<()> {
    let mut dispatcher = server()?;
    let endpoint = addr(&["root", "endpoint"]);

    let by_terminate = Wire::new();
    let a = dispatcher.accept(&endpoint, by_terminate.boxed())?;
    let terminate = Event::new(Address::root(), Address::root(), Payload::new("terminate"))?;
    dispatcher.deliver(a.link, LinkEvent::Event(terminate))?;
    assert!(dispatcher.deliver(a.link, LinkEvent::Closed).is_err());
    assert_eq!(by_terminate.close_count(), 1);

    let by_error = Wire::new();
    let b = dispatcher.accept(&endpoint, by_error.boxed())?;
    dispatcher.deliver(b.link, LinkEvent::Error("reset by peer".into()))?;
    assert_eq!(by_error.close_count(), 1);
    assert!(dispatcher.node(&b.address).is_none());

    let by_write = Wire::new();
    let c = dispatcher.accept(&endpoint, by_write.boxed())?;
    by_write.break_pipe();
    dispatcher.send(&addr(&["root", "public"]), c.address.child("peer")?, Payload::new("x"))?;
    assert_eq!(by_write.close_count(), 1);
    assert!(dispatcher.node(&c.address).is_none());

    let by_detach = Wire::new();
    let d = dispatcher.accept(&endpoint, by_detach.boxed())?;
    let removed = dispatcher.del_child(&endpoint, d.address.last().unwrap())?;
    assert!(removed.is_some());
    assert_eq!(by_detach.commands().last().map(String::as_str), Some("terminate"));
    assert_eq!(by_detach.close_count(), 1);
    drop(removed);
    assert_eq!(by_detach.close_count(), 1);
    Ok(())
}

#[test]
fn local_terminate_notifies_peer() -> Result<()> {
    let mut dispatcher = server()?;
    let wire = Wire::new();
    let accepted = dispatcher.accept(&addr(&["root", "endpoint"]), wire.boxed())?;

    dispatcher.terminate(&accepted.address)?;
    assert_eq!(wire.commands().last().map(String::as_str), Some("terminate"));
    assert_eq!(wire.close_count(), 1);
    assert!(dispatcher.node(&accepted.address).is_none());
    assert!(matches!(
        dispatcher.terminate(&addr(&["root", "public"])),
        Err(ArborError::NotALink(_))
    ));
    Ok(())
}

#[test]
fn connector_observer_sees_close_reason() -> Result<()> {
    let wire = Wire::new();
    let notices = Arc::new(Mutex::new(Vec::new()));
    let seen = notices.clone();
    let link = Link::connector(wire.boxed(), config())
        .with_observer(move |notice| seen.lock().unwrap().push(notice.clone()));

    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::with_role(Role::Link(link)), Address::root());
    let id = root_link(&dispatcher);
    dispatcher.deliver(id, LinkEvent::Closed)?;

    assert_eq!(
        *notices.lock().unwrap(),
        vec![LinkNotice::Closed(CloseReason::TransportClosed)]
    );
    assert!(matches!(
        dispatcher.deliver(id, LinkEvent::Tick),
        Err(ArborError::LinkClosed(_))
    ));
    Ok(())
}

#[test]
fn requests_to_a_closed_connector_are_unreachable() -> Result<()> {
    let wire = Wire::new();
    let mut dispatcher = Dispatcher::new();
    dispatcher.set_root(Node::connector(wire.boxed(), config()), Address::root());
    dispatcher.add_child(&Address::root(), "svc", Node::new())?;
    dispatcher.deliver(
        root_link(&dispatcher),
        LinkEvent::Event(register_event(&addr(&["root", "endpoint", "0"]))),
    )?;
    dispatcher.deliver(root_link(&dispatcher), LinkEvent::Closed)?;

    let errors = Inbox::new();
    let seen = errors.clone();
    dispatcher.chain(
        &addr(&["root", "endpoint", "0", "svc"]),
        addr(&["root", "public"]),
        Payload::new("late"),
        move |e, _| seen.push(e),
    )?;
    assert_eq!(errors.commands(), vec!["lateResponse"]);
    Ok(())
}
