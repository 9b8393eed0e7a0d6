// Arbor Core Library
// Addressed message bus: routing tree, access restrictions, wire codec, connection protocol

pub mod address;
pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod endpoint;
pub mod event;
pub mod link;
pub mod node;
pub mod restrictions;
pub mod telemetry;
pub mod topic;
pub mod value;

// Export core types
pub use address::Address;
pub use codec::FrameCodec;
pub use config::{EndpointConfig, LinkConfig, LivenessConfig};
pub use dispatcher::{Accepted, Dispatcher};
pub use endpoint::Endpoint;
pub use event::Event;
pub use link::{CloseReason, Link, LinkEvent, LinkId, LinkKind, LinkNotice, LinkState, Transport};
pub use node::{Context, Node, Outbox, RequestIdPolicy, Role, WrapBehavior};
pub use restrictions::Restrictions;
pub use topic::Topic;
pub use value::{Payload, Value};

// Error types
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ArborError {
    #[error("event payload has no command name")]
    MissingCommand,

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("node is detached")]
    DetachedNode,

    #[error("destination {0} is not present")]
    DestinationUnreachable(Address),

    #[error("destination {0} is restricted")]
    RestrictionViolation(Address),

    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("liveness timeout after {0} missed pings")]
    LivenessTimeout(u32),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("unknown link {0}")]
    UnknownLink(LinkId),

    #[error("link {0} is closed")]
    LinkClosed(LinkId),

    #[error("node {0} is not an endpoint")]
    NotAnEndpoint(Address),

    #[error("node {0} is not a topic")]
    NotATopic(Address),

    #[error("node {0} is not a link")]
    NotALink(Address),

    #[error("request ids exhausted at limit {0}")]
    RequestIdsExhausted(u64),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ArborError>;
