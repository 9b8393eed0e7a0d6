//! Tokio runtime pieces for arbor trees.
//!
//! [`Router`] owns a [`Dispatcher`](arbor_core::Dispatcher) on its own task;
//! everything else talks to it through a cloneable [`RouterHandle`]. The TCP
//! and in-process drivers implement the link collaborator interface on top of
//! that handle.

use arbor_core::ArborError;

pub mod channel;
pub mod driver;
pub mod router;
pub mod socket;
pub mod tcp;

pub use channel::{link_in_process, pipe, ChannelEnd, ChannelTransport};
pub use driver::ConnectorHandle;
pub use router::{Router, RouterHandle};
pub use socket::{SocketDriver, SocketTransport};
pub use tcp::{connect, Session, TcpEndpointServer};

#[derive(thiserror::Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Arbor(#[from] ArborError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("router task has stopped")]
    RouterGone,
    #[error("registration failed: {0}")]
    Registration(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;
