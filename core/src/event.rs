// Event envelope
use bytes::Bytes;

use crate::address::Address;
use crate::value::{keys, Payload};
use crate::{ArborError, Result};

/// Envelope routed through the tree.
///
/// Created by a node on `send`/`chain`/`respond`, or reconstructed from wire
/// bytes by the codec; consumed exactly once by dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub sender: Address,
    pub destination: Address,
    pub data: Payload,
    pub is_response: bool,
    pub trace: bool,
    pub req_id: Option<u64>,
}

impl Event {
    pub fn new(sender: Address, destination: Address, data: Payload) -> Result<Self> {
        Self::with_flags(sender, destination, data, false, false)
    }

    /// Fails with [`ArborError::MissingCommand`] when `data` has no command name.
    pub fn with_flags(
        sender: Address,
        destination: Address,
        data: Payload,
        is_response: bool,
        trace: bool,
    ) -> Result<Self> {
        if data.command().is_none() {
            return Err(ArborError::MissingCommand);
        }
        Ok(Self {
            sender,
            destination,
            data,
            is_response,
            trace,
            req_id: None,
        })
    }

    /// Link-level control event (`ping`, `register`, ...) with empty addresses.
    pub(crate) fn control(data: Payload) -> Self {
        debug_assert!(data.command().is_some());
        Self {
            sender: Address::root(),
            destination: Address::root(),
            data,
            is_response: false,
            trace: false,
            req_id: None,
        }
    }

    pub fn command(&self) -> &str {
        self.data.command().unwrap_or_default()
    }

    /// Correlation id, from the envelope or, failing that, the payload.
    pub fn req_id(&self) -> Option<u64> {
        self.req_id.or_else(|| self.data.req_id())
    }

    /// Builds the reply: addresses swapped, `is_response` set, `reqId` carried over.
    pub fn response(&self, mut data: Payload) -> Result<Event> {
        let req_id = self.req_id();
        if let Some(id) = req_id {
            data.set_req_id(id);
        }
        let mut reply = Event::with_flags(
            self.destination.clone(),
            self.sender.clone(),
            data,
            true,
            false,
        )?;
        reply.req_id = req_id;
        Ok(reply)
    }

    /// `<command>Response` with `error: true` and `details`.
    pub fn error_response(&self, details: impl Into<String>) -> Result<Event> {
        self.response(Payload::error(self.command(), details))
    }

    /// Every binary value in the payload, depth-first in encounter order.
    ///
    /// The returned handles share storage with the payload, so this doubles as
    /// the transfer list for in-process handoff.
    pub fn capture_binary_segments(&self) -> Vec<Bytes> {
        let mut out = Vec::new();
        self.data.collect_bytes(&mut out);
        out
    }

    pub fn is_error(&self) -> bool {
        self.data.is_error()
    }

    pub(crate) fn stamp_req_id(&mut self, id: u64) {
        self.req_id = Some(id);
        self.data.insert(keys::REQ_ID, id);
    }
}
