// Shared helpers for arbor-core integration tests
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use arbor_core::codec;
use arbor_core::{Address, ArborError, Event, Result, Transport};
use bytes::Bytes;

pub fn addr(segments: &[&str]) -> Address {
    Address::new(segments.iter().copied()).expect("valid address")
}

/// Transport that decodes every frame written to it and keeps the events.
#[derive(Clone, Default)]
pub struct Wire {
    written: Arc<Mutex<Vec<Event>>>,
    closed: Arc<AtomicUsize>,
    broken: Arc<AtomicBool>,
}

impl Wire {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn boxed(&self) -> Box<dyn Transport> {
        Box::new(self.clone())
    }

    pub fn commands(&self) -> Vec<String> {
        self.written
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.command().to_string())
            .collect()
    }

    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.written.lock().unwrap())
    }

    pub fn last(&self) -> Option<Event> {
        self.written.lock().unwrap().last().cloned()
    }

    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn break_pipe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }
}

impl Transport for Wire {
    fn write_bytes(&mut self, frame: Bytes) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(ArborError::Transport("broken pipe".into()));
        }
        let events = codec::decode_sequence(frame)?;
        self.written.lock().unwrap().extend(events);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects clones of whatever a listener receives.
#[derive(Clone, Default)]
pub struct Inbox(Arc<Mutex<Vec<Event>>>);

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: &Event) {
        self.0.lock().unwrap().push(event.clone());
    }

    pub fn len(&self) -> usize {
        self.0.lock().unwrap().len()
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.events().iter().map(|e| e.command().to_string()).collect()
    }
}
