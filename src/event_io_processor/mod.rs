//! Event I/O processors (W3C SCXML 1.0 §6, "The Event I/O Processors").
//!
//! This module provides the [`EventIOProcessor`] trait and its concrete implementations:
//! the mandatory SCXML Event I/O Processor (self/parent/invoke/sibling-session routing) and,
//! behind a feature flag, the Basic HTTP Event I/O Processor.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::mpsc::Sender;

#[cfg(feature = "Debug")]
use crate::common::debug;

use crate::datamodel::{Datamodel, GlobalDataArc, ToAny};
use crate::fsm::SessionId;
use crate::fsm::{Event, Fsm};

#[cfg(feature = "BasicHttpEventIOProcessor")]
pub mod http_event_io_processor;

pub mod scxml_event_io_processor;

pub const SYS_IO_PROCESSORS: &str = "_ioprocessors";

pub const EVENT_CANCEL_SESSION: &str = "cancel.session";

#[derive(Debug, Clone, Default)]
pub struct ExternalQueueContainer {
    /// The sessions that are connected to this IO Processor, by session id.
    pub fsms: HashMap<SessionId, Sender<Box<Event>>>,
}

impl ExternalQueueContainer {
    pub fn new() -> ExternalQueueContainer {
        ExternalQueueContainer {
            fsms: HashMap::new(),
        }
    }

    pub fn shutdown(&mut self) {
        let cancel_event = Event::new_simple(EVENT_CANCEL_SESSION);
        #[allow(unused_variables)]
        for (id, sender) in &self.fsms {
            #[cfg(feature = "Debug")]
            debug!("Send cancel to fsm #{}", id);
            let _ = sender.send(Box::new(cancel_event.clone()));
        }
    }
}

/// Trait for Event I/O Processors (W3C SCXML 1.0 §6). An instance is bound to one
/// session's `GlobalData`, but may share a backend (e.g. an HTTP listener) with others.
pub trait EventIOProcessor: ToAny + Debug + Send {
    /// Returns the location of this session and processor (the value bound to
    /// `_ioprocessors.<type>.location`).
    fn get_location(&self, id: SessionId) -> String;

    /// Returns the type(s) (URIs/short forms) this processor answers to.
    fn get_types(&self) -> &[&str];

    fn get_external_queues(&mut self) -> &mut ExternalQueueContainer;

    fn add_fsm(&mut self, _fsm: &Fsm, datamodel: &mut dyn Datamodel) {
        let global = datamodel.global().lock().unwrap();
        self.get_external_queues()
            .fsms
            .insert(global.session_id, global.externalQueue.clone());
    }

    fn get_copy(&self) -> Box<dyn EventIOProcessor>;

    /// Sends `event` to `target` (an URI/location understood by this processor).
    /// Returns `false` if this processor doesn't recognize `target` at all -- the
    /// caller then tries the next registered processor; a recognized-but-failed send
    /// must raise `error.communication` itself and still return `true`.
    fn send(&mut self, global: &GlobalDataArc, target: &str, event: Event) -> bool;

    fn shutdown(&mut self);
}
