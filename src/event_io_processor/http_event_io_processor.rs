//! Implementation of the Basic HTTP Event I/O Processor
//! (W3C SCXML 1.0 §6.3 "The Basic HTTP Event I/O Processor"), type
//! `http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor` (or short form "basichttp").
//! Included if feature "BasicHttpEventIOProcessor" is enabled.
//!
//! Serving an inbound HTTP endpoint for a session is a deployment concern left to the
//! embedding application (see `fsm_executor::FsmExecutor::send_to_session` for how an
//! inbound event reaches a session once decoded); this processor implements the
//! outbound half that `<send target="http://...">` needs: form-encoding the event and
//! POSTing it to the target URL.

use crate::common::{debug, error};
use crate::datamodel::{Data, GlobalDataArc, BASIC_HTTP_EVENT_PROCESSOR};
use crate::event_io_processor::{EventIOProcessor, ExternalQueueContainer};
use crate::fsm::{Event, SessionId};

pub const SCXML_EVENT_NAME: &str = "_scxmleventname";
pub const SCXML_EVENT_CONTENT: &str = "_content";

/// Client-side Basic HTTP Event I/O Processor. One instance is shared across all
/// sessions of a process; `location` is only meaningful if this process also exposes
/// an inbound endpoint under that base URL (left to the embedding application).
#[derive(Debug, Clone, Default)]
pub struct BasicHTTPEventIOProcessor {
    pub location: String,
    pub queues: ExternalQueueContainer,
}

impl BasicHTTPEventIOProcessor {
    pub fn new() -> BasicHTTPEventIOProcessor {
        BasicHTTPEventIOProcessor {
            location: String::new(),
            queues: ExternalQueueContainer::new(),
        }
    }

    pub fn with_location(location: &str) -> BasicHTTPEventIOProcessor {
        BasicHTTPEventIOProcessor {
            location: location.to_string(),
            queues: ExternalQueueContainer::new(),
        }
    }
}

const TYPES: &[&str] = &[BASIC_HTTP_EVENT_PROCESSOR, "basichttp"];

impl EventIOProcessor for BasicHTTPEventIOProcessor {
    fn get_location(&self, id: SessionId) -> String {
        format!("{}{}", self.location, id)
    }

    fn get_types(&self) -> &[&str] {
        TYPES
    }

    fn get_external_queues(&mut self) -> &mut ExternalQueueContainer {
        &mut self.queues
    }

    fn get_copy(&self) -> Box<dyn EventIOProcessor> {
        Box::new(self.clone())
    }

    /// *W3C says* (B.2.9 Serialization): in certain circumstances, e.g. including data
    /// in events sent via the BasicHTTP Event I/O Processor, the Processor is required
    /// to serialize data model values for transmission to a remote entity. If the
    /// Processor supports JSON it MUST serialize to JSON; form-encoding here is the
    /// platform-specific fallback this implementation uses for simple values.
    fn send(&mut self, global: &GlobalDataArc, target: &str, event: Event) -> bool {
        if !(target.starts_with("http://") || target.starts_with("https://")) {
            return false;
        }

        debug!("Send HTTP Event {} to {}", event.name, target);

        let mut form_data: Vec<(String, String)> = Vec::new();
        form_data.push((SCXML_EVENT_NAME.to_string(), event.name.clone()));
        if let Some(parameters) = &event.param_values {
            for p in parameters {
                form_data.push((p.name.clone(), p.value.to_string()));
            }
        }
        if let Some(content) = &event.content {
            if !matches!(content, Data::None) {
                form_data.push((SCXML_EVENT_CONTENT.to_string(), content.to_string()));
            }
        }
        let form_refs: Vec<(&str, &str)> = form_data
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        // W3C: 2xx is success; 4xx is a permanent failure (no retry); 5xx and transport
        // errors (timeout, connection refused, ...) are retried with backoff before
        // giving up and placing error.communication on the internal queue.
        const RETRIES: u32 = 3;
        let mut last_err = None;
        for attempt in 0..RETRIES {
            match ureq::post(target).send_form(form_refs.as_slice()) {
                Ok(_) => return true,
                Err(ureq::Error::Status(code, response)) if (400..500).contains(&code) => {
                    error!(
                        "Send to {} permanently failed with status {}: {}",
                        target,
                        code,
                        response.status_text()
                    );
                    global
                        .lock()
                        .unwrap()
                        .enqueue_internal(Event::error_communication(&event));
                    return true;
                }
                Err(err) => {
                    last_err = Some(err.to_string());
                    if attempt + 1 < RETRIES {
                        std::thread::sleep(std::time::Duration::from_millis(100 * (attempt as u64 + 1)));
                    }
                }
            }
        }
        error!(
            "Failed to send event '{}' to {}: {}",
            event.name,
            target,
            last_err.unwrap_or_default()
        );
        global.lock().unwrap().enqueue_internal(Event::error_communication(&event));
        true
    }

    fn shutdown(&mut self) {
        self.queues.shutdown();
    }
}
