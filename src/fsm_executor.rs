//! Helper module to maintain FSM sessions.\

extern crate core;

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
#[cfg(test)]
use std::println as info;
use std::sync::mpsc::{SendError, Sender};
use std::sync::{Arc, Mutex};

#[cfg(not(test))]
use log::info;
use timer::Timer;

#[cfg(feature = "BasicHttpEventIOProcessor")]
use crate::event_io_processor::http_event_io_processor::BasicHTTPEventIOProcessor;
use crate::common::ArgOption;
use crate::datamodel::Data;
use crate::event_io_processor::scxml_event_io_processor::ScxmlEventIOProcessor;
use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{Event, InvokeId, ManualScxmlSession, ScxmlSession, SessionId};
use crate::scheduler::{AutomaticScheduler, Scheduler};
#[cfg(feature = "Trace")]
use crate::tracer::TraceMode;
use crate::{fsm, scxml_reader};

#[derive(Clone)]
pub struct SessionHandle {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
}

pub struct ExecuteState {
    pub processors: Vec<Box<dyn EventIOProcessor>>,
    pub sessions: HashMap<SessionId, SessionHandle>,
}

impl ExecuteState {
    pub fn new() -> ExecuteState {
        let e = ExecuteState {
            processors: Vec::new(),
            sessions: HashMap::new(),
        };
        e
    }
}

/// Executed FSM in separate threads.
/// This class maintains IO Processors used by the FSMs and running sessions.
#[derive(Clone)]
pub struct FsmExecutor {
    pub state: Arc<Mutex<ExecuteState>>,
    pub include_paths: Vec<PathBuf>,
    /// Shared delayed-event timer backing every session's scheduler (`<send delay="...">`).
    pub timer: Arc<Timer>,
}

pub static INCLUDE_PATH_ARGUMENT_OPTION: ArgOption = ArgOption {
    name: "includePaths",
    with_value: true,
    required: false,
};

pub fn include_path_from_arguments(
    named_arguments: &HashMap<&'static str, String>,
) -> Vec<PathBuf> {
    let mut include_paths = Vec::new();
    match named_arguments.get(INCLUDE_PATH_ARGUMENT_OPTION.name) {
        None => {}
        Some(paths) => {
            for pa in env::split_paths(&paths) {
                include_paths.push(pa.to_owned());
            }
        }
    }
    include_paths
}

impl FsmExecutor {
    pub fn add_processor(&mut self, processor: Box<dyn EventIOProcessor>) {
        self.state.lock().unwrap().processors.push(processor);
    }

    pub fn new_without_io_processor() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            include_paths: Vec::new(),
            timer: Arc::new(Timer::new()),
        };
        e.add_processor(Box::new(ScxmlEventIOProcessor::new()));
        e
    }

    pub fn new_with_io_processor() -> FsmExecutor {
        let mut e = FsmExecutor {
            state: Arc::new(Mutex::new(ExecuteState::new())),
            include_paths: Vec::new(),
            timer: Arc::new(Timer::new()),
        };
        #[cfg(feature = "BasicHttpEventIOProcessor")]
        e.add_processor(Box::new(BasicHTTPEventIOProcessor::new()));
        e.add_processor(Box::new(ScxmlEventIOProcessor::new()));
        e
    }

    pub fn set_include_paths_from_arguments(
        &mut self,
        named_arguments: &HashMap<&'static str, String>,
    ) {
        self.set_include_paths(&include_path_from_arguments(named_arguments));
    }

    pub fn set_include_paths(&mut self, include_path: &Vec<PathBuf>) {
        for p in include_path {
            self.include_paths.push(p.clone());
        }
    }

    /// Shutdown of all FSMs and IO-Processors.
    pub fn shutdown(&mut self) {
        let mut guard = self.state.lock().unwrap();
        while !guard.processors.is_empty() {
            let p = guard.processors.pop();
            match p {
                Some(mut pp) => {
                    pp.shutdown();
                }
                None => {}
            }
        }
    }

    /// Loads and starts the specified FSM.
    pub fn execute(
        &mut self,
        uri: &str,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        self.execute_with_data(
            uri,
            &HashMap::new(),
            None,
            &"".to_string(),
            #[cfg(feature = "Trace")]
            trace,
        )
    }

    /// Loads and starts the specified FSM with some data set.
    pub fn execute_with_data(
        &mut self,
        uri: &str,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from {}", uri);

        // Use reader to parse the scxml file:
        let sm = scxml_reader::parse_from_uri(uri.to_string(), &self.include_paths);
        match sm {
            Ok(mut fsm) => {
                #[cfg(feature = "Trace")]
                fsm.global.lock().unwrap().tracer.enable_trace(trace);
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                fsm.global.lock().unwrap().scheduler =
                    Some(Box::new(AutomaticScheduler::with_timer(self.timer.clone())));
                let session = fsm::start_fsm_with_data(*fsm, Box::new(self.clone()), data);
                self.register_session(&session);
                Ok(session)
            }
            Err(message) => {
                return Err(message);
            }
        }
    }

    /// Loads and starts the specified FSM with some data set.
    pub fn execute_with_data_from_xml(
        &mut self,
        xml: &String,
        data: &HashMap<String, Data>,
        parent: Option<SessionId>,
        invoke_id: &InvokeId,
        #[cfg(feature = "Trace")] trace: TraceMode,
    ) -> Result<ScxmlSession, String> {
        info!("Loading FSM from XML");

        // Use reader to parse the XML:
        let sm = scxml_reader::parse_from_xml_with_includes(xml.clone(), &self.include_paths);
        match sm {
            Ok(mut fsm) => {
                #[cfg(feature = "Trace")]
                fsm.global.lock().unwrap().tracer.enable_trace(trace);
                fsm.caller_invoke_id = Some(invoke_id.clone());
                fsm.parent_session_id = parent;
                fsm.global.lock().unwrap().scheduler =
                    Some(Box::new(AutomaticScheduler::with_timer(self.timer.clone())));
                let session = fsm::start_fsm_with_data(*fsm, Box::new(self.clone()), data);
                self.register_session(&session);
                Ok(session)
            }
            Err(message) => {
                return Err(message);
            }
        }
    }

    /// Loads and starts the specified FSM in manual/polled mode (`spec.md` §4.2/§4.6
    /// "Manual / polled" operating mode): no driver thread is spawned, a
    /// `ManualScheduler` is installed in place of the `AutomaticScheduler` every other
    /// `execute*` entry point uses, and the session is driven forward by the caller's
    /// own thread via `ManualScxmlSession::step` (`spec.md` §6's `step(session_id)`)
    /// instead of reacting to events pushed from other threads.
    pub fn execute_single_instance(&mut self, uri: &str) -> Result<ManualScxmlSession, String> {
        self.execute_single_instance_with_data(uri, &HashMap::new())
    }

    /// Like [`FsmExecutor::execute_single_instance`] with an initial data set bound
    /// into the session's data model before `initialize` runs.
    pub fn execute_single_instance_with_data(
        &mut self,
        uri: &str,
        data: &HashMap<String, Data>,
    ) -> Result<ManualScxmlSession, String> {
        info!("Loading FSM from {} (manual mode)", uri);

        let sm = scxml_reader::parse_from_uri(uri.to_string(), &self.include_paths);
        match sm {
            Ok(fsm) => {
                let session = fsm::start_fsm_manual_with_data(*fsm, Box::new(self.clone()), data);
                self.register_manual_session(&session);
                Ok(session)
            }
            Err(message) => Err(message),
        }
    }

    fn register_session(&self, session: &ScxmlSession) {
        self.state.lock().unwrap().sessions.insert(
            session.session_id,
            SessionHandle {
                session_id: session.session_id,
                sender: session.sender.clone(),
            },
        );
    }

    fn register_manual_session(&self, session: &ManualScxmlSession) {
        self.state.lock().unwrap().sessions.insert(
            session.session_id,
            SessionHandle {
                session_id: session.session_id,
                sender: session.sender.clone(),
            },
        );
    }

    pub fn remove_session(&mut self, session_id: SessionId) {
        self.state.lock().unwrap().sessions.remove(&session_id);
    }

    pub fn get_session_sender(&self, session_id: SessionId) -> Option<Sender<Box<Event>>> {
        Some(
            self.state
                .lock()
                .unwrap()
                .sessions
                .get(&session_id)?
                .sender
                .clone(),
        )
    }

    pub fn send_to_session(
        &self,
        session_id: SessionId,
        event: Event,
    ) -> Result<(), SendError<Box<Event>>> {
        match self.get_session_sender(session_id) {
            None => {
                info!("send_to_session: no such session {}", session_id);
                Ok(())
            }
            Some(sender) => sender.send(Box::new(event)),
        }
    }

    /// Decodes an event descriptor in the JSON form used when an event crosses a
    /// non-native boundary (e.g. a JSON-speaking embedder's inbound endpoint) and
    /// delivers it to the session's External Queue.
    #[cfg(feature = "json-config")]
    pub fn send_json_to_session(
        &self,
        session_id: SessionId,
        descriptor: &serde_json::Value,
    ) -> Result<(), String> {
        let event = Event::from_json_descriptor(descriptor)?;
        self.send_to_session(session_id, event)
            .map_err(|e| e.to_string())
    }
}
