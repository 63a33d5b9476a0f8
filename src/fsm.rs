#![allow(non_snake_case)]

//! Implementation of the data structures and algorithms described in the W3C SCXML proposal.
//! As reference, each type and method has the W3C description as documentation.
//! See <https://www.w3.org/TR/scxml/#AlgorithmforSCXMLInterpretation>

use std::collections::{HashMap, VecDeque};
use std::fmt::{Debug, Display, Formatter};
use std::hash::Hash;
use std::slice::Iter;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

#[cfg(feature = "Trace")]
use log::debug;
use log::{error, info, warn};

use crate::datamodel::null::NullDatamodel;
use crate::datamodel::{
    Data, Datamodel, GlobalDataArc, NULL_DATAMODEL, NULL_DATAMODEL_LC, SCXML_INVOKE_TYPE,
    SCXML_INVOKE_TYPE_SHORT,
};
use crate::event_io_processor::EventIOProcessor;
use crate::executable_content::ExecutableContentRegistry;
use crate::fsm_executor::FsmExecutor;
use crate::scheduler::Scheduler;
#[cfg(feature = "Trace")]
use crate::tracer::TraceMode;
use crate::tracer::Tracer;

pub const ECMA_SCRIPT: &str = "ECMAScript";
pub const ECMA_SCRIPT_LC: &str = "ecmascript";

pub type StateId = u32;
pub type TransitionId = u32;
pub type ExecutableContentId = u32;
pub type SessionId = u32;
pub type InvokeId = String;
pub type Name = String;

pub type StateMap = HashMap<StateId, State>;
pub type StateNameMap = HashMap<Name, StateId>;
pub type TransitionMap = HashMap<TransitionId, Transition>;

/// Document order is the order in which states were registered by the reader, which for this
/// reader always matches ascending id order (ids are handed out depth-first while parsing).
pub fn documentOrder(s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
    s1.cmp(s2)
}

pub fn entryOrder(s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
    documentOrder(s1, s2)
}

pub fn exitOrder(s1: &StateId, s2: &StateId) -> std::cmp::Ordering {
    documentOrder(s2, s1)
}

////////////////////////////////////////////////////////////////////////////////
// General purpose collection types, named and shaped to match the W3C pseudocode.

/// #W3C says: General purpose list type.
#[derive(Debug, Clone)]
pub struct List<T: Clone> {
    data: Vec<T>,
}

impl<T: Clone> Default for List<T> {
    fn default() -> Self {
        List::new()
    }
}

impl<T: Clone> List<T> {
    pub fn new() -> List<T> {
        List {
            data: Default::default(),
        }
    }

    pub fn from_vec(data: Vec<T>) -> List<T> {
        List { data }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn push(&mut self, t: T) {
        self.data.push(t);
    }

    /// #W3C says: Returns the head of the list
    pub fn head(&self) -> &T {
        self.data.first().unwrap()
    }

    /// #W3C says: Returns the tail of the list (i.e., the rest of the list once the head is removed)
    pub fn tail(&self) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        t.data.remove(0);
        t
    }

    /// #W3C says: Returns the list appended with l
    pub fn append(&self, l: &List<T>) -> List<T> {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    pub fn appendSet(&self, l: &OrderedSet<T>) -> List<T>
    where
        T: PartialEq,
    {
        let mut t = List {
            data: self.data.clone(),
        };
        for i in l.data.iter() {
            t.data.push((*i).clone());
        }
        t
    }

    /// #W3C says: Returns the members of the list that satisfy the predicate f
    pub fn filterBy(&self, f: &dyn Fn(&T) -> bool) -> List<T> {
        List {
            data: self.data.iter().filter(|e| f(e)).cloned().collect(),
        }
    }

    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().any(f)
    }

    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().all(f)
    }

    /// #W3C says: Returns a list sorted by comparator f
    pub fn sort<F>(&self, compare: &F) -> List<T>
    where
        F: Fn(&T, &T) -> std::cmp::Ordering,
    {
        let mut data = self.data.clone();
        data.sort_by(compare);
        List { data }
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// #W3C says: General purpose set that guarantees that no element occurs twice and
/// preserves insertion order.
#[derive(Debug, Clone)]
pub struct OrderedSet<T> {
    data: Vec<T>,
}

impl<T: Clone + PartialEq> Default for OrderedSet<T> {
    fn default() -> Self {
        OrderedSet::new()
    }
}

impl<T: Clone + PartialEq> OrderedSet<T> {
    pub fn new() -> OrderedSet<T> {
        OrderedSet {
            data: Default::default(),
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// #W3C says: Adds e to the set if it is not already a member
    pub fn add(&mut self, e: T) {
        if !self.isMember(&e) {
            self.data.push(e);
        }
    }

    /// #W3C says: Deletes e from the set
    pub fn delete(&mut self, e: &T) {
        self.data.retain(|x| x != e);
    }

    /// #W3C says: Adds all members of s that are not already members of the set
    pub fn union(&mut self, s: &OrderedSet<T>) {
        for si in &s.data {
            self.add(si.clone());
        }
    }

    /// #W3C says: Is e a member of set?
    pub fn isMember(&self, e: &T) -> bool {
        self.data.contains(e)
    }

    pub fn contains(&self, e: &T) -> bool {
        self.isMember(e)
    }

    /// #W3C says: Returns true if some element in the set satisfies the predicate f
    pub fn some(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().any(f)
    }

    /// #W3C says: Returns true if every element in the set satisfies the predicate f
    pub fn every(&self, f: &dyn Fn(&T) -> bool) -> bool {
        self.data.iter().all(f)
    }

    /// #W3C says: Returns true if this set and set s have at least one member in common
    pub fn hasIntersection(&self, s: &OrderedSet<T>) -> bool {
        self.data.iter().any(|si| s.isMember(si))
    }

    pub fn isEmpty(&self) -> bool {
        self.size() == 0
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// #W3C says: Converts the set to a list that reflects insertion order.
    pub fn toList(&self) -> List<T> {
        List {
            data: self.data.clone(),
        }
    }

    pub fn iterator(&self) -> Iter<'_, T> {
        self.data.iter()
    }
}

/// #W3C says: Queue of events, FIFO.
#[derive(Debug)]
pub struct Queue<T> {
    data: VecDeque<T>,
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Queue::new()
    }
}

impl<T> Queue<T> {
    pub fn new() -> Queue<T> {
        Queue {
            data: VecDeque::new(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// #W3C says: Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        self.data.push_back(e);
    }

    /// #W3C says: Removes and returns first element in queue
    pub fn dequeue(&mut self) -> T {
        self.data.pop_front().unwrap()
    }

    /// Removes and returns the first element, or `None` if the queue is empty.
    pub fn dequeue_opt(&mut self) -> Option<T> {
        self.data.pop_front()
    }

    pub fn isEmpty(&self) -> bool {
        self.data.is_empty()
    }
}

/// #W3C says: Queue that blocks the caller on dequeue while empty. Backed by an mpsc
/// channel so that any thread holding a clone of the `Sender` can enqueue an event for
/// this session's External Queue without synchronizing through `Fsm` at all.
#[derive(Debug)]
pub struct BlockingQueue<T> {
    pub sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> Default for BlockingQueue<T> {
    fn default() -> Self {
        BlockingQueue::new()
    }
}

impl<T> BlockingQueue<T> {
    pub fn new() -> BlockingQueue<T> {
        let (sender, receiver) = channel();
        BlockingQueue { sender, receiver }
    }

    /// #W3C says: Puts e last in the queue
    pub fn enqueue(&mut self, e: T) {
        self.sender.send(e).ok();
    }

    /// #W3C says: Removes and returns first element in queue, blocks if queue is empty
    pub fn dequeue(&mut self) -> T {
        self.receiver.recv().unwrap()
    }

    /// Non-blocking variant used by the manual/polled macrostep driver.
    pub fn try_dequeue(&mut self) -> Option<T> {
        self.receiver.try_recv().ok()
    }
}

/// #W3C says: `table[foo]` returns the value associated with foo; `table[foo] = bar` sets it.
/// #Actual implementation: methods are used instead of the index operators.
#[derive(Debug, Clone)]
pub struct HashTable<K, T> {
    data: HashMap<K, T>,
}

impl<K: std::cmp::Eq + Hash + Clone, T: Clone> Default for HashTable<K, T> {
    fn default() -> Self {
        HashTable::new()
    }
}

impl<K: std::cmp::Eq + Hash + Clone, T: Clone> HashTable<K, T> {
    pub fn new() -> HashTable<K, T> {
        HashTable {
            data: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }

    pub fn put(&mut self, k: K, v: &T) {
        self.data.insert(k, v.clone());
    }

    pub fn has(&self, k: &K) -> bool {
        self.data.contains_key(k)
    }

    pub fn get(&self, k: &K) -> &T {
        self.data.get(k).unwrap()
    }

    pub fn get_opt(&self, k: &K) -> Option<&T> {
        self.data.get(k)
    }

    pub fn remove(&mut self, k: &K) {
        self.data.remove(k);
    }
}

////////////////////////////////////////////////////////////////////////////////
// Event model

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Raised by the platform itself, such as error events.
    platform,
    /// Raised by `<raise>` and internal bookkeeping (done.state.*, done.invoke.*).
    internal,
    /// Raised by `<send>`, invoked children, or external components.
    external,
}

#[derive(Debug, Clone)]
pub struct ParamPair {
    pub name: String,
    pub value: Data,
}

#[derive(Debug, Clone, Default)]
pub struct CommonContent {
    pub content: Option<String>,
    pub content_expr: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Parameter {
    pub name: String,
    pub location: String,
    pub expr: String,
}

impl Parameter {
    pub fn new() -> Parameter {
        Parameter::default()
    }
}

impl Display for Parameter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Parameter{{name:{} expr:{} location:{}}}",
            self.name, self.expr, self.location
        )
    }
}

pub fn vec_to_string<T: Display>(v: &[T]) -> String {
    v.iter().map(|e| e.to_string()).collect::<Vec<_>>().join(",")
}

#[derive(Debug, Clone, Default)]
pub struct DoneData {
    pub content: Option<CommonContent>,
    pub params: Option<Vec<Parameter>>,
}

/// #W3C says: The SCXML processor must generate events for errors, and may allow
/// other software to generate other events.
#[derive(Debug, Clone)]
pub struct Event {
    pub name: String,
    pub etype: EventType,
    pub sendid: Option<String>,
    pub origin: Option<String>,
    pub origin_type: Option<String>,
    pub invoke_id: Option<InvokeId>,
    pub param_values: Option<Vec<ParamPair>>,
    pub content: Option<Data>,
}

pub const ERROR_EXECUTION: &str = "error.execution";
pub const ERROR_COMMUNICATION: &str = "error.communication";
pub const ERROR_PLATFORM: &str = "error.platform";

impl Event {
    pub fn new_simple(name: &str) -> Event {
        Event {
            name: name.to_string(),
            etype: EventType::platform,
            sendid: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            param_values: None,
            content: None,
        }
    }

    pub fn new(prefix: &str, state: StateId, data: &Option<DoneData>) -> Event {
        let mut ev = Event::new_simple(&format!("{}{}", prefix, state));
        ev.etype = EventType::internal;
        ev.content = data
            .as_ref()
            .and_then(|d| d.content.as_ref())
            .and_then(|c| c.content.clone())
            .map(Data::String);
        ev
    }

    pub fn error(name: &str, send_id: &Option<String>, invoke_id: &Option<InvokeId>) -> Event {
        Event {
            name: name.to_string(),
            etype: EventType::platform,
            sendid: send_id.clone(),
            origin: None,
            origin_type: None,
            invoke_id: invoke_id.clone(),
            param_values: None,
            content: None,
        }
    }

    pub fn error_execution(send_id: &Option<String>, invoke_id: &Option<InvokeId>) -> Event {
        Event::error(ERROR_EXECUTION, send_id, invoke_id)
    }

    pub fn error_execution_with_event(event: &Event) -> Event {
        Event::error_execution(&event.sendid, &event.invoke_id)
    }

    pub fn error_communication(event: &Event) -> Event {
        Event::error(ERROR_COMMUNICATION, &event.sendid, &event.invoke_id)
    }

    /// Matches an event descriptor (e.g. "error.*", "foo.bar", "*") against this event's name,
    /// per W3C B.2.3.
    pub fn name_matches(descriptors: &[String], event_name: &str) -> bool {
        descriptors.iter().any(|descriptor| {
            if descriptor == "*" {
                return true;
            }
            let d = descriptor.trim_end_matches(".*");
            event_name == d || event_name.starts_with(&format!("{}.", d))
        })
    }

    /// Encodes this event in the event descriptor JSON form used when an event crosses
    /// a non-native boundary: `{"event", "sendid", "data", "source", ...}`, with
    /// `invokeid`/`origintype`/`origin` included only when non-empty.
    #[cfg(feature = "json-config")]
    pub fn to_json_descriptor(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        map.insert("event".to_string(), serde_json::Value::String(self.name.clone()));
        map.insert(
            "sendid".to_string(),
            self.sendid
                .clone()
                .map(serde_json::Value::String)
                .unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "data".to_string(),
            self.content
                .as_ref()
                .map(Data::to_json)
                .unwrap_or(serde_json::Value::Null),
        );
        map.insert(
            "source".to_string(),
            serde_json::Value::String("scxml".to_string()),
        );
        if let Some(invoke_id) = &self.invoke_id {
            map.insert(
                "invokeid".to_string(),
                serde_json::Value::String(invoke_id.clone()),
            );
        }
        if let Some(origin_type) = &self.origin_type {
            map.insert(
                "origintype".to_string(),
                serde_json::Value::String(origin_type.clone()),
            );
        }
        if let Some(origin) = &self.origin {
            map.insert("origin".to_string(), serde_json::Value::String(origin.clone()));
        }
        serde_json::Value::Object(map)
    }

    /// Decodes the event descriptor JSON form. Unknown fields are preserved by folding
    /// them into a trailing `Data::Map` entry under the event's content so a round-trip
    /// through an embedder that doesn't understand them doesn't lose information.
    #[cfg(feature = "json-config")]
    pub fn from_json_descriptor(value: &serde_json::Value) -> Result<Event, String> {
        let obj = value
            .as_object()
            .ok_or_else(|| "event descriptor is not a JSON object".to_string())?;
        let name = obj
            .get("event")
            .and_then(|v| v.as_str())
            .ok_or_else(|| "event descriptor missing 'event' field".to_string())?
            .to_string();
        let mut ev = Event::new_simple(&name);
        ev.etype = EventType::external;
        ev.sendid = obj
            .get("sendid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        ev.content = obj.get("data").map(Data::from_json);
        ev.invoke_id = obj
            .get("invokeid")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        ev.origin_type = obj
            .get("origintype")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        ev.origin = obj
            .get("origin")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        Ok(ev)
    }

    #[cfg(feature = "Trace")]
    pub fn trace(mode: TraceMode, enable: bool) -> Event {
        let mut ev = Event::new_simple(if enable {
            "trace.enable"
        } else {
            "trace.disable"
        });
        ev.etype = EventType::platform;
        ev.param_values = Some(vec![ParamPair {
            name: "mode".to_string(),
            value: Data::String(format!("{:?}", mode)),
        }]);
        ev
    }
}

impl Display for Event {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

////////////////////////////////////////////////////////////////////////////////
// Session and global data, shared between the `Fsm` (the macrostep driver) and the
// `Datamodel` bound to it. Event I/O Processors are only reachable through the
// datamodel (`_ioprocessors`), so anything they need to touch -- the queues, the
// child-session table, the scheduler -- lives here rather than on `Fsm` alone.

/// A running invocation started by `<invoke>`, tracked from the parent session's side.
#[derive(Debug, Clone)]
pub struct Invoke {
    pub invoke_id: InvokeId,
    pub invoking_state: StateId,
    pub parent_state_name: String,
    /// SCXML `<invoke>` attribute 'type'.
    pub type_name: String,
    /// SCXML `<invoke>` attribute 'typeexpr'.
    pub type_expr: String,
    /// SCXML `<invoke>` attribute 'src'.
    pub src: String,
    /// SCXML `<invoke>` attribute 'srcexpr'.
    pub src_expr: String,
    /// SCXML `<invoke>` attribute 'idlocation': where to store the generated invoke id.
    pub external_id_location: String,
    /// SCXML `<invoke>` attribute 'namelist'.
    pub name_list: Vec<String>,
    /// `<param>` children.
    pub params: Option<Vec<Parameter>>,
    pub content: Option<CommonContent>,
    pub autoforward: bool,
    pub finalize: ExecutableContentId,
}

impl Invoke {
    pub fn new() -> Invoke {
        Invoke {
            invoke_id: String::new(),
            invoking_state: 0,
            parent_state_name: String::new(),
            type_name: String::new(),
            type_expr: String::new(),
            src: String::new(),
            src_expr: String::new(),
            external_id_location: String::new(),
            name_list: Vec::new(),
            params: None,
            content: None,
            autoforward: false,
            finalize: 0,
        }
    }
}

impl Default for Invoke {
    fn default() -> Self {
        Invoke::new()
    }
}

/// Handle to a session created by `<invoke>`, owned by the parent's `GlobalData` so that
/// autoforward and cancellation can reach it without a trip through the session registry.
#[derive(Clone)]
pub struct ChildSession {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
}

impl Debug for ChildSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ChildSession{{session_id: {}}}", self.session_id)
    }
}

/// Handle returned to a caller that started an FSM: the session id, a sender for events
/// addressed to this session's External Queue, and a join handle for the driver thread.
pub struct ScxmlSession {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
    pub thread: Option<JoinHandle<()>>,
}

impl Debug for ScxmlSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ScxmlSession{{session_id: {}}}", self.session_id)
    }
}

/// Outcome of one [`Fsm::step`] call (`spec.md` §6's `step(session_id)`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    /// A macrostep ran: one or more microsteps fired, an external event was consumed,
    /// or both.
    Progressed,
    /// Nothing was ready: no eventless transitions, an empty Internal Queue, and no
    /// External Queue event already pending. The caller should deliver an event or
    /// advance the scheduler before calling `step` again.
    Idle,
    /// The session reached a top-level final state; `exitInterpreter`'s `onexit`
    /// handling has already run and no further `step` calls will do anything.
    Terminated,
}

/// A session driven synchronously by the host via [`ManualScxmlSession::step`]
/// instead of its own macrostep-driver thread: the "Manual / polled" operating mode
/// `spec.md` §4.2/§4.6 describe for single-threaded/deterministic callers. No thread
/// is spawned; `step` runs on whichever thread the caller calls it from, and the
/// session's scheduler is a [`crate::scheduler::ManualScheduler`] rather than an
/// `AutomaticScheduler`.
pub struct ManualScxmlSession {
    pub session_id: SessionId,
    pub sender: Sender<Box<Event>>,
    fsm: Fsm,
    datamodel: Box<dyn Datamodel>,
}

impl ManualScxmlSession {
    /// Runs at most one macrostep iteration (`spec.md` §6 "step(session_id)").
    pub fn step(&mut self) -> StepResult {
        self.fsm.step(self.datamodel.as_mut())
    }

    pub fn is_terminated(&self) -> bool {
        !self.fsm.running
    }

    pub fn current_configuration(&self) -> Vec<StateId> {
        self.fsm.configuration.toList().iterator().cloned().collect()
    }
}

impl Debug for ManualScxmlSession {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "ManualScxmlSession{{session_id: {}}}", self.session_id)
    }
}

static SESSION_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

pub fn new_session_id() -> SessionId {
    SESSION_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Allocates `ExecutableContentId`s as the reader parses executable-content regions.
pub static ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Allocates ids for auto-generated `<send idlocation="...">` and anonymous delayed
/// sends (a send with a delay but no explicit/generated sendid still needs a scheduler key).
pub static PLATFORM_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

static INVOKE_ID_COUNTER: AtomicU32 = AtomicU32::new(1);

/// *W3C says* (6.4.1): "If the 'id' attribute is not specified, the SCXML Processor must
/// generate an id for the invocation automatically."
pub fn new_invoke_id(state_name: &str) -> InvokeId {
    format!("{}.{}", state_name, INVOKE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
}

pub struct GlobalData {
    pub session_id: SessionId,
    pub name: String,
    pub source: Option<String>,
    pub parent_session_id: Option<SessionId>,
    pub caller_invoke_id: Option<InvokeId>,

    pub configuration: OrderedSet<StateId>,
    pub internalQueue: Queue<Event>,
    pub externalQueue: Sender<Box<Event>>,

    pub child_sessions: HashMap<InvokeId, ChildSession>,
    pub executor: Option<FsmExecutor>,
    pub tracer: Box<dyn Tracer>,
    pub scheduler: Option<Box<dyn Scheduler>>,
}

impl GlobalData {
    /// A `GlobalData` with no real session behind it, for data model implementations
    /// that need a placeholder before they're bound to an actual running session
    /// (see `Datamodel::global`/`global_s`).
    pub fn new_detached() -> GlobalData {
        let (tx, _rx) = std::sync::mpsc::channel();
        GlobalData::new(0, tx)
    }

    pub fn new(session_id: SessionId, externalQueue: Sender<Box<Event>>) -> GlobalData {
        GlobalData {
            session_id,
            name: String::new(),
            source: None,
            parent_session_id: None,
            caller_invoke_id: None,
            configuration: OrderedSet::new(),
            internalQueue: Queue::new(),
            externalQueue,
            child_sessions: HashMap::new(),
            executor: None,
            tracer: crate::tracer::new_noop_tracer(),
            scheduler: None,
        }
    }

    /// #W3C says: internal events are always added to the front/back of the session's
    /// internal queue, never the external one.
    pub fn enqueue_internal(&mut self, event: Event) {
        #[cfg(feature = "Trace_Event")]
        debug!("enqueue internal: {:?}", event);
        self.internalQueue.enqueue(event);
    }

    /// Delivers an event into this session's External Queue, as an Event I/O Processor
    /// sending to `#_scxml_<sessionid>` (self) would.
    pub fn enqueue_external(&mut self, event: Event) {
        self.externalQueue.send(Box::new(event)).ok();
    }

    /// Resolves an SCXML-processor style target ("", "#_parent", "#_scxml_<id>",
    /// "#_<invokeid>") to the raw sender backing that session's External Queue. Used by
    /// the scheduler to deliver delayed sends without a second trip through the Event
    /// I/O Processor registry once the delay has elapsed.
    pub fn resolve_session_sender(&self, target: &str) -> Option<Sender<Box<Event>>> {
        use crate::event_io_processor::scxml_event_io_processor::{
            SCXML_TARGET_INVOKE_ID_PREFIX, SCXML_TARGET_PARENT, SCXML_TARGET_SESSION_ID_PREFIX,
        };
        if target.is_empty() {
            return Some(self.externalQueue.clone());
        }
        if target == SCXML_TARGET_PARENT {
            return self.executor.as_ref()?.get_session_sender(self.parent_session_id?);
        }
        if let Some(rest) = target.strip_prefix(SCXML_TARGET_SESSION_ID_PREFIX) {
            let session_id: SessionId = rest.parse().ok()?;
            return self.executor.as_ref()?.get_session_sender(session_id);
        }
        if let Some(invoke_id) = target.strip_prefix(SCXML_TARGET_INVOKE_ID_PREFIX) {
            return self.child_sessions.get(invoke_id).map(|c| c.sender.clone());
        }
        None
    }

    pub fn send_to_parent(&self, mut event: Event) {
        if let (Some(parent), Some(executor)) = (self.parent_session_id, &self.executor) {
            event.invoke_id = self.caller_invoke_id.clone();
            let _ = executor.send_to_session(parent, event);
        }
    }

    pub fn send_to_child(&self, invoke_id: &InvokeId, event: Event) -> Result<(), String> {
        match self.child_sessions.get(invoke_id) {
            Some(child) => child
                .sender
                .send(Box::new(event))
                .map_err(|e| e.to_string()),
            None => Err(format!("no such invoked session '{}'", invoke_id)),
        }
    }
}

////////////////////////////////////////////////////////////////////////////////
// FSM model (State etc, representing the chart IR produced by the reader)

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum BindingType {
    Early,
    Late,
}

#[derive(PartialEq, Debug, Clone, Copy)]
pub enum TransitionType {
    Internal,
    External,
}

pub fn map_transition_type(ts: &str) -> TransitionType {
    if ts.eq_ignore_ascii_case("internal") {
        TransitionType::Internal
    } else {
        TransitionType::External
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HistoryType {
    Shallow,
    Deep,
}

pub fn map_history_type(ts: &str) -> HistoryType {
    if ts.eq_ignore_ascii_case("deep") {
        HistoryType::Deep
    } else {
        HistoryType::Shallow
    }
}

/// Appends `param` to `params`, allocating the `Vec` on first use.
pub fn push_param(params: &mut Option<Vec<Parameter>>, param: Parameter) {
    params.get_or_insert_with(Vec::new).push(param);
}

#[derive(Debug, Clone)]
pub struct State {
    pub id: StateId,
    pub name: Name,
    pub initial: TransitionId,
    pub states: Vec<StateId>,
    pub onentry: Vec<ExecutableContentId>,
    pub onexit: Vec<ExecutableContentId>,
    pub transitions: Vec<TransitionId>,
    pub invoke: Vec<Invoke>,
    pub history_type: Option<HistoryType>,
    pub is_parallel: bool,
    pub is_final: bool,
    pub parent: Option<StateId>,
    pub donedata: Option<DoneData>,
    /// A `<datamodel>` container local to this state, populated under late binding.
    pub data: Vec<(String, Option<String>)>,
    pub isFirstEntry: bool,
}

impl State {
    pub fn new(id: StateId, name: &str) -> State {
        State {
            id,
            name: name.to_string(),
            initial: 0,
            states: Vec::new(),
            onentry: Vec::new(),
            onexit: Vec::new(),
            transitions: Vec::new(),
            invoke: Vec::new(),
            history_type: None,
            is_parallel: false,
            is_final: false,
            parent: None,
            donedata: None,
            data: Vec::new(),
            isFirstEntry: true,
        }
    }
}

impl PartialEq for State {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "State{{#{} {}}}", self.id, self.name)
    }
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub id: TransitionId,
    pub events: Vec<String>,
    pub cond: Option<String>,
    pub source: StateId,
    pub target: Vec<StateId>,
    pub transition_type: TransitionType,
    pub content: Option<ExecutableContentId>,
}

impl Transition {
    pub fn new(id: TransitionId, source: StateId) -> Transition {
        Transition {
            id,
            events: Vec::new(),
            cond: None,
            source,
            target: Vec::new(),
            transition_type: TransitionType::External,
            content: None,
        }
    }
}

impl Display for Transition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Transition{{#{}}}", self.id)
    }
}

impl Display for TransitionType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                TransitionType::Internal => "internal",
                TransitionType::External => "external",
            }
        )
    }
}

pub fn createDatamodel(name: &str) -> Box<dyn Datamodel> {
    #[cfg(feature = "ECMAScriptModel")]
    if name.eq_ignore_ascii_case(ECMA_SCRIPT) {
        return Box::new(crate::datamodel::ecma_script::ECMAScriptDatamodel::new());
    }
    if !name.is_empty()
        && !name.eq_ignore_ascii_case(NULL_DATAMODEL)
        && !name.eq_ignore_ascii_case(ECMA_SCRIPT)
    {
        warn!("unsupported datamodel '{}', falling back to null", name);
    }
    Box::new(NullDatamodel::new())
}

/// Top level struct: the chart IR plus the runtime state needed to drive a session.
pub struct Fsm {
    pub configuration: OrderedSet<StateId>,
    pub statesToInvoke: OrderedSet<StateId>,
    pub externalQueue: BlockingQueue<Box<Event>>,
    pub historyValue: HashTable<StateId, OrderedSet<StateId>>,
    pub running: bool,
    pub binding: BindingType,

    pub version: String,
    pub name: String,

    /// A FSM can have actual multiple initial-target-states, so this state may be artificial.
    pub pseudo_root: StateId,

    pub states: StateMap,
    pub statesNames: StateNameMap,
    pub executableContent: ExecutableContentRegistry,
    pub transitions: TransitionMap,
    pub datamodel_name: String,

    pub caller_invoke_id: Option<InvokeId>,
    pub parent_session_id: Option<SessionId>,
    pub source: Option<String>,

    pub global: GlobalDataArc,
}

impl Debug for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fsm{{name: {}, version: {}}}", self.name, self.version)
    }
}

impl Display for Fsm {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name)
    }
}

impl Default for Fsm {
    fn default() -> Self {
        Fsm::new()
    }
}

impl Fsm {
    pub fn new() -> Fsm {
        let session_id = new_session_id();
        let externalQueue = BlockingQueue::new();
        let global = GlobalDataArc::from(GlobalData::new(session_id, externalQueue.sender.clone()));
        Fsm {
            configuration: OrderedSet::new(),
            version: "1.0".to_string(),
            name: String::new(),
            pseudo_root: 0,
            externalQueue,
            historyValue: HashTable::new(),
            running: false,
            statesToInvoke: OrderedSet::new(),
            binding: BindingType::Early,
            states: HashMap::new(),
            statesNames: HashMap::new(),
            executableContent: ExecutableContentRegistry::new(),
            transitions: HashMap::new(),
            datamodel_name: ECMA_SCRIPT.to_string(),
            caller_invoke_id: None,
            parent_session_id: None,
            source: None,
            global,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.global.lock().unwrap().session_id
    }

    pub fn get_state_by_name(&self, name: &Name) -> Option<&State> {
        self.statesNames.get(name).and_then(|id| self.get_state_by_id(*id))
    }

    pub fn get_state_by_name_mut(&mut self, name: &Name) -> Option<&mut State> {
        match self.statesNames.get(name) {
            None => None,
            Some(id) => self.states.get_mut(id),
        }
    }

    pub fn get_state_by_id(&self, state_id: StateId) -> Option<&State> {
        self.states.get(&state_id)
    }

    pub fn get_state_by_id_mut(&mut self, state_id: StateId) -> Option<&mut State> {
        self.states.get_mut(&state_id)
    }

    pub fn get_transition_by_id(&self, transition_id: TransitionId) -> Option<&Transition> {
        self.transitions.get(&transition_id)
    }

    pub fn get_transition_by_id_mut(&mut self, transition_id: TransitionId) -> Option<&mut Transition> {
        self.transitions.get_mut(&transition_id)
    }

    /// Copies every Event I/O Processor registered with the executor into this session's
    /// data model and registers this session's External Queue with each of them, so that
    /// `<send>` can route through them and other sessions can target `#_scxml_<sessionid>`.
    /// A no-op for detached/test FSMs that have no `executor` bound.
    fn bind_io_processors(&self, datamodel: &mut dyn Datamodel) {
        let executor = match &self.global.lock().unwrap().executor {
            Some(executor) => executor.clone(),
            None => return,
        };
        let copies: Vec<Box<dyn EventIOProcessor>> = executor
            .state
            .lock()
            .unwrap()
            .processors
            .iter()
            .map(|p| p.get_copy())
            .collect();
        for mut processor in copies {
            processor.add_fsm(self, datamodel);
            let key = processor
                .get_types()
                .first()
                .map(|t| t.to_string())
                .unwrap_or_default();
            datamodel.get_io_processors().insert(key, processor);
        }
    }

    /// #W3C says:
    /// ```text
    /// procedure interpret(doc):
    ///     if not valid(doc): failWithError()
    ///     expandScxmlSource(doc)
    ///     configuration = new OrderedSet()
    ///     statesToInvoke = new OrderedSet()
    ///     internalQueue = new Queue()
    ///     externalQueue = new BlockingQueue()
    ///     historyValue = new HashTable()
    ///     datamodel = new Datamodel(doc)
    ///     if doc.binding == "early":
    ///         initializeDatamodel(datamodel, doc)
    ///     running = true
    ///     executeGlobalScriptElement(doc)
    ///     enterStates([doc.initial.transition])
    ///     mainEventLoop()
    /// ```
    pub fn interpret(&mut self, datamodel: &mut dyn Datamodel) {
        self.initialize(datamodel);
        self.mainEventLoop(datamodel);
    }

    /// The part of `interpret` up to and including `enterStates([doc.initial.transition])`,
    /// split out so a host driving the session manually (`spec.md` §4.2/§4.6 "Manual /
    /// polled" mode, §6's `initialize(session_id)`) can run the initial configuration's
    /// entry actions on its own thread and then call [`Fsm::step`] itself instead of
    /// handing control to the blocking [`Fsm::mainEventLoop`].
    pub fn initialize(&mut self, datamodel: &mut dyn Datamodel) {
        self.running = true;
        {
            let mut global = self.global.lock().unwrap();
            global.parent_session_id = self.parent_session_id;
            global.caller_invoke_id = self.caller_invoke_id.clone();
        }
        self.bind_io_processors(datamodel);
        datamodel.implement_mandatory_functionality(self);
        if self.binding == BindingType::Early {
            datamodel.initializeDataModel(self, self.pseudo_root);
        }

        let mut initial_states = List::new();
        initial_states.push(self.pseudo_root);
        self.enterStates(datamodel, &initial_states);
    }

    /// #W3C says:
    /// ```text
    /// procedure mainEventLoop():
    ///     while running:
    ///         enabledTransitions = null
    ///         macrostepDone = false
    ///         while running and not macrostepDone:
    ///             enabledTransitions = selectEventlessTransitions()
    ///             if enabledTransitions.isEmpty():
    ///                 if internalQueue.isEmpty(): macrostepDone = true
    ///                 else: internalEvent = internalQueue.dequeue()
    ///                       datamodel._event = internalEvent
    ///                       enabledTransitions = selectTransitions(internalEvent)
    ///             if not enabledTransitions.isEmpty():
    ///                 microstep(enabledTransitions.toList())
    ///         for state in statesToInvoke.sort(documentOrder):
    ///             for inv in state.invoke.sort(documentOrder):
    ///                 invoke(inv)
    ///         statesToInvoke.clear()
    ///         if not internalQueue.isEmpty(): continue
    ///         externalEvent = externalQueue.dequeue()
    ///         if isCancelEvent(externalEvent): running = false; continue
    ///         datamodel._event = externalEvent
    ///         for state in configuration:
    ///             for inv in state.invoke:
    ///                 if inv.invokeid == externalEvent.invokeid: applyFinalize(inv, externalEvent)
    ///                 if inv.autoforward: send(inv.id, externalEvent)
    ///         enabledTransitions = selectTransitions(externalEvent)
    ///         if not enabledTransitions.isEmpty(): microstep(enabledTransitions.toList())
    ///     exitInterpreter()
    /// ```
    pub fn mainEventLoop(&mut self, datamodel: &mut dyn Datamodel) {
        while self.running {
            self.run_microsteps_to_quiescence(datamodel);

            self.execute_pending_invokes(datamodel);
            self.statesToInvoke.clear();

            if !self.global.lock().unwrap().internalQueue.isEmpty() {
                continue;
            }

            let external_event = *self.externalQueue.dequeue();
            if !self.running {
                break;
            }
            #[cfg(feature = "Trace_Event")]
            debug!("external event: {:?}", external_event);

            self.applyFinalizeAndAutoforward(datamodel, &external_event);

            datamodel.set_event(&external_event);
            let enabled_transitions = self.selectTransitions(datamodel, &external_event);
            if !enabled_transitions.isEmpty() {
                self.microstep(datamodel, &enabled_transitions.toList());
            }
        }
        self.exitInterpreter(datamodel);
    }

    /// The inner "drain eventless transitions, then the Internal Queue, to
    /// quiescence" loop shared by the blocking [`Fsm::mainEventLoop`] and the
    /// non-blocking [`Fsm::step`] (`spec.md` §4.6's macrostep step 1). Returns whether
    /// any microstep actually ran.
    fn run_microsteps_to_quiescence(&mut self, datamodel: &mut dyn Datamodel) -> bool {
        let mut progressed = false;
        let mut macrostep_done = false;
        while self.running && !macrostep_done {
            let mut enabled_transitions = self.selectEventlessTransitions(datamodel);
            if enabled_transitions.isEmpty() {
                let next_internal = self.global.lock().unwrap().internalQueue.dequeue_opt();
                match next_internal {
                    None => {
                        macrostep_done = true;
                        continue;
                    }
                    Some(internal_event) => {
                        #[cfg(feature = "Trace_Event")]
                        debug!("internal event: {:?}", internal_event);
                        datamodel.set_event(&internal_event);
                        enabled_transitions = self.selectTransitions(datamodel, &internal_event);
                    }
                }
            }
            if !enabled_transitions.isEmpty() {
                self.microstep(datamodel, &enabled_transitions.toList());
                progressed = true;
            }
        }
        progressed
    }

    /// Polls this session's scheduler for delayed sends that are now due and delivers
    /// each to its recorded target (`spec.md` §4.2/§4.6: "Manual mode calls
    /// `poll_ready(now)` at the top of each macrostep iteration"). A no-op under
    /// `AutomaticScheduler`, whose timer thread already delivers directly once a
    /// delay elapses.
    fn poll_scheduler(&mut self) {
        let ready = {
            let mut global = self.global.lock().unwrap();
            match &mut global.scheduler {
                Some(scheduler) => scheduler.poll_ready(),
                None => Vec::new(),
            }
        };
        for entry in ready {
            let _ = entry.target.send(entry.event);
        }
    }

    /// The non-blocking counterpart of `mainEventLoop`'s body, for hosts that drive a
    /// session manually (`spec.md` §4.2/§4.6 "Manual / polled" operating mode, §6's
    /// `step(session_id)` host API) instead of letting `mainEventLoop` block on
    /// `externalQueue.dequeue()`. Runs at most one macrostep: polls the scheduler,
    /// drains eventless/internal transitions to quiescence, executes invokes pending
    /// from that macrostep, and consumes at most one already-queued external event.
    pub fn step(&mut self, datamodel: &mut dyn Datamodel) -> StepResult {
        if !self.running {
            return StepResult::Terminated;
        }

        self.poll_scheduler();

        let mut progressed = self.run_microsteps_to_quiescence(datamodel);

        self.execute_pending_invokes(datamodel);
        self.statesToInvoke.clear();

        if !self.running {
            self.exitInterpreter(datamodel);
            return StepResult::Terminated;
        }

        if !self.global.lock().unwrap().internalQueue.isEmpty() {
            return StepResult::Progressed;
        }

        if let Some(boxed_event) = self.externalQueue.try_dequeue() {
            let external_event = *boxed_event;
            #[cfg(feature = "Trace_Event")]
            debug!("external event: {:?}", external_event);

            self.applyFinalizeAndAutoforward(datamodel, &external_event);

            datamodel.set_event(&external_event);
            let enabled_transitions = self.selectTransitions(datamodel, &external_event);
            if !enabled_transitions.isEmpty() {
                self.microstep(datamodel, &enabled_transitions.toList());
            }
            progressed = true;

            if !self.running {
                self.exitInterpreter(datamodel);
                return StepResult::Terminated;
            }
        }

        if progressed {
            StepResult::Progressed
        } else {
            StepResult::Idle
        }
    }

    fn execute_pending_invokes(&mut self, datamodel: &mut dyn Datamodel) {
        let mut to_invoke: Vec<StateId> = self.statesToInvoke.toList().iterator().cloned().collect();
        to_invoke.sort_by(documentOrder);
        for state_id in to_invoke {
            let invokes = match self.get_state_by_id(state_id) {
                Some(s) => s.invoke.clone(),
                None => continue,
            };
            for inv in invokes {
                self.invoke(datamodel, &inv);
            }
        }
    }

    fn applyFinalizeAndAutoforward(&mut self, datamodel: &mut dyn Datamodel, event: &Event) {
        let active: Vec<StateId> = self.configuration.toList().iterator().cloned().collect();
        for state_id in active {
            let invokes = match self.get_state_by_id(state_id) {
                Some(s) => s.invoke.clone(),
                None => continue,
            };
            for inv in invokes {
                if event.invoke_id.as_deref() == Some(inv.invoke_id.as_str()) {
                    if inv.finalize != 0 {
                        datamodel.executeContent(self, inv.finalize);
                    }
                }
                if inv.autoforward {
                    let global = self.global.lock().unwrap();
                    let _ = global.send_to_child(&inv.invoke_id, event.clone());
                }
            }
        }
    }

    /// #W3C says:
    /// ```text
    /// procedure exitInterpreter():
    ///     statesToExit = configuration.toList().sort(exitOrder)
    ///     for s in statesToExit:
    ///         for content in s.onexit: executeContent(content)
    ///         for inv in s.invoke: cancelInvoke(inv)
    ///         configuration.delete(s)
    ///         if isFinalState(s) and isSCXMLElement(s.parent):
    ///             returnDoneEvent(s.donedata)
    /// ```
    fn exitInterpreter(&mut self, datamodel: &mut dyn Datamodel) {
        let states_to_exit = self.configuration.toList().sort(&exitOrder);
        let mut final_donedata = None;
        for s in states_to_exit.iterator() {
            let state_id = *s;
            if let Some(onexit) = self.get_state_by_id(state_id).map(|st| st.onexit.clone()) {
                for content in onexit {
                    datamodel.executeContent(self, content);
                }
            }
            let invokes = self.get_state_by_id(state_id).map(|st| st.invoke.clone()).unwrap_or_default();
            for inv in invokes {
                self.cancel_invoke(&inv);
            }
            if let Some(state) = self.get_state_by_id(state_id) {
                if state.is_final && state.parent.map(|p| self.isSCXMLElement(p)).unwrap_or(false) {
                    final_donedata = state.donedata.clone();
                }
            }
            self.configuration.delete(&state_id);
        }

        // W3C: if this session was started by <invoke>, notify the parent session that
        // it has reached a top-level final state.
        let has_parent = self.global.lock().unwrap().parent_session_id.is_some();
        if has_parent {
            let payload = final_donedata.as_ref().map(|d| self.build_donedata(datamodel, d));
            let global = self.global.lock().unwrap();
            let invoke_id = global.caller_invoke_id.clone().unwrap_or_default();
            let mut event = Event::new_simple(&format!("done.invoke.{}", invoke_id));
            event.etype = EventType::external;
            event.invoke_id = Some(invoke_id);
            event.content = payload;
            global.send_to_parent(event);
        }

        info!("session {} terminated", self.session_id());
    }

    /// #W3C says:
    /// ```text
    /// function selectEventlessTransitions():
    ///     enabledTransitions = new OrderedSet()
    ///     atomicStates = configuration.toList().filter(isAtomicState).sort(documentOrder)
    ///     for state in atomicStates:
    ///         loop: for s in [state].append(getProperAncestors(state, null)):
    ///             for t in s.transitions.sort(documentOrder):
    ///                 if not t.event and conditionMatch(t):
    ///                     enabledTransitions.add(t)
    ///                     break loop
    ///     enabledTransitions = removeConflictingTransitions(enabledTransitions)
    ///     return enabledTransitions
    /// ```
    fn selectEventlessTransitions(&self, datamodel: &mut dyn Datamodel) -> OrderedSet<TransitionId> {
        let mut enabled_transitions = OrderedSet::new();
        let mut atomic_states: Vec<StateId> = self
            .configuration
            .toList()
            .iterator()
            .cloned()
            .filter(|s| self.isAtomicState(*s))
            .collect();
        atomic_states.sort_by(documentOrder);

        for state in atomic_states {
            let mut ancestors = vec![state];
            ancestors.extend(self.getProperAncestors(state, None));
            let mut found = false;
            for s in ancestors {
                if found {
                    break;
                }
                let mut transitions = self.get_state_by_id(s).map(|st| st.transitions.clone()).unwrap_or_default();
                transitions.sort_by(documentOrder);
                for t_id in transitions {
                    let t = match self.get_transition_by_id(t_id) {
                        Some(t) => t,
                        None => continue,
                    };
                    if t.events.is_empty() && self.conditionMatch(datamodel, t_id) {
                        enabled_transitions.add(t_id);
                        found = true;
                        break;
                    }
                }
            }
        }
        self.removeConflictingTransitions(&enabled_transitions)
    }

    /// #W3C says:
    /// ```text
    /// function selectTransitions(event):
    ///     enabledTransitions = new OrderedSet()
    ///     atomicStates = configuration.toList().filter(isAtomicState).sort(documentOrder)
    ///     for state in atomicStates:
    ///         loop: for s in [state].append(getProperAncestors(state, null)):
    ///             for t in s.transitions.sort(documentOrder):
    ///                 if t.event and nameMatch(t.event, event.name) and conditionMatch(t):
    ///                     enabledTransitions.add(t)
    ///                     break loop
    ///     enabledTransitions = removeConflictingTransitions(enabledTransitions)
    ///     return enabledTransitions
    /// ```
    fn selectTransitions(&self, datamodel: &mut dyn Datamodel, event: &Event) -> OrderedSet<TransitionId> {
        let mut enabled_transitions = OrderedSet::new();
        let mut atomic_states: Vec<StateId> = self
            .configuration
            .toList()
            .iterator()
            .cloned()
            .filter(|s| self.isAtomicState(*s))
            .collect();
        atomic_states.sort_by(documentOrder);

        for state in atomic_states {
            let mut ancestors = vec![state];
            ancestors.extend(self.getProperAncestors(state, None));
            let mut found = false;
            for s in ancestors {
                if found {
                    break;
                }
                let mut transitions = self.get_state_by_id(s).map(|st| st.transitions.clone()).unwrap_or_default();
                transitions.sort_by(documentOrder);
                for t_id in transitions {
                    let t = match self.get_transition_by_id(t_id) {
                        Some(t) => t,
                        None => continue,
                    };
                    if !t.events.is_empty()
                        && Event::name_matches(&t.events, &event.name)
                        && self.conditionMatch(datamodel, t_id)
                    {
                        enabled_transitions.add(t_id);
                        found = true;
                        break;
                    }
                }
            }
        }
        self.removeConflictingTransitions(&enabled_transitions)
    }

    fn conditionMatch(&self, datamodel: &mut dyn Datamodel, t_id: TransitionId) -> bool {
        match self.get_transition_by_id(t_id) {
            None => false,
            Some(t) => match &t.cond {
                None => true,
                Some(cond) => match datamodel.execute_condition(cond) {
                    Ok(v) => v,
                    Err(msg) => {
                        // W3C 5.9: a guard that fails to evaluate is treated as false,
                        // and raises error.execution on the internal queue.
                        error!("cond '{}' is invalid ({})", cond, msg);
                        datamodel.internal_error_execution();
                        false
                    }
                },
            },
        }
    }

    /// #W3C says:
    /// ```text
    /// function removeConflictingTransitions(enabledTransitions):
    ///     filteredTransitions = new OrderedSet()
    ///     for t1 in enabledTransitions.toList().sort(documentOrder):
    ///         t1Preempted = false
    ///         transitionsToRemove = new OrderedSet()
    ///         for t2 in filteredTransitions.toList():
    ///             if computeExitSet([t1]).hasIntersection(computeExitSet([t2])):
    ///                 if isDescendant(t1.source, t2.source):
    ///                     transitionsToRemove.add(t2)
    ///                 else:
    ///                     t1Preempted = true
    ///                     break
    ///         if not t1Preempted:
    ///             for t3 in transitionsToRemove.toList(): filteredTransitions.delete(t3)
    ///             filteredTransitions.add(t1)
    ///     return filteredTransitions
    /// ```
    fn removeConflictingTransitions(&self, enabled_transitions: &OrderedSet<TransitionId>) -> OrderedSet<TransitionId> {
        let mut filtered: OrderedSet<TransitionId> = OrderedSet::new();
        let mut ts = enabled_transitions.toList().iterator().cloned().collect::<Vec<_>>();
        ts.sort_by(documentOrder);

        for t1 in ts {
            let mut t1_preempted = false;
            let mut to_remove: Vec<TransitionId> = Vec::new();
            let exit1 = self.computeExitSet(&List::from_vec(vec![t1]));
            for t2 in filtered.toList().iterator().cloned().collect::<Vec<_>>() {
                let exit2 = self.computeExitSet(&List::from_vec(vec![t2]));
                if exit1.hasIntersection(&exit2) {
                    let t1_source = self.get_transition_by_id(t1).map(|t| t.source);
                    let t2_source = self.get_transition_by_id(t2).map(|t| t.source);
                    if let (Some(s1), Some(s2)) = (t1_source, t2_source) {
                        if self.isDescendant(s1, s2) {
                            to_remove.push(t2);
                        } else {
                            t1_preempted = true;
                            break;
                        }
                    }
                }
            }
            if !t1_preempted {
                for t3 in to_remove {
                    filtered.delete(&t3);
                }
                filtered.add(t1);
            }
        }
        filtered
    }

    /// #W3C says:
    /// ```text
    /// procedure microstep(enabledTransitions):
    ///     exitStates(enabledTransitions)
    ///     executeTransitionContent(enabledTransitions)
    ///     enterStates(enabledTransitions)
    /// ```
    fn microstep(&mut self, datamodel: &mut dyn Datamodel, enabled_transitions: &List<TransitionId>) {
        self.exitStates(datamodel, enabled_transitions);
        self.executeTransitionContent(datamodel, enabled_transitions);
        self.enterStates(datamodel, enabled_transitions);
        self.global.lock().unwrap().configuration = self.configuration.clone();
    }

    /// #W3C says:
    /// ```text
    /// procedure exitStates(enabledTransitions):
    ///     statesToExit = computeExitSet(enabledTransitions)
    ///     for s in statesToExit: statesToInvoke.delete(s)
    ///     statesToExit = statesToExit.toList().sort(exitOrder)
    ///     for s in statesToExit:
    ///         for h in s.history:
    ///             if h.type == "deep": f = lambda s0: isAtomicState(s0) and isDescendant(s0,s)
    ///             else: f = lambda s0: s0.parent == s
    ///             historyValue[h.id] = configuration.toList().filter(f)
    ///     for s in statesToExit:
    ///         for content in s.onexit: executeContent(content)
    ///         for inv in s.invoke: cancelInvoke(inv)
    ///         configuration.delete(s)
    /// ```
    fn exitStates(&mut self, datamodel: &mut dyn Datamodel, enabled_transitions: &List<TransitionId>) {
        let states_to_exit = self.computeExitSet(enabled_transitions);
        for s in states_to_exit.iterator() {
            self.statesToInvoke.delete(s);
        }
        let sorted = states_to_exit.toList().sort(&exitOrder);

        // record history before exiting.
        for s in sorted.iterator() {
            let history_children: Vec<StateId> = self
                .get_state_by_id(*s)
                .map(|st| st.states.iter().filter(|c| {
                    self.get_state_by_id(**c).map(|cs| cs.history_type.is_some()).unwrap_or(false)
                }).cloned().collect())
                .unwrap_or_default();
            for h in history_children {
                let history_type = self.get_state_by_id(h).and_then(|hs| hs.history_type);
                let recorded: Vec<StateId> = match history_type {
                    Some(HistoryType::Deep) => self
                        .configuration
                        .toList()
                        .iterator()
                        .cloned()
                        .filter(|s0| self.isAtomicState(*s0) && self.isDescendant(*s0, *s))
                        .collect(),
                    _ => self
                        .configuration
                        .toList()
                        .iterator()
                        .cloned()
                        .filter(|s0| self.get_state_by_id(*s0).and_then(|st| st.parent) == Some(*s))
                        .collect(),
                };
                let mut set = OrderedSet::new();
                for r in recorded {
                    set.add(r);
                }
                self.historyValue.put(h, &set);
            }
        }

        for s in sorted.iterator() {
            let state_id = *s;
            if let Some(onexit) = self.get_state_by_id(state_id).map(|st| st.onexit.clone()) {
                for content in onexit {
                    datamodel.executeContent(self, content);
                }
            }
            let invokes = self.get_state_by_id(state_id).map(|st| st.invoke.clone()).unwrap_or_default();
            for inv in invokes {
                self.cancel_invoke(&inv);
            }
            self.configuration.delete(&state_id);
        }
    }

    fn cancel_invoke(&mut self, inv: &Invoke) {
        let mut global = self.global.lock().unwrap();
        if let Some(child) = global.child_sessions.remove(&inv.invoke_id) {
            // Best effort: ask the child to stop by dropping its sender; any events it
            // still sends afterwards are silently discarded since we no longer hold it.
            drop(child);
        }
    }

    /// Schedules `event` for delivery to `target` after `delay_ms`. `target` must
    /// resolve to a known session (self, `#_parent`, `#_scxml_<id>`, `#_<invokeid>`) --
    /// delayed sends to other Event I/O Processors (e.g. `http://...`) are not supported,
    /// since the scheduler fires by pushing directly onto a session's External Queue.
    pub fn schedule_send(&self, delay_ms: i64, sendid: Option<String>, target: &str, event: Event) -> Result<(), String> {
        let mut global = self.global.lock().unwrap();
        let session_id = global.session_id;
        let sender = global
            .resolve_session_sender(target)
            .ok_or_else(|| format!("target '{}' does not support delayed delivery", target))?;
        let key = sendid.unwrap_or_else(|| format!("__anon.{}", PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)));
        match &mut global.scheduler {
            Some(scheduler) => scheduler.schedule(
                session_id,
                key,
                std::time::Duration::from_millis(delay_ms.max(0) as u64),
                Box::new(event),
                sender,
            ),
            None => Err("no scheduler configured for this session".to_string()),
        }
    }

    /// Cancels a previously scheduled `<send>` by id (`<cancel>`). Best effort.
    pub fn cancel_send(&self, sendid: &str) {
        let mut global = self.global.lock().unwrap();
        let session_id = global.session_id;
        if let Some(scheduler) = &mut global.scheduler {
            scheduler.cancel(session_id, sendid);
        }
    }

    /// #W3C says: executes the executable content inside each transition in document order.
    fn executeTransitionContent(&mut self, datamodel: &mut dyn Datamodel, enabled_transitions: &List<TransitionId>) {
        for t_id in enabled_transitions.iterator() {
            if let Some(content) = self.get_transition_by_id(*t_id).and_then(|t| t.content) {
                datamodel.executeContent(self, content);
            }
        }
    }

    /// #W3C says:
    /// ```text
    /// procedure enterStates(enabledTransitions):
    ///     statesToEnter = new OrderedSet()
    ///     statesForDefaultEntry = new OrderedSet()
    ///     defaultHistoryContent = new HashTable()
    ///     computeEntrySet(enabledTransitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent)
    ///     for s in statesToEnter.toList().sort(entryOrder):
    ///         configuration.add(s)
    ///         statesToInvoke.add(s)
    ///         if binding == "late" and s.isFirstEntry:
    ///             initializeDataModel(s.datamodel)
    ///             s.isFirstEntry = false
    ///         for content in s.onentry: executeContent(content)
    ///         if statesForDefaultEntry.isMember(s):
    ///             executeContent(s.initial.transition.content)
    ///         if defaultHistoryContent[s.id]:
    ///             executeContent(defaultHistoryContent[s.id])
    ///         if isFinalState(s):
    ///             if isSCXMLElement(s.parent): running = false
    ///             else:
    ///                 parent = s.parent
    ///                 grandparent = parent.parent
    ///                 internalQueue.enqueue(Event("done.state." + parent.id, s.donedata))
    ///                 if isParallelState(grandparent):
    ///                     if getChildStates(grandparent).every(isInFinalState):
    ///                         internalQueue.enqueue(Event("done.state." + grandparent.id))
    /// ```
    fn enterStates(&mut self, datamodel: &mut dyn Datamodel, enabled_transitions: &List<TransitionId>) {
        let mut states_to_enter: OrderedSet<StateId> = OrderedSet::new();
        let mut states_for_default_entry: OrderedSet<StateId> = OrderedSet::new();
        let mut default_history_content: HashTable<StateId, ExecutableContentId> = HashTable::new();
        self.computeEntrySet(
            enabled_transitions,
            &mut states_to_enter,
            &mut states_for_default_entry,
            &mut default_history_content,
        );

        let sorted = states_to_enter.toList().sort(&entryOrder);
        for s in sorted.iterator() {
            let state_id = *s;
            self.configuration.add(state_id);
            self.statesToInvoke.add(state_id);

            if self.binding == BindingType::Late {
                let is_first_entry = self.get_state_by_id(state_id).map(|st| st.isFirstEntry).unwrap_or(false);
                if is_first_entry {
                    datamodel.initializeDataModel(self, state_id);
                    if let Some(st) = self.get_state_by_id_mut(state_id) {
                        st.isFirstEntry = false;
                    }
                }
            }

            if let Some(onentry) = self.get_state_by_id(state_id).map(|st| st.onentry.clone()) {
                for content in onentry {
                    datamodel.executeContent(self, content);
                }
            }

            if states_for_default_entry.isMember(&state_id) {
                let initial_transition = self.get_state_by_id(state_id).map(|st| st.initial);
                if let Some(t_id) = initial_transition {
                    if t_id != 0 {
                        if let Some(content) = self.get_transition_by_id(t_id).and_then(|t| t.content) {
                            datamodel.executeContent(self, content);
                        }
                    }
                }
            }

            if default_history_content.has(&state_id) {
                let content = *default_history_content.get(&state_id);
                datamodel.executeContent(self, content);
            }

            if self.get_state_by_id(state_id).map(|st| st.is_final).unwrap_or(false) {
                let parent = self.get_state_by_id(state_id).and_then(|st| st.parent);
                match parent {
                    None => self.running = false,
                    Some(parent_id) => {
                        if self.isSCXMLElement(parent_id) {
                            self.running = false;
                        } else {
                            let donedata = self.get_state_by_id(state_id).and_then(|st| st.donedata.clone());
                            let payload = donedata.as_ref().map(|d| self.build_donedata(datamodel, d));
                            let mut event = Event::new_simple(&format!("done.state.{}", parent_id));
                            event.etype = EventType::internal;
                            event.content = payload;
                            self.global.lock().unwrap().enqueue_internal(event);

                            let grandparent = self.get_state_by_id(parent_id).and_then(|st| st.parent);
                            if let Some(gp) = grandparent {
                                if self.isParallelState(gp)
                                    && self
                                        .getChildStates(gp)
                                        .every(&|c| self.isInFinalState(*c))
                                {
                                    let mut gp_event = Event::new_simple(&format!("done.state.{}", gp));
                                    gp_event.etype = EventType::internal;
                                    self.global.lock().unwrap().enqueue_internal(gp_event);
                                }
                            }
                        }
                    }
                }
            }
        }
    }

    fn build_donedata(&self, datamodel: &mut dyn Datamodel, donedata: &DoneData) -> Data {
        let content = datamodel.evaluate_content(&donedata.content);
        if let Some(params) = &donedata.params {
            let mut values = Vec::new();
            datamodel.evaluate_params(params, &mut values);
            return Data::Map(values.into_iter().map(|p| (p.name, p.value)).collect());
        }
        content.map(Data::String).unwrap_or(Data::None)
    }

    /// #W3C says:
    /// ```text
    /// procedure computeExitSet(transitions):
    ///     statesToExit = new OrderedSet
    ///     for t in transitions:
    ///         if t.target:
    ///             domain = getTransitionDomain(t)
    ///             for s in configuration:
    ///                 if isDescendant(s,domain): statesToExit.add(s)
    ///     return statesToExit
    /// ```
    fn computeExitSet(&self, transitions: &List<TransitionId>) -> OrderedSet<StateId> {
        let mut states_to_exit = OrderedSet::new();
        for t_id in transitions.iterator() {
            let t = match self.get_transition_by_id(*t_id) {
                Some(t) => t,
                None => continue,
            };
            if !t.target.is_empty() {
                if let Some(domain) = self.getTransitionDomain(*t_id) {
                    for s in self.configuration.iterator() {
                        if self.isDescendant(*s, domain) {
                            states_to_exit.add(*s);
                        }
                    }
                }
            }
        }
        states_to_exit
    }

    /// #W3C says:
    /// ```text
    /// procedure computeEntrySet(transitions, statesToEnter, statesForDefaultEntry, defaultHistoryContent):
    ///     for t in transitions:
    ///         for s in t.target: addDescendantStatesToEnter(s,...)
    ///         ancestor = getTransitionDomain(t)
    ///         for s in getEffectiveTargetStates(t):
    ///             addAncestorStatesToEnter(s, ancestor, ...)
    /// ```
    fn computeEntrySet(
        &self,
        transitions: &List<TransitionId>,
        states_to_enter: &mut OrderedSet<StateId>,
        states_for_default_entry: &mut OrderedSet<StateId>,
        default_history_content: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for t_id in transitions.iterator() {
            let t = match self.get_transition_by_id(*t_id) {
                Some(t) => t,
                None => continue,
            };
            for s in t.target.clone() {
                self.addDescendantStatesToEnter(
                    s,
                    states_to_enter,
                    states_for_default_entry,
                    default_history_content,
                );
            }
            let ancestor = self.getTransitionDomain(*t_id);
            let targets = self.getEffectiveTargetStates(*t_id);
            for s in targets.iterator() {
                self.addAncestorStatesToEnter(
                    *s,
                    ancestor,
                    states_to_enter,
                    states_for_default_entry,
                    default_history_content,
                );
            }
        }
    }

    /// #W3C says:
    /// ```text
    /// procedure addDescendantStatesToEnter(state,...):
    ///     if isHistoryState(state):
    ///         if historyValue[state.id]:
    ///             for s in historyValue[state.id]: addDescendantStatesToEnter(s,...)
    ///             for s in historyValue[state.id]: addAncestorStatesToEnter(s, state.parent,...)
    ///         else:
    ///             defaultHistoryContent[state.parent.id] = state.transition.content
    ///             for s in state.transition.target: addDescendantStatesToEnter(s,...)
    ///             for s in state.transition.target: addAncestorStatesToEnter(s, state.parent,...)
    ///     else:
    ///         statesToEnter.add(state)
    ///         if isCompoundState(state):
    ///             statesForDefaultEntry.add(state)
    ///             for s in getEffectiveTargetStates(state.initial): addDescendantStatesToEnter(s,...)
    ///             for s in getEffectiveTargetStates(state.initial): addAncestorStatesToEnter(s, state,...)
    ///         else if isParallelState(state):
    ///             for child in getChildStates(state): addDescendantStatesToEnter(child,...)
    /// ```
    fn addDescendantStatesToEnter(
        &self,
        state: StateId,
        states_to_enter: &mut OrderedSet<StateId>,
        states_for_default_entry: &mut OrderedSet<StateId>,
        default_history_content: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        if self.isHistoryState(state) {
            let parent = self.get_state_by_id(state).and_then(|s| s.parent);
            if self.historyValue.has(&state) {
                let recorded = self.historyValue.get(&state).clone();
                for s in recorded.iterator() {
                    self.addDescendantStatesToEnter(
                        *s,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
                for s in recorded.iterator() {
                    self.addAncestorStatesToEnter(
                        *s,
                        parent,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
            } else {
                let t_id = self.get_state_by_id(state).map(|s| s.initial).unwrap_or(0);
                if let Some(t) = self.get_transition_by_id(t_id) {
                    if let (Some(p), Some(content)) = (parent, t.content) {
                        default_history_content.put(p, &content);
                    }
                    for s in t.target.clone() {
                        self.addDescendantStatesToEnter(
                            s,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                    for s in t.target.clone() {
                        self.addAncestorStatesToEnter(
                            s,
                            parent,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            }
        } else {
            states_to_enter.add(state);
            if self.isCompoundState(state) {
                states_for_default_entry.add(state);
                let t_id = self.get_state_by_id(state).map(|s| s.initial).unwrap_or(0);
                let targets = self.getEffectiveTargetStates(t_id);
                for s in targets.iterator() {
                    self.addDescendantStatesToEnter(
                        *s,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
                for s in targets.iterator() {
                    self.addAncestorStatesToEnter(
                        *s,
                        Some(state),
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
            } else if self.isParallelState(state) {
                for child in self.getChildStates(state).iterator() {
                    self.addDescendantStatesToEnter(
                        *child,
                        states_to_enter,
                        states_for_default_entry,
                        default_history_content,
                    );
                }
            }
        }
    }

    /// #W3C says:
    /// ```text
    /// procedure addAncestorStatesToEnter(state, ancestor,...):
    ///     for anc in getProperAncestors(state, ancestor):
    ///         statesToEnter.add(anc)
    ///         if isParallelState(anc):
    ///             for child in getChildStates(anc):
    ///                 if not statesToEnter.some(descendant of child): addDescendantStatesToEnter(child,...)
    /// ```
    fn addAncestorStatesToEnter(
        &self,
        state: StateId,
        ancestor: Option<StateId>,
        states_to_enter: &mut OrderedSet<StateId>,
        states_for_default_entry: &mut OrderedSet<StateId>,
        default_history_content: &mut HashTable<StateId, ExecutableContentId>,
    ) {
        for anc in self.getProperAncestors(state, ancestor) {
            states_to_enter.add(anc);
            if self.isParallelState(anc) {
                for child in self.getChildStates(anc).iterator() {
                    let already = states_to_enter.some(&|s| self.isDescendant(*s, *child) || *s == *child);
                    if !already {
                        self.addDescendantStatesToEnter(
                            *child,
                            states_to_enter,
                            states_for_default_entry,
                            default_history_content,
                        );
                    }
                }
            }
        }
    }

    /// #W3C says:
    /// ```text
    /// function getTransitionDomain(t):
    ///     tstates = getEffectiveTargetStates(t)
    ///     if not tstates: return null
    ///     elif t.type == "internal" and isCompoundState(t.source) and tstates.every(isDescendant(_, t.source)):
    ///         return t.source
    ///     else: return findLCCA([t.source].append(tstates))
    /// ```
    fn getTransitionDomain(&self, t_id: TransitionId) -> Option<StateId> {
        let t = self.get_transition_by_id(t_id)?;
        let tstates = self.getEffectiveTargetStates(t_id);
        if tstates.isEmpty() {
            return None;
        }
        if t.transition_type == TransitionType::Internal
            && self.isCompoundState(t.source)
            && tstates.every(&|s| self.isDescendant(*s, t.source))
        {
            return Some(t.source);
        }
        let mut all = vec![t.source];
        all.extend(tstates.iterator().cloned());
        Some(self.findLCCA(&List::from_vec(all)))
    }

    /// #W3C says:
    /// ```text
    /// function findLCCA(stateList):
    ///     for anc in getProperAncestors(stateList.head(), null).filter(isCompoundStateOrScxml):
    ///         if stateList.tail().every(lambda s: isDescendant(s, anc)): return anc
    /// ```
    fn findLCCA(&self, state_list: &List<StateId>) -> StateId {
        let head = *state_list.head();
        let mut ancestors = self.getProperAncestors(head, None);
        ancestors.push(self.pseudo_root);
        for anc in ancestors {
            if state_list.tail().every(&|s| self.isDescendant(*s, anc) || *s == anc) {
                return anc;
            }
        }
        self.pseudo_root
    }

    /// #W3C says:
    /// ```text
    /// function getProperAncestors(state1, state2):
    ///     ancestors = new List
    ///     while state1.parent:
    ///         state1 = state1.parent
    ///         if state1 == state2: break
    ///         ancestors.push(state1)
    ///     return ancestors
    /// ```
    fn getProperAncestors(&self, state1: StateId, state2: Option<StateId>) -> Vec<StateId> {
        let mut ancestors = Vec::new();
        let mut current = state1;
        while let Some(parent) = self.get_state_by_id(current).and_then(|s| s.parent) {
            if Some(parent) == state2 {
                break;
            }
            ancestors.push(parent);
            current = parent;
        }
        ancestors
    }

    /// #W3C says: True if state1 is a descendant of state2.
    fn isDescendant(&self, state1: StateId, state2: StateId) -> bool {
        if state1 == state2 {
            return false;
        }
        let mut current = state1;
        while let Some(parent) = self.get_state_by_id(current).and_then(|s| s.parent) {
            if parent == state2 {
                return true;
            }
            current = parent;
        }
        false
    }

    fn isCompoundState(&self, state: StateId) -> bool {
        match self.get_state_by_id(state) {
            Some(s) => !s.is_parallel && !s.is_final && !s.states.is_empty(),
            None => false,
        }
    }

    fn isAtomicState(&self, state: StateId) -> bool {
        match self.get_state_by_id(state) {
            Some(s) => s.states.is_empty() || s.is_final,
            None => true,
        }
    }

    fn isParallelState(&self, state: StateId) -> bool {
        self.get_state_by_id(state).map(|s| s.is_parallel).unwrap_or(false)
    }

    fn isFinalState(&self, state: StateId) -> bool {
        self.get_state_by_id(state).map(|s| s.is_final).unwrap_or(false)
    }

    fn isHistoryState(&self, state: StateId) -> bool {
        self.get_state_by_id(state).map(|s| s.history_type.is_some()).unwrap_or(false)
    }

    fn isSCXMLElement(&self, state: StateId) -> bool {
        state == self.pseudo_root
    }

    fn isInFinalState(&self, state: StateId) -> bool {
        if self.isCompoundState(state) {
            self.getChildStates(state).some(&|s| self.isFinalState(*s) && self.configuration.isMember(s))
        } else if self.isParallelState(state) {
            self.getChildStates(state).every(&|s| self.isInFinalState(*s))
        } else {
            false
        }
    }

    /// #W3C says: Returns the states whose invocation will be entered by taking this transition.
    fn getEffectiveTargetStates(&self, t_id: TransitionId) -> OrderedSet<StateId> {
        let mut targets = OrderedSet::new();
        let t = match self.get_transition_by_id(t_id) {
            Some(t) => t,
            None => return targets,
        };
        for s in &t.target {
            if self.isHistoryState(*s) {
                if self.historyValue.has(s) {
                    for rec in self.historyValue.get(s).iterator() {
                        targets.add(*rec);
                    }
                } else {
                    let inner_t = self.get_state_by_id(*s).map(|st| st.initial).unwrap_or(0);
                    if let Some(it) = self.get_transition_by_id(inner_t) {
                        for is in it.target.clone() {
                            let sub = self.getEffectiveTargetStates(inner_t);
                            if sub.isEmpty() {
                                targets.add(is);
                            }
                        }
                        for inner in self.getEffectiveTargetStates(inner_t).iterator() {
                            targets.add(*inner);
                        }
                    }
                }
            } else {
                targets.add(*s);
            }
        }
        targets
    }

    fn getChildStates(&self, state: StateId) -> OrderedSet<StateId> {
        let mut set = OrderedSet::new();
        if let Some(s) = self.get_state_by_id(state) {
            for c in &s.states {
                if !self.isHistoryState(*c) {
                    set.add(*c);
                }
            }
        }
        set
    }

    /// #W3C says: invoked by the Macrostep Driver once a macrostep has ended and all
    /// pending invokes for newly-entered states have been collected.
    ///
    /// *W3C says* (6.4.1): if any location in 'namelist' fails to evaluate, or if any
    /// <param> fails to evaluate, the SCXML Processor must place error.execution on the
    /// internal event queue of the invoking session and MUST NOT create the child session.
    fn invoke(&mut self, datamodel: &mut dyn Datamodel, inv: &Invoke) {
        let invoke_type = match datamodel.get_expression_alternative_value(&inv.type_name, &inv.type_expr) {
            Ok(t) if !t.is_empty() => t,
            _ => SCXML_INVOKE_TYPE.to_string(),
        };
        if invoke_type != SCXML_INVOKE_TYPE && invoke_type != SCXML_INVOKE_TYPE_SHORT {
            warn!("unsupported invoke type '{}'", invoke_type);
            datamodel.internal_error_execution();
            return;
        }

        let mut data = HashMap::new();
        let mut failed = false;
        for name in &inv.name_list {
            match datamodel.get_by_location(name) {
                Ok(value) => {
                    data.insert(name.clone(), value);
                }
                Err(msg) => {
                    error!("namelist location '{}' is invalid ({})", name, msg);
                    failed = true;
                }
            }
        }
        if let Some(params) = &inv.params {
            let mut values = Vec::new();
            datamodel.evaluate_params(params, &mut values);
            if values.len() != params.len() {
                failed = true;
            }
            for v in values {
                data.insert(v.name, v.value);
            }
        }
        if failed {
            datamodel.internal_error_execution();
            return;
        }

        let src = match datamodel.get_expression_alternative_value(&inv.src, &inv.src_expr) {
            Ok(s) => s,
            Err(msg) => {
                error!("invoke srcexpr is invalid ({})", msg);
                datamodel.internal_error_execution();
                return;
            }
        };
        let inline_content = datamodel.evaluate_content(&inv.content);

        let (executor, parent_session) = {
            let global = self.global.lock().unwrap();
            (global.executor.clone(), global.session_id)
        };
        let Some(mut executor) = executor else {
            warn!("no executor bound, cannot invoke '{}'", inv.src);
            return;
        };

        #[cfg(feature = "Trace")]
        let trace = self.global.lock().unwrap().tracer.trace_mode();

        let session = if !src.is_empty() {
            executor.execute_with_data(
                &src,
                &data,
                Some(parent_session),
                &inv.invoke_id,
                #[cfg(feature = "Trace")]
                trace,
            )
        } else if let Some(xml) = inline_content {
            executor.execute_with_data_from_xml(
                &xml,
                &data,
                Some(parent_session),
                &inv.invoke_id,
                #[cfg(feature = "Trace")]
                trace,
            )
        } else {
            error!("invoke has neither 'src', 'srcexpr' nor inline content");
            datamodel.internal_error_execution();
            return;
        };
        match session {
            Ok(child) => {
                self.global.lock().unwrap().child_sessions.insert(
                    inv.invoke_id.clone(),
                    ChildSession {
                        session_id: child.session_id,
                        sender: child.sender,
                    },
                );
                if !inv.external_id_location.is_empty() {
                    let literal = format!("'{}'", inv.invoke_id.replace('\'', "\\'"));
                    datamodel.assign(&inv.external_id_location, &literal);
                }
            }
            Err(msg) => {
                error!("invoke '{}' failed: {}", src, msg);
                datamodel.internal_error_execution();
            }
        }
    }
}

/// Starts the FSM inside its own worker thread (the thread-per-session model). Returns
/// a handle the caller can use to send events into the session's External Queue and to
/// join the driver thread on shutdown.
pub fn start_fsm(fsm: Fsm, executor: Box<FsmExecutor>) -> ScxmlSession {
    start_fsm_with_data(fsm, executor, &HashMap::new())
}

pub fn start_fsm_with_data(
    mut fsm: Fsm,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
) -> ScxmlSession {
    let session_id = fsm.session_id();
    let sender = fsm.externalQueue.sender.clone();
    {
        let mut global = fsm.global.lock().unwrap();
        global.executor = Some(*executor);
    }

    let init_data = data.clone();
    let thread = thread::Builder::new()
        .name(format!("fsm-{}", session_id))
        .spawn(move || {
            let mut datamodel = createDatamodel(&fsm.datamodel_name);
            *datamodel.global() = fsm.global.clone();
            for (k, v) in init_data {
                datamodel.set(&k, v);
            }
            fsm.interpret(datamodel.as_mut());
        })
        .expect("failed to spawn session thread");

    ScxmlSession {
        session_id,
        sender,
        thread: Some(thread),
    }
}

/// Starts the FSM in manual/polled mode (`spec.md` §4.2/§4.6): no driver thread is
/// spawned, a [`crate::scheduler::ManualScheduler`] is installed in place of the
/// `AutomaticScheduler` every other `start_fsm*` entry point uses, and the initial
/// configuration's entry actions (`Fsm::initialize`) run synchronously before
/// returning. The caller drives the session forward with [`ManualScxmlSession::step`].
pub fn start_fsm_manual(fsm: Fsm, executor: Box<FsmExecutor>) -> ManualScxmlSession {
    start_fsm_manual_with_data(fsm, executor, &HashMap::new())
}

pub fn start_fsm_manual_with_data(
    mut fsm: Fsm,
    executor: Box<FsmExecutor>,
    data: &HashMap<String, Data>,
) -> ManualScxmlSession {
    let session_id = fsm.session_id();
    let sender = fsm.externalQueue.sender.clone();
    {
        let mut global = fsm.global.lock().unwrap();
        global.executor = Some(*executor);
        global.scheduler = Some(Box::new(crate::scheduler::ManualScheduler::new()));
    }

    let mut datamodel = createDatamodel(&fsm.datamodel_name);
    *datamodel.global() = fsm.global.clone();
    for (k, v) in data.clone() {
        datamodel.set(&k, v);
    }
    fsm.initialize(datamodel.as_mut());

    ManualScxmlSession {
        session_id,
        sender,
        fsm,
        datamodel,
    }
}
