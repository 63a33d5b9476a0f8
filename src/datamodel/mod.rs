//! Defines the API used to access the data models (W3C SCXML §5 Data Model and Data Manipulation).
//!
//! The runtime treats the expression/data-model layer as an opaque evaluator behind the
//! [`Datamodel`] trait: everything above this module only ever calls `assign`/`execute`/
//! `execute_condition`/`get_by_location` and never inspects how a concrete implementation
//! represents a script value internally.

pub mod ecma_script;
pub mod null;

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::sync::{Arc, Mutex, MutexGuard};

use log::error;

use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{
    CommonContent, Event, ExecutableContentId, Fsm, GlobalData, InvokeId, ParamPair, Parameter,
    StateId,
};

pub const DATAMODEL_OPTION_PREFIX: &str = "datamodel:";

pub const NULL_DATAMODEL: &str = "NULL";
pub const NULL_DATAMODEL_LC: &str = "null";

pub const SCXML_INVOKE_TYPE: &str = "http://www.w3.org/TR/scxml/";

/// W3C: Processors MAY define short form notations as an authoring convenience
/// (e.g., "scxml" as equivalent to http://www.w3.org/TR/scxml/).
pub const SCXML_INVOKE_TYPE_SHORT: &str = "scxml";

pub const SCXML_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#SCXMLEventProcessor";

#[cfg(feature = "BasicHttpEventIOProcessor")]
pub const BASIC_HTTP_EVENT_PROCESSOR: &str = "http://www.w3.org/TR/scxml/#BasicHTTPEventProcessor";

/// Name of system variable "_sessionid".\
/// *W3C says*:\
/// The SCXML Processor MUST bind the variable _sessionid at load time to the system-generated id
/// for the current SCXML session. (This is of type NMTOKEN.) The Processor MUST keep the variable
/// bound to this value until the session terminates.
pub const SESSION_ID_VARIABLE_NAME: &str = "_sessionid";

/// Name of system variable "_name".
pub const SESSION_NAME_VARIABLE_NAME: &str = "_name";

/// Name of system variable "_event" for events.
pub const EVENT_VARIABLE_NAME: &str = "_event";

/// Name of system variable "_ioprocessors".
pub const IO_PROCESSORS_VARIABLE_NAME: &str = "_ioprocessors";

pub const EVENT_VARIABLE_FIELD_NAME: &str = "name";
pub const EVENT_VARIABLE_FIELD_TYPE: &str = "type";
pub const EVENT_VARIABLE_FIELD_SEND_ID: &str = "sendid";
pub const EVENT_VARIABLE_FIELD_ORIGIN: &str = "origin";
pub const EVENT_VARIABLE_FIELD_ORIGIN_TYPE: &str = "origintype";
pub const EVENT_VARIABLE_FIELD_INVOKE_ID: &str = "invokeid";
pub const EVENT_VARIABLE_FIELD_DATA: &str = "data";

/// Gets the global data store from a datamodel.
#[macro_export]
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock().unwrap()
    };
}

/// Gets the global data store from a datamodel (shared borrow).
#[macro_export]
macro_rules! get_global_s {
    ($x:expr) => {
        $x.global_s().lock().unwrap()
    };
}

pub type GlobalDataLock<'a> = MutexGuard<'a, GlobalData>;

/// Shared, lock-protected handle to a session's [`GlobalData`].
///
/// Both the `Fsm` driving the session and the `Datamodel` bound to it hold a clone of the
/// same `GlobalDataArc`, so that Event I/O Processors (reached only through the datamodel,
/// per W3C's `_ioprocessors` binding) can append to the session's queues without needing a
/// reference to the `Fsm` itself.
#[derive(Clone)]
pub struct GlobalDataArc {
    arc: Arc<Mutex<GlobalData>>,
}

impl Default for GlobalDataArc {
    fn default() -> Self {
        GlobalDataArc::from(GlobalData::new_detached())
    }
}

impl GlobalDataArc {
    pub fn from(data: GlobalData) -> GlobalDataArc {
        GlobalDataArc {
            arc: Arc::new(Mutex::new(data)),
        }
    }

    pub fn lock(&self) -> std::sync::LockResult<GlobalDataLock> {
        self.arc.lock()
    }
}

/// A value crossing the boundary of the data model: a `<param>` binding, an event payload,
/// or a value serialized to/from JSON or BasicHTTP form fields.
///
/// Concrete data models (e.g. the ECMAScript one) are free to hold a richer internal
/// representation; `Data` is only what crosses back out to the runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum Data {
    None,
    String(String),
    Number(f64),
    Boolean(bool),
    Array(Vec<Data>),
    Map(Vec<(String, Data)>),
}

impl Data {
    pub fn new(val: &str) -> Data {
        Data::String(val.to_string())
    }

    pub fn new_moved(val: String) -> Data {
        Data::String(val)
    }

    pub fn new_null() -> Data {
        Data::None
    }

    /// Best-effort numeric coercion used when decoding BasicHTTP form fields (W3C says
    /// "numeric strings coerced to numbers").
    pub fn from_form_field(val: &str) -> Data {
        if let Ok(n) = val.parse::<f64>() {
            Data::Number(n)
        } else {
            Data::String(val.to_string())
        }
    }

    /// Converts to a `serde_json::Value`, used by the event descriptor JSON form
    /// (§6 "Event descriptor JSON form") and by data models that need to round-trip
    /// a value across a JSON boundary.
    #[cfg(feature = "json-config")]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Data::None => serde_json::Value::Null,
            Data::String(s) => serde_json::Value::String(s.clone()),
            Data::Number(n) => serde_json::json!(n),
            Data::Boolean(b) => serde_json::Value::Bool(*b),
            Data::Array(items) => {
                serde_json::Value::Array(items.iter().map(Data::to_json).collect())
            }
            Data::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }

    #[cfg(feature = "json-config")]
    pub fn from_json(value: &serde_json::Value) -> Data {
        match value {
            serde_json::Value::Null => Data::None,
            serde_json::Value::Bool(b) => Data::Boolean(*b),
            serde_json::Value::Number(n) => Data::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => Data::String(s.clone()),
            serde_json::Value::Array(items) => {
                Data::Array(items.iter().map(Data::from_json).collect())
            }
            serde_json::Value::Object(map) => Data::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), Data::from_json(v)))
                    .collect(),
            ),
        }
    }
}

impl Display for Data {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Data::None => write!(f, "null"),
            Data::String(s) => write!(f, "{}", s),
            Data::Number(n) => write!(f, "{}", n),
            Data::Boolean(b) => write!(f, "{}", b),
            Data::Array(items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            Data::Map(entries) => {
                write!(f, "{{")?;
                for (i, (k, v)) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", k, v)?;
                }
                write!(f, "}}")
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct DataStore {
    pub values: HashMap<String, Data>,
}

impl DataStore {
    pub fn new() -> DataStore {
        DataStore::default()
    }

    pub fn get(&self, key: &str) -> Option<&Data> {
        self.values.get(key)
    }

    pub fn get_mut(&mut self, key: &str) -> Option<&mut Data> {
        self.values.get_mut(key)
    }

    pub fn set(&mut self, key: &str, data: Data) {
        self.values.insert(key.to_string(), data);
    }
}

/// Data model interface trait.\
/// *W3C says*:\
/// The Data Model offers the capability of storing, reading, and modifying a set of data that
/// is internal to the state machine. This specification does not mandate any specific data
/// model, but instead defines a set of abstract capabilities that can be realized by various
/// languages, such as ECMAScript or XML/XPath.
pub trait Datamodel: Send {
    /// Returns the global data, owned by the session, not by the datamodel itself.
    fn global(&mut self) -> &mut GlobalDataArc;

    fn global_s(&self) -> &GlobalDataArc;

    /// Get the name of the data model as declared by the `datamodel` attribute of `<scxml>`.
    fn get_name(&self) -> &str;

    /// Adds the "In" predicate function and, if the data model supports scripting, "log".
    /// Also binds `_ioprocessors`.
    fn implement_mandatory_functionality(&mut self, fsm: &mut Fsm);

    /// Initializes the data model for one `<datamodel>` container (the document's top-level one,
    /// or a state's local one under late binding).
    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &mut Fsm, state: StateId);

    fn initialize_read_only(&mut self, name: &str, value: &str);

    fn set(&mut self, name: &str, data: Data);

    /// Sets predefined system variable `_event`.
    fn set_event(&mut self, event: &Event);

    /// Executes an `<assign>`. Returns `true` if the assignment succeeded.
    fn assign(&mut self, left_expr: &str, right_expr: &str) -> bool;

    /// Resolves a location expression to its current value. On failure, `error.execution`
    /// has already been raised by the caller (see [`Datamodel::internal_error_execution`]).
    fn get_by_location(&mut self, location: &str) -> Result<Data, String>;

    fn get_expression_alternative_value(
        &mut self,
        value: &str,
        value_expression: &str,
    ) -> Result<String, String> {
        if value_expression.is_empty() {
            Ok(value.to_string())
        } else {
            match self.execute(value_expression) {
                Err(_msg) => Err("execution failed".to_string()),
                Ok(value) => Ok(value),
            }
        }
    }

    fn get_io_processors(&mut self) -> &mut HashMap<String, Box<dyn EventIOProcessor>>;

    /// Finds the registered Event I/O Processor answering to `type_str` (a full URI or one
    /// of its short forms, e.g. "scxml" or "basichttp"). Used by `<send>` to dispatch.
    fn get_io_processor(&mut self, type_str: &str) -> Option<&mut Box<dyn EventIOProcessor>> {
        self.get_io_processors()
            .values_mut()
            .find(|p| p.get_types().contains(&type_str))
    }

    /// Dispatches `event` to `target` via the Event I/O Processor registered for `type_str`.
    /// Returns `false` if no processor answers to `type_str` at all -- the caller (`<send>`'s
    /// executable content) must then raise `error.execution`.
    fn send(&mut self, type_str: &str, target: &str, event: Event) -> bool {
        let global = self.global_s().clone();
        match self.get_io_processor(type_str) {
            Some(processor) => processor.send(&global, target, event),
            None => false,
        }
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Data>;

    fn clear(&mut self);

    /// "log" function, used for `<log>` content.
    fn log(&mut self, msg: &str);

    /// Executes a script/expression. On failure, `error.execution` must be raised by the caller.
    fn execute(&mut self, script: &str) -> Result<String, String>;

    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool;

    /// *W3C says*: all data models must support the `In()` predicate.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String>;

    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool;

    /// W3C: an error internal to the execution of the document has occurred.
    fn internal_error_execution_with_event(&mut self, event: &Event) {
        get_global!(self).enqueue_internal(Event::error_execution_with_event(event));
    }

    fn internal_error_execution_for_event(
        &mut self,
        send_id: &Option<String>,
        invoke_id: &Option<InvokeId>,
    ) {
        get_global!(self).enqueue_internal(Event::error_execution(send_id, invoke_id));
    }

    fn internal_error_execution(&mut self) {
        get_global!(self).enqueue_internal(Event::error_execution(&None, &None));
    }

    /// W3C: an error has occurred while trying to communicate with an external entity.
    fn internal_error_communication(&mut self, event: &Event) {
        get_global!(self).enqueue_internal(Event::error_communication(event));
    }

    fn evaluate_content(&mut self, content: &Option<CommonContent>) -> Option<String> {
        match content {
            None => None,
            Some(ct) => match &ct.content_expr {
                None => ct.content.clone(),
                Some(expr) => match self.execute(expr.as_str()) {
                    Err(msg) => {
                        // W3C: on error, place error.execution in the internal queue and use
                        // the empty string as the value of <content>.
                        error!("content expr '{}' is invalid ({})", expr, msg);
                        self.internal_error_execution();
                        None
                    }
                    Ok(value) => Some(value),
                },
            },
        }
    }

    fn evaluate_params(&mut self, params: &[Parameter], values: &mut Vec<ParamPair>) {
        for param in params {
            if !param.location.is_empty() {
                match self.get_by_location(&param.location) {
                    Err(msg) => {
                        error!("location of param {} is invalid ({})", param.name, msg);
                        self.internal_error_execution();
                    }
                    Ok(value) => values.push(ParamPair {
                        name: param.name.clone(),
                        value,
                    }),
                }
            } else if !param.expr.is_empty() {
                match self.execute(&param.expr) {
                    Err(msg) => {
                        error!("expr of param {} is invalid ({})", param.name, msg);
                        self.internal_error_execution();
                    }
                    Ok(value) => values.push(ParamPair {
                        name: param.name.clone(),
                        value: Data::new_moved(value),
                    }),
                }
            }
        }
    }
}

pub trait ToAny: 'static {
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn as_any(&self) -> &dyn Any;
}

impl<T: Debug + 'static> ToAny for T {
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
