//! Implementation of "executable content" elements.
//! See [W3C:Executable Content](/doc/W3C_SCXML_2024_07_13/index.html#executable).

use std::collections::HashMap;
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use std::sync::atomic::Ordering;

#[cfg(feature = "Debug")]
use crate::common::debug;
use crate::common::{error, warn};
use crate::datamodel::{Data, Datamodel, ToAny, SCXML_EVENT_PROCESSOR};
use crate::event_io_processor::scxml_event_io_processor::SCXML_TARGET_INTERNAL;
use crate::fsm::{
    vec_to_string, CommonContent, Event, EventType, ExecutableContentId, Fsm, ParamPair, Parameter,
    PLATFORM_ID_COUNTER,
};

pub const TYPE_IF: u8 = 0;
pub const TYPE_EXPRESSION: u8 = 1;
pub const TYPE_LOG: u8 = 3;
pub const TYPE_FOREACH: u8 = 4;
pub const TYPE_SEND: u8 = 5;
pub const TYPE_RAISE: u8 = 6;
pub const TYPE_CANCEL: u8 = 7;
pub const TYPE_ASSIGN: u8 = 8;

pub const TYPE_NAMES: [&str; 9] = [
    "if",
    "expression",
    "unused",
    "log",
    "foreach",
    "send",
    "raise",
    "cancel",
    "assign",
];

/// Gets the global data store from datamodel.
macro_rules! get_global {
    ($x:expr) => {
        $x.global().lock().unwrap()
    };
}

pub trait ExecutableContent: ToAny + Debug + Send {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool;
    fn get_type(&self) -> u8;

    fn get_trace(&self) -> HashMap<&str, Data>;
}

pub fn get_safe_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> &mut T {
    let va = ec.as_any_mut();
    va.downcast_mut::<T>()
        .unwrap_or_else(|| panic!("Failed to cast executable content"))
}

pub fn get_executable_content_as<T: 'static>(ec: &mut dyn ExecutableContent) -> Option<&mut T> {
    let va = ec.as_any_mut();
    va.downcast_mut::<T>()
}

pub fn get_opt_executable_content_as<T: 'static>(
    ec_opt: Option<&mut dyn ExecutableContent>,
) -> Option<&mut T> {
    match ec_opt {
        Some(ec) => get_executable_content_as::<T>(ec),
        None => None,
    }
}

/// A parsed sequence of executable content elements, keyed by the id the reader assigned
/// to its containing region (an `<onentry>`, `<onexit>`, `<transition>` body, `<if>`/`<foreach>`
/// branch, ...). Id `0` always denotes "no content".
#[derive(Debug, Default)]
pub struct ExecutableContentRegistry {
    regions: HashMap<ExecutableContentId, Vec<Box<dyn ExecutableContent>>>,
}

impl ExecutableContentRegistry {
    pub fn new() -> ExecutableContentRegistry {
        ExecutableContentRegistry::default()
    }

    pub fn insert(&mut self, id: ExecutableContentId, content: Vec<Box<dyn ExecutableContent>>) {
        self.regions.insert(id, content);
    }

    pub fn get(&self, id: &ExecutableContentId) -> Option<&Vec<Box<dyn ExecutableContent>>> {
        self.regions.get(id)
    }

    pub fn get_mut(
        &mut self,
        id: &ExecutableContentId,
    ) -> Option<&mut Vec<Box<dyn ExecutableContent>>> {
        self.regions.get_mut(id)
    }

    pub fn contains_key(&self, id: &ExecutableContentId) -> bool {
        self.regions.contains_key(id)
    }

    /// Executes the content region `id` in document order.
    ///
    /// *W3C says*: "If executing the executable content contained in a transition causes
    /// an error, the Processor must stop executing the content." We apply the same rule
    /// to every region, not just transitions, by stopping at the first element whose
    /// `execute` returns `false`.
    pub fn execute(
        &self,
        id: ExecutableContentId,
        datamodel: &mut dyn Datamodel,
        fsm: &Fsm,
    ) -> bool {
        if id == 0 {
            return true;
        }
        match self.regions.get(&id) {
            Some(content) => {
                for ec in content {
                    if !ec.execute(datamodel, fsm) {
                        return false;
                    }
                }
                true
            }
            None => true,
        }
    }
}

#[derive(Debug, Default)]
pub struct Cancel {
    pub send_id: String,
    pub send_id_expr: String,
}

impl Cancel {
    pub fn new() -> Cancel {
        Cancel::default()
    }
}

impl ExecutableContent for Cancel {
    /// *W3C says*: The \<cancel\> element is used to cancel a delayed \<send\> event. The
    /// SCXML Processor MUST NOT allow \<cancel\> to affect events that were not raised in
    /// the same session. The Processor SHOULD make its best attempt to cancel all delayed
    /// events with the specified id, though this can't be guaranteed to succeed -- for
    /// example if the event has already been delivered by the time \<cancel\> executes.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        if let Ok(send_id) =
            datamodel.get_expression_alternative_value(&self.send_id, &self.send_id_expr)
        {
            fsm.cancel_send(&send_id);
        }
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_CANCEL
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("sendid", Data::String(self.send_id.clone()));
        d.insert("sendidexpr", Data::String(self.send_id_expr.clone()));
        d
    }
}

/// Holds all parameters of a \<send\> call.
#[derive(Default)]
pub struct SendParameters {
    /// SCXML \<send\> attribute 'idlocation'.
    pub name_location: String,
    /// SCXML \<send\> attribute 'id'.
    pub name: String,
    /// In case the id is generated, the parent state of the send.
    pub parent_state_name: String,
    /// SCXML \<send\> attribute 'event'.
    pub event: String,
    /// SCXML \<send\> attribute 'eventexpr'.
    pub event_expr: String,
    /// SCXML \<send\> attribute 'target'.
    pub target: String,
    /// SCXML \<send\> attribute 'targetexpr'.
    pub target_expr: String,
    /// SCXML \<send\> attribute 'type'.
    pub type_value: String,
    /// SCXML \<send\> attribute 'typeexpr'.
    pub type_expr: String,
    /// SCXML \<send\> attribute 'delay' in milliseconds.
    pub delay_ms: u64,
    /// SCXML \<send\> attribute 'delayexpr'.
    pub delay_expr: String,
    /// SCXML \<send\> attribute 'namelist'. Must not be specified in conjunction with 'content'.
    pub name_list: Vec<String>,
    /// \<param\> children.
    pub params: Option<Vec<Parameter>>,
    pub content: Option<CommonContent>,
}

impl SendParameters {
    pub fn new() -> SendParameters {
        SendParameters::default()
    }
}

impl Debug for SendParameters {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Send").field("name", &self.name).finish()
    }
}

/// Implements the execution of the \<send\> element.
impl ExecutableContent for SendParameters {
    /// If unable to dispatch, place "error.communication" in the internal queue.
    /// If the target/type is not supported, place "error.execution" in the internal queue.
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let target = match datamodel.get_expression_alternative_value(&self.target, &self.target_expr) {
            Ok(value) => value,
            Err(_) => return false,
        };

        let event_name = match datamodel.get_expression_alternative_value(&self.event, &self.event_expr) {
            Ok(value) => value,
            Err(_) => return false,
        };

        let send_id = if self.name_location.is_empty() {
            if self.name.is_empty() {
                None
            } else {
                Some(self.name.clone())
            }
        } else {
            // *W3C says*: If 'idlocation' is present, the SCXML Processor MUST generate an
            // id when the parent <send> element is evaluated and store it in this location.
            // The Processor MAY generate the id in any format, as long as it is unique.
            let generated_id = format!(
                "{}.{}",
                &self.parent_state_name,
                PLATFORM_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
            );
            datamodel.set(self.name_location.as_str(), Data::String(generated_id.clone()));
            Some(generated_id)
        };

        let mut data_vec = Vec::new();
        let mut content = None;

        // A conformant document MUST NOT specify "namelist" or <param> together with <content>.
        if self.content.is_some() {
            content = datamodel.evaluate_content(&self.content);
        } else {
            datamodel.evaluate_params(self.params.as_deref().unwrap_or(&[]), &mut data_vec);
            for name in self.name_list.as_slice() {
                match datamodel.get_by_location(name) {
                    Err(_msg) => return false,
                    Ok(value) => data_vec.push(ParamPair {
                        name: name.clone(),
                        value,
                    }),
                }
            }
        }

        let delay_ms: i64 = if !self.delay_expr.is_empty() {
            match datamodel.execute(&self.delay_expr) {
                Err(_msg) => return false,
                Ok(delay) => parse_duration_to_milliseconds(&delay),
            }
        } else {
            self.delay_ms as i64
        };

        if delay_ms < 0 {
            error!("Send: delay '{}' is invalid", self.delay_expr);
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
            return false;
        }

        if delay_ms > 0 && target == SCXML_TARGET_INTERNAL {
            error!("Send: illegal delay for target {}", target);
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
            return false;
        }

        let type_val = match datamodel.get_expression_alternative_value(&self.type_value, &self.type_expr) {
            Ok(val) => val,
            Err(err) => {
                error!("Failed to evaluate send type: {}", err);
                datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
                return false;
            }
        };
        let type_val_str = if type_val.is_empty() {
            SCXML_EVENT_PROCESSOR
        } else {
            type_val.as_str()
        };

        let event = Event {
            name: event_name,
            etype: EventType::external,
            sendid: send_id.clone(),
            origin: None,
            origin_type: None,
            invoke_id: fsm.caller_invoke_id.clone(),
            param_values: if data_vec.is_empty() { None } else { Some(data_vec) },
            content: content.map(Data::String),
        };

        let result = if delay_ms > 0 {
            #[cfg(feature = "Debug")]
            debug!("schedule '{}' for {}ms", event, delay_ms);
            match fsm.schedule_send(delay_ms, send_id.clone(), &target, event) {
                Ok(()) => true,
                Err(msg) => {
                    error!("Send: can't schedule delayed send: {}", msg);
                    false
                }
            }
        } else {
            #[cfg(feature = "Debug")]
            debug!("send '{}' to '{}'", event, target);
            datamodel.send(type_val_str, &target, event)
        };

        if !result {
            // *W3C says*: If the SCXML Processor does not support the type that is
            // specified, it must place the event "error.execution" on the internal
            // event queue.
            datamodel.internal_error_execution_for_event(&send_id, &fsm.caller_invoke_id);
        }
        result
    }

    fn get_type(&self) -> u8 {
        TYPE_SEND
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("name_location", Data::String(self.name_location.clone()));
        d.insert("name", Data::String(self.name.clone()));
        d.insert("parent_state_name", Data::String(self.parent_state_name.clone()));
        d.insert("event", Data::String(self.event.clone()));
        d.insert("event_expr", Data::String(self.event_expr.clone()));
        d.insert("target", Data::String(self.target.clone()));
        d.insert("target_expr", Data::String(self.target_expr.clone()));
        d.insert("type_value", Data::String(self.type_value.clone()));
        d.insert("type_expr", Data::String(self.type_expr.clone()));
        d.insert("delay_ms", Data::Number(self.delay_ms as f64));
        d.insert("delay_expr", Data::String(self.delay_expr.clone()));
        d.insert("name_list", Data::String(vec_to_string(&self.name_list)));
        d.insert(
            "params",
            match &self.params {
                Some(s) => Data::String(vec_to_string(s)),
                None => Data::None,
            },
        );
        d.insert(
            "content",
            match &self.content {
                Some(s) => Data::String(format!("{:?}", s)),
                None => Data::None,
            },
        );
        d
    }
}

#[derive(Debug, Default)]
pub struct Expression {
    pub content: String,
}

impl Expression {
    pub fn new() -> Expression {
        Expression::default()
    }
}

impl ExecutableContent for Expression {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        datamodel.execute(&self.content).is_ok()
    }

    fn get_type(&self) -> u8 {
        TYPE_EXPRESSION
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("content", Data::String(self.content.clone()));
        d
    }
}

#[derive(Debug, Default)]
pub struct Log {
    pub label: String,
    pub expression: String,
}

impl Log {
    pub fn new(label: &Option<&String>, expression: &str) -> Log {
        Log {
            label: label.map(|s| s.to_string()).unwrap_or_default(),
            expression: expression.to_string(),
        }
    }
}

impl ExecutableContent for Log {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        match datamodel.execute(&self.expression) {
            Ok(msg) => {
                if self.label.is_empty() {
                    datamodel.log(&msg);
                } else {
                    datamodel.log(&format!("{}: {}", self.label, msg));
                }
                true
            }
            Err(_msg) => false,
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_LOG
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("label", Data::String(self.label.clone()));
        d.insert("expression", Data::String(self.expression.clone()));
        d
    }
}

#[derive(Debug, Default)]
pub struct If {
    pub condition: String,
    pub content: ExecutableContentId,
    pub else_content: ExecutableContentId,
}

impl If {
    pub fn new(condition: &str) -> If {
        If {
            condition: condition.to_string(),
            content: 0,
            else_content: 0,
        }
    }
}

impl ExecutableContent for If {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let r = datamodel.execute_condition(&self.condition).unwrap_or_else(|e| {
            warn!("Condition {} can't be evaluated. {}", self.condition, e);
            false
        });
        if r {
            fsm.executableContent.execute(self.content, datamodel, fsm)
        } else {
            fsm.executableContent.execute(self.else_content, datamodel, fsm)
        }
    }

    fn get_type(&self) -> u8 {
        TYPE_IF
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("condition", Data::String(self.condition.clone()));
        d.insert("then", Data::Number(self.content as f64));
        d.insert("else", Data::Number(self.else_content as f64));
        d
    }
}

pub const INDEX_TEMP: &str = "__$index";

#[derive(Debug, Default)]
pub struct ForEach {
    pub array: String,
    pub item: String,
    pub index: String,
    pub content: ExecutableContentId,
}

impl ForEach {
    pub fn new() -> ForEach {
        ForEach::default()
    }
}

impl ExecutableContent for ForEach {
    fn execute(&self, datamodel: &mut dyn Datamodel, fsm: &Fsm) -> bool {
        let idx = if self.index.is_empty() {
            INDEX_TEMP.to_string()
        } else {
            self.index.clone()
        };
        datamodel.execute_for_each(&self.array, &self.item, &idx, &mut |datamodel| -> bool {
            fsm.executableContent.execute(self.content, datamodel, fsm)
        })
    }

    fn get_type(&self) -> u8 {
        TYPE_FOREACH
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("array", Data::String(self.array.clone()));
        d.insert("item", Data::String(self.item.clone()));
        d.insert("index", Data::String(self.index.clone()));
        d
    }
}

#[derive(Debug, Default)]
pub struct Assign {
    pub location: String,
    pub expr: String,
}

impl Assign {
    pub fn new() -> Assign {
        Assign::default()
    }
}

impl ExecutableContent for Assign {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        datamodel.assign(&self.location, &self.expr)
    }

    fn get_type(&self) -> u8 {
        TYPE_ASSIGN
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("location", Data::String(self.location.clone()));
        d.insert("expr", Data::String(self.expr.clone()));
        d
    }
}

/// *W3C says*:
/// The \<raise\> element raises an event in the current SCXML session. Note that the
/// event will not be processed until the current block of executable content has
/// completed and all events that are already in the internal event queue have been
/// processed. For example, suppose the \<raise\> element occurs first in the \<onentry\>
/// handler of state S followed by executable content elements ec1 and ec2. If event e1 is
/// already in the internal event queue when S is entered, the event generated by
/// \<raise\> will not be processed until ec1 and ec2 have finished execution and e1 has
/// been processed.
#[derive(Debug, Default)]
pub struct Raise {
    pub event: String,
}

impl Raise {
    pub fn new() -> Raise {
        Raise::default()
    }
}

impl ExecutableContent for Raise {
    fn execute(&self, datamodel: &mut dyn Datamodel, _fsm: &Fsm) -> bool {
        let event = Event {
            name: self.event.clone(),
            etype: EventType::internal,
            sendid: None,
            origin: None,
            origin_type: None,
            invoke_id: None,
            param_values: None,
            content: None,
        };
        get_global!(datamodel).enqueue_internal(event);
        true
    }

    fn get_type(&self) -> u8 {
        TYPE_RAISE
    }

    fn get_trace(&self) -> HashMap<&str, Data> {
        let mut d = HashMap::new();
        d.insert("event", Data::String(self.event.clone()));
        d
    }
}

/// Parses a duration literal as used by \<send delay="..."\> (e.g. "1s", "0.5d", "200ms").
/// Returns the duration in milliseconds, or `-1` if `d` is not a valid duration literal.
pub fn parse_duration_to_milliseconds(d: &str) -> i64 {
    lazy_static::lazy_static! {
        static ref DURATION_RE: regex::Regex =
            regex::Regex::new(r"(?i)^(\d*(?:\.\d+)?)(ms|s|m|h|d)$").unwrap();
    }
    if d.is_empty() {
        return 0;
    }
    match DURATION_RE.captures(d) {
        None => -1,
        Some(caps) => {
            let mut v: f64 = match caps[1].parse() {
                Ok(v) => v,
                Err(_) => return -1,
            };
            match caps[2].to_ascii_lowercase().as_str() {
                "d" => v *= 24.0 * 60.0 * 60.0 * 1000.0,
                "h" => v *= 60.0 * 60.0 * 1000.0,
                "m" => v *= 60000.0,
                "s" => v *= 1000.0,
                "ms" => {}
                _ => return -1,
            }
            v.round() as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::executable_content::parse_duration_to_milliseconds;

    #[test]
    fn delay_parse() {
        assert_eq!(parse_duration_to_milliseconds("6.7s"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5d"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1m"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001s"), 1);
        assert_eq!(parse_duration_to_milliseconds("6.7S"), 6700);
        assert_eq!(parse_duration_to_milliseconds("0.5D"), 12 * 60 * 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("1M"), 60 * 1000);
        assert_eq!(parse_duration_to_milliseconds("0.001S"), 1);

        assert_eq!(parse_duration_to_milliseconds("x1S"), -1);
        assert_eq!(parse_duration_to_milliseconds("1Sx"), -1);
        assert_eq!(parse_duration_to_milliseconds(""), 0);
    }
}
