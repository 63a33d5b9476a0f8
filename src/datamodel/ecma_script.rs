//! The ECMAScript data model (W3C SCXML 1.0 Appendix C, `datamodel="ecmascript"`),
//! backed by `boa_engine`. Enabled by feature "ECMAScriptModel".
//!
//! `Data` values crossing the trait boundary are converted to/from `boa_engine::JsValue`
//! here; nothing outside this file ever touches a `JsValue`.

use std::collections::HashMap;

use boa_engine::object::FunctionBuilder;
use boa_engine::{Context, JsResult, JsValue, property::Attribute};
use log::error;

use crate::datamodel::{
    Data, DataStore, Datamodel, GlobalDataArc, EVENT_VARIABLE_FIELD_DATA,
    EVENT_VARIABLE_FIELD_INVOKE_ID, EVENT_VARIABLE_FIELD_NAME, EVENT_VARIABLE_FIELD_ORIGIN,
    EVENT_VARIABLE_FIELD_ORIGIN_TYPE, EVENT_VARIABLE_FIELD_SEND_ID, EVENT_VARIABLE_FIELD_TYPE,
    EVENT_VARIABLE_NAME, IO_PROCESSORS_VARIABLE_NAME, SESSION_ID_VARIABLE_NAME,
    SESSION_NAME_VARIABLE_NAME,
};
use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{Event, EventType, ExecutableContentId, Fsm, StateId};

pub const ECMA_SCRIPT: &str = "ECMAScript";
pub const ECMA_SCRIPT_LC: &str = "ecmascript";

fn js_to_data(value: &JsValue, ctx: &mut Context) -> Data {
    match value {
        JsValue::Undefined | JsValue::Null => Data::None,
        JsValue::Boolean(b) => Data::Boolean(*b),
        JsValue::Rational(n) => Data::Number(*n),
        JsValue::Integer(n) => Data::Number(*n as f64),
        other => match other.to_string(ctx) {
            Ok(s) => Data::String(s.to_string()),
            Err(_) => Data::None,
        },
    }
}

fn data_to_js(value: &Data, ctx: &mut Context) -> JsValue {
    match value {
        Data::None => JsValue::null(),
        Data::String(s) => JsValue::from(s.as_str()),
        Data::Number(n) => JsValue::from(*n),
        Data::Boolean(b) => JsValue::from(*b),
        Data::Array(items) => {
            let array = boa_engine::object::JsArray::new(ctx);
            for item in items {
                let jv = data_to_js(item, ctx);
                let _ = array.push(jv, ctx);
            }
            JsValue::from(array)
        }
        Data::Map(entries) => {
            let mut init = boa_engine::object::ObjectInitializer::new(ctx);
            for (k, v) in entries {
                let jv = data_to_js(v, ctx);
                init.property(k.as_str(), jv, Attribute::all());
            }
            JsValue::from(init.build())
        }
    }
}

fn log_js(_this: &JsValue, args: &[JsValue], ctx: &mut Context) -> JsResult<JsValue> {
    let mut out = String::new();
    for arg in args {
        out.push_str(arg.to_string(ctx)?.to_string().as_str());
    }
    log::info!("{}", out);
    Ok(JsValue::undefined())
}

/// *W3C says* (B.2): the ECMAScript data model.
pub struct ECMAScriptDatamodel {
    global: GlobalDataArc,
    io_processors: HashMap<String, Box<dyn EventIOProcessor>>,
    /// Mirror of the values currently bound in `context`, used so `get_mut`/`get_by_location`
    /// don't need to round-trip through the JS engine for simple reads.
    data: DataStore,
    state_name_to_id: HashMap<String, StateId>,
    context: Context,
}

impl ECMAScriptDatamodel {
    pub fn new() -> ECMAScriptDatamodel {
        ECMAScriptDatamodel {
            global: GlobalDataArc::default(),
            io_processors: HashMap::new(),
            data: DataStore::new(),
            state_name_to_id: HashMap::new(),
            context: Context::default(),
        }
    }

    fn bind(&mut self, name: &str, data: &Data) {
        let js = data_to_js(data, &mut self.context);
        self.context
            .register_global_property(name, js, Attribute::all());
    }

    fn eval_to_string(&mut self, script: &str) -> Result<String, String> {
        match self.context.eval(script) {
            Ok(res) => match res.to_string(&mut self.context) {
                Ok(s) => Ok(s.to_string()),
                Err(e) => Err(e.to_string()),
            },
            Err(e) => Err(e.to_string()),
        }
    }

    fn eval_to_data(&mut self, script: &str) -> Result<Data, String> {
        match self.context.eval(script) {
            Ok(res) => Ok(js_to_data(&res, &mut self.context)),
            Err(e) => Err(e.to_string()),
        }
    }
}

impl Default for ECMAScriptDatamodel {
    fn default() -> Self {
        ECMAScriptDatamodel::new()
    }
}

impl Datamodel for ECMAScriptDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        ECMA_SCRIPT
    }

    /// *W3C says*: all data models must support the `In()` predicate; in addition, binds
    /// `log`, `_sessionid`, `_name` and `_ioprocessors` (W3C 5.10).
    fn implement_mandatory_functionality(&mut self, fsm: &mut Fsm) {
        self.state_name_to_id = fsm.statesNames.clone();

        self.context
            .register_global_builtin_function("log", 1, log_js);

        let known_states: Vec<String> = self.state_name_to_id.keys().cloned().collect();
        FunctionBuilder::closure_with_captures(
            &mut self.context,
            move |_this: &JsValue, args: &[JsValue], names: &mut Vec<String>, ctx: &mut Context| {
                if let Some(arg) = args.first() {
                    let name = arg.to_string(ctx)?.to_string();
                    Ok(JsValue::from(names.contains(&name)))
                } else {
                    Err(JsValue::from("In() requires a state id argument"))
                }
            },
            known_states,
        )
        .name("In")
        .length(1)
        .build();

        let session_id = self.global.lock().unwrap().session_id;
        self.initialize_read_only(SESSION_ID_VARIABLE_NAME, &session_id.to_string());
        self.initialize_read_only(SESSION_NAME_VARIABLE_NAME, &fsm.name);

        let mut locations = Vec::new();
        for (type_name, processor) in &self.io_processors {
            locations.push((type_name.clone(), processor.get_location(session_id)));
        }
        let entries: Vec<(String, Data)> = locations
            .into_iter()
            .map(|(t, loc)| {
                (
                    t,
                    Data::Map(vec![("location".to_string(), Data::String(loc))]),
                )
            })
            .collect();
        self.set(IO_PROCESSORS_VARIABLE_NAME, Data::Map(entries));
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &mut Fsm, state: StateId) {
        if let Some(s) = fsm.get_state_by_id(state) {
            for (name, expr) in s.data.clone() {
                let value = match expr {
                    None => Data::None,
                    Some(ref script) if script.is_empty() => Data::None,
                    Some(script) => match self.eval_to_data(&script) {
                        Ok(v) => v,
                        Err(msg) => {
                            error!("data init '{}' for '{}' failed: {}", script, name, msg);
                            self.internal_error_execution();
                            Data::None
                        }
                    },
                };
                self.set(&name, value);
            }
        }
    }

    fn initialize_read_only(&mut self, name: &str, value: &str) {
        self.set(name, Data::String(value.to_string()));
    }

    fn set(&mut self, name: &str, data: Data) {
        self.bind(name, &data);
        self.data.set(name, data);
    }

    fn set_event(&mut self, event: &Event) {
        let entries = vec![
            (
                EVENT_VARIABLE_FIELD_NAME.to_string(),
                Data::String(event.name.clone()),
            ),
            (
                EVENT_VARIABLE_FIELD_TYPE.to_string(),
                Data::String(
                    match event.etype {
                        EventType::platform => "platform",
                        EventType::internal => "internal",
                        EventType::external => "external",
                    }
                    .to_string(),
                ),
            ),
            (
                EVENT_VARIABLE_FIELD_SEND_ID.to_string(),
                event.sendid.clone().map(Data::String).unwrap_or(Data::None),
            ),
            (
                EVENT_VARIABLE_FIELD_ORIGIN.to_string(),
                event.origin.clone().map(Data::String).unwrap_or(Data::None),
            ),
            (
                EVENT_VARIABLE_FIELD_ORIGIN_TYPE.to_string(),
                event
                    .origin_type
                    .clone()
                    .map(Data::String)
                    .unwrap_or(Data::None),
            ),
            (
                EVENT_VARIABLE_FIELD_INVOKE_ID.to_string(),
                event
                    .invoke_id
                    .clone()
                    .map(Data::String)
                    .unwrap_or(Data::None),
            ),
            (
                EVENT_VARIABLE_FIELD_DATA.to_string(),
                event.content.clone().unwrap_or(Data::None),
            ),
        ];
        self.set(EVENT_VARIABLE_NAME, Data::Map(entries));
    }

    fn assign(&mut self, left_expr: &str, right_expr: &str) -> bool {
        let assignment = format!("{} = ({});", left_expr, right_expr);
        match self.context.eval(assignment.as_str()) {
            Ok(_) => {
                if let Ok(value) = self.eval_to_data(left_expr) {
                    self.data.set(left_expr, value);
                }
                true
            }
            Err(e) => {
                error!("assign '{}' = '{}' failed: {}", left_expr, right_expr, e);
                self.internal_error_execution();
                false
            }
        }
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        self.eval_to_data(location)
    }

    fn get_io_processors(&mut self) -> &mut HashMap<String, Box<dyn EventIOProcessor>> {
        &mut self.io_processors
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Data> {
        self.data.get_mut(name)
    }

    fn clear(&mut self) {
        self.data = DataStore::new();
        self.context = Context::default();
    }

    fn log(&mut self, msg: &str) {
        log::info!("{}", msg);
    }

    fn execute(&mut self, script: &str) -> Result<String, String> {
        self.eval_to_string(script)
    }

    fn execute_for_each(
        &mut self,
        array_expression: &str,
        item: &str,
        index: &str,
        execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        let array = match self.eval_to_data(array_expression) {
            Ok(Data::Array(items)) => items,
            Ok(_other) => {
                self.internal_error_execution();
                return false;
            }
            Err(msg) => {
                error!("foreach array '{}' invalid: {}", array_expression, msg);
                self.internal_error_execution();
                return false;
            }
        };

        for (i, item_value) in array.into_iter().enumerate() {
            self.set(item, item_value);
            self.set(index, Data::Number(i as f64));
            if !execute_body(self) {
                return false;
            }
        }
        true
    }

    /// *W3C says*: all data models must support the `In()` predicate; the ECMAScript model
    /// additionally evaluates the full boolean expression language.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        match self.context.eval(script) {
            Ok(res) => Ok(res.to_boolean()),
            Err(e) => Err(e.to_string()),
        }
    }

    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool {
        fsm.executableContent.execute(content_id, self, fsm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_simple_expression() {
        let mut dm = ECMAScriptDatamodel::new();
        let r = dm.execute("1 + 2");
        assert_eq!(r.unwrap(), "3");
    }

    #[test]
    fn set_and_read_back() {
        let mut dm = ECMAScriptDatamodel::new();
        dm.set("x", Data::Number(41.0));
        let r = dm.execute("x + 1");
        assert_eq!(r.unwrap(), "42");
    }

    #[test]
    fn assign_updates_binding() {
        let mut dm = ECMAScriptDatamodel::new();
        dm.set("x", Data::Number(1.0));
        assert!(dm.assign("x", "41"));
        assert_eq!(dm.execute("x").unwrap(), "42");
    }

    #[test]
    fn condition_evaluates_to_bool() {
        let mut dm = ECMAScriptDatamodel::new();
        dm.set("x", Data::Number(3.0));
        assert_eq!(dm.execute_condition("x > 1").unwrap(), true);
        assert_eq!(dm.execute_condition("x > 10").unwrap(), false);
    }
}
