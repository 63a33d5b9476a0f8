//! The "null" data model (W3C C.1): the minimal data model every conformant SCXML
//! processor must support. It has no expression language: `cond`/`expr` attributes
//! are restricted to the `In(stateid)` predicate, and `<assign>`/`<script>` are
//! rejected with `error.execution`.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;

use crate::datamodel::{Data, DataStore, Datamodel, GlobalDataArc, IO_PROCESSORS_VARIABLE_NAME};
use crate::event_io_processor::EventIOProcessor;
use crate::fsm::{Event, ExecutableContentId, Fsm, GlobalData, StateId};

lazy_static! {
    static ref IN_RE: Regex = Regex::new(r"^\s*In\(\s*'?([^')]+)'?\s*\)\s*$").unwrap();
}

pub struct NullDatamodel {
    global: GlobalDataArc,
    io_processors: HashMap<String, Box<dyn EventIOProcessor>>,
    data: DataStore,
    state_name_to_id: HashMap<String, StateId>,
}

impl NullDatamodel {
    pub fn new() -> NullDatamodel {
        NullDatamodel {
            global: GlobalDataArc::from(GlobalData::new_detached()),
            io_processors: HashMap::new(),
            data: DataStore::new(),
            state_name_to_id: HashMap::new(),
        }
    }
}

impl Default for NullDatamodel {
    fn default() -> Self {
        NullDatamodel::new()
    }
}

impl Datamodel for NullDatamodel {
    fn global(&mut self) -> &mut GlobalDataArc {
        &mut self.global
    }

    fn global_s(&self) -> &GlobalDataArc {
        &self.global
    }

    fn get_name(&self) -> &str {
        crate::datamodel::NULL_DATAMODEL
    }

    fn implement_mandatory_functionality(&mut self, fsm: &mut Fsm) {
        self.state_name_to_id = fsm.statesNames.clone();

        let session_id = self.global.lock().unwrap().session_id;
        let entries: Vec<(String, Data)> = self
            .io_processors
            .iter()
            .map(|(type_name, processor)| {
                (
                    type_name.clone(),
                    Data::Map(vec![(
                        "location".to_string(),
                        Data::String(processor.get_location(session_id)),
                    )]),
                )
            })
            .collect();
        self.data.set(IO_PROCESSORS_VARIABLE_NAME, Data::Map(entries));
    }

    #[allow(non_snake_case)]
    fn initializeDataModel(&mut self, fsm: &mut Fsm, state: StateId) {
        if let Some(s) = fsm.get_state_by_id(state) {
            for (name, expr) in s.data.clone() {
                match expr {
                    None => self.data.set(&name, Data::None),
                    Some(_) => {
                        // The null data model has no expression language; treat any
                        // non-empty initializer as an execution error per W3C C.1.
                        self.internal_error_execution();
                        self.data.set(&name, Data::None);
                    }
                }
            }
        }
    }

    fn initialize_read_only(&mut self, name: &str, value: &str) {
        self.data.set(name, Data::new(value));
    }

    fn set(&mut self, name: &str, data: Data) {
        self.data.set(name, data);
    }

    fn set_event(&mut self, event: &Event) {
        self.data.set(
            crate::datamodel::EVENT_VARIABLE_NAME,
            Data::String(event.name.clone()),
        );
    }

    fn assign(&mut self, _left_expr: &str, _right_expr: &str) -> bool {
        self.internal_error_execution();
        false
    }

    fn get_by_location(&mut self, location: &str) -> Result<Data, String> {
        self.data
            .get(location)
            .cloned()
            .ok_or_else(|| format!("unknown location '{}'", location))
    }

    fn get_io_processors(&mut self) -> &mut HashMap<String, Box<dyn EventIOProcessor>> {
        &mut self.io_processors
    }

    fn get_mut(&mut self, name: &str) -> Option<&mut Data> {
        self.data.get_mut(name)
    }

    fn clear(&mut self) {
        self.data = DataStore::new();
    }

    fn log(&mut self, msg: &str) {
        log::info!("{}", msg);
    }

    fn execute(&mut self, _script: &str) -> Result<String, String> {
        Err("the null data model does not support <script>".to_string())
    }

    fn execute_for_each(
        &mut self,
        _array_expression: &str,
        _item: &str,
        _index: &str,
        _execute_body: &mut dyn FnMut(&mut dyn Datamodel) -> bool,
    ) -> bool {
        self.internal_error_execution();
        false
    }

    /// #W3C says: all data models must support the `In()` predicate.
    fn execute_condition(&mut self, script: &str) -> Result<bool, String> {
        match IN_RE.captures(script) {
            Some(caps) => {
                let state_name = caps.get(1).unwrap().as_str();
                match self.state_name_to_id.get(state_name) {
                    Some(state_id) => Ok(self
                        .global
                        .lock()
                        .unwrap()
                        .configuration
                        .contains(state_id)),
                    None => Err(format!("unknown state '{}'", state_name)),
                }
            }
            None => Err(format!("unsupported expression '{}' for null data model", script)),
        }
    }

    #[allow(non_snake_case)]
    fn executeContent(&mut self, fsm: &Fsm, content_id: ExecutableContentId) -> bool {
        fsm.executableContent.execute(content_id, self, fsm)
    }
}
