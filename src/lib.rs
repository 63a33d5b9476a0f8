//! A W3C SCXML (Harel statechart) execution runtime.\
//! \
//! The crate is organized leaf-first: [`fsm`] holds the chart IR and the
//! microstep/macrostep interpreter, [`scheduler`] the delayed-send timer,
//! [`datamodel`] the expression-evaluator contract (ECMAScript and Null
//! implementations), [`event_io_processor`] the event target registry, and
//! [`fsm_executor`] the session registry and invoke manager that ties a
//! process full of sessions together.\
//! See /doc/W3C_SCXML_2024_07_13/index.html

extern crate core;

pub mod common;
pub mod datamodel;
pub mod event_io_processor;
pub mod executable_content;
pub mod fsm;
pub mod fsm_executor;
pub mod scheduler;
#[cfg(feature = "xml")]
pub mod scxml_reader;
#[cfg(feature = "Trace")]
pub mod tracer;

#[cfg(test)]
mod tests;
