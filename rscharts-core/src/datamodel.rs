//! Per-instance execution state.
//!
//! Everything that survives a suspend/resume cycle lives here: the data
//! object, the configuration, the internal queue, history records, running
//! invocations and pending timers. The snapshot module converts this to and
//! from its serialized form.

use crate::configuration::Configuration;
use crate::event::Message;
use chrono::{DateTime, Utc};
use rscharts_model::{EvalError, Expr, Location, StateChart, StateId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of an interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    /// Inside a macrostep.
    Running,
    /// Stable, waiting for an external message.
    WaitingForEvent,
    /// A top-level final state was reached.
    Completed,
    /// Cancelled by a `cancel` message.
    Cancelled,
    /// A structural error aborted the instance.
    Failed,
}

impl Status {
    pub fn is_terminal(self) -> bool {
        matches!(self, Status::Completed | Status::Cancelled | Status::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::WaitingForEvent => "waiting_for_event",
            Status::Completed => "completed",
            Status::Cancelled => "cancelled",
            Status::Failed => "failed",
        }
    }
}

/// A running child invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRecord {
    pub invoke_id: String,
    /// Name of the state whose entry started the child; its exit cancels.
    pub owner: String,
    pub child_instance_id: String,
    pub started_at: DateTime<Utc>,
}

/// A delayed message that has been scheduled but not yet delivered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingTimer {
    /// Send id or timer event name; cancellation key.
    pub key: String,
    pub message: Message,
    pub deadline: DateTime<Utc>,
    /// Name of the state whose exit cancels this timer, for delayed
    /// transitions. None for delayed sends.
    pub owner: Option<String>,
}

/// Mutable state of one chart instance.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub instance_id: String,
    pub chart_checksum: u32,
    pub status: Status,
    /// The object expressions read and write. `_event` holds the message
    /// currently being processed.
    pub data: Value,
    pub configuration: Configuration,
    /// Strictly FIFO; drained before any external message.
    pub internal_queue: VecDeque<Message>,
    /// History state id to the states it recorded at last exit.
    pub history: HashMap<StateId, Vec<StateId>>,
    pub invocations: HashMap<String, InvocationRecord>,
    pub timers: HashMap<String, PendingTimer>,
    /// Output of the top-level final state, set on completion.
    pub done_data: Option<Value>,
}

impl ExecutionContext {
    pub fn new(chart: &StateChart) -> Self {
        Self {
            instance_id: Uuid::new_v4().to_string(),
            chart_checksum: chart.checksum(),
            status: Status::NotStarted,
            data: Value::Object(Default::default()),
            configuration: Configuration::new(),
            internal_queue: VecDeque::new(),
            history: HashMap::new(),
            invocations: HashMap::new(),
            timers: HashMap::new(),
            done_data: None,
        }
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        self.instance_id = id.into();
        self
    }

    /// Runs the chart's data initializers in document order.
    ///
    /// Later initializers see the fields of earlier ones. A failed
    /// initializer leaves its field null and raises `error.execution`.
    pub fn init_data(&mut self, chart: &StateChart) {
        for (name, expr) in chart.data() {
            match expr.evaluate(&self.data) {
                Ok(value) => {
                    self.data[name.as_str()] = value;
                }
                Err(e) => {
                    self.data[name.as_str()] = Value::Null;
                    self.raise(Message::error_execution(format!(
                        "data initializer '{}' failed: {}",
                        name, e
                    )));
                }
            }
        }
    }

    /// Appends to the internal queue.
    pub fn raise(&mut self, msg: Message) {
        debug!(instance_id = %self.instance_id, event = %msg.name, "raise internal");
        self.internal_queue.push_back(msg);
    }

    pub fn next_internal(&mut self) -> Option<Message> {
        self.internal_queue.pop_front()
    }

    /// Binds a message as the `_event` system variable.
    pub fn set_event(&mut self, msg: &Message) {
        self.data["_event"] = msg.as_event_value();
    }

    pub fn evaluate(&self, expr: &Expr) -> Result<Value, EvalError> {
        expr.evaluate(&self.data)
    }

    pub fn evaluate_bool(&self, expr: &Expr) -> Result<bool, EvalError> {
        expr.evaluate_bool(&self.data)
    }

    pub fn assign(&mut self, location: &Location, value: Value) -> Result<(), EvalError> {
        location.assign(&mut self.data, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rscharts_model::ChartDocument;
    use serde_json::json;

    fn chart_with_data() -> StateChart {
        ChartDocument::from_json(
            r#"{"name": "d", "data": [
                {"id": "base", "value": 10},
                {"id": "double", "value": {"expr": "ctx.base * 2"}}
            ], "states": [{"type": "state", "id": "a"}]}"#,
        )
        .unwrap()
        .compile()
        .unwrap()
    }

    #[test]
    fn test_init_data_sequential() {
        let chart = chart_with_data();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.init_data(&chart);

        assert_eq!(ctx.data["base"], json!(10));
        assert_eq!(ctx.data["double"], json!(20));
    }

    #[test]
    fn test_init_data_failure_raises() {
        // An initializer that evaluates to a non-finite or type-broken
        // result leaves null behind and raises error.execution.
        let chart = ChartDocument::from_json(
            r#"{"name": "d", "data": [
                {"id": "bad", "value": {"expr": "null % 0"}}
            ], "states": [{"type": "state", "id": "a"}]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let mut ctx = ExecutionContext::new(&chart);
        ctx.init_data(&chart);

        assert_eq!(ctx.data["bad"], Value::Null);
        let raised = ctx.next_internal().unwrap();
        assert_eq!(raised.name, "error.execution");
    }

    #[test]
    fn test_event_binding_visible_to_expressions() {
        let chart = chart_with_data();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.set_event(&Message::external("pay", json!({"amount": 42})));

        let expr = Expr::parse("ctx._event.data.amount").unwrap();
        assert_eq!(ctx.evaluate(&expr).unwrap(), json!(42));
    }

    #[test]
    fn test_internal_queue_fifo() {
        let chart = chart_with_data();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.raise(Message::internal("one", Value::Null));
        ctx.raise(Message::internal("two", Value::Null));

        assert_eq!(ctx.next_internal().unwrap().name, "one");
        assert_eq!(ctx.next_internal().unwrap().name, "two");
        assert!(ctx.next_internal().is_none());
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(Status::Completed.is_terminal());
        assert!(Status::Cancelled.is_terminal());
        assert!(Status::Failed.is_terminal());
        assert!(!Status::WaitingForEvent.is_terminal());
        assert!(!Status::Running.is_terminal());
    }
}
