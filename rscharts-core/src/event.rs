//! Messages flowing through an interpreter.
//!
//! A message is an event instance: a name, an optional JSON payload and
//! routing metadata. Platform and internal messages go on the instance's
//! internal queue and always drain before external ones within a macrostep.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Cancels the instance when dispatched.
pub const CANCEL: &str = "cancel";
/// Raised when executable content or an expression fails.
pub const ERROR_EXECUTION: &str = "error.execution";
/// Raised when an outbound send or service call fails.
pub const ERROR_COMMUNICATION: &str = "error.communication";

/// Where a message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Raised by the interpreter itself: done.*, error.*, timer expiry.
    Platform,
    /// Raised by executable content of this instance.
    Internal,
    /// Delivered from outside the instance.
    External,
}

/// An event instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub kind: MessageKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
    /// Id of the send that produced this message, when cancellable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub send_id: Option<String>,
    /// Id of the invocation this message relates to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoke_id: Option<String>,
    /// Instance id of the sender, set on child-to-parent traffic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    pub at: DateTime<Utc>,
}

impl Message {
    pub fn new(kind: MessageKind, name: impl Into<String>, payload: Value) -> Self {
        Self {
            kind,
            name: name.into(),
            payload,
            send_id: None,
            invoke_id: None,
            origin: None,
            at: Utc::now(),
        }
    }

    pub fn external(name: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::External, name, payload)
    }

    pub fn internal(name: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Internal, name, payload)
    }

    pub fn platform(name: impl Into<String>, payload: Value) -> Self {
        Self::new(MessageKind::Platform, name, payload)
    }

    /// An external cancellation request.
    pub fn cancel() -> Self {
        Self::external(CANCEL, Value::Null)
    }

    pub fn error_execution(reason: impl Into<String>) -> Self {
        Self::platform(ERROR_EXECUTION, json!({ "reason": reason.into() }))
    }

    pub fn error_communication(reason: impl Into<String>) -> Self {
        Self::platform(ERROR_COMMUNICATION, json!({ "reason": reason.into() }))
    }

    /// Completion of a compound or parallel state.
    pub fn done_state(state_name: &str, done_data: Value) -> Self {
        Self::platform(format!("done.state.{}", state_name), done_data)
    }

    /// Successful completion of an invoked child.
    pub fn done_invoke(invoke_id: &str, done_data: Value) -> Self {
        let mut msg = Self::platform(format!("done.invoke.{}", invoke_id), done_data);
        msg.invoke_id = Some(invoke_id.to_string());
        msg
    }

    /// Failure of an invoked child.
    pub fn done_invoke_error(invoke_id: &str, reason: impl Into<String>) -> Self {
        let mut msg = Self::platform(
            format!("done.invoke.error.{}", invoke_id),
            json!({ "reason": reason.into() }),
        );
        msg.invoke_id = Some(invoke_id.to_string());
        msg
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_send_id(mut self, send_id: impl Into<String>) -> Self {
        self.send_id = Some(send_id.into());
        self
    }

    pub fn is_cancel(&self) -> bool {
        self.name == CANCEL
    }

    /// The `_event` system variable value exposed to expressions.
    pub fn as_event_value(&self) -> Value {
        json!({
            "name": self.name,
            "data": self.payload,
            "origin": self.origin,
            "invoke_id": self.invoke_id,
        })
    }
}
