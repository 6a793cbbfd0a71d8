//! Observability hooks.
//!
//! The interpreter reports everything it does through a [`Tracer`]. Tracers
//! run inline on the driver's task: a tracer that parks its future pauses
//! the instance at that point, which is how a debugger implements
//! breakpoints. The [`TraceFilter`] narrows delivery to the instructions a
//! host cares about.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Something the interpreter did.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceEvent {
    EnterChart {
        instance_id: String,
        chart: String,
    },
    ExitChart {
        instance_id: String,
        status: String,
    },
    EnterState {
        state: String,
    },
    ExitState {
        state: String,
    },
    MakeTransition {
        source: String,
        targets: Vec<String>,
        event: Option<String>,
    },
    /// A selected transition lost conflict resolution.
    DropTransition {
        source: String,
        winner: String,
    },
    BeforeAction {
        kind: String,
        state: String,
    },
    AfterAction {
        kind: String,
        state: String,
        ok: bool,
    },
    BeforeInvoke {
        invoke_id: String,
        chart: String,
    },
    AfterInvoke {
        invoke_id: String,
    },
    /// The instance reached stability after a dispatch.
    MacrostepDone {
        configuration: Vec<String>,
        microsteps: usize,
    },
}

impl TraceEvent {
    /// Instruction name used by filters.
    pub fn kind(&self) -> &'static str {
        match self {
            TraceEvent::EnterChart { .. } => "enter_chart",
            TraceEvent::ExitChart { .. } => "exit_chart",
            TraceEvent::EnterState { .. } => "enter_state",
            TraceEvent::ExitState { .. } => "exit_state",
            TraceEvent::MakeTransition { .. } => "make_transition",
            TraceEvent::DropTransition { .. } => "drop_transition",
            TraceEvent::BeforeAction { .. } => "before_action",
            TraceEvent::AfterAction { .. } => "after_action",
            TraceEvent::BeforeInvoke { .. } => "before_invoke",
            TraceEvent::AfterInvoke { .. } => "after_invoke",
            TraceEvent::MacrostepDone { .. } => "macrostep_done",
        }
    }

    /// The element this event is about, for filtering.
    pub fn element(&self) -> Option<&str> {
        match self {
            TraceEvent::EnterChart { chart, .. } => Some(chart),
            TraceEvent::ExitChart { .. } => None,
            TraceEvent::EnterState { state } | TraceEvent::ExitState { state } => Some(state),
            TraceEvent::MakeTransition { source, .. } => Some(source),
            TraceEvent::DropTransition { source, .. } => Some(source),
            TraceEvent::BeforeAction { kind, .. } | TraceEvent::AfterAction { kind, .. } => {
                Some(kind)
            }
            TraceEvent::BeforeInvoke { invoke_id, .. }
            | TraceEvent::AfterInvoke { invoke_id } => Some(invoke_id),
            TraceEvent::MacrostepDone { .. } => None,
        }
    }
}

/// One filter instruction: an event kind and an element name, either of
/// which may be `*`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceInstruction {
    pub event: String,
    pub element: String,
}

impl TraceInstruction {
    pub fn new(event: impl Into<String>, element: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            element: element.into(),
        }
    }

    fn matches(&self, event: &TraceEvent) -> bool {
        if self.event != "*" && self.event != event.kind() {
            return false;
        }
        self.element == "*" || event.element() == Some(self.element.as_str())
    }
}

/// Selects which trace events reach the tracer.
///
/// An empty filter delivers everything; otherwise an event is delivered
/// when any instruction matches it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TraceFilter {
    instructions: Vec<TraceInstruction>,
}

impl TraceFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn with_instruction(mut self, instruction: TraceInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    pub fn matches(&self, event: &TraceEvent) -> bool {
        self.instructions.is_empty() || self.instructions.iter().any(|i| i.matches(event))
    }
}

#[async_trait]
pub trait Tracer: Send + Sync {
    async fn trace(&self, event: TraceEvent);
}

/// Discards every event.
#[derive(Debug, Default)]
pub struct NoopTracer;

#[async_trait]
impl Tracer for NoopTracer {
    async fn trace(&self, _event: TraceEvent) {}
}

/// Buffers events in memory, for tests and ad hoc debugging.
#[derive(Debug, Default)]
pub struct CollectingTracer {
    events: Mutex<Vec<TraceEvent>>,
}

impl CollectingTracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes everything collected so far.
    pub fn take(&self) -> Vec<TraceEvent> {
        std::mem::take(&mut self.events.lock())
    }

    /// Kinds of the collected events, in order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.events.lock().iter().map(|e| e.kind()).collect()
    }
}

#[async_trait]
impl Tracer for CollectingTracer {
    async fn trace(&self, event: TraceEvent) {
        self.events.lock().push(event);
    }
}
