//! Executable content attached to states and transitions.
//!
//! Actions run during microsteps: a state's `on_entry` list when it is
//! entered, `on_exit` when it is exited, and a transition's content between
//! the two. The set of action kinds is closed; hosts extend behavior through
//! [`Action::Script`] closures and the external service seam rather than new
//! variants.

use crate::chart::StateChart;
use crate::error::EvalError;
use crate::expr::{Expr, Location};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A named expression, used for message payloads and invoke input.
#[derive(Debug, Clone)]
pub struct Param {
    pub name: String,
    pub expr: Expr,
}

impl Param {
    pub fn new(name: impl Into<String>, expr: Expr) -> Self {
        Self {
            name: name.into(),
            expr,
        }
    }

    /// Evaluates a parameter list into a JSON object.
    pub fn evaluate_all(params: &[Param], data: &Value) -> Result<Value, EvalError> {
        let mut map = serde_json::Map::new();
        for param in params {
            map.insert(param.name.clone(), param.expr.evaluate(data)?);
        }
        Ok(Value::Object(map))
    }
}

/// One conditional branch of an [`Action::If`].
#[derive(Debug, Clone)]
pub struct IfBranch {
    pub cond: Expr,
    pub content: Vec<Action>,
}

/// An outbound message to an external target or the instance's own queue.
#[derive(Debug, Clone)]
pub struct SendAction {
    /// Message name.
    pub event: String,
    /// Activity type to deliver through. None sends to the instance's own
    /// external queue.
    pub target: Option<String>,
    /// Named payload fields, evaluated at send time.
    pub params: Vec<Param>,
    /// Whole-payload expression. Wins over `params` when present.
    pub content: Option<Expr>,
    /// Delay before delivery. Delayed sends are cancellable by id.
    pub delay: Option<Duration>,
    /// Send id for cancellation. Generated when absent and needed.
    pub id: Option<String>,
}

/// A request/response call to an external service, awaited in place.
#[derive(Debug, Clone)]
pub struct QueryAction {
    /// Activity type resolved through the service registry.
    pub service: String,
    pub params: Vec<Param>,
    /// Where the response value is written.
    pub location: Option<Location>,
    pub id: Option<String>,
}

/// The definition a child machine is started from.
#[derive(Debug, Clone)]
pub enum InvokeSource {
    /// Look the chart up by name in the host's chart registry.
    Registry(String),
    /// A chart compiled from an inline document.
    Inline(Arc<StateChart>),
}

impl InvokeSource {
    pub fn describe(&self) -> &str {
        match self {
            InvokeSource::Registry(name) => name,
            InvokeSource::Inline(chart) => chart.name(),
        }
    }
}

/// Starts a child statechart without blocking the parent.
#[derive(Debug, Clone)]
pub struct InvokeAction {
    /// Stable invoke id, unique within the chart. Assigned at compile time
    /// when the document does not set one.
    pub id: String,
    pub source: InvokeSource,
    /// Input data passed to the child's data model.
    pub input: Vec<Param>,
    /// Where the child's done-data is written on completion.
    pub location: Option<Location>,
    /// Content executed after the child completes, before `done.invoke`.
    pub finalize: Vec<Action>,
    /// Forward external messages received by the parent to the child.
    pub autoforward: bool,
}

/// A host-supplied closure over the data object.
pub type ScriptFn = Arc<dyn Fn(&mut Value) -> Result<(), EvalError> + Send + Sync>;

/// A named native action for programmatic models.
#[derive(Clone)]
pub struct ScriptAction {
    pub name: String,
    pub run: ScriptFn,
}

impl fmt::Debug for ScriptAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScriptAction")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A single unit of executable content.
#[derive(Debug, Clone)]
pub enum Action {
    /// Evaluate an expression and write it to a data location.
    Assign { location: Location, expr: Expr },
    /// Enqueue an internal message.
    Raise { event: String },
    /// Emit a diagnostic through the tracing layer and observers.
    Log {
        label: Option<String>,
        expr: Option<Expr>,
    },
    /// First branch whose condition is truthy runs; else content when none.
    If {
        branches: Vec<IfBranch>,
        else_content: Vec<Action>,
    },
    /// Run content once per element of an array-valued expression.
    Foreach {
        source: Expr,
        item: String,
        index: Option<String>,
        content: Vec<Action>,
    },
    /// Send a message outward.
    Send(SendAction),
    /// Cancel a pending delayed send by id.
    Cancel { send_id: String },
    /// Call an external service and wait for its response.
    Query(QueryAction),
    /// Start a child statechart.
    Invoke(InvokeAction),
    /// Run a host-registered closure against the data object.
    Script(ScriptAction),
}

impl Action {
    /// The element name used in logs and trace events.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::Assign { .. } => "assign",
            Action::Raise { .. } => "raise",
            Action::Log { .. } => "log",
            Action::If { .. } => "if",
            Action::Foreach { .. } => "foreach",
            Action::Send(_) => "send",
            Action::Cancel { .. } => "cancel",
            Action::Query(_) => "query",
            Action::Invoke(_) => "invoke",
            Action::Script(_) => "script",
        }
    }

    /// Walks this action and its nested content depth-first.
    pub fn visit<'a>(&'a self, f: &mut impl FnMut(&'a Action)) {
        f(self);
        match self {
            Action::If {
                branches,
                else_content,
            } => {
                for branch in branches {
                    for action in &branch.content {
                        action.visit(f);
                    }
                }
                for action in else_content {
                    action.visit(f);
                }
            }
            Action::Foreach { content, .. } => {
                for action in content {
                    action.visit(f);
                }
            }
            Action::Invoke(invoke) => {
                for action in &invoke.finalize {
                    action.visit(f);
                }
            }
            _ => {}
        }
    }
}
