//! # rscharts
//!
//! Hierarchical statecharts with run-to-completion semantics: compound and
//! parallel states, history, delayed transitions, invoked child charts and
//! durable snapshots.
//!
//! Charts are defined as JSON documents (or built programmatically with
//! [`Natives`] for guard and script closures), compiled once into an
//! immutable [`StateChart`] and executed by an [`Interpreter`] per instance.
//!
//! ```
//! use rscharts::{ChartDocument, Interpreter, Message, Status};
//! use serde_json::Value;
//! use std::sync::Arc;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let chart = Arc::new(
//!     ChartDocument::from_json(
//!         r#"{
//!             "name": "door",
//!             "states": [
//!                 {"type": "state", "id": "closed", "transitions": [
//!                     {"event": ["open"], "target": ["opened"]}
//!                 ]},
//!                 {"type": "state", "id": "opened"}
//!             ]
//!         }"#,
//!     )?
//!     .compile()?,
//! );
//!
//! let mut door = Interpreter::new(chart);
//! door.start().await?;
//! assert_eq!(door.configuration(), vec!["closed"]);
//!
//! let status = door.dispatch(Message::external("open", Value::Null)).await?;
//! assert_eq!(status, Status::WaitingForEvent);
//! assert_eq!(door.configuration(), vec!["opened"]);
//! # Ok(())
//! # }
//! ```

pub use rscharts_core::{
    ChartRegistry, CollectingTracer, Configuration, CoreError, EventQueue, EventScheduler,
    ExecutionSnapshot, ExternalService, InMemoryEventQueue, Interpreter, InterpreterConfig,
    Message, MessageKind, NoopTracer, ServiceError, ServiceRegistry, Status, TokioScheduler,
    TraceEvent, TraceFilter, TraceInstruction, Tracer,
};
pub use rscharts_model::{
    ChartDocument, EvalError, Expr, HistoryKind, Location, ModelError, Natives, StateChart,
    TransitionKind,
};

/// The crates behind the facade, for hosts that need the finer surface.
pub mod model {
    pub use rscharts_model::*;
}

/// Interpreter internals: engine functions, queues, execution context.
pub mod core {
    pub use rscharts_core::*;
}
