//! # rscharts-core
//!
//! Statechart interpreter for rscharts.
//!
//! This crate provides:
//! - Configurations and the microstep engine
//! - The interpreter driver with run-to-completion dispatch
//! - Event queues, delayed delivery and external service seams
//! - Invoked child instances
//! - Durable snapshots
//! - Execution tracing

mod actions;
pub mod configuration;
pub mod datamodel;
pub mod engine;
pub mod error;
pub mod event;
pub mod interpreter;
mod invoke;
pub mod io;
pub mod queue;
pub mod snapshot;
pub mod trace;

pub use configuration::Configuration;
pub use datamodel::{ExecutionContext, InvocationRecord, PendingTimer, Status};
pub use error::{CoreError, ServiceError};
pub use event::{Message, MessageKind};
pub use interpreter::{Interpreter, InterpreterConfig};
pub use io::{ChartRegistry, EventScheduler, ExternalService, ServiceRegistry, TokioScheduler};
pub use queue::{EventQueue, InMemoryEventQueue};
pub use snapshot::ExecutionSnapshot;
pub use trace::{CollectingTracer, NoopTracer, TraceEvent, TraceFilter, TraceInstruction, Tracer};
