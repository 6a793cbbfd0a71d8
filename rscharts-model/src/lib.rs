//! # rscharts-model
//!
//! Statechart model metadata for rscharts.
//!
//! This crate provides:
//! - The serde document form of a chart and its compilation
//! - The compiled state/transition arena in document order
//! - Executable content (assign, raise, send, invoke, ...)
//! - The built-in expression language and native extension points
//! - Eager structural validation and definition checksums

pub mod action;
pub mod chart;
pub mod document;
pub mod error;
pub mod expr;
pub mod state;
pub mod transition;

pub use action::{
    Action, IfBranch, InvokeAction, InvokeSource, Param, QueryAction, ScriptAction, ScriptFn,
    SendAction,
};
pub use chart::{Natives, StateChart};
pub use document::{ActionDocument, ChartDocument, StateDocument, TransitionDocument};
pub use error::{EvalError, ModelError};
pub use expr::{Expr, Location};
pub use state::{HistoryKind, State, StateId, StateKind, TransitionId};
pub use transition::{EventDescriptor, Transition, TransitionKind};
