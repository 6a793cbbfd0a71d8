//! Transitions and event descriptors.

use crate::action::Action;
use crate::error::ModelError;
use crate::expr::Expr;
use crate::state::{StateId, TransitionId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Whether taking a transition exits its source state.
///
/// An internal transition whose targets are all descendants of its compound
/// source leaves the source active; every other transition exits up to the
/// transition domain and re-enters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Internal,
    #[default]
    External,
}

/// An event name pattern.
///
/// Descriptors match on dot-separated token prefixes: `error` matches
/// `error` and `error.execution` but not `errored`. `*` matches every
/// event, and a trailing `.*` is tolerated (`done.invoke.*` behaves like
/// `done.invoke`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDescriptor {
    raw: String,
    tokens: Vec<String>,
    wildcard: bool,
}

impl EventDescriptor {
    pub fn parse(s: &str) -> Result<Self, ModelError> {
        let raw = s.trim().to_string();
        if raw.is_empty() {
            return Err(ModelError::InvalidDefinition {
                reason: "empty event descriptor".to_string(),
            });
        }

        if raw == "*" {
            return Ok(Self {
                raw,
                tokens: Vec::new(),
                wildcard: true,
            });
        }

        let trimmed = raw.strip_suffix(".*").unwrap_or(&raw);
        let tokens: Vec<String> = trimmed.split('.').map(|t| t.to_string()).collect();
        if tokens.iter().any(|t| t.is_empty()) {
            return Err(ModelError::InvalidDefinition {
                reason: format!("malformed event descriptor '{}'", raw),
            });
        }

        Ok(Self {
            raw,
            tokens,
            wildcard: false,
        })
    }

    /// Token-prefix match against a concrete event name.
    pub fn matches(&self, event_name: &str) -> bool {
        if self.wildcard {
            return true;
        }

        let mut event_tokens = event_name.split('.');
        for token in &self.tokens {
            match event_tokens.next() {
                Some(t) if t == token => {}
                _ => return false,
            }
        }
        true
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A compiled transition.
#[derive(Debug, Clone)]
pub struct Transition {
    /// Own arena id, in document order.
    pub id: TransitionId,
    pub source: StateId,
    /// Empty for a targetless transition (content runs, configuration
    /// unchanged).
    pub targets: Vec<StateId>,
    /// Empty means eventless.
    pub events: Vec<EventDescriptor>,
    pub guard: Option<Expr>,
    pub kind: TransitionKind,
    /// Present on delayed transitions. The transition is armed when its
    /// source is entered and fires through a platform timer message.
    pub delay: Option<Duration>,
    /// Timer message name assigned at compile time for delayed transitions.
    pub timer_event: Option<String>,
    pub content: Vec<Action>,
}

impl Transition {
    /// True when this transition fires without an event.
    pub fn is_eventless(&self) -> bool {
        self.events.is_empty() && self.timer_event.is_none()
    }

    /// Whether this transition reacts to the given event name.
    pub fn matches_event(&self, event_name: &str) -> bool {
        if let Some(timer) = &self.timer_event {
            return timer == event_name;
        }
        self.events.iter().any(|d| d.matches(event_name))
    }
}
