//! The compiled, immutable chart.
//!
//! A [`StateChart`] is an arena of states and transitions in document
//! pre-order, with an id map and the tree accessors the interpreter needs.
//! Charts are produced by [`ChartDocument::compile`] and never mutated
//! afterwards; interpreters share them behind `Arc`.
//!
//! [`ChartDocument::compile`]: crate::document::ChartDocument::compile

use crate::action::{Action, InvokeAction, ScriptFn};
use crate::error::{EvalError, ModelError};
use crate::expr::Expr;
use crate::state::{State, StateId, StateKind, TransitionId};
use crate::transition::Transition;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Host-registered native expressions and scripts.
///
/// Documents reference natives by name: a condition or value written as
/// `native:<name>` resolves against this registry at compile time, and a
/// `script` action runs the registered closure. This is the seam for
/// programmatic models that need evaluation beyond the built-in language.
#[derive(Default, Clone)]
pub struct Natives {
    exprs: HashMap<String, Expr>,
    scripts: HashMap<String, ScriptFn>,
}

impl Natives {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a native expression under a name.
    pub fn with_expr<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&Value) -> Result<Value, EvalError> + Send + Sync + 'static,
    {
        self.exprs.insert(name.into(), Expr::native(f));
        self
    }

    /// Registers a native script action under a name.
    pub fn with_script<F>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(&mut Value) -> Result<(), EvalError> + Send + Sync + 'static,
    {
        self.scripts.insert(name.into(), Arc::new(f));
        self
    }

    pub(crate) fn expr(&self, name: &str) -> Option<Expr> {
        self.exprs.get(name).cloned()
    }

    pub(crate) fn script(&self, name: &str) -> Option<ScriptFn> {
        self.scripts.get(name).cloned()
    }
}

/// A compiled statechart.
#[derive(Debug, Clone)]
pub struct StateChart {
    pub(crate) name: String,
    pub(crate) version: u32,
    pub(crate) checksum: u32,
    /// States in document pre-order; `StateId` indexes into this.
    pub(crate) states: Vec<State>,
    /// Transitions in document order; `TransitionId` indexes into this.
    pub(crate) transitions: Vec<Transition>,
    /// Document id to arena id. The root is not addressable by name.
    pub(crate) by_name: HashMap<String, StateId>,
    /// Invoke id to its action, for lookup at resume time.
    pub(crate) invokes: HashMap<String, InvokeAction>,
    /// Data model initializers in document order.
    pub(crate) data: Vec<(String, Expr)>,
    pub(crate) root: StateId,
}

impl StateChart {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// crc32c of the canonical document serialization.
    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    pub fn root(&self) -> StateId {
        self.root
    }

    /// Looks a state up by arena id.
    ///
    /// Ids are only ever produced by this chart's accessors, so indexing
    /// cannot miss.
    pub fn state(&self, id: StateId) -> &State {
        &self.states[id.index()]
    }

    pub fn transition(&self, id: TransitionId) -> &Transition {
        &self.transitions[id.index()]
    }

    /// Resolves a document id. The root is not addressable.
    pub fn state_by_name(&self, name: &str) -> Option<StateId> {
        self.by_name.get(name).copied()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.iter()
    }

    pub fn state_count(&self) -> usize {
        self.states.len()
    }

    pub fn transition_count(&self) -> usize {
        self.transitions.len()
    }

    /// Outgoing transitions of a state, in document order.
    pub fn transitions_of(&self, id: StateId) -> impl Iterator<Item = &Transition> {
        self.state(id).transitions.iter().map(|&t| self.transition(t))
    }

    /// Data model initializers in document order.
    pub fn data(&self) -> &[(String, Expr)] {
        &self.data
    }

    /// Looks an invoke action up by its stable id.
    pub fn invoke(&self, id: &str) -> Option<&InvokeAction> {
        self.invokes.get(id)
    }

    pub fn invokes(&self) -> impl Iterator<Item = &InvokeAction> {
        self.invokes.values()
    }

    pub fn parent(&self, id: StateId) -> Option<StateId> {
        self.state(id).parent
    }

    /// Proper ancestors of a state, innermost first, ending at the root.
    pub fn ancestors(&self, id: StateId) -> impl Iterator<Item = StateId> + '_ {
        std::iter::successors(self.state(id).parent, move |&p| self.state(p).parent)
    }

    /// True when `a` is a proper descendant of `b`.
    pub fn is_descendant(&self, a: StateId, b: StateId) -> bool {
        self.ancestors(a).any(|anc| anc == b)
    }

    /// Least common compound ancestor of a set of states.
    ///
    /// The innermost Compound or Root state that is a proper ancestor of
    /// every given state. Parallel states are skipped, as a transition
    /// domain must be able to hold a single-child configuration.
    pub fn lcca(&self, ids: &[StateId]) -> StateId {
        if let Some(&first) = ids.first() {
            for anc in self.ancestors(first) {
                if !self.state(anc).kind.is_compound() {
                    continue;
                }
                if ids.iter().all(|&id| self.is_descendant(id, anc)) {
                    return anc;
                }
            }
        }
        self.root
    }

    /// Structural validation run at the end of compilation.
    pub(crate) fn validate(&self) -> Result<(), ModelError> {
        for state in &self.states {
            match state.kind {
                StateKind::Root | StateKind::Compound => {
                    let initial = state.initial.ok_or_else(|| {
                        ModelError::definition(format!(
                            "compound state '{}' has no initial transition",
                            state.name
                        ))
                    })?;
                    let transition = self.transition(initial);
                    if transition.targets.is_empty() {
                        return Err(ModelError::definition(format!(
                            "initial transition of '{}' has no target",
                            state.name
                        )));
                    }
                    for &target in &transition.targets {
                        if !self.is_descendant(target, state.id) {
                            return Err(ModelError::definition(format!(
                                "initial target '{}' is not a descendant of '{}'",
                                self.state(target).name,
                                state.name
                            )));
                        }
                    }
                }
                StateKind::Parallel => {
                    let regions = state
                        .children
                        .iter()
                        .filter(|&&c| self.state(c).kind != StateKind::History)
                        .count();
                    if regions == 0 {
                        return Err(ModelError::definition(format!(
                            "parallel state '{}' has no regions",
                            state.name
                        )));
                    }
                }
                StateKind::History => {
                    let parent = state.parent.ok_or_else(|| {
                        ModelError::definition("history state cannot be top-level")
                    })?;
                    if !self.state(parent).kind.is_compound() {
                        return Err(ModelError::definition(format!(
                            "history state '{}' must be the child of a compound state",
                            state.name
                        )));
                    }
                    let default = state.initial.ok_or_else(|| {
                        ModelError::definition(format!(
                            "history state '{}' has no default target",
                            state.name
                        ))
                    })?;
                    for &target in &self.transition(default).targets {
                        if target == state.id || !self.is_descendant(target, parent) {
                            return Err(ModelError::definition(format!(
                                "default target of history state '{}' must be a \
                                 descendant of '{}'",
                                state.name,
                                self.state(parent).name
                            )));
                        }
                    }
                }
                StateKind::Atomic | StateKind::Final => {}
            }
        }

        for transition in &self.transitions {
            if transition.delay.is_some() && !transition.events.is_empty() {
                return Err(ModelError::definition(format!(
                    "delayed transition from '{}' cannot also name events",
                    self.state(transition.source).name
                )));
            }
        }

        // Delays are only honored for sends to the own queue; a targeted
        // send delivers through its service immediately.
        let mut bad_send = None;
        self.visit_content(&mut |action| {
            if let Action::Send(send) = action {
                if send.target.is_some() && send.delay.is_some() {
                    bad_send.get_or_insert_with(|| send.event.clone());
                }
            }
        });
        if let Some(event) = bad_send {
            return Err(ModelError::definition(format!(
                "send '{}' cannot combine a target with a delay",
                event
            )));
        }

        Ok(())
    }

    /// Walks every action in the chart, including nested content.
    fn visit_content<'a>(&'a self, f: &mut impl FnMut(&'a Action)) {
        for state in &self.states {
            for action in state.on_entry.iter().chain(&state.on_exit) {
                action.visit(f);
            }
        }
        for transition in &self.transitions {
            for action in &transition.content {
                action.visit(f);
            }
        }
    }

    /// Collects the invoke-id map and rejects duplicates.
    pub(crate) fn index_invokes(&mut self) -> Result<(), ModelError> {
        let mut invokes = HashMap::new();
        let mut duplicate = None;
        self.visit_content(&mut |action| {
            if let Action::Invoke(invoke) = action {
                if invokes.insert(invoke.id.clone(), invoke.clone()).is_some() {
                    duplicate.get_or_insert_with(|| invoke.id.clone());
                }
            }
        });

        if let Some(id) = duplicate {
            return Err(ModelError::definition(format!(
                "duplicate invoke id '{}'",
                id
            )));
        }
        self.invokes = invokes;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ChartDocument;

    fn compile(json: &str) -> StateChart {
        ChartDocument::from_json(json).unwrap().compile().unwrap()
    }

    fn chart_nested() -> StateChart {
        compile(
            r#"{
                "name": "nested",
                "states": [
                    {"type": "state", "id": "a", "states": [
                        {"type": "state", "id": "a1"},
                        {"type": "state", "id": "a2"}
                    ]},
                    {"type": "parallel", "id": "p", "states": [
                        {"type": "state", "id": "r1", "states": [
                            {"type": "state", "id": "r1a"}
                        ]},
                        {"type": "state", "id": "r2", "states": [
                            {"type": "state", "id": "r2a"}
                        ]}
                    ]}
                ]
            }"#,
        )
    }

    #[test]
    fn test_document_preorder_ids() {
        let chart = chart_nested();
        let names: Vec<&str> = chart.states().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["nested", "a", "a1", "a2", "p", "r1", "r1a", "r2", "r2a"]
        );

        let a = chart.state_by_name("a").unwrap();
        let p = chart.state_by_name("p").unwrap();
        assert!(a < p);
    }

    #[test]
    fn test_root_not_addressable() {
        let chart = chart_nested();
        assert!(chart.state_by_name("nested").is_none());
        assert_eq!(chart.state(chart.root()).name, "nested");
    }

    #[test]
    fn test_ancestors_and_descendants() {
        let chart = chart_nested();
        let r1a = chart.state_by_name("r1a").unwrap();
        let r1 = chart.state_by_name("r1").unwrap();
        let p = chart.state_by_name("p").unwrap();
        let a = chart.state_by_name("a").unwrap();

        let ancestors: Vec<StateId> = chart.ancestors(r1a).collect();
        assert_eq!(ancestors, vec![r1, p, chart.root()]);

        assert!(chart.is_descendant(r1a, p));
        assert!(chart.is_descendant(r1a, chart.root()));
        assert!(!chart.is_descendant(r1a, a));
        assert!(!chart.is_descendant(p, p));
    }

    #[test]
    fn test_lcca_skips_parallel() {
        let chart = chart_nested();
        let r1a = chart.state_by_name("r1a").unwrap();
        let r2a = chart.state_by_name("r2a").unwrap();

        // The innermost compound ancestor of both regions is the root, not
        // the parallel state itself.
        assert_eq!(chart.lcca(&[r1a, r2a]), chart.root());

        let a1 = chart.state_by_name("a1").unwrap();
        let a2 = chart.state_by_name("a2").unwrap();
        let a = chart.state_by_name("a").unwrap();
        assert_eq!(chart.lcca(&[a1, a2]), a);
    }

    #[test]
    fn test_default_initial_is_first_child() {
        let chart = chart_nested();
        let a = chart.state_by_name("a").unwrap();
        let initial = chart.state(a).initial.unwrap();
        let a1 = chart.state_by_name("a1").unwrap();
        assert_eq!(chart.transition(initial).targets, vec![a1]);
    }

    #[test]
    fn test_checksum_is_stable() {
        let one = chart_nested();
        let two = chart_nested();
        assert_eq!(one.checksum(), two.checksum());

        let other = compile(
            r#"{"name": "nested", "states": [{"type": "state", "id": "a"}]}"#,
        );
        assert_ne!(one.checksum(), other.checksum());
    }

    #[test]
    fn test_rejects_duplicate_state_id() {
        let result = ChartDocument::from_json(
            r#"{"name": "dup", "states": [
                {"type": "state", "id": "a"},
                {"type": "state", "id": "a"}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(matches!(result, Err(ModelError::DuplicateState { .. })));
    }

    #[test]
    fn test_rejects_unknown_target() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "state", "id": "a", "transitions": [
                    {"event": ["go"], "target": ["nowhere"]}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(matches!(result, Err(ModelError::UnknownState { .. })));
    }

    #[test]
    fn test_rejects_initial_outside_descendants() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "state", "id": "a", "initial": "b", "states": [
                    {"type": "state", "id": "a1"}
                ]},
                {"type": "state", "id": "b"}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_history_under_parallel() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "parallel", "id": "p", "states": [
                    {"type": "history", "id": "h", "target": ["r1"]},
                    {"type": "state", "id": "r1"},
                    {"type": "state", "id": "r2"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_empty_parallel() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "parallel", "id": "p", "states": []}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_delayed_transition_with_events() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "state", "id": "a", "transitions": [
                    {"event": ["go"], "delay_ms": 100, "target": ["b"]}
                ]},
                {"type": "state", "id": "b"}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_rejects_delayed_send_with_target() {
        let result = ChartDocument::from_json(
            r#"{"name": "bad", "states": [
                {"type": "state", "id": "a", "on_entry": [
                    {"type": "send", "event": "ping", "target": "mailer", "delay_ms": 100}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_natives_resolution() {
        let natives = Natives::new()
            .with_expr("always", |_| Ok(serde_json::Value::Bool(true)))
            .with_script("noop", |_| Ok(()));

        let chart = ChartDocument::from_json(
            r#"{"name": "n", "states": [
                {"type": "state", "id": "a", "transitions": [
                    {"event": ["go"], "cond": "native:always", "target": ["b"]}
                ]},
                {"type": "state", "id": "b", "on_entry": [
                    {"type": "script", "name": "noop"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile_with(&natives)
        .unwrap();

        let a = chart.state_by_name("a").unwrap();
        let guard = chart.transitions_of(a).next().unwrap().guard.as_ref().unwrap();
        assert!(guard.evaluate_bool(&serde_json::json!({})).unwrap());
    }

    #[test]
    fn test_unknown_native_rejected() {
        let result = ChartDocument::from_json(
            r#"{"name": "n", "states": [
                {"type": "state", "id": "a", "transitions": [
                    {"event": ["go"], "cond": "native:missing"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(matches!(result, Err(ModelError::InvalidExpression { .. })));
    }
}
