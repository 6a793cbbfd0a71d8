//! States of the chart tree.

use crate::action::{Action, Param};
use crate::expr::Expr;
use serde::{Deserialize, Serialize};

/// Handle to a state in the chart arena.
///
/// Ids are assigned in document pre-order, so comparing two ids compares
/// their document positions. Sorted containers of ids iterate in document
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StateId(pub(crate) u32);

impl StateId {
    /// Position in the chart's state arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a transition in the chart arena, also in document order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransitionId(pub(crate) u32);

impl TransitionId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// What role a state plays in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateKind {
    /// The implicit top-level state owning the chart's top states.
    Root,
    /// A leaf state.
    Atomic,
    /// A state with children, exactly one active at a time.
    Compound,
    /// A state whose children are concurrent regions, all active together.
    Parallel,
    /// A pseudo-state restoring its parent's previously recorded children.
    History,
    /// A terminal state. Entering a Final completes its parent.
    Final,
}

impl StateKind {
    pub fn is_atomic(self) -> bool {
        matches!(self, StateKind::Atomic | StateKind::Final)
    }

    pub fn is_compound(self) -> bool {
        matches!(self, StateKind::Compound | StateKind::Root)
    }
}

/// How much of the exited configuration a history state records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKind {
    /// Immediate children only; descendants re-enter through defaults.
    #[default]
    Shallow,
    /// The full atomic descendant set.
    Deep,
}

/// Output produced when a final state is entered.
#[derive(Debug, Clone, Default)]
pub struct DoneData {
    /// Whole-value expression. Wins over `params` when present.
    pub content: Option<Expr>,
    pub params: Vec<Param>,
}

impl DoneData {
    pub fn is_empty(&self) -> bool {
        self.content.is_none() && self.params.is_empty()
    }
}

/// One node of the compiled chart tree.
#[derive(Debug, Clone)]
pub struct State {
    /// Own arena id.
    pub id: StateId,
    /// Document id, unique within the chart.
    pub name: String,
    pub kind: StateKind,
    /// None only for the root.
    pub parent: Option<StateId>,
    /// Children in document order.
    pub children: Vec<StateId>,
    /// Outgoing transitions in document order.
    pub transitions: Vec<TransitionId>,
    /// Initial transition of a Root/Compound, or the default transition of a
    /// History state.
    pub initial: Option<TransitionId>,
    /// Set only when `kind` is History.
    pub history_kind: Option<HistoryKind>,
    /// Set only when `kind` is Final.
    pub done_data: Option<DoneData>,
    pub on_entry: Vec<Action>,
    pub on_exit: Vec<Action>,
}

impl State {
    /// True for states that can sit at the bottom of a configuration.
    pub fn is_atomic(&self) -> bool {
        matches!(self.kind, StateKind::Atomic | StateKind::Final)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_id_ordering_is_document_order() {
        let a = StateId(3);
        let b = StateId(7);
        assert!(a < b);

        let set: std::collections::BTreeSet<StateId> =
            [StateId(5), StateId(1), StateId(3)].into_iter().collect();
        let order: Vec<usize> = set.iter().map(|id| id.index()).collect();
        assert_eq!(order, vec![1, 3, 5]);
    }

    #[test]
    fn test_kind_predicates() {
        assert!(StateKind::Atomic.is_atomic());
        assert!(StateKind::Final.is_atomic());
        assert!(!StateKind::Parallel.is_atomic());
        assert!(StateKind::Root.is_compound());
        assert!(StateKind::Compound.is_compound());
        assert!(!StateKind::Parallel.is_compound());
    }
}
