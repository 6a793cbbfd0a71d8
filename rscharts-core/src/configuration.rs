//! The set of active states.

use rscharts_model::{StateChart, StateId, StateKind};
use std::collections::BTreeSet;

/// An ancestor-complete set of active states.
///
/// Backed by an ordered set of arena ids, so ascending iteration is
/// document order (entry order) and descending iteration is reverse
/// document order (exit order). Only the engine mutates configurations,
/// and only between microsteps is the set guaranteed legal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    active: BTreeSet<StateId>,
}

impl Configuration {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: StateId) -> bool {
        self.active.contains(&id)
    }

    pub fn insert(&mut self, id: StateId) -> bool {
        self.active.insert(id)
    }

    pub fn remove(&mut self, id: StateId) -> bool {
        self.active.remove(&id)
    }

    pub fn clear(&mut self) {
        self.active.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    /// Active states in document order.
    pub fn iter(&self) -> impl Iterator<Item = StateId> + '_ {
        self.active.iter().copied()
    }

    /// Active states in reverse document order.
    pub fn iter_rev(&self) -> impl Iterator<Item = StateId> + '_ {
        self.active.iter().rev().copied()
    }

    /// Active atomic and final states in document order.
    pub fn atomic_states<'a>(
        &'a self,
        chart: &'a StateChart,
    ) -> impl Iterator<Item = StateId> + 'a {
        self.iter().filter(|&id| chart.state(id).is_atomic())
    }

    /// Names of the active states, root excluded, in document order.
    pub fn names(&self, chart: &StateChart) -> Vec<String> {
        self.iter()
            .filter(|&id| id != chart.root())
            .map(|id| chart.state(id).name.clone())
            .collect()
    }

    /// Checks the legal-configuration invariant.
    ///
    /// A non-empty configuration must contain the root, the parent of every
    /// active state, exactly one child of every active compound and every
    /// region of every active parallel. History states never appear.
    pub fn check_legal(&self, chart: &StateChart) -> Result<(), String> {
        if self.is_empty() {
            return Ok(());
        }

        if !self.contains(chart.root()) {
            return Err("root is not active".to_string());
        }

        for id in self.iter() {
            let state = chart.state(id);

            if let Some(parent) = state.parent {
                if !self.contains(parent) {
                    return Err(format!(
                        "'{}' is active but its parent '{}' is not",
                        state.name,
                        chart.state(parent).name
                    ));
                }
            }

            match state.kind {
                StateKind::History => {
                    return Err(format!("history state '{}' is active", state.name));
                }
                StateKind::Root | StateKind::Compound => {
                    let active_children = state
                        .children
                        .iter()
                        .filter(|&&c| self.contains(c))
                        .count();
                    if active_children != 1 {
                        return Err(format!(
                            "compound '{}' has {} active children, expected 1",
                            state.name, active_children
                        ));
                    }
                }
                StateKind::Parallel => {
                    for &child in &state.children {
                        let child_state = chart.state(child);
                        if child_state.kind != StateKind::History && !self.contains(child) {
                            return Err(format!(
                                "parallel '{}' is active but its region '{}' is not",
                                state.name, child_state.name
                            ));
                        }
                    }
                }
                StateKind::Atomic | StateKind::Final => {}
            }
        }

        Ok(())
    }
}

impl FromIterator<StateId> for Configuration {
    fn from_iter<T: IntoIterator<Item = StateId>>(iter: T) -> Self {
        Self {
            active: iter.into_iter().collect(),
        }
    }
}
