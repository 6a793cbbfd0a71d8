//! Transition selection and configuration set computation.
//!
//! Pure functions over the chart, the configuration and the history
//! records. A microstep is: compute the exit set of the kept transitions,
//! exit it leaf-first, run the transition content, then enter the entry set
//! parents-first. The interpreter drives these functions and applies the
//! side effects; nothing here touches queues or I/O.

use crate::configuration::Configuration;
use crate::event::Message;
use rscharts_model::{StateChart, StateId, StateKind, Transition, TransitionId, TransitionKind};
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

/// Recorded history: history state id to the states it recorded.
pub type HistoryRecords = HashMap<StateId, Vec<StateId>>;

/// Result of transition selection for one event (or the eventless round).
#[derive(Debug, Default)]
pub struct Selection {
    /// Selected transitions in document order of their winning branch.
    pub transitions: Vec<TransitionId>,
    /// `error.execution` messages produced by failing guards.
    pub errors: Vec<Message>,
}

/// Result of conflict resolution.
#[derive(Debug)]
pub struct ConflictResolution {
    pub kept: Vec<TransitionId>,
    /// Each dropped transition paired with the one that beat it.
    pub dropped: Vec<(TransitionId, TransitionId)>,
}

/// Selects at most one transition per active branch.
///
/// For every active atomic state in document order, the state and then its
/// ancestors are searched inward to outward; the first transition in
/// document order that matches the event and whose guard holds wins the
/// branch. `event` of None selects eventless transitions. A guard that
/// fails to evaluate counts as false and reports an error message.
pub fn select_transitions(
    chart: &StateChart,
    config: &Configuration,
    data: &Value,
    event: Option<&Message>,
) -> Selection {
    let mut selection = Selection::default();

    for atomic in config.atomic_states(chart) {
        let branch = std::iter::once(atomic).chain(chart.ancestors(atomic));

        'branch: for state in branch {
            for transition in chart.transitions_of(state) {
                let matches = match event {
                    Some(msg) => transition.matches_event(&msg.name),
                    None => transition.is_eventless(),
                };
                if !matches {
                    continue;
                }
                if !guard_passes(chart, transition, data, &mut selection.errors) {
                    continue;
                }
                if !selection.transitions.contains(&transition.id) {
                    selection.transitions.push(transition.id);
                }
                break 'branch;
            }
        }
    }

    selection
}

fn guard_passes(
    chart: &StateChart,
    transition: &Transition,
    data: &Value,
    errors: &mut Vec<Message>,
) -> bool {
    match &transition.guard {
        None => true,
        Some(guard) => match guard.evaluate_bool(data) {
            Ok(passes) => passes,
            Err(e) => {
                errors.push(Message::error_execution(format!(
                    "guard on transition from '{}' failed: {}",
                    chart.state(transition.source).name,
                    e
                )));
                false
            }
        },
    }
}

/// Drops transitions whose exit sets overlap an already kept one.
///
/// A later transition survives a conflict only by preempting: when its
/// source is a descendant of the kept transition's source, the kept one is
/// dropped instead. Otherwise document order wins.
pub fn remove_conflicting(
    chart: &StateChart,
    config: &Configuration,
    history: &HistoryRecords,
    selected: &[TransitionId],
) -> ConflictResolution {
    let mut kept: Vec<TransitionId> = Vec::new();
    let mut dropped: Vec<(TransitionId, TransitionId)> = Vec::new();

    for &candidate in selected {
        let candidate_exit = exit_set_of(chart, config, history, candidate);
        let mut preempted_by = None;
        let mut to_drop = Vec::new();

        for &existing in &kept {
            let existing_exit = exit_set_of(chart, config, history, existing);
            if candidate_exit.iter().any(|s| existing_exit.contains(s)) {
                let candidate_source = chart.transition(candidate).source;
                let existing_source = chart.transition(existing).source;
                if chart.is_descendant(candidate_source, existing_source) {
                    to_drop.push(existing);
                } else {
                    preempted_by = Some(existing);
                    break;
                }
            }
        }

        match preempted_by {
            Some(winner) => dropped.push((candidate, winner)),
            None => {
                kept.retain(|t| !to_drop.contains(t));
                dropped.extend(to_drop.into_iter().map(|t| (t, candidate)));
                kept.push(candidate);
            }
        }
    }

    ConflictResolution { kept, dropped }
}

/// Targets with history states resolved to recorded or default states.
pub fn effective_targets(
    chart: &StateChart,
    history: &HistoryRecords,
    transition: &Transition,
) -> Vec<StateId> {
    let mut targets = Vec::new();
    for &target in &transition.targets {
        let state = chart.state(target);
        if state.kind == StateKind::History {
            match history.get(&target) {
                Some(recorded) => targets.extend(recorded.iter().copied()),
                None => {
                    if let Some(default) = state.initial {
                        targets.extend(chart.transition(default).targets.iter().copied());
                    }
                }
            }
        } else {
            targets.push(target);
        }
    }
    targets
}

/// The state whose proper descendants a transition exits and enters.
///
/// The LCCA of the source and effective targets, except that an internal
/// transition whose targets all sit below its compound source keeps the
/// source itself as the domain.
pub fn transition_domain(
    chart: &StateChart,
    history: &HistoryRecords,
    transition: &Transition,
) -> StateId {
    let targets = effective_targets(chart, history, transition);
    if targets.is_empty() {
        return transition.source;
    }

    if transition.kind == TransitionKind::Internal
        && chart.state(transition.source).kind.is_compound()
        && targets
            .iter()
            .all(|&t| chart.is_descendant(t, transition.source))
    {
        return transition.source;
    }

    let mut all = targets;
    all.push(transition.source);
    chart.lcca(&all)
}

fn exit_set_of(
    chart: &StateChart,
    config: &Configuration,
    history: &HistoryRecords,
    transition: TransitionId,
) -> BTreeSet<StateId> {
    let transition = chart.transition(transition);
    if transition.targets.is_empty() {
        return BTreeSet::new();
    }
    let domain = transition_domain(chart, history, transition);
    config
        .iter()
        .filter(|&s| chart.is_descendant(s, domain))
        .collect()
}

/// Union exit set of a microstep, in reverse document order.
pub fn compute_exit_set(
    chart: &StateChart,
    config: &Configuration,
    history: &HistoryRecords,
    transitions: &[TransitionId],
) -> Vec<StateId> {
    let mut set = BTreeSet::new();
    for &t in transitions {
        set.extend(exit_set_of(chart, config, history, t));
    }
    set.into_iter().rev().collect()
}

/// Records history for every exited state that owns history children.
///
/// Must run against the configuration as it was before the exit set is
/// removed.
pub fn record_history(
    chart: &StateChart,
    config: &Configuration,
    exit_set: &[StateId],
    history: &mut HistoryRecords,
) {
    for &exited in exit_set {
        let state = chart.state(exited);
        for &child in &state.children {
            let h = chart.state(child);
            if h.kind != StateKind::History {
                continue;
            }
            let recorded: Vec<StateId> = match h.history_kind {
                Some(rscharts_model::HistoryKind::Deep) => config
                    .iter()
                    .filter(|&s| chart.state(s).is_atomic() && chart.is_descendant(s, exited))
                    .collect(),
                _ => state
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| config.contains(c))
                    .collect(),
            };
            history.insert(h.id, recorded);
        }
    }
}

/// Union entry set of a microstep, in document order.
///
/// Adds every target, the default-initial descendants of entered compounds,
/// every region of entered parallels, history resolutions, and the
/// ancestors of each effective target up to (excluding) the transition
/// domain.
pub fn compute_entry_set(
    chart: &StateChart,
    history: &HistoryRecords,
    transitions: &[TransitionId],
) -> Vec<StateId> {
    let mut to_enter = BTreeSet::new();

    for &tid in transitions {
        let transition = chart.transition(tid);
        if transition.targets.is_empty() {
            continue;
        }
        let domain = transition_domain(chart, history, transition);

        for &target in &transition.targets {
            add_descendants(chart, history, target, &mut to_enter);
        }
        for target in effective_targets(chart, history, transition) {
            add_ancestors(chart, history, target, domain, &mut to_enter);
        }
    }

    to_enter.into_iter().collect()
}

fn add_descendants(
    chart: &StateChart,
    history: &HistoryRecords,
    id: StateId,
    to_enter: &mut BTreeSet<StateId>,
) {
    let state = chart.state(id);

    if state.kind == StateKind::History {
        let parent = match state.parent {
            Some(p) => p,
            None => return,
        };
        let resolved: Vec<StateId> = match history.get(&id) {
            Some(recorded) => recorded.clone(),
            None => state
                .initial
                .map(|t| chart.transition(t).targets.clone())
                .unwrap_or_default(),
        };
        for &s in &resolved {
            add_descendants(chart, history, s, to_enter);
        }
        for &s in &resolved {
            add_ancestors(chart, history, s, parent, to_enter);
        }
        return;
    }

    to_enter.insert(id);

    match state.kind {
        StateKind::Compound | StateKind::Root => {
            if let Some(initial) = state.initial {
                let targets = &chart.transition(initial).targets;
                for &s in targets {
                    add_descendants(chart, history, s, to_enter);
                }
                for &s in targets {
                    add_ancestors(chart, history, s, id, to_enter);
                }
            }
        }
        StateKind::Parallel => {
            for &child in &state.children {
                if chart.state(child).kind == StateKind::History {
                    continue;
                }
                if !to_enter.iter().any(|&s| chart.is_descendant(s, child)) {
                    add_descendants(chart, history, child, to_enter);
                }
            }
        }
        _ => {}
    }
}

fn add_ancestors(
    chart: &StateChart,
    history: &HistoryRecords,
    id: StateId,
    upper: StateId,
    to_enter: &mut BTreeSet<StateId>,
) {
    let ancestors: Vec<StateId> = chart
        .ancestors(id)
        .take_while(|&a| a != upper)
        .collect();

    for anc in ancestors {
        to_enter.insert(anc);
        if chart.state(anc).kind == StateKind::Parallel {
            for &child in &chart.state(anc).children {
                if chart.state(child).kind == StateKind::History {
                    continue;
                }
                if !to_enter.iter().any(|&s| chart.is_descendant(s, child)) {
                    add_descendants(chart, history, child, to_enter);
                }
            }
        }
    }
}

/// Whether a state counts as completed within the current configuration.
///
/// A compound is in a final state when one of its Final children is active;
/// a parallel when every region is in a final state.
pub fn is_in_final_state(chart: &StateChart, config: &Configuration, id: StateId) -> bool {
    let state = chart.state(id);
    match state.kind {
        StateKind::Compound | StateKind::Root => state.children.iter().any(|&c| {
            chart.state(c).kind == StateKind::Final && config.contains(c)
        }),
        StateKind::Parallel => state
            .children
            .iter()
            .filter(|&&c| chart.state(c).kind != StateKind::History)
            .all(|&c| is_in_final_state(chart, config, c)),
        _ => false,
    }
}
