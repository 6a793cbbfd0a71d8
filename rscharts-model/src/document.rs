//! The serde document form of a chart, and its compilation.
//!
//! Documents are the wire and storage representation: plain serde structs
//! with tagged unions for states and actions. [`ChartDocument::compile`]
//! turns a document into an immutable [`StateChart`], assigning arena ids in
//! document pre-order, resolving every name, parsing every expression and
//! running structural validation. All definition problems surface here,
//! before an interpreter ever runs.

use crate::action::{
    Action, IfBranch, InvokeAction, InvokeSource, Param, QueryAction, ScriptAction, SendAction,
};
use crate::chart::{Natives, StateChart};
use crate::error::ModelError;
use crate::expr::{Expr, Location};
use crate::state::{DoneData, HistoryKind, State, StateId, StateKind, TransitionId};
use crate::transition::{EventDescriptor, Transition, TransitionKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

fn default_version() -> u32 {
    1
}

fn is_external(kind: &TransitionKind) -> bool {
    *kind == TransitionKind::External
}

fn is_false(b: &bool) -> bool {
    !b
}

/// A literal JSON value or an expression to evaluate.
///
/// Serialized untagged: `{"expr": "ctx.x + 1"}` is an expression, anything
/// else is taken literally. Expression strings may name a registered native
/// with the `native:` prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueExpr {
    Expr { expr: String },
    Value(Value),
}

impl Default for ValueExpr {
    fn default() -> Self {
        ValueExpr::Value(Value::Null)
    }
}

/// One data model field and its initializer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDocument {
    pub id: String,
    #[serde(default)]
    pub value: ValueExpr,
}

/// A named parameter of a send, query, invoke or done-data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamDocument {
    pub name: String,
    pub value: ValueExpr,
}

/// One conditional branch of an `if` action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IfBranchDocument {
    pub cond: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDocument>,
}

/// Executable content in document form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ActionDocument {
    Assign {
        location: String,
        value: ValueExpr,
    },
    Raise {
        event: String,
    },
    Log {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<ValueExpr>,
    },
    If {
        branches: Vec<IfBranchDocument>,
        #[serde(default, skip_serializing_if = "Vec::is_empty", rename = "else")]
        else_actions: Vec<ActionDocument>,
    },
    Foreach {
        array: String,
        item: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        actions: Vec<ActionDocument>,
    },
    Send {
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<ParamDocument>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<ValueExpr>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delay_ms: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Cancel {
        send_id: String,
    },
    Query {
        service: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        params: Vec<ParamDocument>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
    },
    Invoke {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chart: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        document: Option<Box<ChartDocument>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        input: Vec<ParamDocument>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        finalize: Vec<ActionDocument>,
        #[serde(default, skip_serializing_if = "is_false")]
        autoforward: bool,
    },
    Script {
        name: String,
    },
}

/// A transition in document form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransitionDocument {
    /// Event descriptors. Empty means eventless.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub event: Vec<String>,
    /// Target state ids. Empty means targetless.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub target: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cond: Option<String>,
    #[serde(default, skip_serializing_if = "is_external")]
    pub kind: TransitionKind,
    /// Makes this a delayed transition, armed while the source is active.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<ActionDocument>,
}

/// Shared shape of `state` and `parallel` document nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompositeDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub states: Vec<StateDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<ActionDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub transitions: Vec<TransitionDocument>,
}

/// Done-data produced when a final state is entered.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DoneDataDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ValueExpr>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub params: Vec<ParamDocument>,
}

/// A final state in document form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalDocument {
    pub id: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_entry: Vec<ActionDocument>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub on_exit: Vec<ActionDocument>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done_data: Option<DoneDataDocument>,
}

/// A history pseudo-state in document form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryDocument {
    pub id: String,
    #[serde(default)]
    pub kind: HistoryKind,
    /// Default targets used when no history has been recorded yet.
    pub target: Vec<String>,
}

/// A state node in document form.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StateDocument {
    /// Atomic when it has no child states, compound otherwise.
    State(CompositeDocument),
    Parallel(CompositeDocument),
    Final(FinalDocument),
    History(HistoryDocument),
}

impl StateDocument {
    pub fn id(&self) -> &str {
        match self {
            StateDocument::State(c) | StateDocument::Parallel(c) => &c.id,
            StateDocument::Final(f) => &f.id,
            StateDocument::History(h) => &h.id,
        }
    }

    fn is_history(&self) -> bool {
        matches!(self, StateDocument::History(_))
    }
}

/// A complete chart in document form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartDocument {
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data: Vec<DataDocument>,
    /// Initial top-level state. Defaults to the first non-history state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial: Option<String>,
    pub states: Vec<StateDocument>,
}

impl ChartDocument {
    pub fn from_json(s: &str) -> Result<Self, ModelError> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn to_json(&self) -> Result<String, ModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Compiles the document without any registered natives.
    pub fn compile(&self) -> Result<StateChart, ModelError> {
        self.compile_with(&Natives::default())
    }

    /// Compiles the document, resolving `native:` references and `script`
    /// actions against the given registry.
    pub fn compile_with(&self, natives: &Natives) -> Result<StateChart, ModelError> {
        Compiler::new(self, natives).run()
    }
}

enum PendingKind<'a> {
    /// Synthesized initial transition of a Root/Compound state.
    Initial { target: &'a str },
    /// Default transition of a history state.
    HistoryDefault { targets: &'a [String] },
    /// A transition written in the document.
    Doc(&'a TransitionDocument),
}

struct Pending<'a> {
    source: StateId,
    kind: PendingKind<'a>,
}

struct Compiler<'a> {
    doc: &'a ChartDocument,
    natives: &'a Natives,
    states: Vec<State>,
    by_name: HashMap<String, StateId>,
    /// Transitions in document order, resolved after the state pass.
    pending: Vec<Pending<'a>>,
    /// Next auto-assigned invoke ordinal per owning state.
    invoke_ordinals: HashMap<StateId, usize>,
    /// Next delayed-transition ordinal per source state.
    timer_ordinals: HashMap<StateId, usize>,
}

impl<'a> Compiler<'a> {
    fn new(doc: &'a ChartDocument, natives: &'a Natives) -> Self {
        Self {
            doc,
            natives,
            states: Vec::new(),
            by_name: HashMap::new(),
            pending: Vec::new(),
            invoke_ordinals: HashMap::new(),
            timer_ordinals: HashMap::new(),
        }
    }

    fn run(mut self) -> Result<StateChart, ModelError> {
        let checksum = crc32c::crc32c(&serde_json::to_vec(self.doc)?);

        if self.doc.states.is_empty() {
            return Err(ModelError::definition("chart has no states"));
        }

        // Root state, then the tree in document pre-order.
        let root = self.alloc_root()?;
        let mut top = Vec::with_capacity(self.doc.states.len());
        for node in &self.doc.states {
            top.push(self.alloc_state(node, root)?);
        }
        self.states[root.index()].children = top;

        let transitions = self.resolve_transitions()?;
        let data = self.compile_data()?;

        let mut chart = StateChart {
            name: self.doc.name.clone(),
            version: self.doc.version,
            checksum,
            states: self.states,
            transitions,
            by_name: self.by_name,
            invokes: HashMap::new(),
            data,
            root,
        };
        chart.index_invokes()?;
        chart.validate()?;
        tracing::debug!(
            chart = %chart.name,
            states = chart.states.len(),
            transitions = chart.transitions.len(),
            "compiled chart"
        );
        Ok(chart)
    }

    fn alloc_root(&mut self) -> Result<StateId, ModelError> {
        let initial = match &self.doc.initial {
            Some(name) => name.as_str(),
            None => self.first_region(&self.doc.states).ok_or_else(|| {
                ModelError::definition("chart has no top-level state to enter")
            })?,
        };

        let id = StateId(0);
        self.states.push(State {
            id,
            name: self.doc.name.clone(),
            kind: StateKind::Root,
            parent: None,
            children: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            history_kind: None,
            done_data: None,
            on_entry: Vec::new(),
            on_exit: Vec::new(),
        });
        self.pending.push(Pending {
            source: id,
            kind: PendingKind::Initial { target: initial },
        });
        Ok(id)
    }

    /// First child that can serve as a default initial target.
    fn first_region<'b>(&self, nodes: &'b [StateDocument]) -> Option<&'b str> {
        nodes.iter().find(|n| !n.is_history()).map(|n| n.id())
    }

    fn alloc_state(
        &mut self,
        node: &'a StateDocument,
        parent: StateId,
    ) -> Result<StateId, ModelError> {
        let id = StateId(self.states.len() as u32);
        let name = node.id().to_string();
        if name.is_empty() {
            return Err(ModelError::definition("state id cannot be empty"));
        }
        if self.by_name.insert(name.clone(), id).is_some() {
            return Err(ModelError::DuplicateState { id: name });
        }

        // Placeholder first so children and actions see a stable arena.
        self.states.push(State {
            id,
            name: name.clone(),
            kind: StateKind::Atomic,
            parent: Some(parent),
            children: Vec::new(),
            transitions: Vec::new(),
            initial: None,
            history_kind: None,
            done_data: None,
            on_entry: Vec::new(),
            on_exit: Vec::new(),
        });

        match node {
            StateDocument::State(c) | StateDocument::Parallel(c) => {
                let parallel = matches!(node, StateDocument::Parallel(_));
                let kind = if parallel {
                    StateKind::Parallel
                } else if c.states.is_empty() {
                    StateKind::Atomic
                } else {
                    StateKind::Compound
                };
                self.states[id.index()].kind = kind;

                match kind {
                    StateKind::Compound => {
                        let target = match &c.initial {
                            Some(name) => name.as_str(),
                            None => self.first_region(&c.states).ok_or_else(|| {
                                ModelError::definition(format!(
                                    "compound state '{}' has only history children",
                                    name
                                ))
                            })?,
                        };
                        self.pending.push(Pending {
                            source: id,
                            kind: PendingKind::Initial { target },
                        });
                    }
                    StateKind::Parallel if c.initial.is_some() => {
                        return Err(ModelError::definition(format!(
                            "parallel state '{}' cannot declare an initial",
                            name
                        )));
                    }
                    StateKind::Atomic if c.initial.is_some() => {
                        return Err(ModelError::definition(format!(
                            "state '{}' declares an initial but has no children",
                            name
                        )));
                    }
                    _ => {}
                }

                for t in &c.transitions {
                    self.pending.push(Pending {
                        source: id,
                        kind: PendingKind::Doc(t),
                    });
                }

                let on_entry = self.compile_actions(&c.on_entry, id)?;
                let on_exit = self.compile_actions(&c.on_exit, id)?;
                self.states[id.index()].on_entry = on_entry;
                self.states[id.index()].on_exit = on_exit;

                let mut children = Vec::with_capacity(c.states.len());
                for child in &c.states {
                    children.push(self.alloc_state(child, id)?);
                }
                self.states[id.index()].children = children;
            }
            StateDocument::Final(f) => {
                self.states[id.index()].kind = StateKind::Final;
                let on_entry = self.compile_actions(&f.on_entry, id)?;
                let on_exit = self.compile_actions(&f.on_exit, id)?;
                let done_data = match &f.done_data {
                    Some(d) => Some(DoneData {
                        content: d
                            .content
                            .as_ref()
                            .map(|v| self.compile_value(v))
                            .transpose()?,
                        params: self.compile_params(&d.params)?,
                    }),
                    None => None,
                };
                let state = &mut self.states[id.index()];
                state.on_entry = on_entry;
                state.on_exit = on_exit;
                state.done_data = done_data;
            }
            StateDocument::History(h) => {
                let state = &mut self.states[id.index()];
                state.kind = StateKind::History;
                state.history_kind = Some(h.kind);
                self.pending.push(Pending {
                    source: id,
                    kind: PendingKind::HistoryDefault { targets: &h.target },
                });
            }
        }

        Ok(id)
    }

    fn resolve_transitions(&mut self) -> Result<Vec<Transition>, ModelError> {
        let pending = std::mem::take(&mut self.pending);
        let mut transitions = Vec::with_capacity(pending.len());

        for p in pending {
            let tid = TransitionId(transitions.len() as u32);
            let source_name = self.states[p.source.index()].name.clone();

            let transition = match p.kind {
                PendingKind::Initial { target } => {
                    let target = self.resolve_target(
                        target,
                        &format!("initial of '{}'", source_name),
                    )?;
                    self.states[p.source.index()].initial = Some(tid);
                    Transition {
                        id: tid,
                        source: p.source,
                        targets: vec![target],
                        events: Vec::new(),
                        guard: None,
                        kind: TransitionKind::External,
                        delay: None,
                        timer_event: None,
                        content: Vec::new(),
                    }
                }
                PendingKind::HistoryDefault { targets } => {
                    let referenced_by = format!("history '{}'", source_name);
                    let targets = targets
                        .iter()
                        .map(|t| self.resolve_target(t, &referenced_by))
                        .collect::<Result<Vec<_>, _>>()?;
                    if targets.is_empty() {
                        return Err(ModelError::definition(format!(
                            "history state '{}' has no default target",
                            source_name
                        )));
                    }
                    self.states[p.source.index()].initial = Some(tid);
                    Transition {
                        id: tid,
                        source: p.source,
                        targets,
                        events: Vec::new(),
                        guard: None,
                        kind: TransitionKind::External,
                        delay: None,
                        timer_event: None,
                        content: Vec::new(),
                    }
                }
                PendingKind::Doc(doc) => {
                    let referenced_by = format!("transition from '{}'", source_name);
                    let targets = doc
                        .target
                        .iter()
                        .map(|t| self.resolve_target(t, &referenced_by))
                        .collect::<Result<Vec<_>, _>>()?;
                    let events = doc
                        .event
                        .iter()
                        .map(|e| EventDescriptor::parse(e))
                        .collect::<Result<Vec<_>, _>>()?;
                    let guard = doc
                        .cond
                        .as_deref()
                        .map(|c| self.compile_expr(c))
                        .transpose()?;
                    let delay = doc.delay_ms.map(Duration::from_millis);
                    let timer_event = delay.map(|_| {
                        let n = self.timer_ordinals.entry(p.source).or_insert(0);
                        let name = format!("delay.expired.{}.{}", source_name, n);
                        *n += 1;
                        name
                    });
                    let content = self.compile_actions(&doc.actions, p.source)?;
                    self.states[p.source.index()].transitions.push(tid);
                    Transition {
                        id: tid,
                        source: p.source,
                        targets,
                        events,
                        guard,
                        kind: doc.kind,
                        delay,
                        timer_event,
                        content,
                    }
                }
            };
            transitions.push(transition);
        }

        Ok(transitions)
    }

    fn resolve_target(&self, name: &str, referenced_by: &str) -> Result<StateId, ModelError> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| ModelError::UnknownState {
                id: name.to_string(),
                referenced_by: referenced_by.to_string(),
            })
    }

    fn compile_data(&self) -> Result<Vec<(String, Expr)>, ModelError> {
        let mut data = Vec::with_capacity(self.doc.data.len());
        for field in &self.doc.data {
            if field.id.is_empty()
                || !field.id.chars().all(|c| c.is_alphanumeric() || c == '_')
            {
                return Err(ModelError::definition(format!(
                    "invalid data field name '{}'",
                    field.id
                )));
            }
            data.push((field.id.clone(), self.compile_value(&field.value)?));
        }
        Ok(data)
    }

    fn compile_expr(&self, src: &str) -> Result<Expr, ModelError> {
        if let Some(name) = src.strip_prefix("native:") {
            return self.natives.expr(name).ok_or_else(|| {
                ModelError::InvalidExpression {
                    expr: src.to_string(),
                    reason: format!("no native expression registered as '{}'", name),
                }
            });
        }
        Expr::parse(src)
    }

    fn compile_value(&self, value: &ValueExpr) -> Result<Expr, ModelError> {
        match value {
            ValueExpr::Expr { expr } => self.compile_expr(expr),
            ValueExpr::Value(v) => Ok(Expr::Literal(v.clone())),
        }
    }

    fn compile_params(&self, params: &[ParamDocument]) -> Result<Vec<Param>, ModelError> {
        params
            .iter()
            .map(|p| Ok(Param::new(p.name.clone(), self.compile_value(&p.value)?)))
            .collect()
    }

    fn compile_actions(
        &mut self,
        docs: &[ActionDocument],
        owner: StateId,
    ) -> Result<Vec<Action>, ModelError> {
        docs.iter().map(|doc| self.compile_action(doc, owner)).collect()
    }

    fn compile_action(
        &mut self,
        doc: &ActionDocument,
        owner: StateId,
    ) -> Result<Action, ModelError> {
        let action = match doc {
            ActionDocument::Assign { location, value } => Action::Assign {
                location: Location::parse(location)?,
                expr: self.compile_value(value)?,
            },
            ActionDocument::Raise { event } => {
                if event.is_empty() {
                    return Err(ModelError::definition("raise requires an event name"));
                }
                Action::Raise {
                    event: event.clone(),
                }
            }
            ActionDocument::Log { label, value } => Action::Log {
                label: label.clone(),
                expr: value.as_ref().map(|v| self.compile_value(v)).transpose()?,
            },
            ActionDocument::If {
                branches,
                else_actions,
            } => {
                if branches.is_empty() {
                    return Err(ModelError::definition("if requires at least one branch"));
                }
                let branches = branches
                    .iter()
                    .map(|b| {
                        Ok(IfBranch {
                            cond: self.compile_expr(&b.cond)?,
                            content: self.compile_actions(&b.actions, owner)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ModelError>>()?;
                Action::If {
                    branches,
                    else_content: self.compile_actions(else_actions, owner)?,
                }
            }
            ActionDocument::Foreach {
                array,
                item,
                index,
                actions,
            } => Action::Foreach {
                source: self.compile_expr(array)?,
                item: item.clone(),
                index: index.clone(),
                content: self.compile_actions(actions, owner)?,
            },
            ActionDocument::Send {
                event,
                target,
                params,
                content,
                delay_ms,
                id,
            } => Action::Send(SendAction {
                event: event.clone(),
                target: target.clone(),
                params: self.compile_params(params)?,
                content: content.as_ref().map(|v| self.compile_value(v)).transpose()?,
                delay: delay_ms.map(Duration::from_millis),
                id: id.clone(),
            }),
            ActionDocument::Cancel { send_id } => Action::Cancel {
                send_id: send_id.clone(),
            },
            ActionDocument::Query {
                service,
                params,
                location,
                id,
            } => Action::Query(QueryAction {
                service: service.clone(),
                params: self.compile_params(params)?,
                location: location.as_deref().map(Location::parse).transpose()?,
                id: id.clone(),
            }),
            ActionDocument::Invoke {
                id,
                chart,
                document,
                input,
                location,
                finalize,
                autoforward,
            } => {
                let source = match (chart, document) {
                    (Some(name), None) => InvokeSource::Registry(name.clone()),
                    (None, Some(doc)) => {
                        InvokeSource::Inline(Arc::new(doc.compile_with(self.natives)?))
                    }
                    _ => {
                        return Err(ModelError::definition(
                            "invoke requires exactly one of 'chart' or 'document'",
                        ))
                    }
                };
                let id = match id {
                    Some(id) => id.clone(),
                    None => {
                        let n = self.invoke_ordinals.entry(owner).or_insert(0);
                        let id = format!(
                            "{}.invoke.{}",
                            self.states[owner.index()].name, n
                        );
                        *n += 1;
                        id
                    }
                };
                Action::Invoke(InvokeAction {
                    id,
                    source,
                    input: self.compile_params(input)?,
                    location: location.as_deref().map(Location::parse).transpose()?,
                    finalize: self.compile_actions(finalize, owner)?,
                    autoforward: *autoforward,
                })
            }
            ActionDocument::Script { name } => {
                let run = self.natives.script(name).ok_or_else(|| {
                    ModelError::definition(format!("no script registered as '{}'", name))
                })?;
                Action::Script(ScriptAction {
                    name: name.clone(),
                    run,
                })
            }
        };
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_document_round_trip() {
        let doc = ChartDocument {
            name: "order".to_string(),
            version: 2,
            data: vec![DataDocument {
                id: "total".to_string(),
                value: ValueExpr::Value(json!(0)),
            }],
            initial: Some("pending".to_string()),
            states: vec![
                StateDocument::State(CompositeDocument {
                    id: "pending".to_string(),
                    transitions: vec![TransitionDocument {
                        event: vec!["approve".to_string()],
                        target: vec!["done".to_string()],
                        actions: vec![ActionDocument::Assign {
                            location: "ctx.total".to_string(),
                            value: ValueExpr::Expr {
                                expr: "ctx.total + 1".to_string(),
                            },
                        }],
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
                StateDocument::Final(FinalDocument {
                    id: "done".to_string(),
                    on_entry: Vec::new(),
                    on_exit: Vec::new(),
                    done_data: None,
                }),
            ],
        };

        let json = serde_json::to_string(&doc).unwrap();
        assert!(json.contains(r#""type":"state""#));
        assert!(json.contains(r#""type":"assign""#));

        let parsed = ChartDocument::from_json(&json).unwrap();
        assert_eq!(parsed.name, "order");
        assert_eq!(parsed.version, 2);
        assert_eq!(parsed.states.len(), 2);
    }

    #[test]
    fn test_value_expr_forms() {
        let literal: ValueExpr = serde_json::from_value(json!(42)).unwrap();
        assert!(matches!(literal, ValueExpr::Value(_)));

        let expr: ValueExpr = serde_json::from_value(json!({"expr": "ctx.x"})).unwrap();
        assert!(matches!(expr, ValueExpr::Expr { .. }));
    }

    #[test]
    fn test_version_defaults_to_one() {
        let doc = ChartDocument::from_json(
            r#"{"name": "v", "states": [{"type": "state", "id": "a"}]}"#,
        )
        .unwrap();
        assert_eq!(doc.version, 1);
    }

    #[test]
    fn test_compile_assigns_timer_events() {
        let chart = ChartDocument::from_json(
            r#"{"name": "t", "states": [
                {"type": "state", "id": "a", "transitions": [
                    {"delay_ms": 50, "target": ["b"]},
                    {"delay_ms": 200, "target": ["c"]}
                ]},
                {"type": "state", "id": "b"},
                {"type": "state", "id": "c"}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let a = chart.state_by_name("a").unwrap();
        let timers: Vec<&str> = chart
            .transitions_of(a)
            .filter_map(|t| t.timer_event.as_deref())
            .collect();
        assert_eq!(timers, vec!["delay.expired.a.0", "delay.expired.a.1"]);
    }

    #[test]
    fn test_compile_assigns_invoke_ids() {
        let chart = ChartDocument::from_json(
            r#"{"name": "parent", "states": [
                {"type": "state", "id": "work", "on_entry": [
                    {"type": "invoke", "chart": "child"},
                    {"type": "invoke", "chart": "child", "id": "explicit"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        assert!(chart.invoke("work.invoke.0").is_some());
        assert!(chart.invoke("explicit").is_some());
        assert!(chart.invoke("work.invoke.1").is_none());
    }

    #[test]
    fn test_compile_rejects_duplicate_invoke_ids() {
        let result = ChartDocument::from_json(
            r#"{"name": "parent", "states": [
                {"type": "state", "id": "work", "on_entry": [
                    {"type": "invoke", "chart": "child", "id": "same"},
                    {"type": "invoke", "chart": "child", "id": "same"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_invoke_requires_one_source() {
        let result = ChartDocument::from_json(
            r#"{"name": "parent", "states": [
                {"type": "state", "id": "work", "on_entry": [
                    {"type": "invoke"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_inline_invoke_document_compiles() {
        let chart = ChartDocument::from_json(
            r#"{"name": "parent", "states": [
                {"type": "state", "id": "work", "on_entry": [
                    {"type": "invoke", "document": {
                        "name": "inline_child",
                        "states": [{"type": "final", "id": "end"}]
                    }}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let invoke = chart.invoke("work.invoke.0").unwrap();
        match &invoke.source {
            InvokeSource::Inline(child) => assert_eq!(child.name(), "inline_child"),
            other => panic!("expected inline source, got {:?}", other),
        }
    }

    #[test]
    fn test_compile_data_initializers() {
        let chart = ChartDocument::from_json(
            r#"{"name": "d", "data": [
                {"id": "count", "value": 0},
                {"id": "label", "value": {"expr": "\"run-\" + ctx.count"}}
            ], "states": [{"type": "state", "id": "a"}]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        assert_eq!(chart.data().len(), 2);
        assert_eq!(chart.data()[0].0, "count");
        let initial = chart.data()[0].1.evaluate(&json!({})).unwrap();
        assert_eq!(initial, json!(0));
    }

    #[test]
    fn test_compile_done_data() {
        let chart = ChartDocument::from_json(
            r#"{"name": "d", "states": [
                {"type": "final", "id": "end", "done_data": {
                    "params": [{"name": "result", "value": {"expr": "ctx.total"}}]
                }}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let end = chart.state_by_name("end").unwrap();
        let done = chart.state(end).done_data.as_ref().unwrap();
        assert_eq!(done.params.len(), 1);
        let value =
            Param::evaluate_all(&done.params, &json!({"total": 7})).unwrap();
        assert_eq!(value, json!({"result": 7}));
    }

    #[test]
    fn test_compile_rejects_bad_data_name() {
        let result = ChartDocument::from_json(
            r#"{"name": "d", "data": [{"id": "a.b", "value": 1}],
                "states": [{"type": "state", "id": "a"}]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_if_document_with_else() {
        let chart = ChartDocument::from_json(
            r#"{"name": "c", "states": [
                {"type": "state", "id": "a", "on_entry": [
                    {"type": "if", "branches": [
                        {"cond": "ctx.x > 0", "actions": [{"type": "raise", "event": "pos"}]}
                    ], "else": [{"type": "raise", "event": "neg"}]}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let a = chart.state_by_name("a").unwrap();
        match &chart.state(a).on_entry[0] {
            Action::If {
                branches,
                else_content,
            } => {
                assert_eq!(branches.len(), 1);
                assert_eq!(else_content.len(), 1);
            }
            other => panic!("expected if, got {:?}", other.kind()),
        }
    }

    #[test]
    fn test_atomic_with_initial_rejected() {
        let result = ChartDocument::from_json(
            r#"{"name": "c", "states": [
                {"type": "state", "id": "a", "initial": "b"}
            ]}"#,
        )
        .unwrap()
        .compile();
        assert!(result.is_err());
    }

    #[test]
    fn test_deep_history_document() {
        let chart = ChartDocument::from_json(
            r#"{"name": "h", "states": [
                {"type": "state", "id": "outer", "states": [
                    {"type": "history", "id": "mem", "kind": "deep", "target": ["inner"]},
                    {"type": "state", "id": "inner"}
                ]}
            ]}"#,
        )
        .unwrap()
        .compile()
        .unwrap();

        let mem = chart.state_by_name("mem").unwrap();
        assert_eq!(chart.state(mem).history_kind, Some(HistoryKind::Deep));
        let default = chart.state(mem).initial.unwrap();
        let inner = chart.state_by_name("inner").unwrap();
        assert_eq!(chart.transition(default).targets, vec![inner]);
    }
}
