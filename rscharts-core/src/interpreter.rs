//! The statechart driver.
//!
//! An [`Interpreter`] owns one running instance of a compiled chart: its
//! configuration, data object, queues, timers and child invocations. The
//! host feeds it external messages through [`Interpreter::dispatch`] or the
//! [`Interpreter::run`] loop; each message is processed to completion as one
//! macrostep, after which the instance is stable again and can be snapshot.
//!
//! Within a macrostep the driver repeatedly takes a microstep: it selects
//! transitions, exits their exit set in reverse document order, executes
//! transition content in selection order and enters the entry set in
//! document order. Eventless transitions are tried before every internal
//! dequeue, and the internal queue always drains before the next external
//! message is considered.

use crate::actions::{self, ActionRuntime, PendingInvoke};
use crate::datamodel::{ExecutionContext, InvocationRecord, PendingTimer, Status};
use crate::engine;
use crate::error::CoreError;
use crate::event::{Message, MessageKind};
use crate::invoke::{self, InvokeSet};
use crate::io::{scheduler_key, ChartRegistry, EventScheduler, ServiceRegistry, TokioScheduler};
use crate::queue::{EventQueue, InMemoryEventQueue};
use crate::snapshot::ExecutionSnapshot;
use crate::trace::{NoopTracer, TraceEvent, TraceFilter, Tracer};
use chrono::Utc;
use rscharts_model::{InvokeSource, Param, State, StateChart, StateId, StateKind, TransitionId};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Limits on a single instance.
#[derive(Debug, Clone)]
pub struct InterpreterConfig {
    /// Fail the instance when conflicting transitions are selected instead
    /// of dropping the losers.
    pub fail_fast: bool,
    /// Upper bound on microsteps per macrostep; exceeded means the chart
    /// loops without stabilizing.
    pub max_microsteps: usize,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            fail_fast: false,
            max_microsteps: 1024,
        }
    }
}

impl InterpreterConfig {
    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn with_max_microsteps(mut self, max_microsteps: usize) -> Self {
        self.max_microsteps = max_microsteps;
        self
    }
}

/// One running chart instance.
pub struct Interpreter {
    chart: Arc<StateChart>,
    config: InterpreterConfig,
    ctx: ExecutionContext,
    charts: ChartRegistry,
    runtime: ActionRuntime,
    invokes: InvokeSet,
    /// Overlaid on the data object at start, after the chart's own
    /// initializers. Set for invoked children.
    input: Option<Value>,
}

impl Interpreter {
    pub fn new(chart: Arc<StateChart>) -> Self {
        let ctx = ExecutionContext::new(&chart);
        let runtime = ActionRuntime {
            instance_id: ctx.instance_id.clone(),
            services: ServiceRegistry::default(),
            scheduler: Arc::new(TokioScheduler::new()),
            external: Arc::new(InMemoryEventQueue::new()),
            tracer: Arc::new(NoopTracer),
            filter: TraceFilter::all(),
            cancel: CancellationToken::new(),
        };
        Self {
            chart,
            config: InterpreterConfig::default(),
            ctx,
            charts: ChartRegistry::default(),
            runtime,
            invokes: InvokeSet::default(),
            input: None,
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_instance_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        self.runtime.instance_id = id.clone();
        self.ctx.instance_id = id;
        self
    }

    pub fn with_services(mut self, services: ServiceRegistry) -> Self {
        self.runtime.services = services;
        self
    }

    pub fn with_charts(mut self, charts: ChartRegistry) -> Self {
        self.charts = charts;
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn EventScheduler>) -> Self {
        self.runtime.scheduler = scheduler;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn EventQueue>) -> Self {
        self.runtime.external = queue;
        self
    }

    pub fn with_tracer(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.runtime.tracer = tracer;
        self
    }

    pub fn with_trace_filter(mut self, filter: TraceFilter) -> Self {
        self.runtime.filter = filter;
        self
    }

    /// Initial data overlaid on top of the chart's initializers.
    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn chart(&self) -> &Arc<StateChart> {
        &self.chart
    }

    pub fn instance_id(&self) -> &str {
        &self.ctx.instance_id
    }

    pub fn status(&self) -> Status {
        self.ctx.status
    }

    /// Names of the active states in document order, root excluded.
    pub fn configuration(&self) -> Vec<String> {
        self.ctx.configuration.names(&self.chart)
    }

    pub fn data(&self) -> &Value {
        &self.ctx.data
    }

    /// Output of the top-level final state, once completed.
    pub fn done_data(&self) -> Option<&Value> {
        self.ctx.done_data.as_ref()
    }

    /// The instance's external queue, for producers.
    pub fn queue(&self) -> Arc<dyn EventQueue> {
        self.runtime.external.clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.runtime.cancel.clone()
    }

    /// Requests cooperative cancellation. Takes effect at the next stable
    /// point of the [`Interpreter::run`] loop and interrupts in-flight
    /// service calls.
    pub fn cancel(&self) {
        self.runtime.cancel.cancel();
    }

    /// Convenience for `self.queue().send(msg)`.
    pub async fn send(&self, msg: Message) -> Result<(), CoreError> {
        self.runtime.external.send(msg).await
    }

    /// Enters the initial configuration and runs the first macrostep.
    pub async fn start(&mut self) -> Result<Status, CoreError> {
        match self.start_inner().await {
            Ok(()) => Ok(self.ctx.status),
            Err(e) => {
                // A failure mid-macrostep poisons the instance; a rejected
                // call leaves it as it was.
                if self.ctx.status == Status::Running {
                    self.finish(Status::Failed).await;
                }
                Err(e)
            }
        }
    }

    async fn start_inner(&mut self) -> Result<(), CoreError> {
        if self.ctx.status != Status::NotStarted {
            return Err(CoreError::InvalidStatus {
                status: self.ctx.status.as_str(),
                operation: "start",
            });
        }
        info!(
            instance_id = %self.runtime.instance_id,
            chart = %self.chart.name(),
            "starting instance"
        );
        self.emit(TraceEvent::EnterChart {
            instance_id: self.runtime.instance_id.clone(),
            chart: self.chart.name().to_string(),
        })
        .await;

        self.ctx.status = Status::Running;
        self.ctx.init_data(&self.chart);
        if let Some(input) = self.input.take() {
            if let Some(fields) = input.as_object() {
                for (name, value) in fields {
                    self.ctx.data[name.as_str()] = value.clone();
                }
            }
        }

        let chart = self.chart.clone();
        let root = chart.root();
        self.ctx.configuration.insert(root);
        let initial = match chart.state(root).initial {
            Some(t) => t,
            None => return Err(CoreError::illegal_configuration("root has no initial state")),
        };
        let entry_set = engine::compute_entry_set(&chart, &self.ctx.history, &[initial]);
        self.enter_states(&entry_set).await;
        self.cascade(0).await
    }

    /// Delivers one external message and runs it to completion.
    ///
    /// Returns the status after the macrostep. Scheduled messages that no
    /// longer match a pending timer are dropped without effect.
    pub async fn dispatch(&mut self, msg: Message) -> Result<Status, CoreError> {
        match self.dispatch_inner(msg).await {
            Ok(()) => Ok(self.ctx.status),
            Err(e) => {
                if self.ctx.status == Status::Running {
                    self.finish(Status::Failed).await;
                }
                Err(e)
            }
        }
    }

    async fn dispatch_inner(&mut self, msg: Message) -> Result<(), CoreError> {
        if self.ctx.status != Status::WaitingForEvent {
            return Err(CoreError::InvalidStatus {
                status: self.ctx.status.as_str(),
                operation: "dispatch",
            });
        }
        if msg.send_id.is_some() && !self.take_fresh_timer(&msg) {
            debug!(
                instance_id = %self.runtime.instance_id,
                event = %msg.name,
                "stale scheduled message dropped"
            );
            return Ok(());
        }
        if let Some(invoke_id) = completion_invoke_id(&msg) {
            if !self.ctx.invocations.contains_key(invoke_id) {
                debug!(
                    instance_id = %self.runtime.instance_id,
                    invoke_id,
                    "completion of a cancelled invocation dropped"
                );
                return Ok(());
            }
        }

        self.ctx.status = Status::Running;
        if msg.is_cancel() {
            self.unwind().await;
            return Ok(());
        }
        if let Some(invoke_id) = completion_invoke_id(&msg).map(str::to_string) {
            self.finish_invoke(&invoke_id, &msg).await;
        }
        self.autoforward(&msg).await;

        self.ctx.set_event(&msg);
        let chart = self.chart.clone();
        let selection = engine::select_transitions(&chart, &self.ctx.configuration, &self.ctx.data, Some(&msg));
        for error in selection.errors {
            self.ctx.raise(error);
        }
        let kept = self.resolve_conflicts(selection.transitions).await?;
        let mut microsteps = 0;
        if kept.is_empty() {
            debug!(
                instance_id = %self.runtime.instance_id,
                event = %msg.name,
                "event matched no transition"
            );
        } else {
            microsteps = 1;
            self.microstep(&kept, Some(&msg)).await;
        }
        self.cascade(microsteps).await
    }

    /// Drives the instance to a terminal status, pulling messages from the
    /// external queue. Cancellation is observed between macrosteps.
    pub async fn run(&mut self) -> Result<Status, CoreError> {
        if self.ctx.status == Status::NotStarted {
            self.start().await?;
        }
        while !self.ctx.status.is_terminal() {
            let cancel = self.runtime.cancel.clone();
            let queue = self.runtime.external.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    self.ctx.status = Status::Running;
                    self.unwind().await;
                }
                msg = queue.recv() => match msg {
                    Some(msg) => {
                        self.dispatch(msg).await?;
                    }
                    None => {
                        // The host closed our input while we were live.
                        self.ctx.status = Status::Running;
                        self.unwind().await;
                    }
                },
            }
        }
        Ok(self.ctx.status)
    }

    /// Captures a durable snapshot. Legal only when the instance is stable
    /// or terminal.
    pub fn snapshot(&self) -> Result<ExecutionSnapshot, CoreError> {
        match self.ctx.status {
            Status::WaitingForEvent | Status::Completed | Status::Cancelled | Status::Failed => {
                Ok(ExecutionSnapshot::capture(&self.chart, &self.ctx))
            }
            _ => Err(CoreError::InvalidStatus {
                status: self.ctx.status.as_str(),
                operation: "snapshot",
            }),
        }
    }

    /// Restores a snapshot into this not-yet-started instance.
    ///
    /// Pending timers are re-scheduled with their remaining delay; timers
    /// already past due deliver immediately. Invocations that were running
    /// are re-issued from scratch, so children observe at-least-once starts.
    pub async fn resume(&mut self, snapshot: ExecutionSnapshot) -> Result<Status, CoreError> {
        if self.ctx.status != Status::NotStarted {
            return Err(CoreError::InvalidStatus {
                status: self.ctx.status.as_str(),
                operation: "resume",
            });
        }
        let ctx = snapshot.restore(&self.chart)?;
        self.runtime.instance_id = ctx.instance_id.clone();
        self.ctx = ctx;

        for timer in self.ctx.timers.values() {
            let remaining = (timer.deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
            self.runtime.scheduler.schedule(
                scheduler_key(&self.runtime.instance_id, &timer.key),
                timer.message.clone(),
                remaining,
                self.runtime.external.clone(),
            );
        }

        let records: Vec<InvocationRecord> = self.ctx.invocations.values().cloned().collect();
        self.ctx.invocations.clear();
        for record in records {
            self.start_invoke(PendingInvoke {
                invoke_id: record.invoke_id,
                owner: record.owner,
            })
            .await;
        }

        info!(
            instance_id = %self.runtime.instance_id,
            status = self.ctx.status.as_str(),
            "resumed from snapshot"
        );
        Ok(self.ctx.status)
    }

    async fn emit(&self, event: TraceEvent) {
        actions::emit(&self.runtime, event).await;
    }

    /// Runs microsteps until the instance stabilizes.
    ///
    /// Each iteration gives eventless transitions priority; only when none
    /// are enabled is the next internal message dequeued.
    async fn cascade(&mut self, mut microsteps: usize) -> Result<(), CoreError> {
        let chart = self.chart.clone();

        while self.ctx.status == Status::Running {
            let selection =
                engine::select_transitions(&chart, &self.ctx.configuration, &self.ctx.data, None);
            for error in selection.errors {
                self.ctx.raise(error);
            }
            let kept = self.resolve_conflicts(selection.transitions).await?;
            if !kept.is_empty() {
                microsteps += 1;
                if microsteps > self.config.max_microsteps {
                    return Err(CoreError::MicrostepLimit {
                        limit: self.config.max_microsteps,
                    });
                }
                self.microstep(&kept, None).await;
                continue;
            }

            let msg = match self.ctx.next_internal() {
                Some(msg) => msg,
                None => break,
            };
            if msg.is_cancel() {
                self.unwind().await;
                break;
            }
            self.ctx.set_event(&msg);
            let selection = engine::select_transitions(
                &chart,
                &self.ctx.configuration,
                &self.ctx.data,
                Some(&msg),
            );
            for error in selection.errors {
                self.ctx.raise(error);
            }
            let kept = self.resolve_conflicts(selection.transitions).await?;
            if kept.is_empty() {
                debug!(
                    instance_id = %self.runtime.instance_id,
                    event = %msg.name,
                    "internal message matched no transition"
                );
                continue;
            }
            microsteps += 1;
            if microsteps > self.config.max_microsteps {
                return Err(CoreError::MicrostepLimit {
                    limit: self.config.max_microsteps,
                });
            }
            self.microstep(&kept, Some(&msg)).await;
        }

        self.emit(TraceEvent::MacrostepDone {
            configuration: self.ctx.configuration.names(&chart),
            microsteps,
        })
        .await;

        match self.ctx.status {
            Status::Running => {
                if let Err(reason) = self.ctx.configuration.check_legal(&chart) {
                    return Err(CoreError::illegal_configuration(reason));
                }
                self.ctx.status = Status::WaitingForEvent;
                Ok(())
            }
            Status::Completed => {
                self.finish(Status::Completed).await;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    async fn resolve_conflicts(
        &mut self,
        selected: Vec<TransitionId>,
    ) -> Result<Vec<TransitionId>, CoreError> {
        if selected.len() <= 1 {
            return Ok(selected);
        }
        let chart = self.chart.clone();
        let resolution = engine::remove_conflicting(
            &chart,
            &self.ctx.configuration,
            &self.ctx.history,
            &selected,
        );
        if !resolution.dropped.is_empty() {
            for &(loser, winner) in &resolution.dropped {
                let source = chart.state(chart.transition(loser).source).name.clone();
                let winner_name = chart.state(chart.transition(winner).source).name.clone();
                warn!(
                    instance_id = %self.runtime.instance_id,
                    dropped = %source,
                    winner = %winner_name,
                    "conflicting transition dropped"
                );
                self.emit(TraceEvent::DropTransition {
                    source,
                    winner: winner_name,
                })
                .await;
            }
            if self.config.fail_fast {
                let sources: Vec<&str> = resolution
                    .dropped
                    .iter()
                    .map(|&(loser, _)| chart.state(chart.transition(loser).source).name.as_str())
                    .collect();
                return Err(CoreError::ConflictingTransitions {
                    details: format!("dropped from: {}", sources.join(", ")),
                });
            }
        }
        Ok(resolution.kept)
    }

    /// Exit set in reverse document order, transition content in selection
    /// order, entry set in document order.
    async fn microstep(&mut self, kept: &[TransitionId], event: Option<&Message>) {
        let chart = self.chart.clone();

        let exit_set =
            engine::compute_exit_set(&chart, &self.ctx.configuration, &self.ctx.history, kept);
        self.exit_states(&exit_set).await;

        for &tid in kept {
            let transition = chart.transition(tid);
            let source = chart.state(transition.source).name.clone();
            let targets: Vec<String> = transition
                .targets
                .iter()
                .map(|&t| chart.state(t).name.clone())
                .collect();
            self.emit(TraceEvent::MakeTransition {
                source: source.clone(),
                targets,
                event: event.map(|m| m.name.clone()),
            })
            .await;
            let mut started = Vec::new();
            let _ = actions::execute_content(
                &self.runtime,
                &mut self.ctx,
                &source,
                &transition.content,
                &mut started,
            )
            .await;
            self.start_invokes(started).await;
        }

        let entry_set = engine::compute_entry_set(&chart, &self.ctx.history, kept);
        self.enter_states(&entry_set).await;
    }

    /// Exits states leaf first: history is recorded against the configuration
    /// as it stood before any removal, then each state runs its exit content,
    /// drops its timers and cancels its invocations.
    async fn exit_states(&mut self, exit_set: &[StateId]) {
        let chart = self.chart.clone();
        engine::record_history(&chart, &self.ctx.configuration, exit_set, &mut self.ctx.history);

        for &id in exit_set {
            let state = chart.state(id);
            debug!(instance_id = %self.runtime.instance_id, state = %state.name, "exit");
            self.emit(TraceEvent::ExitState {
                state: state.name.clone(),
            })
            .await;
            let mut started = Vec::new();
            let _ = actions::execute_content(
                &self.runtime,
                &mut self.ctx,
                &state.name,
                &state.on_exit,
                &mut started,
            )
            .await;
            self.start_invokes(started).await;
            self.disarm_timers_of(&state.name);
            self.cancel_invokes_of(&state.name).await;
            self.ctx.configuration.remove(id);
        }
    }

    /// Enters states in document order, arming timers and starting
    /// invocations as each becomes active.
    async fn enter_states(&mut self, entry_set: &[StateId]) {
        let chart = self.chart.clone();
        let mut interrupted = false;

        for &id in entry_set {
            if self.ctx.configuration.contains(id) {
                continue;
            }
            self.ctx.configuration.insert(id);
            let state = chart.state(id);
            debug!(instance_id = %self.runtime.instance_id, state = %state.name, "enter");
            self.emit(TraceEvent::EnterState {
                state: state.name.clone(),
            })
            .await;
            self.arm_delayed_transitions(id);
            if interrupted {
                // Cancellation in an earlier entry block: keep the
                // structural bookkeeping but run no more content.
                continue;
            }
            let mut started = Vec::new();
            if actions::execute_content(
                &self.runtime,
                &mut self.ctx,
                &state.name,
                &state.on_entry,
                &mut started,
            )
            .await
            .is_err()
            {
                interrupted = true;
            }
            self.start_invokes(started).await;
            if !interrupted {
                self.completion_events(id);
            }
        }
    }

    /// Raises the completion messages for an entered final state.
    fn completion_events(&mut self, id: StateId) {
        let chart = self.chart.clone();
        let state = chart.state(id);
        if state.kind != StateKind::Final {
            return;
        }
        let parent = match state.parent {
            Some(parent) => parent,
            None => return,
        };
        let done_data = self.evaluate_done_data(state).unwrap_or(Value::Null);

        if parent == chart.root() {
            self.ctx.done_data = Some(done_data);
            self.ctx.status = Status::Completed;
            return;
        }

        let parent_name = &chart.state(parent).name;
        self.ctx.raise(Message::done_state(parent_name, done_data));

        if let Some(grandparent) = chart.state(parent).parent {
            if chart.state(grandparent).kind == StateKind::Parallel
                && engine::is_in_final_state(&chart, &self.ctx.configuration, grandparent)
            {
                let name = &chart.state(grandparent).name;
                self.ctx.raise(Message::done_state(name, Value::Null));
            }
        }
    }

    fn evaluate_done_data(&mut self, state: &State) -> Option<Value> {
        let done_data = state.done_data.as_ref()?;
        let result = match &done_data.content {
            Some(expr) => self.ctx.evaluate(expr),
            None => Param::evaluate_all(&done_data.params, &self.ctx.data),
        };
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.ctx.raise(Message::error_execution(format!(
                    "done data of '{}': {}",
                    state.name, e
                )));
                None
            }
        }
    }

    /// Schedules the timer message of every delayed transition leaving the
    /// entered state. Each arming gets a fresh send id so a message from an
    /// earlier activation can be told apart and dropped.
    fn arm_delayed_transitions(&mut self, id: StateId) {
        let chart = self.chart.clone();
        let state_name = &chart.state(id).name;
        for transition in chart.transitions_of(id) {
            let (delay, timer_event) = match (transition.delay, &transition.timer_event) {
                (Some(delay), Some(name)) => (delay, name.clone()),
                _ => continue,
            };
            let send_id = Uuid::new_v4().to_string();
            let message = Message::platform(timer_event.clone(), Value::Null).with_send_id(send_id);
            self.ctx.timers.insert(
                timer_event.clone(),
                PendingTimer {
                    key: timer_event.clone(),
                    message: message.clone(),
                    deadline: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
                    owner: Some(state_name.clone()),
                },
            );
            self.runtime.scheduler.schedule(
                scheduler_key(&self.runtime.instance_id, &timer_event),
                message,
                delay,
                self.runtime.external.clone(),
            );
        }
    }

    /// Cancels timers owned by an exited state. Delayed sends have no owner
    /// and survive the sender's exit.
    fn disarm_timers_of(&mut self, state_name: &str) {
        let keys: Vec<String> = self
            .ctx
            .timers
            .iter()
            .filter(|(_, timer)| timer.owner.as_deref() == Some(state_name))
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            self.ctx.timers.remove(&key);
            self.runtime
                .scheduler
                .cancel(&scheduler_key(&self.runtime.instance_id, &key));
        }
    }

    /// Checks a scheduled message against the pending timer that produced
    /// it, consuming the timer when it matches. A mismatch means the timer
    /// was cancelled or re-armed after this message was already in flight.
    fn take_fresh_timer(&mut self, msg: &Message) -> bool {
        let send_id = match &msg.send_id {
            Some(id) => id,
            None => return true,
        };
        let key = if msg.name.starts_with("delay.expired.") {
            msg.name.as_str()
        } else {
            send_id.as_str()
        };
        let fresh = self
            .ctx
            .timers
            .get(key)
            .map(|timer| timer.message.send_id.as_deref() == Some(send_id.as_str()))
            .unwrap_or(false);
        if fresh {
            self.ctx.timers.remove(key);
        }
        fresh
    }

    async fn start_invokes(&mut self, started: Vec<PendingInvoke>) {
        for pending in started {
            self.start_invoke(pending).await;
        }
    }

    /// Builds and spawns the child interpreter for one invoke. The child
    /// shares the parent's services, chart registry, scheduler and tracer but
    /// runs on its own queue under its own instance id.
    async fn start_invoke(&mut self, pending: PendingInvoke) {
        let chart = self.chart.clone();
        let PendingInvoke { invoke_id, owner } = pending;

        let invoke = match chart.invoke(&invoke_id) {
            Some(invoke) => invoke,
            None => {
                self.ctx.raise(Message::error_execution(format!(
                    "unknown invoke id '{}'",
                    invoke_id
                )));
                return;
            }
        };
        let child_chart = match &invoke.source {
            InvokeSource::Inline(chart) => chart.clone(),
            InvokeSource::Registry(name) => match self.charts.get(name) {
                Ok(chart) => chart,
                Err(e) => {
                    warn!(
                        instance_id = %self.runtime.instance_id,
                        invoke_id = %invoke_id,
                        error = %e,
                        "invoke failed to resolve its chart"
                    );
                    self.ctx.raise(Message::error_execution(format!(
                        "invoke '{}': {}",
                        invoke_id, e
                    )));
                    return;
                }
            },
        };
        let input = match Param::evaluate_all(&invoke.input, &self.ctx.data) {
            Ok(input) => input,
            Err(e) => {
                self.ctx.raise(Message::error_execution(format!(
                    "invoke '{}' input: {}",
                    invoke_id, e
                )));
                return;
            }
        };

        let child_instance_id = format!("{}.{}", self.runtime.instance_id, invoke_id);
        let child = Interpreter::new(child_chart)
            .with_instance_id(child_instance_id.clone())
            .with_services(self.runtime.services.clone())
            .with_charts(self.charts.clone())
            .with_scheduler(self.runtime.scheduler.clone())
            .with_tracer(self.runtime.tracer.clone())
            .with_trace_filter(self.runtime.filter.clone())
            .with_input(input);

        info!(
            instance_id = %self.runtime.instance_id,
            invoke_id = %invoke_id,
            chart = %child.chart.name(),
            "starting invocation"
        );
        self.emit(TraceEvent::BeforeInvoke {
            invoke_id: invoke_id.clone(),
            chart: child.chart.name().to_string(),
        })
        .await;

        let handle = invoke::spawn_child(child, invoke_id.clone(), self.runtime.external.clone());
        self.ctx.invocations.insert(
            invoke_id.clone(),
            InvocationRecord {
                invoke_id: invoke_id.clone(),
                owner,
                child_instance_id,
                started_at: Utc::now(),
            },
        );
        self.invokes.insert(invoke_id, handle);
    }

    /// Completes a finished invocation: reaps the task, writes the result
    /// location, runs finalize content in the owner's context.
    async fn finish_invoke(&mut self, invoke_id: &str, msg: &Message) {
        let record = match self.ctx.invocations.remove(invoke_id) {
            Some(record) => record,
            None => return,
        };
        if let Some(handle) = self.invokes.remove(invoke_id) {
            // The child already reached a terminal status; this only reaps
            // the task.
            if handle.task.await.is_err() {
                warn!(
                    instance_id = %self.runtime.instance_id,
                    invoke_id,
                    "invoked child panicked"
                );
            }
        }

        let chart = self.chart.clone();
        if let Some(invoke) = chart.invoke(invoke_id) {
            let succeeded = !msg.name.starts_with("done.invoke.error.");
            if succeeded {
                if let Some(location) = &invoke.location {
                    if let Err(e) = self.ctx.assign(location, msg.payload.clone()) {
                        self.ctx.raise(Message::error_execution(format!(
                            "invoke '{}' result location: {}",
                            invoke_id, e
                        )));
                    }
                }
            }
            if !invoke.finalize.is_empty() {
                self.ctx.set_event(msg);
                let mut started = Vec::new();
                let _ = actions::execute_content(
                    &self.runtime,
                    &mut self.ctx,
                    &record.owner,
                    &invoke.finalize,
                    &mut started,
                )
                .await;
                self.start_invokes(started).await;
            }
        }
        self.emit(TraceEvent::AfterInvoke {
            invoke_id: invoke_id.to_string(),
        })
        .await;
    }

    /// Clones an external message to every running invocation that asked
    /// for forwarding.
    async fn autoforward(&mut self, msg: &Message) {
        if msg.kind != MessageKind::External
            || msg.is_cancel()
            || msg.name.starts_with("done.invoke.")
        {
            return;
        }
        let chart = self.chart.clone();
        let ids: Vec<String> = self.ctx.invocations.keys().cloned().collect();
        for id in ids {
            let forward = chart.invoke(&id).map(|i| i.autoforward).unwrap_or(false);
            if !forward {
                continue;
            }
            if let Some(handle) = self.invokes.get(&id) {
                if handle.child_queue.send(msg.clone()).await.is_err() {
                    debug!(
                        instance_id = %self.runtime.instance_id,
                        invoke_id = %id,
                        "autoforward to a finished child dropped"
                    );
                }
            }
        }
    }

    async fn cancel_invokes_of(&mut self, owner: &str) {
        let ids: Vec<String> = self
            .ctx
            .invocations
            .iter()
            .filter(|(_, record)| record.owner == owner)
            .map(|(id, _)| id.clone())
            .collect();
        for id in ids {
            self.ctx.invocations.remove(&id);
            if let Some(handle) = self.invokes.remove(&id) {
                invoke::cancel_child(&id, handle).await;
            }
            self.emit(TraceEvent::AfterInvoke { invoke_id: id }).await;
        }
    }

    /// Exits every active state leaf first and finishes as cancelled.
    async fn unwind(&mut self) {
        info!(instance_id = %self.runtime.instance_id, "cancelling instance");
        let root = self.chart.root();
        let exit_set: Vec<StateId> = self
            .ctx
            .configuration
            .iter_rev()
            .filter(|&id| id != root)
            .collect();
        self.exit_states(&exit_set).await;
        self.ctx.configuration.clear();
        self.ctx.internal_queue.clear();
        self.finish(Status::Cancelled).await;
    }

    /// Settles the instance into a terminal status: timers cancelled,
    /// children stopped, external queue closed.
    async fn finish(&mut self, status: Status) {
        self.ctx.status = status;
        let keys: Vec<String> = self.ctx.timers.keys().cloned().collect();
        for key in keys {
            self.runtime
                .scheduler
                .cancel(&scheduler_key(&self.runtime.instance_id, &key));
        }
        self.ctx.timers.clear();
        for (invoke_id, handle) in self.invokes.drain() {
            self.ctx.invocations.remove(&invoke_id);
            invoke::cancel_child(&invoke_id, handle).await;
        }
        self.runtime.external.close();
        info!(
            instance_id = %self.runtime.instance_id,
            status = status.as_str(),
            "instance finished"
        );
        self.emit(TraceEvent::ExitChart {
            instance_id: self.runtime.instance_id.clone(),
            status: status.as_str().to_string(),
        })
        .await;
    }
}

/// The invocation a completion message belongs to, if it is one.
fn completion_invoke_id(msg: &Message) -> Option<&str> {
    if let Some(id) = &msg.invoke_id {
        return Some(id);
    }
    msg.name
        .strip_prefix("done.invoke.error.")
        .or_else(|| msg.name.strip_prefix("done.invoke."))
}
