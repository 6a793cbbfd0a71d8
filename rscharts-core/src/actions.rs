//! Executes the content attached to states and transitions.
//!
//! Failures here are soft: a broken expression or a rejected send raises
//! `error.execution` or `error.communication` on the internal queue and the
//! remaining actions keep running. Only instance cancellation interrupts a
//! content block.

use crate::datamodel::{ExecutionContext, PendingTimer};
use crate::error::ServiceError;
use crate::event::Message;
use crate::io::{scheduler_key, EventScheduler, ServiceRegistry};
use crate::queue::EventQueue;
use crate::trace::{TraceEvent, TraceFilter, Tracer};
use chrono::Utc;
use rscharts_model::{Action, EvalError, Param, QueryAction, SendAction};
use serde_json::Value;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// Capabilities the executor reaches for. Built once per interpreter; every
/// handle is shared, so cloning is cheap.
#[derive(Clone)]
pub(crate) struct ActionRuntime {
    pub instance_id: String,
    pub services: ServiceRegistry,
    pub scheduler: Arc<dyn EventScheduler>,
    /// The instance's own external queue, the destination of targetless
    /// sends.
    pub external: Arc<dyn EventQueue>,
    pub tracer: Arc<dyn Tracer>,
    pub filter: TraceFilter,
    pub cancel: CancellationToken,
}

/// An invoke encountered during content execution. The driver starts it
/// once the surrounding block completes.
#[derive(Debug)]
pub(crate) struct PendingInvoke {
    pub invoke_id: String,
    /// State whose exit cancels the child.
    pub owner: String,
}

/// Content execution stopped because the instance is cancelling.
#[derive(Debug)]
pub(crate) struct Interrupted;

pub(crate) async fn emit(rt: &ActionRuntime, event: TraceEvent) {
    if rt.filter.matches(&event) {
        rt.tracer.trace(event).await;
    }
}

fn soft_fail(rt: &ActionRuntime, ctx: &mut ExecutionContext, reason: String) {
    warn!(instance_id = %rt.instance_id, %reason, "executable content failed");
    ctx.raise(Message::error_execution(reason));
}

fn comm_fail(rt: &ActionRuntime, ctx: &mut ExecutionContext, reason: String) {
    warn!(instance_id = %rt.instance_id, %reason, "outbound delivery failed");
    ctx.raise(Message::error_communication(reason));
}

/// Runs a content block in order, wrapping each action in trace hooks.
///
/// Boxed because if and foreach recurse into nested blocks.
pub(crate) fn execute_content<'a>(
    rt: &'a ActionRuntime,
    ctx: &'a mut ExecutionContext,
    state: &'a str,
    content: &'a [Action],
    started: &'a mut Vec<PendingInvoke>,
) -> Pin<Box<dyn Future<Output = Result<(), Interrupted>> + Send + 'a>> {
    Box::pin(async move {
        for action in content {
            emit(
                rt,
                TraceEvent::BeforeAction {
                    kind: action.kind().to_string(),
                    state: state.to_string(),
                },
            )
            .await;
            let outcome = run_action(rt, ctx, state, action, started).await;
            emit(
                rt,
                TraceEvent::AfterAction {
                    kind: action.kind().to_string(),
                    state: state.to_string(),
                    ok: matches!(outcome, Ok(true)),
                },
            )
            .await;
            outcome?;
        }
        Ok(())
    })
}

/// Executes one action. `Ok(false)` means the action failed softly and an
/// error message was raised; the block continues.
async fn run_action(
    rt: &ActionRuntime,
    ctx: &mut ExecutionContext,
    state: &str,
    action: &Action,
    started: &mut Vec<PendingInvoke>,
) -> Result<bool, Interrupted> {
    match action {
        Action::Assign { location, expr } => {
            let value = match ctx.evaluate(expr) {
                Ok(value) => value,
                Err(e) => {
                    soft_fail(rt, ctx, format!("assign to '{}': {}", location.as_str(), e));
                    return Ok(false);
                }
            };
            match ctx.assign(location, value) {
                Ok(()) => Ok(true),
                Err(e) => {
                    soft_fail(rt, ctx, format!("assign to '{}': {}", location.as_str(), e));
                    Ok(false)
                }
            }
        }
        Action::Raise { event } => {
            ctx.raise(Message::internal(event.clone(), Value::Null));
            Ok(true)
        }
        Action::Log { label, expr } => {
            // Diagnostic only; a broken expression is reported but raises
            // nothing.
            match expr {
                Some(expr) => match ctx.evaluate(expr) {
                    Ok(value) => {
                        info!(
                            target: "rscharts::chart",
                            instance_id = %rt.instance_id,
                            label = label.as_deref().unwrap_or(""),
                            value = %value,
                            "chart log"
                        );
                        Ok(true)
                    }
                    Err(e) => {
                        warn!(instance_id = %rt.instance_id, error = %e, "log expression failed");
                        Ok(false)
                    }
                },
                None => {
                    info!(
                        target: "rscharts::chart",
                        instance_id = %rt.instance_id,
                        label = label.as_deref().unwrap_or(""),
                        "chart log"
                    );
                    Ok(true)
                }
            }
        }
        Action::If {
            branches,
            else_content,
        } => {
            for branch in branches {
                // A broken condition counts as false, like a guard.
                match ctx.evaluate_bool(&branch.cond) {
                    Ok(true) => {
                        execute_content(rt, ctx, state, &branch.content, started).await?;
                        return Ok(true);
                    }
                    Ok(false) => {}
                    Err(e) => {
                        soft_fail(rt, ctx, format!("if condition: {}", e));
                    }
                }
            }
            execute_content(rt, ctx, state, else_content, started).await?;
            Ok(true)
        }
        Action::Foreach {
            source,
            item,
            index,
            content,
        } => {
            let items = match ctx.evaluate(source) {
                Ok(Value::Array(items)) => items,
                Ok(_) => {
                    soft_fail(rt, ctx, "foreach source is not an array".to_string());
                    return Ok(false);
                }
                Err(e) => {
                    soft_fail(rt, ctx, format!("foreach source: {}", e));
                    return Ok(false);
                }
            };

            // Item and index shadow existing fields for the duration of the
            // loop and are restored afterwards.
            let saved_item = ctx.data.get(item.as_str()).cloned();
            let saved_index = index
                .as_ref()
                .map(|field| ctx.data.get(field.as_str()).cloned());

            let mut interrupted = false;
            for (position, element) in items.into_iter().enumerate() {
                ctx.data[item.as_str()] = element;
                if let Some(field) = index {
                    ctx.data[field.as_str()] = Value::from(position as u64);
                }
                if execute_content(rt, ctx, state, content, started)
                    .await
                    .is_err()
                {
                    interrupted = true;
                    break;
                }
            }

            restore_field(&mut ctx.data, item, saved_item);
            if let (Some(field), Some(saved)) = (index, saved_index) {
                restore_field(&mut ctx.data, field, saved);
            }
            if interrupted {
                return Err(Interrupted);
            }
            Ok(true)
        }
        Action::Send(send) => run_send(rt, ctx, send).await,
        Action::Cancel { send_id } => {
            // Cancelling an unknown or already-delivered id is a no-op.
            if ctx.timers.remove(send_id).is_some() {
                rt.scheduler
                    .cancel(&scheduler_key(&rt.instance_id, send_id));
            }
            Ok(true)
        }
        Action::Query(query) => run_query(rt, ctx, query).await,
        Action::Invoke(invoke) => {
            started.push(PendingInvoke {
                invoke_id: invoke.id.clone(),
                owner: state.to_string(),
            });
            Ok(true)
        }
        Action::Script(script) => match (script.run)(&mut ctx.data) {
            Ok(()) => Ok(true),
            Err(e) => {
                soft_fail(rt, ctx, format!("script '{}': {}", script.name, e));
                Ok(false)
            }
        },
    }
}

fn restore_field(data: &mut Value, field: &str, saved: Option<Value>) {
    match saved {
        Some(value) => data[field] = value,
        None => {
            if let Some(map) = data.as_object_mut() {
                map.remove(field);
            }
        }
    }
}

fn send_payload(ctx: &ExecutionContext, send: &SendAction) -> Result<Value, EvalError> {
    match &send.content {
        Some(expr) => ctx.evaluate(expr),
        None if send.params.is_empty() => Ok(Value::Null),
        None => Param::evaluate_all(&send.params, &ctx.data),
    }
}

async fn run_send(
    rt: &ActionRuntime,
    ctx: &mut ExecutionContext,
    send: &SendAction,
) -> Result<bool, Interrupted> {
    let payload = match send_payload(ctx, send) {
        Ok(payload) => payload,
        Err(e) => {
            soft_fail(rt, ctx, format!("send '{}' payload: {}", send.event, e));
            return Ok(false);
        }
    };

    match (&send.target, send.delay) {
        // To the instance's own external queue, picked up next macrostep.
        (None, None) => {
            let msg = Message::external(send.event.clone(), payload);
            if rt.external.send(msg).await.is_err() {
                comm_fail(rt, ctx, format!("send '{}': queue closed", send.event));
                return Ok(false);
            }
            Ok(true)
        }
        // Held by the scheduler; the send id is the cancellation key and is
        // validated on dequeue so a cancelled delivery cannot race in.
        (None, Some(delay)) => {
            let id = send
                .id
                .clone()
                .unwrap_or_else(|| format!("send.{}", Uuid::new_v4()));
            let msg = Message::external(send.event.clone(), payload).with_send_id(id.clone());
            ctx.timers.insert(
                id.clone(),
                PendingTimer {
                    key: id.clone(),
                    message: msg.clone(),
                    deadline: Utc::now() + chrono::Duration::milliseconds(delay.as_millis() as i64),
                    owner: None,
                },
            );
            rt.scheduler.schedule(
                scheduler_key(&rt.instance_id, &id),
                msg,
                delay,
                rt.external.clone(),
            );
            Ok(true)
        }
        // Fire and forget through the activity's service. Delivery failures
        // come back later as error.communication.
        (Some(target), _) => {
            let service = match rt.services.get(target) {
                Ok(service) => service,
                Err(e) => {
                    comm_fail(rt, ctx, format!("send '{}': {}", send.event, e));
                    return Ok(false);
                }
            };
            let event = send.event.clone();
            let external = rt.external.clone();
            let cancel = rt.cancel.child_token();
            let instance_id = rt.instance_id.clone();
            tokio::spawn(async move {
                match service.call(&event, payload, cancel).await {
                    Ok(_) | Err(ServiceError::Cancelled) => {}
                    Err(e) => {
                        warn!(instance_id = %instance_id, event = %event, error = %e, "send delivery failed");
                        let _ = external
                            .send(Message::error_communication(format!(
                                "send '{}': {}",
                                event, e
                            )))
                            .await;
                    }
                }
            });
            Ok(true)
        }
    }
}

async fn run_query(
    rt: &ActionRuntime,
    ctx: &mut ExecutionContext,
    query: &QueryAction,
) -> Result<bool, Interrupted> {
    let params = match Param::evaluate_all(&query.params, &ctx.data) {
        Ok(params) => params,
        Err(e) => {
            soft_fail(rt, ctx, format!("query '{}' params: {}", query.service, e));
            return Ok(false);
        }
    };
    let service = match rt.services.get(&query.service) {
        Ok(service) => service,
        Err(e) => {
            comm_fail(rt, ctx, format!("query '{}': {}", query.service, e));
            return Ok(false);
        }
    };

    let operation = query.id.as_deref().unwrap_or(&query.service);
    match service
        .call(operation, params, rt.cancel.child_token())
        .await
    {
        Ok(value) => {
            if let Some(location) = &query.location {
                if let Err(e) = ctx.assign(location, value) {
                    soft_fail(rt, ctx, format!("query '{}' result: {}", query.service, e));
                    return Ok(false);
                }
            }
            Ok(true)
        }
        Err(ServiceError::Cancelled) => Err(Interrupted),
        Err(e) => {
            comm_fail(rt, ctx, format!("query '{}': {}", query.service, e));
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::TokioScheduler;
    use crate::queue::InMemoryEventQueue;
    use crate::trace::{CollectingTracer, NoopTracer};
    use async_trait::async_trait;
    use rscharts_model::{ChartDocument, Expr, InvokeAction, InvokeSource, Location, StateChart};
    use serde_json::json;
    use std::time::Duration;

    fn chart() -> StateChart {
        ChartDocument::from_json(r#"{"name": "t", "states": [{"type": "state", "id": "a"}]}"#)
            .unwrap()
            .compile()
            .unwrap()
    }

    fn runtime() -> (ActionRuntime, Arc<InMemoryEventQueue>) {
        let external = Arc::new(InMemoryEventQueue::new());
        let rt = ActionRuntime {
            instance_id: "test-instance".to_string(),
            services: ServiceRegistry::new(),
            scheduler: Arc::new(TokioScheduler::new()),
            external: external.clone(),
            tracer: Arc::new(NoopTracer),
            filter: TraceFilter::all(),
            cancel: CancellationToken::new(),
        };
        (rt, external)
    }

    async fn run(
        rt: &ActionRuntime,
        ctx: &mut ExecutionContext,
        content: &[Action],
    ) -> Vec<PendingInvoke> {
        let mut started = Vec::new();
        execute_content(rt, ctx, "a", content, &mut started)
            .await
            .unwrap();
        started
    }

    #[tokio::test]
    async fn test_assign_failure_raises_and_continues() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![
            Action::Assign {
                location: Location::parse("ctx.x").unwrap(),
                expr: Expr::parse("null % 0").unwrap(),
            },
            Action::Assign {
                location: Location::parse("ctx.y").unwrap(),
                expr: Expr::parse("7").unwrap(),
            },
        ];
        run(&rt, &mut ctx, &content).await;

        assert_eq!(ctx.next_internal().unwrap().name, "error.execution");
        assert_eq!(ctx.data["y"], json!(7));
    }

    #[tokio::test]
    async fn test_foreach_binds_and_restores() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.data = json!({"items": [1, 2, 3], "acc": 0, "item": "shadowed"});

        let content = vec![Action::Foreach {
            source: Expr::parse("ctx.items").unwrap(),
            item: "item".to_string(),
            index: Some("i".to_string()),
            content: vec![
                Action::Assign {
                    location: Location::parse("ctx.acc").unwrap(),
                    expr: Expr::parse("ctx.acc * 10 + ctx.item").unwrap(),
                },
                Action::Assign {
                    location: Location::parse("ctx.last_i").unwrap(),
                    expr: Expr::parse("ctx.i").unwrap(),
                },
            ],
        }];
        run(&rt, &mut ctx, &content).await;

        // 1, 2, 3 in order gives 123; any other order gives a different digit
        // string.
        assert_eq!(ctx.data["acc"], json!(123));
        assert_eq!(ctx.data["last_i"], json!(2));
        assert_eq!(ctx.data["item"], json!("shadowed"));
        assert!(ctx.data.get("i").is_none());
        assert!(ctx.internal_queue.is_empty());
    }

    #[tokio::test]
    async fn test_foreach_non_array_raises() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.data = json!({"items": 5});

        let content = vec![Action::Foreach {
            source: Expr::parse("ctx.items").unwrap(),
            item: "item".to_string(),
            index: None,
            content: vec![],
        }];
        run(&rt, &mut ctx, &content).await;

        assert_eq!(ctx.next_internal().unwrap().name, "error.execution");
    }

    #[tokio::test]
    async fn test_if_condition_error_counts_false() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![Action::If {
            branches: vec![rscharts_model::IfBranch {
                cond: Expr::parse("null % 0").unwrap(),
                content: vec![Action::Raise {
                    event: "then".to_string(),
                }],
            }],
            else_content: vec![Action::Raise {
                event: "else".to_string(),
            }],
        }];
        run(&rt, &mut ctx, &content).await;

        assert_eq!(ctx.next_internal().unwrap().name, "error.execution");
        assert_eq!(ctx.next_internal().unwrap().name, "else");
    }

    #[tokio::test]
    async fn test_send_without_target_hits_own_queue() {
        let chart = chart();
        let (rt, external) = runtime();
        let mut ctx = ExecutionContext::new(&chart);
        ctx.data = json!({"n": 4});

        let content = vec![Action::Send(SendAction {
            event: "poked".to_string(),
            target: None,
            params: vec![Param::new("n", Expr::parse("ctx.n").unwrap())],
            content: None,
            delay: None,
            id: None,
        })];
        run(&rt, &mut ctx, &content).await;

        let msg = external.try_recv().unwrap();
        assert_eq!(msg.name, "poked");
        assert_eq!(msg.payload, json!({"n": 4}));
        assert!(msg.send_id.is_none());
    }

    #[tokio::test]
    async fn test_delayed_send_schedules_and_cancel_unschedules() {
        let chart = chart();
        let (rt, external) = runtime();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![Action::Send(SendAction {
            event: "later".to_string(),
            target: None,
            params: vec![],
            content: None,
            delay: Some(Duration::from_millis(150)),
            id: Some("reminder".to_string()),
        })];
        run(&rt, &mut ctx, &content).await;
        assert!(ctx.timers.contains_key("reminder"));
        assert_eq!(rt.scheduler.pending(), 1);

        let cancel = vec![Action::Cancel {
            send_id: "reminder".to_string(),
        }];
        run(&rt, &mut ctx, &cancel).await;
        assert!(ctx.timers.is_empty());
        assert_eq!(rt.scheduler.pending(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!external.has_pending());
    }

    struct Doubler;

    #[async_trait]
    impl crate::io::ExternalService for Doubler {
        async fn call(
            &self,
            _operation: &str,
            params: Value,
            _cancel: CancellationToken,
        ) -> Result<Value, ServiceError> {
            let n = params["n"].as_i64().unwrap_or(0);
            Ok(json!(n * 2))
        }
    }

    #[tokio::test]
    async fn test_query_writes_result_location() {
        let chart = chart();
        let (rt, _) = runtime();
        rt.services.register("math", Arc::new(Doubler));
        let mut ctx = ExecutionContext::new(&chart);
        ctx.data = json!({"n": 21});

        let content = vec![Action::Query(QueryAction {
            service: "math".to_string(),
            params: vec![Param::new("n", Expr::parse("ctx.n").unwrap())],
            location: Some(Location::parse("ctx.result").unwrap()),
            id: None,
        })];
        run(&rt, &mut ctx, &content).await;

        assert_eq!(ctx.data["result"], json!(42));
        assert!(ctx.internal_queue.is_empty());
    }

    #[tokio::test]
    async fn test_query_unknown_service_raises_communication() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![Action::Query(QueryAction {
            service: "nowhere".to_string(),
            params: vec![],
            location: None,
            id: None,
        })];
        run(&rt, &mut ctx, &content).await;

        let raised = ctx.next_internal().unwrap();
        assert_eq!(raised.name, "error.communication");
        assert!(raised.payload["reason"]
            .as_str()
            .unwrap()
            .contains("nowhere"));
    }

    #[tokio::test]
    async fn test_invoke_collects_pending() {
        let chart = chart();
        let (rt, _) = runtime();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![Action::Invoke(InvokeAction {
            id: "a.invoke.0".to_string(),
            source: InvokeSource::Registry("child".to_string()),
            input: vec![],
            location: None,
            finalize: vec![],
            autoforward: false,
        })];
        let started = run(&rt, &mut ctx, &content).await;

        assert_eq!(started.len(), 1);
        assert_eq!(started[0].invoke_id, "a.invoke.0");
        assert_eq!(started[0].owner, "a");
    }

    #[tokio::test]
    async fn test_trace_hooks_wrap_each_action() {
        let chart = chart();
        let (mut rt, _) = runtime();
        let tracer = Arc::new(CollectingTracer::new());
        rt.tracer = tracer.clone();
        let mut ctx = ExecutionContext::new(&chart);

        let content = vec![
            Action::Raise {
                event: "one".to_string(),
            },
            Action::Assign {
                location: Location::parse("ctx.x").unwrap(),
                expr: Expr::parse("null % 0").unwrap(),
            },
        ];
        run(&rt, &mut ctx, &content).await;

        let kinds = tracer.kinds();
        assert_eq!(
            kinds,
            vec![
                "before_action",
                "after_action",
                "before_action",
                "after_action"
            ]
        );
        let events = tracer.take();
        assert!(
            matches!(&events[1], TraceEvent::AfterAction { ok: true, .. }),
            "raise should succeed"
        );
        assert!(
            matches!(&events[3], TraceEvent::AfterAction { ok: false, .. }),
            "broken assign should be flagged"
        );
    }
}
