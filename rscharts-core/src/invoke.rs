//! Invoked child machines.
//!
//! A child runs as its own tokio task with its own queue and instance id,
//! sharing the parent's services, charts, scheduler and tracer. The task
//! reports the terminal outcome to the parent's external queue; a cancelled
//! child reports nothing.

use crate::datamodel::Status;
use crate::event::Message;
use crate::interpreter::Interpreter;
use crate::queue::EventQueue;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Runtime levers the parent keeps for one running child.
pub(crate) struct InvokeHandle {
    /// The child's external queue, for autoforwarded messages.
    pub child_queue: Arc<dyn EventQueue>,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

/// Live children of one interpreter, by invoke id.
#[derive(Default)]
pub(crate) struct InvokeSet {
    handles: HashMap<String, InvokeHandle>,
}

impl InvokeSet {
    pub fn insert(&mut self, invoke_id: String, handle: InvokeHandle) {
        self.handles.insert(invoke_id, handle);
    }

    pub fn get(&self, invoke_id: &str) -> Option<&InvokeHandle> {
        self.handles.get(invoke_id)
    }

    pub fn remove(&mut self, invoke_id: &str) -> Option<InvokeHandle> {
        self.handles.remove(invoke_id)
    }

    pub fn drain(&mut self) -> Vec<(String, InvokeHandle)> {
        self.handles.drain().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

/// Runs a child interpreter to a terminal status and reports the outcome.
///
/// Completed becomes `done.invoke.<id>` carrying the child's done-data,
/// failure becomes `done.invoke.error.<id>`, cancellation stays silent.
pub(crate) fn spawn_child(
    mut child: Interpreter,
    invoke_id: String,
    parent_queue: Arc<dyn EventQueue>,
) -> InvokeHandle {
    let child_queue = child.queue();
    let cancel = child.cancel_token();

    let task = tokio::spawn(async move {
        let outcome = match child.run().await {
            Ok(Status::Completed) => {
                let done_data = child.done_data().cloned().unwrap_or(Value::Null);
                Some(Message::done_invoke(&invoke_id, done_data))
            }
            Ok(Status::Cancelled) => None,
            Ok(other) => Some(Message::done_invoke_error(
                &invoke_id,
                format!("child ended {}", other.as_str()),
            )),
            Err(e) => Some(Message::done_invoke_error(&invoke_id, e.to_string())),
        };

        if let Some(msg) = outcome {
            let msg = msg.with_origin(child.instance_id());
            if parent_queue.send(msg).await.is_err() {
                debug!(invoke_id = %invoke_id, "parent queue closed before child outcome arrived");
            }
        }
    });

    InvokeHandle {
        child_queue,
        cancel,
        task,
    }
}

/// Cancels a child and waits for its task to wind down.
pub(crate) async fn cancel_child(invoke_id: &str, handle: InvokeHandle) {
    debug!(invoke_id = %invoke_id, "cancelling invoked child");
    handle.cancel.cancel();
    if handle.task.await.is_err() {
        warn!(invoke_id = %invoke_id, "invoked child task panicked");
    }
}
