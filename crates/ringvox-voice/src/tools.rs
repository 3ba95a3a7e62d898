//! Execution of model-requested function calls.
//!
//! Each call announced on the event channel is executed against the backend
//! on its own task. Outstanding calls live in a pending map keyed by
//! `call_id`; removing the entry is the single point that reports a result,
//! so every call is answered with exactly one `function_call_output` and one
//! `response.create`.

use crate::backend::BackendClient;
use crate::channel::{EventChannel, RawToolCall};
use ringvox_types::{HostMessage, SystemAction, ToolExecutionRequest};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Completed,
    Failed,
}

/// A resolved function call as reported to observers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub call_id: String,
    pub name: String,
    pub arguments: String,
    pub status: ToolCallStatus,
    /// The output sent back to the model.
    pub output: String,
}

/// What the invoker needs from whoever owns the session.
pub trait ToolHost: Send + Sync {
    /// Forwards a message to the embedding host.
    fn host_message(&self, message: HostMessage);
    /// Asks for the session to be torn down after `delay`.
    fn request_disconnect(&self, delay: Duration);
    /// Called once per call, after its result was sent.
    fn tool_resolved(&self, call: ToolCall);
}

#[derive(Debug)]
struct PendingCall {
    name: String,
    task: AbortHandle,
}

#[derive(Debug)]
struct Resolution {
    output: String,
    status: ToolCallStatus,
    host: Vec<HostMessage>,
    disconnect: bool,
}

impl Resolution {
    fn completed(output: String) -> Self {
        Self {
            output,
            status: ToolCallStatus::Completed,
            host: Vec::new(),
            disconnect: false,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            output: serde_json::json!({ "error": message }).to_string(),
            status: ToolCallStatus::Failed,
            host: Vec::new(),
            disconnect: false,
        }
    }
}

struct Shared {
    session_id: Uuid,
    backend: BackendClient,
    channel: Arc<EventChannel>,
    host: Arc<dyn ToolHost>,
    collections: HashMap<String, String>,
    disconnect_grace: Duration,
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl Shared {
    fn pending(&self) -> MutexGuard<'_, HashMap<String, PendingCall>> {
        match self.pending.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    async fn execute(&self, call: &RawToolCall) -> Resolution {
        let arguments: Value = match serde_json::from_str(&call.arguments) {
            Ok(arguments) => arguments,
            Err(e) => {
                warn!(session_id = %self.session_id, call_id = %call.call_id, error = %e, "malformed tool arguments");
                return Resolution::failed(format!("invalid arguments: {e}"));
            }
        };

        let request = ToolExecutionRequest {
            tool_name: call.name.clone(),
            arguments,
        };
        let response = match self.backend.execute_tool(&request).await {
            Ok(response) => response,
            Err(e) => {
                warn!(session_id = %self.session_id, call_id = %call.call_id, error = %e, "tool execution failed");
                return Resolution::failed(e.to_string());
            }
        };
        if !response.success {
            let message = response.error.unwrap_or_else(|| "Error".to_string());
            info!(session_id = %self.session_id, call_id = %call.call_id, tool = %call.name, error = %message, "tool reported failure");
            return Resolution::failed(message);
        }

        let result = response.result.clone().unwrap_or(Value::Null);
        let mut resolution = Resolution::completed(result.to_string());
        match response.action() {
            SystemAction::None => {}
            SystemAction::Disconnect => resolution.disconnect = true,
            SystemAction::OpenUrl => match response.url {
                Some(url) => resolution.host.push(HostMessage::OpenUrl { url }),
                None => warn!(session_id = %self.session_id, call_id = %call.call_id, "open_url action without url"),
            },
            SystemAction::OpenModule => match response.module {
                Some(module) => resolution.host.push(HostMessage::OpenModule { module }),
                None => warn!(session_id = %self.session_id, call_id = %call.call_id, "open_module action without module"),
            },
        }
        if let Some(collection) = self.collections.get(&call.name) {
            resolution.host.push(HostMessage::DataChanged {
                collection: collection.clone(),
            });
        }
        resolution
    }

    async fn resolve(&self, call: RawToolCall, resolution: Resolution) {
        if self.pending().remove(&call.call_id).is_none() {
            debug!(session_id = %self.session_id, call_id = %call.call_id, "tool call no longer pending");
            return;
        }

        for message in resolution.host {
            self.host.host_message(message);
        }
        self.channel
            .send_tool_result(&call.call_id, &resolution.output)
            .await;
        self.channel.send_response_create().await;
        info!(
            session_id = %self.session_id,
            call_id = %call.call_id,
            tool = %call.name,
            status = ?resolution.status,
            "tool call resolved"
        );

        self.host.tool_resolved(ToolCall {
            call_id: call.call_id,
            name: call.name,
            arguments: call.arguments,
            status: resolution.status,
            output: resolution.output,
        });
        if resolution.disconnect {
            self.host.request_disconnect(self.disconnect_grace);
        }
    }
}

/// Runs function calls for one connected session. Clones share the pending
/// map.
#[derive(Clone)]
pub struct ToolInvoker {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for ToolInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolInvoker")
            .field("session_id", &self.shared.session_id)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl ToolInvoker {
    pub fn new(
        session_id: Uuid,
        backend: BackendClient,
        channel: Arc<EventChannel>,
        host: Arc<dyn ToolHost>,
        collections: HashMap<String, String>,
        disconnect_grace: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                session_id,
                backend,
                channel,
                host,
                collections,
                disconnect_grace,
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Starts executing `call`. A `call_id` that is already outstanding is
    /// ignored.
    pub fn handle(&self, call: RawToolCall) {
        let mut pending = self.shared.pending();
        if let Some(existing) = pending.get(&call.call_id) {
            warn!(
                session_id = %self.shared.session_id,
                call_id = %call.call_id,
                tool = %existing.name,
                "duplicate tool call ignored"
            );
            return;
        }

        debug!(session_id = %self.shared.session_id, call_id = %call.call_id, tool = %call.name, "executing tool call");
        let call_id = call.call_id.clone();
        let name = call.name.clone();
        let shared = Arc::clone(&self.shared);
        // The map lock is held until the entry exists, so the task cannot
        // resolve before it is registered.
        let task = tokio::spawn(async move {
            let resolution = shared.execute(&call).await;
            shared.resolve(call, resolution).await;
        });
        pending.insert(
            call_id,
            PendingCall {
                name,
                task: task.abort_handle(),
            },
        );
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending().len()
    }

    /// Aborts every outstanding call without reporting results. Returns how
    /// many were aborted.
    pub fn abort_all(&self) -> usize {
        let drained: Vec<(String, PendingCall)> = self.shared.pending().drain().collect();
        for (call_id, call) in &drained {
            debug!(session_id = %self.shared.session_id, call_id = %call_id, tool = %call.name, "aborting tool call");
            call.task.abort();
        }
        drained.len()
    }
}
