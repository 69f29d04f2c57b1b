//! Endpoint registry.
//!
//! Maps method names to a parameter schema and a handler. Handlers come in
//! two flavours: immediate handlers produce the result on the spot, task
//! handlers are run by the [`Scheduler`] and the caller gets a task id back.
//! The registry is filled at startup and read-only afterwards.
//!
//! A handful of methods (`cancel`, `wait`, `status`, `methods`) are always
//! present and operate on the scheduler or the registry itself.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use jsonschema::Validator;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::core::{ConnectionId, Progress, Scheduler, Task, TaskFuture, TaskId, TaskOutcome};
use crate::error::{RpcFailure, SchemaViolation, TaskError};
use crate::frame::Outbox;

use super::protocol::{Request, RequestId};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

type ImmediateFn = Arc<dyn Fn(Call) -> BoxFuture<Result<Response, RpcFailure>> + Send + Sync>;
type TaskFn = Arc<dyn Fn(Call, Progress) -> TaskFuture + Send + Sync>;

/// Registration-time failures. Fatal at startup.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("method {0:?} is already registered")]
    DuplicateMethod(String),
    #[error("invalid {kind} schema for {method:?}: {message}")]
    InvalidSchema {
        method: String,
        kind: &'static str,
        message: String,
    },
}

/// Everything a handler gets to see about one invocation.
pub struct Call {
    pub params: Value,
    pub blob: Option<Bytes>,
    pub connection: ConnectionId,
    pub request_id: Option<RequestId>,
    registry: Arc<Registry>,
}

impl Call {
    pub fn scheduler(&self) -> &Scheduler {
        &self.registry.scheduler
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Deserialize the (already validated) parameters.
    pub fn parse_params<T: serde::de::DeserializeOwned>(&self) -> Result<T, RpcFailure> {
        T::deserialize(&self.params).map_err(|e| {
            RpcFailure::InvalidParams(vec![SchemaViolation {
                path: String::new(),
                message: e.to_string(),
            }])
        })
    }
}

/// What a request resolves to: the JSON result, and raw bytes to send back
/// with it as a binary message.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub result: Value,
    pub blob: Option<Bytes>,
}

impl Response {
    pub fn with_blob(result: Value, blob: impl Into<Bytes>) -> Self {
        Self {
            result,
            blob: Some(blob.into()),
        }
    }
}

impl From<Value> for Response {
    fn from(result: Value) -> Self {
        Self { result, blob: None }
    }
}

/// The connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Caller {
    pub connection: ConnectionId,
    /// Where progress notifications for tasks started by this caller go.
    pub outbox: Option<Outbox>,
}

impl Caller {
    pub fn new(connection: ConnectionId, outbox: Option<Outbox>) -> Self {
        Self { connection, outbox }
    }
}

#[derive(Clone)]
enum Handler {
    Immediate(ImmediateFn),
    Task { run: TaskFn, priority: bool },
}

/// A named operation.
pub struct Endpoint {
    method: String,
    description: String,
    params_schema: Value,
    result_schema: Value,
    handler: Handler,
}

impl Endpoint {
    /// An endpoint whose handler answers directly, with a [`Value`] or a
    /// [`Response`] carrying a blob.
    pub fn immediate<F, Fut, R>(
        method: impl Into<String>,
        description: impl Into<String>,
        handler: F,
    ) -> Self
    where
        F: Fn(Call) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, RpcFailure>> + Send + 'static,
        R: Into<Response> + Send + 'static,
    {
        Self::with_handler(
            method,
            description,
            Handler::Immediate(Arc::new(
                move |call: Call| -> BoxFuture<Result<Response, RpcFailure>> {
                    let answer = handler(call);
                    Box::pin(async move { answer.await.map(Into::into) })
                },
            )),
        )
    }

    /// An endpoint whose handler runs as a background task.
    pub fn task<F, Fut>(method: impl Into<String>, description: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Call, Progress) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, TaskError>> + Send + 'static,
    {
        Self::with_handler(
            method,
            description,
            Handler::Task {
                run: Arc::new(move |call: Call, progress: Progress| -> TaskFuture {
                    Box::pin(handler(call, progress))
                }),
                priority: false,
            },
        )
    }

    fn with_handler(method: impl Into<String>, description: impl Into<String>, handler: Handler) -> Self {
        Self {
            method: method.into(),
            description: description.into(),
            params_schema: json!(true),
            result_schema: json!(true),
            handler,
        }
    }

    pub fn params_schema(mut self, schema: Value) -> Self {
        self.params_schema = schema;
        self
    }

    pub fn result_schema(mut self, schema: Value) -> Self {
        self.result_schema = schema;
        self
    }

    /// Run inline on the submitting connection instead of queueing.
    /// No effect on immediate endpoints.
    pub fn priority(mut self) -> Self {
        if let Handler::Task { priority, .. } = &mut self.handler {
            *priority = true;
        }
        self
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn is_async(&self) -> bool {
        matches!(self.handler, Handler::Task { .. })
    }
}

/// Public description of an endpoint, as served by `methods`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointInfo {
    pub method: String,
    pub description: String,
    #[serde(rename = "async")]
    pub is_async: bool,
    pub priority: bool,
    pub params: Value,
    pub result: Value,
}

struct Registered {
    endpoint: Endpoint,
    params: Validator,
    result: Validator,
}

/// Method name to endpoint mapping.
pub struct Registry {
    endpoints: BTreeMap<String, Registered>,
    scheduler: Scheduler,
}

impl Registry {
    /// Create a registry holding the built-in task control methods.
    pub fn new(scheduler: Scheduler) -> Self {
        let mut registry = Self {
            endpoints: BTreeMap::new(),
            scheduler,
        };
        for endpoint in builtins() {
            // names and schemas are fixed
            if let Err(e) = registry.register(endpoint) {
                warn!(error = %e, "Failed to register built-in method");
            }
        }
        registry
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Add an endpoint. The first registration of a name wins.
    pub fn register(&mut self, endpoint: Endpoint) -> Result<(), RegistryError> {
        if self.endpoints.contains_key(&endpoint.method) {
            return Err(RegistryError::DuplicateMethod(endpoint.method));
        }

        let compile = |schema: &Value, kind: &'static str| {
            jsonschema::validator_for(schema).map_err(|e| RegistryError::InvalidSchema {
                method: endpoint.method.clone(),
                kind,
                message: e.to_string(),
            })
        };
        let params = compile(&endpoint.params_schema, "params")?;
        let result = compile(&endpoint.result_schema, "result")?;

        debug!(method = %endpoint.method, is_async = endpoint.is_async(), "Registered endpoint");
        self.endpoints.insert(
            endpoint.method.clone(),
            Registered {
                endpoint,
                params,
                result,
            },
        );
        Ok(())
    }

    /// Find the endpoint for a method name.
    pub fn lookup(&self, method: &str) -> Result<&Endpoint, RpcFailure> {
        self.resolve(method).map(|r| &r.endpoint)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Descriptions of every endpoint, ordered by method name.
    pub fn catalogue(&self) -> Vec<EndpointInfo> {
        self.endpoints
            .values()
            .map(|r| EndpointInfo {
                method: r.endpoint.method.clone(),
                description: r.endpoint.description.clone(),
                is_async: r.endpoint.is_async(),
                priority: matches!(r.endpoint.handler, Handler::Task { priority: true, .. }),
                params: r.endpoint.params_schema.clone(),
                result: r.endpoint.result_schema.clone(),
            })
            .collect()
    }

    /// Resolve, validate and run one request.
    ///
    /// Immediate endpoints return their result. A panicking handler is
    /// reported as [`RpcFailure::Unexpected`]. Task endpoints return
    /// `{"task_id": N}` once the task is admitted, or null when the request
    /// carried no id and the task is therefore untracked.
    pub async fn dispatch(self: &Arc<Self>, caller: &Caller, request: Request) -> Result<Response, RpcFailure> {
        let registered = self.resolve(&request.method)?;
        check(&registered.params, &request.params).map_err(RpcFailure::InvalidParams)?;

        let endpoint = &registered.endpoint;
        let call = Call {
            params: request.params,
            blob: request.blob,
            connection: caller.connection,
            request_id: request.id,
            registry: Arc::clone(self),
        };

        match &endpoint.handler {
            Handler::Immediate(handler) => {
                let handler = Arc::clone(handler);
                let response = AssertUnwindSafe(async move { handler(call).await })
                    .catch_unwind()
                    .await
                    .map_err(|_| {
                        error!(method = %endpoint.method, "Handler panicked");
                        RpcFailure::Unexpected(format!("handler for {:?} panicked", endpoint.method))
                    })??;
                if let Err(violations) = check(&registered.result, &response.result) {
                    warn!(method = %endpoint.method, ?violations, "Result does not match its schema");
                }
                Ok(response)
            }
            Handler::Task { run, priority } => {
                let request_id = call.request_id.clone();
                let run = Arc::clone(run);
                let mut task = Task::new(endpoint.method.clone(), caller.connection, move |progress| {
                    run(call, progress)
                })
                .with_priority(*priority);

                let Some(request_id) = request_id else {
                    self.scheduler.add(task).await?;
                    return Ok(Value::Null.into());
                };

                let id = self.scheduler.allocate_id().await;
                task = task.with_id(id).with_request(Some(request_id));
                if let Some(outbox) = &caller.outbox {
                    task = task.with_notifier(outbox.clone());
                }
                if let Err(e) = self.scheduler.add(task).await {
                    self.scheduler.release_id(id).await;
                    return Err(e.into());
                }
                Ok(json!({ "task_id": id }).into())
            }
        }
    }

    fn resolve(&self, method: &str) -> Result<&Registered, RpcFailure> {
        self.endpoints
            .get(method)
            .ok_or_else(|| RpcFailure::MethodNotFound(method.to_string()))
    }
}

fn check(validator: &Validator, instance: &Value) -> Result<(), Vec<SchemaViolation>> {
    let violations: Vec<SchemaViolation> = validator
        .iter_errors(instance)
        .map(|e| SchemaViolation {
            path: e.instance_path.to_string(),
            message: e.to_string(),
        })
        .collect();
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations)
    }
}

#[derive(Deserialize)]
struct TaskRef {
    id: TaskId,
}

fn task_ref_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "id": { "type": "integer", "minimum": 1 } },
        "required": ["id"]
    })
}

fn builtins() -> Vec<Endpoint> {
    vec![
        Endpoint::immediate("cancel", "Cancel a queued or running task", |call: Call| async move {
            let TaskRef { id } = call.parse_params()?;
            call.scheduler().cancel(id).await?;
            Ok(Value::Bool(true))
        })
        .params_schema(task_ref_schema())
        .result_schema(json!({ "type": "boolean" })),
        Endpoint::immediate(
            "wait",
            "Block until a task finishes and collect its result",
            |call: Call| async move {
                let TaskRef { id } = call.parse_params()?;
                match call.scheduler().wait(id).await? {
                    TaskOutcome::Completed(value) => Ok(value),
                    TaskOutcome::Failed(e) => Err(RpcFailure::Endpoint(e)),
                    TaskOutcome::Cancelled => Err(RpcFailure::TaskCancelled),
                }
            },
        )
        .params_schema(task_ref_schema()),
        Endpoint::immediate("status", "Current operation of a task", |call: Call| async move {
            let TaskRef { id } = call.parse_params()?;
            let snapshot = call.scheduler().current_operation(id).await?;
            serde_json::to_value(snapshot).map_err(|e| RpcFailure::Unexpected(e.to_string()))
        })
        .params_schema(task_ref_schema())
        .result_schema(json!({
            "type": "object",
            "properties": {
                "operation": { "type": "string" },
                "amount": { "type": "number", "minimum": 0, "maximum": 1 },
                "started": { "type": "boolean" }
            },
            "required": ["operation", "amount", "started"]
        })),
        Endpoint::immediate("methods", "List the available methods", |call: Call| async move {
            serde_json::to_value(call.registry().catalogue())
                .map_err(|e| RpcFailure::Unexpected(e.to_string()))
        })
        .params_schema(json!({ "type": ["object", "array", "null"] })),
    ]
}
