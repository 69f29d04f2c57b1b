//! Error taxonomy for request handling.
//!
//! Per-message failures are converted to error envelopes at the connection
//! boundary and never end the connection. Transport failures live in
//! [`crate::frame::FrameError`], registration failures in
//! [`crate::rpc::RegistryError`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::core::TaskId;
use crate::rpc::protocol::{
    DUPLICATE_TASK_ID, ENDPOINT_ERROR, INTERNAL_ERROR, INVALID_PARAMS, INVALID_REQUEST,
    METHOD_NOT_FOUND, PARSE_ERROR, RpcError, TASK_CANCELLED, UNKNOWN_TASK_ID,
};

/// Error raised by an endpoint handler, carrying its own code and detail.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("{message}")]
pub struct EndpointError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl EndpointError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: ENDPOINT_ERROR,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn with_data(mut self, data: impl Serialize) -> Self {
        self.data = serde_json::to_value(data).ok();
        self
    }
}

/// One schema violation found while validating parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON pointer to the offending value ("" for the root)
    pub path: String,
    pub message: String,
}

/// Per-message failure, reported to the client as an error envelope.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RpcFailure {
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    #[error("Method not found: {0}")]
    MethodNotFound(String),
    #[error("Invalid params")]
    InvalidParams(Vec<SchemaViolation>),
    #[error(transparent)]
    Endpoint(#[from] EndpointError),
    #[error("Task cancelled")]
    TaskCancelled,
    #[error("Unknown task id: {0}")]
    UnknownTaskId(TaskId),
    #[error("Duplicate task id: {0}")]
    DuplicateTaskId(TaskId),
    #[error("Unexpected condition: {0}")]
    Unexpected(String),
}

impl RpcFailure {
    pub fn code(&self) -> i32 {
        match self {
            RpcFailure::Parse(_) => PARSE_ERROR,
            RpcFailure::InvalidRequest(_) => INVALID_REQUEST,
            RpcFailure::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcFailure::InvalidParams(_) => INVALID_PARAMS,
            RpcFailure::Endpoint(e) => e.code,
            RpcFailure::TaskCancelled => TASK_CANCELLED,
            RpcFailure::UnknownTaskId(_) => UNKNOWN_TASK_ID,
            RpcFailure::DuplicateTaskId(_) => DUPLICATE_TASK_ID,
            RpcFailure::Unexpected(_) => INTERNAL_ERROR,
        }
    }

    /// Wire form of this failure.
    pub fn to_rpc_error(&self) -> RpcError {
        let data = match self {
            RpcFailure::InvalidParams(violations) => serde_json::to_value(violations).ok(),
            RpcFailure::Endpoint(e) => e.data.clone(),
            RpcFailure::UnknownTaskId(id) | RpcFailure::DuplicateTaskId(id) => {
                Some(Value::from(*id))
            }
            _ => None,
        };
        RpcError {
            code: self.code(),
            message: self.to_string(),
            data,
        }
    }
}

/// Scheduler bookkeeping failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SchedulerError {
    #[error("unknown task id {0}")]
    UnknownTaskId(TaskId),
    #[error("duplicate task id {0}")]
    DuplicateTaskId(TaskId),
}

impl From<SchedulerError> for RpcFailure {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownTaskId(id) => RpcFailure::UnknownTaskId(id),
            SchedulerError::DuplicateTaskId(id) => RpcFailure::DuplicateTaskId(id),
        }
    }
}

/// How a task body stopped short of producing a result.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TaskError {
    /// The cancellation flag was observed. Not a failure.
    #[error("task cancelled")]
    Cancelled,
    #[error(transparent)]
    Failed(#[from] EndpointError),
}

impl From<TaskError> for RpcFailure {
    fn from(err: TaskError) -> Self {
        match err {
            TaskError::Cancelled => RpcFailure::TaskCancelled,
            TaskError::Failed(e) => RpcFailure::Endpoint(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn invalid_params_lists_every_violation() {
        let failure = RpcFailure::InvalidParams(vec![
            SchemaViolation {
                path: "".into(),
                message: "\"a\" is a required property".into(),
            },
            SchemaViolation {
                path: "".into(),
                message: "\"b\" is a required property".into(),
            },
        ]);
        let err = failure.to_rpc_error();
        assert_eq!(err.code, INVALID_PARAMS);
        assert_eq!(err.data.unwrap().as_array().unwrap().len(), 2);
    }

    #[test]
    fn endpoint_error_keeps_its_code_and_detail() {
        let failure: RpcFailure = EndpointError::new("disk full")
            .with_code(-32050)
            .with_data(json!({"free": 0}))
            .into();
        let err = failure.to_rpc_error();
        assert_eq!(err.code, -32050);
        assert_eq!(err.message, "disk full");
        assert_eq!(err.data, Some(json!({"free": 0})));
    }

    #[test]
    fn cancellation_is_its_own_code() {
        let failure: RpcFailure = TaskError::Cancelled.into();
        assert_eq!(failure, RpcFailure::TaskCancelled);
        assert_eq!(failure.code(), TASK_CANCELLED);
    }
}
