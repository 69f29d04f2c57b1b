//! Demonstration endpoint catalogue served by the `taskport` binary.

use std::time::Duration;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use crate::core::Progress;
use crate::error::{EndpointError, TaskError};
use crate::rpc::protocol::INVALID_PARAMS;
use crate::rpc::{Call, Endpoint, Registry, RegistryError, Response};

/// Register every demo endpoint.
pub fn register_all(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(echo())?;
    registry.register(sleep())?;
    registry.register(countdown())?;
    Ok(())
}

/// Returns its params unchanged, and the attached blob with them.
pub fn echo() -> Endpoint {
    Endpoint::immediate("echo", "Return the params and blob unchanged", |call: Call| async move {
        Ok(Response {
            result: call.params,
            blob: call.blob,
        })
    })
}

#[derive(Deserialize)]
struct SleepParams {
    ms: u64,
}

/// Sleeps in ten steps, reporting progress after each.
pub fn sleep() -> Endpoint {
    Endpoint::task("sleep", "Sleep for a number of milliseconds", |call: Call, progress: Progress| async move {
        let SleepParams { ms } = task_params(&call)?;
        progress.next_operation("sleeping")?;
        progress.update(0.0)?;

        let step = Duration::from_millis(ms / 10);
        for i in 1..=10 {
            pause(&progress, step).await?;
            progress.update(f64::from(i) / 10.0)?;
        }
        Ok(json!({ "slept_ms": ms }))
    })
    .params_schema(json!({
        "type": "object",
        "properties": { "ms": { "type": "integer", "minimum": 0, "maximum": 600000 } },
        "required": ["ms"]
    }))
    .result_schema(json!({
        "type": "object",
        "properties": { "slept_ms": { "type": "integer" } },
        "required": ["slept_ms"]
    }))
}

#[derive(Deserialize)]
struct CountdownParams {
    from: u32,
    #[serde(default = "default_interval")]
    interval_ms: u64,
}

fn default_interval() -> u64 {
    100
}

/// Counts down to zero, one named operation per number.
pub fn countdown() -> Endpoint {
    Endpoint::task("countdown", "Count down to zero", |call: Call, progress: Progress| async move {
        let CountdownParams { from, interval_ms } = task_params(&call)?;
        let interval = Duration::from_millis(interval_ms);

        for (done, n) in (1..=from).rev().enumerate() {
            progress.next_operation(n.to_string())?;
            progress.update(done as f64 / f64::from(from))?;
            pause(&progress, interval).await?;
        }
        progress.next_operation("liftoff")?;
        progress.update(1.0)?;
        Ok(json!("liftoff"))
    })
    .params_schema(json!({
        "type": "object",
        "properties": {
            "from": { "type": "integer", "minimum": 1, "maximum": 1000 },
            "interval_ms": { "type": "integer", "minimum": 0, "maximum": 60000 }
        },
        "required": ["from"]
    }))
    .result_schema(json!({ "type": "string" }))
}

/// Sleep, waking early when the task is cancelled.
async fn pause(progress: &Progress, duration: Duration) -> Result<(), TaskError> {
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = progress.cancelled() => Err(TaskError::Cancelled),
    }
}

/// Task bodies report bad params as a failed task.
fn task_params<P: DeserializeOwned>(call: &Call) -> Result<P, TaskError> {
    call.parse_params()
        .map_err(|e| TaskError::Failed(EndpointError::new(e.to_string()).with_code(INVALID_PARAMS)))
}
