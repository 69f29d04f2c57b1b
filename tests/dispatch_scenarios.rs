//! End-to-end scenarios over a real TCP listener.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use taskport::config::ServerConfig;
use taskport::context::ServerContext;
use taskport::core::{Progress, Scheduler, TaskEvent, TaskOutcome};
use taskport::error::TaskError;
use taskport::rpc::protocol::{TASK_CANCELLED, UNKNOWN_TASK_ID};
use taskport::rpc::{Call, ClientError, Endpoint, Registry, RpcClient, RpcServer};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

type Gate = mpsc::UnboundedSender<()>;

/// Reports 0, 0.5 and 1.0, waiting for a gate token after each report.
fn slow_job(gate: Arc<Mutex<mpsc::UnboundedReceiver<()>>>) -> Endpoint {
    Endpoint::task("slowJob", "Three gated steps", move |_call: Call, progress: Progress| {
        let gate = gate.clone();
        async move {
            let mut gate = gate.lock().await;
            for amount in [0.0, 0.5, 1.0] {
                progress.update(amount)?;
                if gate.recv().await.is_none() {
                    return Err(TaskError::Cancelled);
                }
            }
            Ok(json!("done"))
        }
    })
}

fn flush() -> Endpoint {
    Endpoint::task("flush", "Runs ahead of the queue", |_call: Call, progress: Progress| async move {
        progress.next_operation("flushing")?;
        progress.update(0.5)?;
        progress.update(1.0)?;
        Ok(json!("flushed"))
    })
    .priority()
}

struct Harness {
    addr: SocketAddr,
    ctx: ServerContext,
    gate: Gate,
    _server: Arc<RpcServer>,
}

async fn start() -> Harness {
    let (gate, rx) = mpsc::unbounded_channel();

    let mut registry = Registry::new(Scheduler::new());
    taskport::endpoints::register_all(&mut registry).unwrap();
    registry.register(slow_job(Arc::new(Mutex::new(rx)))).unwrap();
    registry.register(flush()).unwrap();

    let ctx = ServerContext::new(ServerConfig::default(), registry);
    let server = Arc::new(
        RpcServer::bind(ctx.clone(), "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap(),
    );
    let addr = server.local_addr().unwrap();
    let running = server.clone();
    tokio::spawn(async move { running.start().await });

    Harness {
        addr,
        ctx,
        gate,
        _server: server,
    }
}

async fn connect(harness: &Harness) -> RpcClient<TcpStream> {
    RpcClient::connect(harness.addr).await.unwrap()
}

async fn wait_for_amount(client: &mut RpcClient<TcpStream>, task_id: u64, amount: f64) {
    timeout(TIMEOUT, async {
        loop {
            let status = client.call("status", json!({ "id": task_id })).await.unwrap();
            if status["started"] == true && status["amount"].as_f64() == Some(amount) {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task never reached the expected progress");
}

async fn next_finished(events: &mut broadcast::Receiver<TaskEvent>) -> (Option<u64>, TaskOutcome) {
    timeout(TIMEOUT, async {
        loop {
            if let TaskEvent::Finished { id, outcome, .. } = events.recv().await.unwrap() {
                return (id, outcome);
            }
        }
    })
    .await
    .expect("no task finished")
}

fn rpc_code(err: ClientError) -> i32 {
    match err {
        ClientError::Rpc(e) => e.code,
        other => panic!("expected an RPC error, got {other}"),
    }
}

#[tokio::test]
async fn echo_and_slow_job_round_trip() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    assert_eq!(client.call("echo", json!("x")).await.unwrap(), json!("x"));

    let accepted = client.call("slowJob", Value::Null).await.unwrap();
    let task_id = accepted["task_id"].as_u64().expect("task id");

    wait_for_amount(&mut client, task_id, 0.0).await;
    harness.gate.send(()).unwrap();
    wait_for_amount(&mut client, task_id, 0.5).await;
    harness.gate.send(()).unwrap();
    wait_for_amount(&mut client, task_id, 1.0).await;
    harness.gate.send(()).unwrap();

    let result = timeout(TIMEOUT, client.call("wait", json!({ "id": task_id })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!("done"));

    let err = client.call("status", json!({ "id": task_id })).await.unwrap_err();
    assert_eq!(rpc_code(err), UNKNOWN_TASK_ID);

    // the collected id is handed out again
    let again = client.call("slowJob", Value::Null).await.unwrap();
    assert_eq!(again["task_id"].as_u64(), Some(task_id));
}

#[tokio::test]
async fn blob_round_trips_through_echo() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let (result, blob) = client
        .call_with_blob("echo", json!({ "name": "frame.raw" }), &b"\x89PNG\r\n"[..])
        .await
        .unwrap();
    assert_eq!(result, json!({ "name": "frame.raw" }));
    assert_eq!(blob.as_deref(), Some(&b"\x89PNG\r\n"[..]));

    // no blob in, plain text reply out
    assert_eq!(client.call("echo", json!(2)).await.unwrap(), json!(2));
}

#[tokio::test]
async fn cancel_queued_and_running_tasks() {
    let harness = start().await;
    let mut events = harness.ctx.scheduler().subscribe();
    let mut client = connect(&harness).await;

    let running = client.call("slowJob", Value::Null).await.unwrap()["task_id"]
        .as_u64()
        .unwrap();
    wait_for_amount(&mut client, running, 0.0).await;

    let queued = client
        .call("countdown", json!({ "from": 1, "interval_ms": 0 }))
        .await
        .unwrap()["task_id"]
        .as_u64()
        .unwrap();
    let status = client.call("status", json!({ "id": queued })).await.unwrap();
    assert_eq!(status["started"], false);

    assert_eq!(client.call("cancel", json!({ "id": queued })).await.unwrap(), json!(true));
    assert_eq!(
        next_finished(&mut events).await,
        (Some(queued), TaskOutcome::Cancelled)
    );
    let err = client.call("status", json!({ "id": queued })).await.unwrap_err();
    assert_eq!(rpc_code(err), UNKNOWN_TASK_ID);

    assert_eq!(client.call("cancel", json!({ "id": running })).await.unwrap(), json!(true));
    harness.gate.send(()).unwrap();
    assert_eq!(
        next_finished(&mut events).await,
        (Some(running), TaskOutcome::Cancelled)
    );

    let err = client.call("cancel", json!({ "id": running })).await.unwrap_err();
    assert_eq!(rpc_code(err), UNKNOWN_TASK_ID);
}

#[tokio::test]
async fn waiting_on_a_cancelled_task_reports_cancellation() {
    let harness = start().await;
    let mut waiter = connect(&harness).await;
    let mut canceller = connect(&harness).await;

    let task_id = waiter
        .call("sleep", json!({ "ms": 60000 }))
        .await
        .unwrap()["task_id"]
        .as_u64()
        .unwrap();
    wait_for_amount(&mut canceller, task_id, 0.0).await;

    let wait = tokio::spawn(async move { waiter.call("wait", json!({ "id": task_id })).await });
    // give the waiter time to subscribe before the task goes away
    sleep(Duration::from_millis(50)).await;
    canceller.call("cancel", json!({ "id": task_id })).await.unwrap();

    let err = timeout(TIMEOUT, wait).await.unwrap().unwrap().unwrap_err();
    assert_eq!(rpc_code(err), TASK_CANCELLED);
}

#[tokio::test]
async fn priority_task_finishes_before_the_reply() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let mut amounts = Vec::new();
    let accepted = client
        .call_with_progress("flush", Value::Null, |update| {
            assert_eq!(update.operation, "flushing");
            amounts.push(update.amount);
        })
        .await
        .unwrap();
    assert_eq!(amounts, vec![0.0, 0.5, 1.0]);

    let task_id = accepted["task_id"].as_u64().unwrap();
    let result = client.call("wait", json!({ "id": task_id })).await.unwrap();
    assert_eq!(result, json!("flushed"));
}

#[tokio::test]
async fn progress_notifications_follow_a_queued_task() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let accepted = client
        .call("countdown", json!({ "from": 2, "interval_ms": 1 }))
        .await
        .unwrap();
    let task_id = accepted["task_id"].as_u64().unwrap();

    let result = timeout(TIMEOUT, client.call("wait", json!({ "id": task_id })))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result, json!("liftoff"));
}

#[tokio::test]
async fn schema_violations_are_listed() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let err = client.call("countdown", json!({ "interval_ms": "soon" })).await.unwrap_err();
    let ClientError::Rpc(error) = err else {
        panic!("expected an RPC error");
    };
    assert_eq!(error.code, -32602);
    let violations = error.data.unwrap();
    assert_eq!(violations.as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn unknown_method_is_reported() {
    let harness = start().await;
    let mut client = connect(&harness).await;

    let err = client.call("render", Value::Null).await.unwrap_err();
    assert_eq!(rpc_code(err), -32601);

    // the connection survives
    assert_eq!(client.call("echo", json!(1)).await.unwrap(), json!(1));
}

#[tokio::test]
async fn dropped_connection_cancels_its_tasks() {
    let harness = start().await;
    let mut events = harness.ctx.scheduler().subscribe();
    let mut owner = connect(&harness).await;
    let mut observer = connect(&harness).await;

    let running = owner.call("slowJob", Value::Null).await.unwrap()["task_id"]
        .as_u64()
        .unwrap();
    wait_for_amount(&mut observer, running, 0.0).await;
    let queued = owner
        .call("countdown", json!({ "from": 1 }))
        .await
        .unwrap()["task_id"]
        .as_u64()
        .unwrap();

    owner.close().await;

    // queued task is dropped without running
    assert_eq!(
        next_finished(&mut events).await,
        (Some(queued), TaskOutcome::Cancelled)
    );

    // running task sees the cancellation on its next report
    harness.gate.send(()).unwrap();
    assert_eq!(
        next_finished(&mut events).await,
        (Some(running), TaskOutcome::Cancelled)
    );

    for id in [running, queued] {
        let err = observer.call("status", json!({ "id": id })).await.unwrap_err();
        assert_eq!(rpc_code(err), UNKNOWN_TASK_ID);
    }
}
