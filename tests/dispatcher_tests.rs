//! End-to-end dispatcher scenarios
//!
//! Drives the dispatcher through in-process worker sessions: a test worker
//! connects by opening a session over a channel and speaking the same
//! frames a WebSocket worker would. No sockets involved, so every scenario
//! is deterministic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::TimeZone;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use sandbox_gateway::Error;
use sandbox_gateway::clock::{ManualClock, SharedClock, SystemClock};
use sandbox_gateway::config::DispatcherConfig;
use sandbox_gateway::dispatcher::Dispatcher;
use sandbox_gateway::identity::{IdentityStore, IdentityVerifier, MemoryIdentityStore, WorkerType};
use sandbox_gateway::protocol::{
    CapabilityDecl, CommandDispatch, CommandError, CommandResult, DispatcherFrame, Hello,
};
use sandbox_gateway::task::{SubmitRequest, TaskMode, TaskStatus};

/// A connected test worker: exposes the dispatches it receives and lets the
/// test answer them explicitly.
struct TestWorker {
    session_id: String,
    node_id: String,
    dispatches: mpsc::Receiver<CommandDispatch>,
    dispatcher: Arc<Dispatcher>,
}

impl TestWorker {
    async fn connect(
        dispatcher: &Arc<Dispatcher>,
        node_id: &str,
        secret: &str,
        caps: &[(&str, u32)],
    ) -> Self {
        let (tx, mut rx) = mpsc::channel(32);
        let hello = Hello {
            node_id: node_id.into(),
            node_name: format!("{node_id}-name"),
            executor_kind: "python-sandbox".into(),
            capabilities: caps
                .iter()
                .map(|(name, max)| CapabilityDecl {
                    name: (*name).into(),
                    max_inflight: *max,
                })
                .collect(),
            labels: HashMap::new(),
            version: "1.0.0".into(),
            worker_secret: secret.into(),
        };
        let (_session, ack) = dispatcher
            .sessions()
            .open(hello, tx)
            .await
            .expect("worker hello accepted");

        let (dispatch_tx, dispatch_rx) = mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let DispatcherFrame::CommandDispatch(dispatch) = frame {
                    if dispatch_tx.send(dispatch).await.is_err() {
                        break;
                    }
                }
            }
        });

        Self {
            session_id: ack.session_id,
            node_id: node_id.into(),
            dispatches: dispatch_rx,
            dispatcher: Arc::clone(dispatcher),
        }
    }

    async fn next_dispatch(&mut self) -> CommandDispatch {
        tokio::time::timeout(Duration::from_secs(5), self.dispatches.recv())
            .await
            .expect("dispatch within deadline")
            .expect("session still open")
    }

    fn reply_ok(&self, command_id: &str, payload: Value) {
        self.dispatcher
            .sessions()
            .handle_result(
                &self.session_id,
                CommandResult {
                    command_id: command_id.into(),
                    payload: Some(payload),
                    error: None,
                    completed_unix_ms: 1_700_000_000_000,
                },
            )
            .expect("result accepted");
    }

    fn reply_err(&self, command_id: &str, code: &str, message: &str) {
        self.dispatcher
            .sessions()
            .handle_result(
                &self.session_id,
                CommandResult {
                    command_id: command_id.into(),
                    payload: None,
                    error: Some(CommandError {
                        code: code.into(),
                        message: message.into(),
                    }),
                    completed_unix_ms: 0,
                },
            )
            .expect("result accepted");
    }

    /// Answer every dispatch by reflecting its payload back
    fn run_echo_loop(mut self) {
        tokio::spawn(async move {
            while let Some(dispatch) = self.dispatches.recv().await {
                let _ = self.dispatcher.sessions().handle_result(
                    &self.session_id,
                    CommandResult {
                        command_id: dispatch.command_id,
                        payload: Some(dispatch.payload),
                        error: None,
                        completed_unix_ms: 1,
                    },
                );
            }
        });
    }
}

struct TestBed {
    dispatcher: Arc<Dispatcher>,
    verifier: Arc<IdentityVerifier>,
}

impl TestBed {
    async fn new() -> Self {
        Self::with(DispatcherConfig::default(), Arc::new(SystemClock)).await
    }

    async fn with(config: DispatcherConfig, clock: SharedClock) -> Self {
        let store = Arc::new(MemoryIdentityStore::new());
        let verifier = Arc::new(IdentityVerifier::new(
            store as Arc<dyn IdentityStore>,
            b"integration-test-key".to_vec(),
        ));
        let dispatcher = Dispatcher::new(Arc::clone(&verifier), clock, config);
        Self {
            dispatcher,
            verifier,
        }
    }

    async fn issue_identity(&self, node_id: &str, owner_id: &str) -> String {
        self.verifier
            .create(node_id, owner_id, WorkerType::Normal)
            .await
            .expect("identity created")
    }
}

fn submit(capability: &str, owner: &str, mode: TaskMode) -> SubmitRequest {
    SubmitRequest {
        capability: capability.into(),
        input: json!({"code": "print(1)"}),
        mode,
        timeout: Some(Duration::from_secs(60)),
        request_id: None,
        owner_id: owner.into(),
    }
}

async fn wait_for_status(
    dispatcher: &Arc<Dispatcher>,
    task_id: &str,
    owner: &str,
    wanted: TaskStatus,
) -> TaskStatus {
    for _ in 0..100 {
        let status = dispatcher
            .get_task(task_id, owner)
            .expect("task visible to owner")
            .status;
        if status == wanted || status.is_terminal() {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    dispatcher.get_task(task_id, owner).unwrap().status
}

// Scenario: echo happy path

#[tokio::test]
async fn echo_round_trip_returns_message_and_frees_capacity() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let worker = TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("echo", 1)]).await;
    worker.run_echo_loop();

    let echoed = bed
        .dispatcher
        .dispatch_echo("hello", Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(echoed, "hello");

    let stats = bed.dispatcher.inflight_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].capabilities[0].inflight, 0);
}

// Scenario: sync task success

#[tokio::test]
async fn sync_python_task_succeeds_with_exact_result() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let mut worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 4)]).await;

    let dispatcher = Arc::clone(&bed.dispatcher);
    let submit_handle = tokio::spawn(async move {
        dispatcher
            .submit_task(SubmitRequest {
                capability: "pythonExec".into(),
                input: json!({"code": "print(1)"}),
                mode: TaskMode::Sync,
                timeout: Some(Duration::from_millis(60_000)),
                request_id: None,
                owner_id: "acct-1".into(),
            })
            .await
    });

    let dispatch = worker.next_dispatch().await;
    assert_eq!(dispatch.capability, "pythonExec");
    assert_eq!(dispatch.payload, json!({"code": "print(1)"}));
    worker.reply_ok(
        &dispatch.command_id,
        json!({"output": "1\n", "stderr": "", "exit_code": 0}),
    );

    let result = submit_handle.await.unwrap().unwrap();
    assert!(result.completed);
    assert_eq!(result.task.status, TaskStatus::Succeeded);
    assert_eq!(
        result.task.result,
        Some(json!({"output": "1\n", "stderr": "", "exit_code": 0}))
    );
    assert!(result.task.completed_at.is_some());
    assert_eq!(result.task.node_id.as_deref(), Some("node-1"));
}

// Scenario: async task with deferred result

#[tokio::test]
async fn async_task_defers_result_until_worker_replies() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let mut worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 4)]).await;

    let result = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-1", TaskMode::Async))
        .await
        .unwrap();
    assert!(!result.completed);
    let task_id = result.task.task_id.clone();

    // Visible as running while the worker sits on the command.
    let running = bed.dispatcher.get_task(&task_id, "acct-1").unwrap();
    assert_eq!(running.status, TaskStatus::Running);

    let dispatch = worker.next_dispatch().await;
    worker.reply_ok(&dispatch.command_id, json!({"output": "done"}));

    let status = wait_for_status(&bed.dispatcher, &task_id, "acct-1", TaskStatus::Succeeded).await;
    assert_eq!(status, TaskStatus::Succeeded);
    assert_eq!(
        bed.dispatcher.get_task(&task_id, "acct-1").unwrap().result,
        Some(json!({"output": "done"}))
    );
}

// Scenario: idempotent retry within the same owner

#[tokio::test]
async fn concurrent_same_key_submits_share_one_task() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 4)]).await;
    worker.run_echo_loop();

    let request = SubmitRequest {
        capability: "pythonExec".into(),
        input: json!({"code": "print(1)"}),
        mode: TaskMode::Sync,
        timeout: Some(Duration::from_secs(30)),
        request_id: Some("req-1".into()),
        owner_id: "acct-1".into(),
    };

    let a = tokio::spawn({
        let dispatcher = Arc::clone(&bed.dispatcher);
        let request = request.clone();
        async move { dispatcher.submit_task(request).await }
    });
    let b = tokio::spawn({
        let dispatcher = Arc::clone(&bed.dispatcher);
        let request = request.clone();
        async move { dispatcher.submit_task(request).await }
    });

    let a = a.await.unwrap().unwrap();
    let b = b.await.unwrap().unwrap();
    assert_eq!(a.task.task_id, b.task.task_id);

    // A retry after the terminal state replays the same task.
    let replay = bed.dispatcher.submit_task(request.clone()).await.unwrap();
    assert_eq!(replay.task.task_id, a.task.task_id);
    assert!(replay.completed);

    // The same request id under another owner is a different task.
    let mut foreign = request;
    foreign.owner_id = "acct-2".into();
    let c = bed.dispatcher.submit_task(foreign).await.unwrap();
    assert_ne!(c.task.task_id, a.task.task_id);
}

// Scenario: cross-owner isolation

#[tokio::test]
async fn tasks_are_invisible_across_owners() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-a").await;
    let worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 4)]).await;
    worker.run_echo_loop();

    let result = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-a", TaskMode::Sync))
        .await
        .unwrap();
    let task_id = result.task.task_id;

    assert!(bed.dispatcher.get_task(&task_id, "acct-b").is_none());
    let err = bed
        .dispatcher
        .cancel_task(&task_id, "acct-b")
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // The owner still sees it.
    assert!(bed.dispatcher.get_task(&task_id, "acct-a").is_some());
}

// Scenario: no-capacity failure

#[tokio::test]
async fn second_submit_fails_fast_when_single_slot_is_busy() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let mut worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 1)]).await;

    // First task occupies the only slot; the worker holds the command.
    let first = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-1", TaskMode::Async))
        .await
        .unwrap();
    assert_eq!(first.task.status, TaskStatus::Running);
    let held = worker.next_dispatch().await;

    let started = std::time::Instant::now();
    let second = bed
        .dispatcher
        .submit_task(SubmitRequest {
            timeout: Some(Duration::from_secs(1)),
            ..submit("pythonExec", "acct-1", TaskMode::Sync)
        })
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(second.task.status, TaskStatus::Failed);
    assert_eq!(second.task.error_code.as_deref(), Some("no_capacity"));

    // The first task is unaffected and still completes.
    worker.reply_ok(&held.command_id, json!({"output": "ok"}));
    let status = wait_for_status(
        &bed.dispatcher,
        &first.task.task_id,
        "acct-1",
        TaskStatus::Succeeded,
    )
    .await;
    assert_eq!(status, TaskStatus::Succeeded);
}

// Scenario: session replacement

#[tokio::test]
async fn reconnect_fails_inflight_command_and_serves_new_dispatches() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let mut first_conn =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 1)]).await;

    let pending = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-1", TaskMode::Async))
        .await
        .unwrap();
    let _held = first_conn.next_dispatch().await;

    // Same node reconnects with a fresh hello.
    let second_conn =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 1)]).await;
    assert_ne!(first_conn.session_id, second_conn.session_id);
    second_conn.run_echo_loop();

    // The superseded session's command fails with session_closed.
    let status = wait_for_status(
        &bed.dispatcher,
        &pending.task.task_id,
        "acct-1",
        TaskStatus::Failed,
    )
    .await;
    assert_eq!(status, TaskStatus::Failed);
    assert_eq!(
        bed.dispatcher
            .get_task(&pending.task.task_id, "acct-1")
            .unwrap()
            .error_code
            .as_deref(),
        Some("session_closed")
    );

    // The new session accepts fresh work.
    let fresh = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-1", TaskMode::Sync))
        .await
        .unwrap();
    assert_eq!(fresh.task.status, TaskStatus::Succeeded);
    assert_eq!(fresh.task.node_id.as_deref(), Some(first_conn.node_id.as_str()));
}

// Scenario: heartbeat timeout

#[tokio::test]
async fn silent_worker_goes_offline_and_stops_receiving_work() {
    let clock = Arc::new(ManualClock::new(
        chrono::Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
    ));
    let bed = TestBed::with(
        DispatcherConfig::default(),
        Arc::clone(&clock) as SharedClock,
    )
    .await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let _worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("pythonExec", 1)]).await;

    let stats = bed.dispatcher.registry_stats();
    assert_eq!(stats.online, 1);

    // Silence past offline_ttl (60s default) plus a little slack.
    clock.advance(chrono::Duration::seconds(61));

    let stats = bed.dispatcher.registry_stats();
    assert_eq!(stats.online, 0);
    assert_eq!(stats.offline, 1);

    let result = bed
        .dispatcher
        .submit_task(submit("pythonExec", "acct-1", TaskMode::Sync))
        .await
        .unwrap();
    assert_eq!(result.task.status, TaskStatus::Failed);
    assert_eq!(result.task.error_code.as_deref(), Some("no_worker"));
}

// Boundary: owner-pinned capabilities route only to the caller's workers

#[tokio::test]
async fn owner_pinned_capability_requires_own_worker() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-a").await;
    let worker = TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("hostExec", 1)]).await;
    worker.run_echo_loop();

    // The owning account reaches its worker.
    let mine = bed
        .dispatcher
        .submit_task(submit("hostExec", "acct-a", TaskMode::Sync))
        .await
        .unwrap();
    assert_eq!(mine.task.status, TaskStatus::Succeeded);

    // Another account gets no_worker even though the capability is online.
    let theirs = bed
        .dispatcher
        .submit_task(submit("hostExec", "acct-b", TaskMode::Sync))
        .await
        .unwrap();
    assert_eq!(theirs.task.status, TaskStatus::Failed);
    assert_eq!(theirs.task.error_code.as_deref(), Some("no_worker"));
}

// Boundary: worker errors surface verbatim on the task

#[tokio::test]
async fn worker_error_pair_lands_on_the_task() {
    let bed = TestBed::new().await;
    let secret = bed.issue_identity("node-1", "acct-1").await;
    let mut worker =
        TestWorker::connect(&bed.dispatcher, "node-1", &secret, &[("terminalExec", 2)]).await;

    let dispatcher = Arc::clone(&bed.dispatcher);
    let submit_handle = tokio::spawn(async move {
        dispatcher
            .submit_task(submit("terminalExec", "acct-1", TaskMode::Sync))
            .await
    });

    let dispatch = worker.next_dispatch().await;
    worker.reply_err(&dispatch.command_id, "session_busy", "shell session occupied");

    let result = submit_handle.await.unwrap().unwrap();
    assert_eq!(result.task.status, TaskStatus::Failed);
    assert_eq!(result.task.error_code.as_deref(), Some("session_busy"));
    assert_eq!(
        result.task.error_message.as_deref(),
        Some("shell session occupied")
    );
}
