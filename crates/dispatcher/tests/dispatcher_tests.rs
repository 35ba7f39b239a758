use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router as AxumRouter};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use yggdrasil_client::{BreakerRegistry, CloudFallback, ResilientClient, RetryPolicy};
use yggdrasil_dispatcher::{Dispatcher, HandlerRegistry, HostPool, Router};
use yggdrasil_domain::{Capability, CircuitState, HostDescriptor, Task, TaskStatus};
use yggdrasil_ledger::{Ledger, TaskUpdate};
use yggdrasil_observability::{ErrorTracker, EventLog, MetricsCollector};

async fn spawn_stub(app: AxumRouter) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn chat_body(content: &str) -> Value {
    json!({
        "choices": [{"message": {"role": "assistant", "content": content}}],
        "usage": {"prompt_tokens": 7, "completion_tokens": 2},
    })
}

fn text_host(name: &str, addr: SocketAddr) -> HostDescriptor {
    HostDescriptor {
        name: name.to_string(),
        url: format!("http://{addr}"),
        model: "llama3.2:3b".to_string(),
        capabilities: vec![Capability::Text, Capability::General],
        priority: 1,
        timeout: Duration::from_secs(10),
    }
}

fn test_routing() -> HashMap<String, Vec<Capability>> {
    let mut routing = HashMap::new();
    routing.insert("text-processing".to_string(), vec![Capability::Text]);
    routing.insert("code-generation".to_string(), vec![Capability::Code]);
    routing.insert(
        "general".to_string(),
        vec![Capability::Reasoning, Capability::General],
    );
    routing
}

struct Bed {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<()>,
    client: Arc<ResilientClient>,
    pool: Arc<HostPool>,
}

async fn launch(
    ledger: Ledger,
    hosts: Vec<HostDescriptor>,
    concurrency: usize,
    max_attempts: u32,
    failure_threshold: u32,
    cloud: Option<CloudFallback>,
    log_dir: &Path,
) -> Bed {
    let events = Arc::new(EventLog::open(log_dir).await.unwrap());
    let limits: Vec<(String, usize)> = hosts
        .iter()
        .map(|h| (h.name.clone(), concurrency))
        .collect();

    let router = Arc::new(Router::new(
        hosts,
        test_routing(),
        None,
        Arc::clone(&events),
    ));
    let pool = Arc::new(HostPool::new(limits));
    let policy = RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        exponential_base: 2.0,
        jitter: false,
    };
    let breakers = Arc::new(BreakerRegistry::new(
        failure_threshold,
        Duration::from_secs(300),
    ));
    let client = Arc::new(ResilientClient::new(
        policy,
        breakers,
        cloud,
        Arc::clone(&events),
    ));

    let dispatcher = Dispatcher::new(
        ledger,
        router,
        Arc::clone(&pool),
        HandlerRegistry::builtin(),
        Arc::clone(&client),
        events,
        Arc::new(MetricsCollector::new()),
        Arc::new(ErrorTracker::disabled()),
        Duration::from_millis(50),
        Duration::from_millis(300),
    );

    let (shutdown, rx) = broadcast::channel(4);
    let handle = tokio::spawn(dispatcher.run(rx));
    Bed {
        shutdown,
        handle,
        client,
        pool,
    }
}

async fn scratch_ledger() -> (TempDir, Ledger) {
    let dir = tempfile::tempdir().unwrap();
    let ledger = Ledger::open(dir.path().join("ledger.sqlite")).await.unwrap();
    (dir, ledger)
}

async fn wait_for_status(ledger: &Ledger, task_id: &str, status: TaskStatus) -> Task {
    for _ in 0..250 {
        let task = ledger.get(task_id).await.unwrap();
        if task.status == status {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {task_id} never reached {status}");
}

fn events_named(log_dir: &Path, name: &str) -> usize {
    let content =
        std::fs::read_to_string(log_dir.join("dispatcher.jsonl")).unwrap_or_default();
    content
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .filter(|event| event["event"] == name)
        .count()
}

#[tokio::test]
async fn happy_path_closes_task_with_result() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async { Json(chat_body("hello")) }),
    ))
    .await;

    ledger
        .create(
            &Task::new("t1", "echo hello")
                .with_type("text-processing")
                .with_priority(2)
                .with_description("echo hello"),
        )
        .await
        .unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        1,
        3,
        None,
        dir.path(),
    )
    .await;

    let task = wait_for_status(&ledger, "t1", TaskStatus::Closed).await;
    assert_eq!(task.result.as_deref(), Some("hello"));
    assert_eq!(task.attempt_count, 1);

    let audit = ledger.audit("t1").await.unwrap();
    let transitions: Vec<(TaskStatus, TaskStatus)> = audit
        .iter()
        .map(|entry| (entry.old_status, entry.new_status))
        .collect();
    assert_eq!(
        transitions,
        vec![
            (TaskStatus::Open, TaskStatus::InProgress),
            (TaskStatus::InProgress, TaskStatus::Closed),
        ]
    );

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
    assert_eq!(events_named(dir.path(), "task_started"), 1);
    assert_eq!(events_named(dir.path(), "task_completed"), 1);
}

#[tokio::test]
async fn retry_then_success_counts_attempts() {
    let (dir, ledger) = scratch_ledger().await;
    let calls = Arc::new(AtomicU32::new(0));
    let app = AxumRouter::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(calls): State<Arc<AtomicU32>>| async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err((StatusCode::INTERNAL_SERVER_ERROR, "transient"))
                    } else {
                        Ok(Json(chat_body("ok")))
                    }
                },
            ),
        )
        .with_state(Arc::clone(&calls));
    let addr = spawn_stub(app).await;

    ledger
        .create(&Task::new("t1", "flaky").with_type("text-processing"))
        .await
        .unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        3,
        3,
        None,
        dir.path(),
    )
    .await;

    let task = wait_for_status(&ledger, "t1", TaskStatus::Closed).await;
    assert_eq!(task.result.as_deref(), Some("ok"));
    assert_eq!(task.attempt_count, 3);

    // Two failures stay below the breaker threshold of three.
    assert_eq!(
        bed.client.breakers().state("fenrir-chat").await,
        CircuitState::Closed
    );

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
    assert_eq!(events_named(dir.path(), "task_retry_scheduled"), 2);
}

#[tokio::test]
async fn breaker_opens_and_cloud_fallback_completes_task() {
    let (dir, ledger) = scratch_ledger().await;
    let bad_addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "down") }),
    ))
    .await;
    let cloud_addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async { Json(chat_body("fallback")) }),
    ))
    .await;

    std::env::set_var("YGG_DISPATCH_TEST_KEY", "sk-test");
    let cloud = CloudFallback {
        endpoint: format!("http://{cloud_addr}/v1/chat/completions"),
        model: "claude-sonnet".to_string(),
        credential_env: "YGG_DISPATCH_TEST_KEY".to_string(),
        task_types: vec!["text-processing".to_string()],
        timeout: Duration::from_secs(5),
    };

    ledger
        .create(&Task::new("t1", "needs fallback").with_type("text-processing"))
        .await
        .unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", bad_addr)],
        1,
        3,
        3,
        Some(cloud),
        dir.path(),
    )
    .await;

    let task = wait_for_status(&ledger, "t1", TaskStatus::Closed).await;
    assert_eq!(task.result.as_deref(), Some("fallback"));
    assert_eq!(
        bed.client.breakers().state("fenrir-chat").await,
        CircuitState::Open
    );

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
    assert_eq!(events_named(dir.path(), "breaker_opened"), 1);
}

#[tokio::test]
async fn dispatch_order_follows_priority_then_created_at() {
    let (dir, ledger) = scratch_ledger().await;
    let order = Arc::new(tokio::sync::Mutex::new(Vec::<String>::new()));
    let app = AxumRouter::new()
        .route(
            "/v1/chat/completions",
            post(
                move |State(order): State<Arc<tokio::sync::Mutex<Vec<String>>>>,
                      Json(body): Json<Value>| async move {
                    // text-processing prompts are the task description.
                    let prompt = body["messages"][0]["content"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string();
                    order.lock().await.push(prompt);
                    Json(chat_body("done"))
                },
            ),
        )
        .with_state(Arc::clone(&order));
    let addr = spawn_stub(app).await;

    let base = chrono::Utc::now();
    for (i, (id, priority)) in [("t-low", 2i64), ("t-crit", 0), ("t-mid", 1)]
        .iter()
        .enumerate()
    {
        let mut task = Task::new(*id, *id)
            .with_type("text-processing")
            .with_priority(*priority)
            .with_description(*id);
        task.created_at = base + chrono::Duration::milliseconds(i as i64);
        task.updated_at = task.created_at;
        ledger.create(&task).await.unwrap();
    }

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        1,
        3,
        None,
        dir.path(),
    )
    .await;

    for id in ["t-crit", "t-mid", "t-low"] {
        wait_for_status(&ledger, id, TaskStatus::Closed).await;
    }

    assert_eq!(
        *order.lock().await,
        vec!["t-crit".to_string(), "t-mid".to_string(), "t-low".to_string()]
    );

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
}

#[tokio::test]
async fn executor_dispatch_round_trip_closes_with_echoed_output() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/execute",
        post(|Json(body): Json<Value>| async move {
            Json(json!({
                "task_id": body["task_id"],
                "type": body["type"],
                "status": "completed",
                "output": body["params"]["text"],
                "duration_seconds": 0.1,
            }))
        }),
    ))
    .await;

    let mut task = Task::new("t1", "echo via executor").with_type("dev-echo");
    task.params = json!({"text": "hello"});
    ledger.create(&task).await.unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-executor", addr)],
        1,
        1,
        3,
        None,
        dir.path(),
    )
    .await;

    let task = wait_for_status(&ledger, "t1", TaskStatus::Closed).await;
    assert_eq!(task.result.as_deref(), Some("hello"));

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
}

#[tokio::test]
async fn non_retryable_failure_blocks_task_with_report() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async { (StatusCode::BAD_REQUEST, "prompt rejected") }),
    ))
    .await;

    ledger
        .create(&Task::new("t1", "bad prompt").with_type("text-processing"))
        .await
        .unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        3,
        3,
        None,
        dir.path(),
    )
    .await;

    let task = wait_for_status(&ledger, "t1", TaskStatus::Blocked).await;
    let report = task.error.unwrap();
    assert!(report.contains("ERROR REPORT"));
    assert!(report.contains("invalid_payload"));

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
    assert_eq!(events_named(dir.path(), "task_failed"), 1);
}

#[tokio::test]
async fn shutdown_under_load_blocks_in_flight_and_releases_slots() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_secs(120)).await;
            Json(chat_body("too late"))
        }),
    ))
    .await;

    for id in ["t1", "t2", "t3"] {
        ledger
            .create(&Task::new(id, "slow").with_type("text-processing"))
            .await
            .unwrap();
    }

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        3,
        1,
        5,
        None,
        dir.path(),
    )
    .await;

    for id in ["t1", "t2", "t3"] {
        wait_for_status(&ledger, id, TaskStatus::InProgress).await;
    }

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();

    for id in ["t1", "t2", "t3"] {
        let task = ledger.get(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Blocked);
        assert!(task.error.unwrap().contains("shutdown"));
    }

    let status = bed.pool.status().await;
    assert_eq!(status["fenrir-chat"].available, 3);
    assert_eq!(status["fenrir-chat"].active, 0);

    assert_eq!(events_named(dir.path(), "shutdown_begin"), 1);
    assert_eq!(events_named(dir.path(), "shutdown_end"), 1);
}

#[tokio::test]
async fn cancelled_mid_flight_result_is_discarded() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async {
            tokio::time::sleep(Duration::from_millis(400)).await;
            Json(chat_body("late result"))
        }),
    ))
    .await;

    ledger
        .create(&Task::new("t1", "doomed").with_type("text-processing"))
        .await
        .unwrap();

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        1,
        3,
        None,
        dir.path(),
    )
    .await;

    wait_for_status(&ledger, "t1", TaskStatus::InProgress).await;
    ledger
        .update("t1", TaskStatus::Cancelled, TaskUpdate::default())
        .await
        .unwrap();

    // Let the handler finish and attempt its (discarded) commit.
    tokio::time::sleep(Duration::from_millis(700)).await;

    let task = ledger.get("t1").await.unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert!(task.result.is_none());

    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();
}

#[tokio::test]
async fn idle_polls_emit_no_per_task_events() {
    let (dir, ledger) = scratch_ledger().await;
    let addr = spawn_stub(AxumRouter::new().route(
        "/v1/chat/completions",
        post(|| async { Json(chat_body("unused")) }),
    ))
    .await;

    let bed = launch(
        ledger.clone(),
        vec![text_host("fenrir-chat", addr)],
        1,
        1,
        3,
        None,
        dir.path(),
    )
    .await;

    tokio::time::sleep(Duration::from_millis(250)).await;
    bed.shutdown.send(()).unwrap();
    bed.handle.await.unwrap();

    assert_eq!(events_named(dir.path(), "task_started"), 0);
    assert_eq!(events_named(dir.path(), "task_completed"), 0);
    assert_eq!(events_named(dir.path(), "shutdown_begin"), 1);
    assert_eq!(events_named(dir.path(), "shutdown_end"), 1);
}
