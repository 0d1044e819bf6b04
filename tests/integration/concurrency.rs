//! Ceilings, cancellation and aggregation across concurrent work.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use switchboard::core::{Capability, FailureReason, RequestStatus, RequesterContext, TaskStatus};
use switchboard::worker::{Registration, TaskInvocation, Worker, WorkerFailure, WorkerRegistry};
use switchboard::Error;

use crate::fixtures::{
    as_worker, plan, start, start_with_registry, test_config, wait_for_status, Hanging, Scripted,
    Slow,
};

/// Test: Ceiling respected
/// Given six independent search steps and a ceiling of two
/// When they are dispatched
/// Then never more than two run at once and all complete
#[tokio::test(start_paused = true)]
async fn test_concurrency_ceiling_never_exceeded() {
    let search = Slow::new(Duration::from_millis(100));
    let registry = WorkerRegistry::with_builtins();
    registry
        .register_with("search", Registration::new(as_worker(&search)).with_concurrency(2))
        .unwrap();
    let orchestrator = start_with_registry(test_config(0), registry);

    let steps: Vec<String> = (1..=6).map(|i| format!("s{}", i)).collect();
    let spec: Vec<(&str, &str, &[&str])> =
        steps.iter().map(|s| (s.as_str(), "search", &[][..])).collect();

    let started = tokio::time::Instant::now();
    let response = orchestrator
        .run(&plan(&spec), RequesterContext::default())
        .await
        .unwrap();

    assert_eq!(response.status, RequestStatus::Succeeded);
    assert_eq!(search.calls(), 6);
    assert_eq!(search.peak(), 2);
    // three waves of two
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert_eq!(orchestrator.tracker().in_flight(&Capability::new("search")).await, 0);

    orchestrator.shutdown().await;
}

/// The config ceiling overrides the registration's.
#[tokio::test(start_paused = true)]
async fn test_config_ceiling_wins() {
    let report = Slow::new(Duration::from_millis(50));
    let registry = WorkerRegistry::with_builtins();
    registry
        .register_with("report", Registration::new(as_worker(&report)).with_concurrency(8))
        .unwrap();
    let mut config = test_config(0);
    config.capabilities.insert(
        "report".to_string(),
        switchboard::config::CapabilityConfig {
            concurrency: Some(1),
            timeout_secs: None,
        },
    );
    let orchestrator = start_with_registry(config, registry);

    let spec: Vec<(&str, &str, &[&str])> = vec![
        ("a", "report", &[]),
        ("b", "report", &[]),
        ("c", "report", &[]),
    ];
    let response = orchestrator
        .run(&plan(&spec), RequesterContext::default())
        .await
        .unwrap();

    assert!(response.is_success());
    assert_eq!(report.peak(), 1);
    orchestrator.shutdown().await;
}

/// Independent requests share the capability ceiling.
#[tokio::test(start_paused = true)]
async fn test_ceiling_shared_across_requests() {
    let analysis = Slow::new(Duration::from_millis(100));
    let registry = WorkerRegistry::with_builtins();
    registry
        .register_with("analysis", Registration::new(as_worker(&analysis)).with_concurrency(1))
        .unwrap();
    let orchestrator = start_with_registry(test_config(0), registry);

    let first = orchestrator
        .submit("analysis: churn", RequesterContext::default())
        .await
        .unwrap();
    let second = orchestrator
        .submit("analysis: retention", RequesterContext::default())
        .await
        .unwrap();

    assert!(orchestrator.wait_for(&first).await.unwrap().is_success());
    assert!(orchestrator.wait_for(&second).await.unwrap().is_success());
    assert_eq!(analysis.peak(), 1);
    assert_eq!(analysis.calls(), 2);

    orchestrator.shutdown().await;
}

/// Takes `delay` for the query "slow"; fails any other query transiently
/// on its first call.
struct SlowOrFlaky {
    delay: Duration,
    failed_once: AtomicBool,
    current: AtomicUsize,
    peak: AtomicUsize,
    calls: AtomicUsize,
}

impl SlowOrFlaky {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            failed_once: AtomicBool::new(false),
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl Worker for SlowOrFlaky {
    async fn invoke(&self, task: &TaskInvocation) -> Result<Value, WorkerFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let outcome = if task.query() == Some("slow") {
            tokio::time::sleep(self.delay).await;
            Ok(json!({"report": "slow done"}))
        } else if !self.failed_once.swap(true, Ordering::SeqCst) {
            Err(WorkerFailure::transient("connection reset"))
        } else {
            Ok(json!({"report": "flaky done"}))
        };
        self.current.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    fn description(&self) -> &str {
        "slow or flaky test worker"
    }
}

/// Test: Retry waits for a full ceiling
/// Given a ceiling of one, a step in backoff and a slow step holding the slot
/// When the backoff ends before the slot frees
/// Then the retry runs as soon as the slow step completes
#[tokio::test(start_paused = true)]
async fn test_due_retry_waits_for_free_slot() {
    let retrieval = SlowOrFlaky::new(Duration::from_secs(1));
    let registry = WorkerRegistry::with_builtins();
    registry
        .register_with(
            "retrieval",
            Registration::new(as_worker(&retrieval)).with_concurrency(1),
        )
        .unwrap();
    let orchestrator = start_with_registry(test_config(2), registry);
    let mut events = orchestrator.subscribe();
    let started = tokio::time::Instant::now();

    let flaky = orchestrator
        .submit("fetch: flaky", RequesterContext::default())
        .await
        .unwrap();
    wait_for_status(&mut events, flaky, "retrieval", "retrying").await;
    let slow = orchestrator
        .submit("fetch: slow", RequesterContext::default())
        .await
        .unwrap();
    wait_for_status(&mut events, slow, "retrieval", "dispatched").await;

    // the backoff (200ms) ends long before the slow step frees the slot
    let response = tokio::time::timeout(Duration::from_secs(60), orchestrator.wait_for(&flaky))
        .await
        .expect("retry dispatched once the slot frees")
        .unwrap();
    assert!(response.is_success());
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert!(started.elapsed() < Duration::from_secs(2));

    assert!(orchestrator.wait_for(&slow).await.unwrap().is_success());
    assert_eq!(retrieval.calls.load(Ordering::SeqCst), 3);
    assert_eq!(retrieval.peak.load(Ordering::SeqCst), 1);

    let task = orchestrator.tasks(&flaky).await.unwrap().remove(0);
    assert_eq!(task.attempts, 2);
    assert!(task.visited("retrying"));

    orchestrator.shutdown().await;
}

/// Test: Cancellation
/// Given a request whose worker never answers
/// When the request is cancelled
/// Then the response is cancelled and the slot frees once the attempt ends
#[tokio::test(start_paused = true)]
async fn test_cancel_in_flight_request() {
    let search = Hanging::new();
    let orchestrator = start(test_config(3), vec![("search", as_worker(&search))]);
    let mut events = orchestrator.subscribe();

    let rid = orchestrator
        .submit("search: never ends", RequesterContext::default())
        .await
        .unwrap();
    wait_for_status(&mut events, rid, "search", "dispatched").await;

    assert_eq!(orchestrator.cancel(&rid).await.unwrap(), 1);
    let response = orchestrator.wait_for(&rid).await.unwrap();
    assert_eq!(response.status, RequestStatus::Cancelled);
    assert_eq!(response.summary, "Request cancelled; 0 of 1 step completed.");

    // cancelling again is a no-op
    assert_eq!(orchestrator.cancel(&rid).await.unwrap(), 0);

    // the abandoned attempt still holds its slot until its deadline
    let search_cap = Capability::new("search");
    assert_eq!(orchestrator.tracker().in_flight(&search_cap).await, 1);
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(orchestrator.tracker().in_flight(&search_cap).await, 0);

    // the timeout is discarded, not retried
    assert_eq!(search.calls(), 1);
    let task = orchestrator.tasks(&rid).await.unwrap().remove(0);
    assert_eq!(
        task.status,
        TaskStatus::Failed {
            reason: FailureReason::Cancelled
        }
    );

    orchestrator.shutdown().await;
}

/// A result arriving after cancellation is discarded.
#[tokio::test(start_paused = true)]
async fn test_late_result_after_cancel_is_discarded() {
    let retrieval = Slow::new(Duration::from_millis(500));
    let report = Scripted::succeeding(json!({"report": "never"}));
    let orchestrator = start(
        test_config(3),
        vec![
            ("retrieval", as_worker(&retrieval)),
            ("report", as_worker(&report)),
        ],
    );
    let mut events = orchestrator.subscribe();

    let rid = orchestrator
        .submit("fetch the data then write a report", RequesterContext::default())
        .await
        .unwrap();
    wait_for_status(&mut events, rid, "retrieval", "dispatched").await;
    assert_eq!(orchestrator.cancel(&rid).await.unwrap(), 2);

    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(retrieval.calls(), 1);
    assert_eq!(report.calls(), 0);
    let tasks = orchestrator.tasks(&rid).await.unwrap();
    assert!(tasks.iter().all(|t| t.failure() == Some(&FailureReason::Cancelled)));
    assert!(tasks.iter().all(|t| t.result.is_none()));

    let response = orchestrator.aggregate(&rid).await.unwrap();
    assert_eq!(response.status, RequestStatus::Cancelled);

    orchestrator.shutdown().await;
}

/// Aggregating twice yields byte-identical responses, also after archiving.
#[tokio::test]
async fn test_aggregate_is_idempotent() {
    for archive in [false, true] {
        let mut config = test_config(0);
        config.archive_terminal = archive;
        let orchestrator = start(config, vec![]);

        let rid = orchestrator
            .submit("briefing on the ACME account", RequesterContext::default())
            .await
            .unwrap();
        let delivered = orchestrator.wait_for(&rid).await.unwrap();

        let first = serde_json::to_string(&orchestrator.aggregate(&rid).await.unwrap()).unwrap();
        let second = serde_json::to_string(&orchestrator.aggregate(&rid).await.unwrap()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, serde_json::to_string(&delivered).unwrap());

        if !archive {
            assert_eq!(orchestrator.tasks(&rid).await.unwrap().len(), 3);
        }
        orchestrator.shutdown().await;
    }
}

/// Only the most recent delivered requests are kept.
#[tokio::test]
async fn test_delivered_requests_are_bounded() {
    let mut config = test_config(0);
    config.retain_responses = 2;
    let orchestrator = start(config, vec![]);

    let mut ids = Vec::new();
    for i in 0..5 {
        let response = orchestrator
            .run(&format!("search: item {}", i), RequesterContext::default())
            .await
            .unwrap();
        assert!(orchestrator.tracker().request_count().await <= 2);
        ids.push(response.request_id);
    }

    assert!(matches!(
        orchestrator.aggregate(&ids[0]).await,
        Err(Error::RequestNotFound(id)) if id == ids[0]
    ));
    assert!(orchestrator.aggregate(&ids[4]).await.unwrap().is_success());
    orchestrator.shutdown().await;
}

/// A transport can drop a request once it has the response.
#[tokio::test]
async fn test_forget_after_delivery() {
    let orchestrator = start(switchboard::Config::default(), vec![]);

    for i in 0..3 {
        let response = orchestrator
            .run(&format!("search: item {}", i), RequesterContext::default())
            .await
            .unwrap();
        orchestrator.forget(&response.request_id).await.unwrap();
    }
    assert_eq!(orchestrator.tracker().request_count().await, 0);
    assert!(orchestrator.tracker().active_requests().await.is_empty());
    orchestrator.shutdown().await;
}

/// Aggregating before the request is terminal is refused.
#[tokio::test(start_paused = true)]
async fn test_aggregate_before_terminal() {
    let search = Hanging::new();
    let orchestrator = start(test_config(0), vec![("search", as_worker(&search))]);
    let mut events = orchestrator.subscribe();

    let rid = orchestrator
        .submit("search: slow", RequesterContext::default())
        .await
        .unwrap();
    wait_for_status(&mut events, rid, "search", "dispatched").await;

    assert!(!orchestrator.is_request_terminal(&rid).await.unwrap());
    assert!(matches!(
        orchestrator.aggregate(&rid).await,
        Err(Error::RequestNotTerminal(id)) if id == rid
    ));
    orchestrator.shutdown().await;
}

/// Test: Failure propagation through a diamond
/// Given a -> {b, c} -> d
/// When a fails permanently
/// Then b, c and d fail as upstream failures without running
#[tokio::test]
async fn test_upstream_failure_propagates_through_diamond() {
    let search = Scripted::failing("quota exceeded");
    let retrieval = Scripted::succeeding(json!({"rows": []}));
    let report = Scripted::succeeding(json!({"report": "x"}));
    let orchestrator = start(
        test_config(3),
        vec![
            ("search", as_worker(&search)),
            ("retrieval", as_worker(&retrieval)),
            ("report", as_worker(&report)),
        ],
    );

    let spec: Vec<(&str, &str, &[&str])> = vec![
        ("a", "search", &[]),
        ("b", "retrieval", &["a"]),
        ("c", "retrieval", &["a"]),
        ("d", "report", &["b", "c"]),
    ];
    let response = orchestrator
        .run(&plan(&spec), RequesterContext::default())
        .await
        .unwrap();

    assert_eq!(response.status, RequestStatus::Failed);
    assert_eq!(response.failure.as_ref().unwrap().step, "a");
    assert_eq!(retrieval.calls(), 0);
    assert_eq!(report.calls(), 0);

    for task in orchestrator.tasks(&response.request_id).await.unwrap() {
        if task.step == "a" {
            assert!(task.failure().unwrap().is_root_cause());
        } else {
            assert!(matches!(
                task.failure(),
                Some(FailureReason::UpstreamFailure { .. })
            ));
            assert_eq!(task.attempts, 0);
        }
    }
    orchestrator.shutdown().await;
}

/// One branch failing leaves the other's result in a partial response.
#[tokio::test]
async fn test_partial_response_keeps_successes() {
    let search = Scripted::succeeding(json!({"report": "three articles"}));
    let retrieval = Scripted::failing("no such table");
    let orchestrator = start(
        test_config(0),
        vec![
            ("search", as_worker(&search)),
            ("retrieval", as_worker(&retrieval)),
        ],
    );

    let response = orchestrator
        .run("briefing on ACME", RequesterContext::default())
        .await
        .unwrap();

    assert_eq!(response.status, RequestStatus::Partial);
    assert_eq!(
        response.summary,
        "1 of 3 steps completed; step 'retrieval' (retrieval) failed: no such table."
    );
    assert_eq!(response.completed.len(), 1);
    assert_eq!(response.completed[0].step, "search");
    assert!(response.text().contains("search: three articles"));
    orchestrator.shutdown().await;
}

/// A worker removed after startup rejects the request up front.
#[tokio::test]
async fn test_worker_unregistered_after_startup() {
    let orchestrator = start(test_config(0), vec![]);
    let mut events = orchestrator.subscribe();
    orchestrator.registry().unregister("analysis");

    let err = orchestrator
        .submit("analysis: churn", RequesterContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Decomposition(_)));
    assert!(events.try_recv().is_err());

    orchestrator.shutdown().await;
}
