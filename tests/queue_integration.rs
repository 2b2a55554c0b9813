//! End-to-end tests for the queue: producers, workers and recovery sharing
//! one store.
//!
//! Most tests use an in-memory database, short poll intervals and no retry
//! delay so whole job lifecycles finish within milliseconds. The
//! multi-process case shares one database file between several connections.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use serde_json::json;
use tokio::time::timeout;

use jobq::config::QueueConfig;
use jobq::error::{HandlerError, StoreError};
use jobq::queue::{Backoff, EnqueueOptions, Job, JobId, JobQueue, JobState};
use jobq::tasks::builtin::{WelcomeEmailTask, welcome_email};
use jobq::tasks::{TaskContext, TaskRegistry};
use jobq::worker::{SlotState, Worker, WorkerHandle};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn test_config(concurrency: usize) -> QueueConfig {
    QueueConfig {
        concurrency,
        poll_interval: Duration::from_millis(20),
        backoff: Backoff::immediate(),
        shutdown_grace: Duration::from_secs(2),
        recovery_interval: None,
        worker_id: "it-worker".to_string(),
        ..QueueConfig::in_memory()
    }
}

async fn test_queue(config: QueueConfig) -> Arc<JobQueue> {
    Arc::new(JobQueue::connect(config).await.unwrap())
}

fn welcome_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    registry
        .register(
            welcome_email::TASK_NAME,
            Arc::new(WelcomeEmailTask::new(Duration::from_millis(5))),
        )
        .unwrap();
    registry
}

fn welcome_payload(n: u32) -> serde_json::Value {
    json!({
        "userId": uuid::Uuid::new_v4(),
        "email": format!("test-user-{n}@example.com"),
    })
}

fn start(queue: &Arc<JobQueue>, registry: TaskRegistry) -> WorkerHandle {
    Worker::new(Arc::clone(queue), Arc::new(registry)).spawn()
}

/// Poll a job until `done` holds for it.
async fn wait_for_job(queue: &JobQueue, id: JobId, done: impl Fn(&Job) -> bool) -> Job {
    timeout(TEST_TIMEOUT, async {
        loop {
            let job = queue.get_job(id).await.unwrap().expect("job exists");
            if done(&job) {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("job did not reach the expected state in time")
}

#[tokio::test]
async fn welcome_emails_are_all_completed() {
    let queue = test_queue(test_config(1)).await;
    let mut ids = Vec::new();
    for n in 1..=3 {
        ids.push(
            queue
                .enqueue(welcome_email::TASK_NAME, welcome_payload(n), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let worker = start(&queue, welcome_registry());
    for id in &ids {
        wait_for_job(&queue, *id, |j| j.state() == JobState::Completed).await;
    }
    let summary = worker.shutdown().await;
    assert_eq!(summary.completed, 3);

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.locked, 0);
    assert_eq!(stats.total, 3);
}

#[tokio::test]
async fn always_failing_job_fails_after_max_attempts() {
    let queue = test_queue(test_config(1)).await;
    let calls = Arc::new(AtomicU32::new(0));

    let mut registry = TaskRegistry::new();
    let counter = Arc::clone(&calls);
    registry
        .register_fn("flaky", move |_payload, _ctx: TaskContext| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::retryable("upstream unavailable"))
            }
        })
        .unwrap();

    let id = queue
        .enqueue("flaky", json!({}), EnqueueOptions::default().max_attempts(2))
        .await
        .unwrap();

    let worker = start(&queue, registry);
    let job = wait_for_job(&queue, id, |j| j.state() == JobState::Failed).await;
    let summary = worker.shutdown().await;

    assert_eq!(job.attempts, 2);
    assert_eq!(job.last_error.as_deref(), Some("upstream unavailable"));
    assert!(job.locked_by.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.failed, 1);
}

#[tokio::test]
async fn reset_stuck_locks_recovers_crashed_job() {
    let queue = test_queue(test_config(1)).await;
    let id = queue
        .enqueue(welcome_email::TASK_NAME, welcome_payload(1), EnqueueOptions::default())
        .await
        .unwrap();

    // Claim and never resolve, as a crashed worker would.
    let claimed = queue.store().try_claim(id, "crashed-worker").await.unwrap().unwrap();
    assert_eq!(claimed.state(), JobState::Locked);

    let outcome = queue.reset_stuck_locks().await.unwrap();
    assert_eq!(outcome.released_count, 1);

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Pending);
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());

    // And it runs to completion afterwards.
    let worker = start(&queue, welcome_registry());
    wait_for_job(&queue, id, |j| j.state() == JobState::Completed).await;
    worker.shutdown().await;
}

#[tokio::test]
async fn concurrent_producers_lose_nothing() {
    let queue = test_queue(test_config(1)).await;

    let mut producers = tokio::task::JoinSet::new();
    for n in 0..50 {
        let queue = Arc::clone(&queue);
        producers.spawn(async move {
            queue
                .enqueue("noop", json!({ "n": n }), EnqueueOptions::default())
                .await
                .unwrap()
        });
    }

    let mut ids = HashSet::new();
    while let Some(id) = producers.join_next().await {
        assert!(ids.insert(id.unwrap()), "duplicate id");
    }
    assert_eq!(ids.len(), 50);

    let stats = queue.get_stats().await.unwrap();
    assert_eq!(stats.total, 50);
    assert_eq!(stats.pending, 50);
}

#[tokio::test]
async fn only_one_claimant_wins() {
    let queue = test_queue(test_config(1)).await;
    let id = queue
        .enqueue("t", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let mut claimants = tokio::task::JoinSet::new();
    for n in 0..10 {
        let queue = Arc::clone(&queue);
        claimants.spawn(async move {
            queue
                .store()
                .try_claim(id, &format!("worker-{n}"))
                .await
                .unwrap()
        });
    }

    let mut winners = Vec::new();
    while let Some(res) = claimants.join_next().await {
        if let Some(job) = res.unwrap() {
            winners.push(job);
        }
    }
    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].attempts, 1);

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.locked_by, winners[0].locked_by);
}

#[tokio::test]
async fn payload_reaches_handler_unchanged() {
    let queue = test_queue(test_config(1)).await;
    let payload = json!({
        "nested": { "list": [1, 2.5, "three", null, true] },
        "unicode": "héllo ✓",
    });

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("capture", move |payload, _ctx: TaskContext| {
            let tx = tx.clone();
            async move {
                tx.send(payload).ok();
                Ok::<(), HandlerError>(())
            }
        })
        .unwrap();

    queue
        .enqueue("capture", payload.clone(), EnqueueOptions::default())
        .await
        .unwrap();

    let worker = start(&queue, registry);
    let seen = timeout(TEST_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    worker.shutdown().await;
    assert_eq!(seen, payload);
}

#[tokio::test]
async fn stats_are_stable_without_writes() {
    let queue = test_queue(test_config(1)).await;
    let empty = queue.get_stats().await.unwrap();
    assert!(empty.is_empty());
    assert_eq!(empty.total, 0);

    for n in 0..3 {
        queue
            .enqueue("a", json!({ "n": n }), EnqueueOptions::default())
            .await
            .unwrap();
    }
    let id = queue
        .enqueue("b", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    queue.store().try_claim(id, "w-1").await.unwrap().unwrap();

    let first = queue.get_stats().await.unwrap();
    let second = queue.get_stats().await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first.pending, 3);
    assert_eq!(first.locked, 1);
    assert_eq!(first.workers.len(), 1);
    assert_eq!(first.workers[0].locked_by, "w-1");
    assert_eq!(first.active_jobs.len(), 1);
}

#[tokio::test]
async fn unknown_task_fails_without_retry() {
    let queue = test_queue(test_config(1)).await;
    let id = queue
        .enqueue("not_registered", json!({}), EnqueueOptions::default())
        .await
        .unwrap();

    let worker = start(&queue, welcome_registry());
    let job = wait_for_job(&queue, id, |j| j.state() == JobState::Failed).await;
    worker.shutdown().await;

    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().contains("not_registered"));
}

#[tokio::test]
async fn invalid_welcome_payload_fails_immediately() {
    let queue = test_queue(test_config(1)).await;
    let id = queue
        .enqueue(
            welcome_email::TASK_NAME,
            json!({ "userId": "not-a-uuid", "email": "x@example.com" }),
            EnqueueOptions::default(),
        )
        .await
        .unwrap();

    let worker = start(&queue, welcome_registry());
    let job = wait_for_job(&queue, id, |j| j.state() == JobState::Failed).await;
    worker.shutdown().await;

    assert_eq!(job.attempts, 1);
    assert!(job.last_error.unwrap().starts_with("Invalid payload"));
}

#[tokio::test]
async fn delayed_job_waits_for_run_at() {
    let queue = test_queue(test_config(1)).await;
    let run_at = chrono::Utc::now() + chrono::Duration::milliseconds(300);
    let id = queue
        .enqueue(
            welcome_email::TASK_NAME,
            welcome_payload(1),
            EnqueueOptions::default().run_at(run_at),
        )
        .await
        .unwrap();

    let worker = start(&queue, welcome_registry());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().state(), JobState::Pending);

    let job = wait_for_job(&queue, id, |j| j.state() == JobState::Completed).await;
    worker.shutdown().await;
    assert!(job.completed_at.unwrap() >= run_at);
}

#[tokio::test]
async fn duplicate_job_key_is_rejected() {
    let queue = test_queue(test_config(1)).await;
    let opts = EnqueueOptions::default().job_key("welcome:42");
    queue
        .enqueue(welcome_email::TASK_NAME, welcome_payload(42), opts.clone())
        .await
        .unwrap();

    let err = queue
        .enqueue(welcome_email::TASK_NAME, welcome_payload(42), opts)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::DuplicateJob { ref key } if key == "welcome:42"));
    assert_eq!(queue.get_stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn shutdown_drains_in_flight_job() {
    let queue = test_queue(test_config(1)).await;
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("slow", |_payload, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<(), HandlerError>(())
        })
        .unwrap();

    let id = queue
        .enqueue("slow", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let worker = start(&queue, registry);
    assert!(
        timeout(TEST_TIMEOUT, worker.wait_for_state(SlotState::Executing))
            .await
            .unwrap()
    );

    let summary = worker.shutdown().await;
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.abandoned, 0);
    assert_eq!(queue.get_job(id).await.unwrap().unwrap().state(), JobState::Completed);
}

#[tokio::test]
async fn job_outliving_grace_period_stays_locked() {
    let config = QueueConfig {
        shutdown_grace: Duration::from_millis(100),
        ..test_config(1)
    };
    let queue = test_queue(config).await;
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("stubborn", |_payload, _ctx: TaskContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<(), HandlerError>(())
        })
        .unwrap();

    let id = queue
        .enqueue("stubborn", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let worker = start(&queue, registry);
    assert!(
        timeout(TEST_TIMEOUT, worker.wait_for_state(SlotState::Executing))
            .await
            .unwrap()
    );

    let summary = timeout(TEST_TIMEOUT, worker.shutdown()).await.unwrap();
    assert_eq!(summary.abandoned, 1);
    assert_eq!(summary.completed, 0);

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Locked);
    assert_eq!(job.locked_by.as_deref(), Some("it-worker-0"));

    queue.reset_stuck_locks().await.unwrap();
    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Pending);
    assert_eq!(job.attempts, 1);
}

#[tokio::test]
async fn cancellation_aware_handler_is_retried_later() {
    let queue = test_queue(test_config(1)).await;
    let mut registry = TaskRegistry::new();
    registry
        .register_fn("long_poll", |_payload, ctx: TaskContext| async move {
            tokio::select! {
                _ = ctx.cancel.cancelled() => Err(HandlerError::retryable("interrupted by shutdown")),
                _ = tokio::time::sleep(Duration::from_secs(30)) => Ok(()),
            }
        })
        .unwrap();

    let id = queue
        .enqueue("long_poll", json!({}), EnqueueOptions::default())
        .await
        .unwrap();
    let worker = start(&queue, registry);
    assert!(
        timeout(TEST_TIMEOUT, worker.wait_for_state(SlotState::Executing))
            .await
            .unwrap()
    );

    let summary = timeout(TEST_TIMEOUT, worker.shutdown()).await.unwrap();
    assert_eq!(summary.retried, 1);
    assert_eq!(summary.abandoned, 0);

    let job = queue.get_job(id).await.unwrap().unwrap();
    assert_eq!(job.state(), JobState::Pending);
    assert_eq!(job.attempts, 1);
    assert_eq!(job.last_error.as_deref(), Some("interrupted by shutdown"));
}

#[tokio::test]
async fn several_workers_share_one_store() {
    let queue = test_queue(test_config(2)).await;
    let mut ids = Vec::new();
    for n in 0..20 {
        ids.push(
            queue
                .enqueue(welcome_email::TASK_NAME, welcome_payload(n), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let a = start(&queue, welcome_registry());
    let b = Worker::new(Arc::clone(&queue), Arc::new(welcome_registry()))
        .with_options(jobq::worker::WorkerOptions {
            worker_id: "other-worker".into(),
            ..jobq::worker::WorkerOptions::from_config(queue.config())
        })
        .spawn();

    for id in &ids {
        wait_for_job(&queue, *id, |j| j.state() == JobState::Completed).await;
    }
    let sa = a.shutdown().await;
    let sb = b.shutdown().await;
    assert_eq!(sa.completed + sb.completed, 20);

    for id in &ids {
        assert_eq!(queue.get_job(*id).await.unwrap().unwrap().attempts, 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn separate_connections_share_one_database_file() {
    const PROCESSES: usize = 3;
    const JOBS: u32 = 40;

    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("jobs.db");

    let mut queues = Vec::new();
    for n in 0..PROCESSES {
        let config = QueueConfig {
            database_url: path.to_str().unwrap().to_string(),
            worker_id: format!("proc-{n}"),
            ..test_config(2)
        };
        queues.push(test_queue(config).await);
    }

    let completed = Arc::new(AtomicU32::new(0));
    let mut ids = Vec::new();
    for n in 0..JOBS {
        let producer = &queues[n as usize % PROCESSES];
        ids.push(
            producer
                .enqueue("count", json!({ "n": n }), EnqueueOptions::default())
                .await
                .unwrap(),
        );
    }

    let workers: Vec<_> = queues
        .iter()
        .map(|queue| {
            let mut registry = TaskRegistry::new();
            let counter = Arc::clone(&completed);
            registry
                .register_fn("count", move |_payload, _ctx: TaskContext| {
                    let counter = Arc::clone(&counter);
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Ok::<(), HandlerError>(())
                    }
                })
                .unwrap();
            start(queue, registry)
        })
        .collect();

    let observer = &queues[0];
    timeout(Duration::from_secs(20), async {
        loop {
            let stats = observer.get_stats().await.unwrap();
            if stats.completed == JOBS as u64 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("every job should complete");

    let mut finished = 0;
    for worker in workers {
        finished += timeout(TEST_TIMEOUT, worker.shutdown()).await.unwrap().completed;
    }
    assert_eq!(finished, JOBS as u64);
    assert_eq!(completed.load(Ordering::SeqCst), JOBS);

    for id in &ids {
        let job = observer.get_job(*id).await.unwrap().unwrap();
        assert_eq!(job.state(), JobState::Completed, "job {id}");
        assert_eq!(job.attempts, 1, "job {id} ran more than once");
    }
}
