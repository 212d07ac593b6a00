//! Task store integration tests: dedup, backoff, recurrence, lease
//! reclaim, ordering, and pagination.
use std::sync::Arc;

use chrono::{Duration, Utc};
use crawl_orchestrator::core::{ErrorKind, ParserTag, Priority, TaskStatus, TaskStore};
use crawl_orchestrator::store::{
    AttemptOutcome, MemoryTaskStore, NewHost, NewTaskOptions, TaskFilter, TaskPatch, TaskQuery,
};
use crawl_orchestrator::{BlobRef, HostId, TaskId};

fn init_test_logging() {
    tracing_subscriber::fmt()
        .with_env_filter("info,crawl_orchestrator=debug")
        .with_test_writer()
        .with_target(false)
        .compact()
        .try_init()
        .ok();
}

async fn setup() -> (Arc<MemoryTaskStore>, HostId) {
    init_test_logging();
    let store = Arc::new(MemoryTaskStore::with_defaults());
    let host_id = store
        .create_host(NewHost::new(
            "host-a",
            "https://a.example",
            ParserTag::new("generic"),
        ))
        .await
        .unwrap();
    (store, host_id)
}

/// Drive a pending task through the download phase up to `Crawling`.
async fn drive_to_crawling(store: &MemoryTaskStore, id: &TaskId) {
    assert!(store
        .transition(id, &[TaskStatus::Pending], TaskStatus::Queued, TaskPatch::none())
        .await
        .unwrap());
    assert!(store
        .transition(
            id,
            &[TaskStatus::Queued],
            TaskStatus::Crawling,
            TaskPatch::started(Utc::now()),
        )
        .await
        .unwrap());
}

/// Drive a pending task all the way to `Completed`.
async fn drive_to_completed(store: &MemoryTaskStore, id: &TaskId, now: chrono::DateTime<Utc>) {
    drive_to_crawling(store, id).await;
    store
        .record_attempt(
            id,
            AttemptOutcome::DownloadSuccess {
                blob_ref: BlobRef::new(format!("{}/1.html", id)),
                http_code: 200,
                latency_ms: 42,
                proxy_id: None,
            },
            now,
        )
        .await
        .unwrap();
    assert!(store
        .transition(
            id,
            &[TaskStatus::Downloaded],
            TaskStatus::QueuedParse,
            TaskPatch::none(),
        )
        .await
        .unwrap());
    assert!(store
        .transition(
            id,
            &[TaskStatus::QueuedParse],
            TaskStatus::Parsing,
            TaskPatch::none(),
        )
        .await
        .unwrap());
    store
        .record_attempt(id, AttemptOutcome::ParseSuccess, now)
        .await
        .unwrap();
}

#[tokio::test]
async fn duplicate_submission_yields_one_row() {
    let (store, host_id) = setup().await;

    let first = store
        .create_task(&host_id, "https://a.example/x?b=2&a=1", NewTaskOptions::default())
        .await
        .unwrap();

    // Same URL modulo query order and fragment.
    let err = store
        .create_task(&host_id, "https://a.example/x?a=1&b=2#frag", NewTaskOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);

    let page = store.query(TaskQuery::default()).await.unwrap();
    assert_eq!(page.tasks.len(), 1);
    assert_eq!(page.tasks[0].id, first);
}

#[tokio::test]
async fn duplicate_check_ignores_terminal_rows() {
    let (store, host_id) = setup().await;
    let url = "https://a.example/once";

    let first = store
        .create_task(&host_id, url, NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&store, &first, Utc::now()).await;

    // The completed row no longer blocks resubmission.
    let second = store
        .create_task(&host_id, url, NewTaskOptions::default())
        .await
        .unwrap();
    assert_ne!(first, second);
}

#[tokio::test]
async fn transient_failures_back_off_exponentially_then_fail() {
    let (store, host_id) = setup().await;
    let id = store
        .create_task(
            &host_id,
            "https://a.example/retry",
            NewTaskOptions {
                max_retries: Some(3),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();

    let base = 60i64;
    for (failure, expected_delay) in [(1u32, base), (2, 2 * base), (3, 4 * base)] {
        drive_to_crawling(&store, &id).await;
        let now = Utc::now();
        store
            .record_attempt(
                &id,
                AttemptOutcome::TransientFailure {
                    error: "connection reset".to_string(),
                },
                now,
            )
            .await
            .unwrap();
        let task = store.get_task(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, failure);
        assert_eq!(task.scheduled_at, now + Duration::seconds(expected_delay));
    }

    // Fourth failure exhausts the budget.
    drive_to_crawling(&store, &id).await;
    store
        .record_attempt(
            &id,
            AttemptOutcome::TransientFailure {
                error: "connection reset".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    let task = store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 3);
    assert!(task.retry_count <= task.max_retries);
}

#[tokio::test]
async fn recurrence_materializes_a_fresh_row() {
    let (store, host_id) = setup().await;
    let id = store
        .create_task(
            &host_id,
            "https://a.example/feed",
            NewTaskOptions {
                interval_secs: Some(3600),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();

    let completed_at = Utc::now();
    drive_to_completed(&store, &id, completed_at).await;

    let parent = store.get_task(&id).await.unwrap();
    assert!(parent.is_recurring);
    assert_eq!(parent.next_run_at, Some(completed_at + Duration::hours(1)));
    // Invariant: next_run_at strictly after completed_at.
    assert!(parent.next_run_at.unwrap() > parent.completed_at.unwrap());

    let later = completed_at + Duration::hours(1);
    let due = store.due_recurrences(10, later).await.unwrap();
    assert_eq!(due, vec![id.clone()]);

    let child_id = store.materialize_recurrence(&id, later).await.unwrap();
    let child = store.get_task(&child_id).await.unwrap();
    assert_eq!(child.status, TaskStatus::Pending);
    assert_eq!(child.url, parent.url);
    assert_eq!(child.url_fp, parent.url_fp);
    assert_eq!(child.host_id, parent.host_id);
    assert_eq!(child.recur_count, parent.recur_count + 1);
    assert_eq!(child.scheduled_at, later);

    let parent_after = store.get_task(&id).await.unwrap();
    assert_eq!(
        parent_after.next_run_at,
        Some(completed_at + Duration::hours(2))
    );

    // With the child live, a second materialization is refused.
    let err = store
        .materialize_recurrence(&id, later + Duration::hours(1))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
}

#[tokio::test]
async fn expired_lease_returns_task_to_pending() {
    let (store, host_id) = setup().await;
    let id = store
        .create_task(&host_id, "https://a.example/slow", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_crawling(&store, &id).await;

    // Inside the crawling deadline nothing happens.
    let report = store
        .reclaim_expired(Utc::now() + Duration::seconds(299))
        .await
        .unwrap();
    assert!(report.requeued.is_empty() && report.failed.is_empty());

    // Just past it the task is reclaimed with one retry consumed.
    let report = store
        .reclaim_expired(Utc::now() + Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(report.requeued, vec![id.clone()]);
    let task = store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
}

#[tokio::test]
async fn exhausted_lease_goes_terminal() {
    let (store, host_id) = setup().await;
    let id = store
        .create_task(
            &host_id,
            "https://a.example/doomed",
            NewTaskOptions {
                max_retries: Some(0),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();
    drive_to_crawling(&store, &id).await;

    let report = store
        .reclaim_expired(Utc::now() + Duration::seconds(301))
        .await
        .unwrap();
    assert_eq!(report.failed, vec![id.clone()]);
    let task = store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.retry_count, 0);
}

#[tokio::test]
async fn fetch_due_orders_by_priority_then_schedule() {
    let (store, host_id) = setup().await;
    let early = Utc::now() - Duration::minutes(10);
    let late = Utc::now() - Duration::minutes(1);

    let low = store
        .create_task(
            &host_id,
            "https://a.example/low",
            NewTaskOptions {
                priority: Priority::new(8),
                scheduled_at: Some(early),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();
    let urgent_late = store
        .create_task(
            &host_id,
            "https://a.example/urgent-late",
            NewTaskOptions {
                priority: Priority::new(1),
                scheduled_at: Some(late),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();
    let urgent_early = store
        .create_task(
            &host_id,
            "https://a.example/urgent-early",
            NewTaskOptions {
                priority: Priority::new(1),
                scheduled_at: Some(early),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();
    // Not yet due.
    store
        .create_task(
            &host_id,
            "https://a.example/future",
            NewTaskOptions {
                scheduled_at: Some(Utc::now() + Duration::hours(1)),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();

    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    let ids: Vec<_> = due.iter().map(|t| t.id.clone()).collect();
    assert_eq!(ids, vec![urgent_early, urgent_late, low]);
}

#[tokio::test]
async fn fetch_due_skips_inactive_hosts_and_honors_in_flight_cap() {
    let (store, host_id) = setup().await;
    let capped = store
        .create_host({
            let mut h = NewHost::new("capped", "https://c.example", ParserTag::new("generic"));
            h.max_in_flight = 1;
            h
        })
        .await
        .unwrap();

    store
        .create_task(&capped, "https://c.example/1", NewTaskOptions::default())
        .await
        .unwrap();
    store
        .create_task(&capped, "https://c.example/2", NewTaskOptions::default())
        .await
        .unwrap();
    store
        .create_task(&host_id, "https://a.example/1", NewTaskOptions::default())
        .await
        .unwrap();

    // Cap of one: only one row of the capped host may dispatch.
    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    let capped_rows = due.iter().filter(|t| t.host_id == capped).count();
    assert_eq!(capped_rows, 1);

    // Disabling the other host removes its rows entirely.
    store
        .update_host(
            &host_id,
            crawl_orchestrator::store::HostPatch {
                active: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let due = store.fetch_due(10, Utc::now()).await.unwrap();
    assert!(due.iter().all(|t| t.host_id == capped));
}

#[tokio::test]
async fn bulk_insert_reports_per_item_outcomes() {
    let (store, host_id) = setup().await;
    store
        .create_task(&host_id, "https://a.example/existing", NewTaskOptions::default())
        .await
        .unwrap();

    let report = store
        .create_tasks_bulk(
            &host_id,
            vec![
                "https://a.example/new".to_string(),
                "https://a.example/existing".to_string(),
                "not a url".to_string(),
            ],
            NewTaskOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(report.inserted.len(), 1);
    assert_eq!(report.duplicates, vec!["https://a.example/existing".to_string()]);
    assert_eq!(report.invalid.len(), 1);
    assert_eq!(report.invalid[0].0, "not a url");

    // A missing host still fails the batch as a whole.
    let err = store
        .create_tasks_bulk(
            &HostId::new("host_missing"),
            vec!["https://a.example/x".to_string()],
            NewTaskOptions::default(),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn query_paginates_with_cursor() {
    let (store, host_id) = setup().await;
    for i in 0..5 {
        store
            .create_task(
                &host_id,
                &format!("https://a.example/p/{}", i),
                NewTaskOptions::default(),
            )
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    let mut cursor = None;
    loop {
        let page = store
            .query(TaskQuery {
                filter: TaskFilter::default(),
                limit: 2,
                cursor: cursor.clone(),
                ..TaskQuery::default()
            })
            .await
            .unwrap();
        seen.extend(page.tasks.iter().map(|t| t.id.clone()));
        match page.next_cursor {
            Some(c) => cursor = Some(c),
            None => break,
        }
    }
    assert_eq!(seen.len(), 5);
    seen.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    seen.dedup();
    assert_eq!(seen.len(), 5);
}

#[tokio::test]
async fn snapshot_round_trips_state() {
    let (store, host_id) = setup().await;
    let id = store
        .create_task(&host_id, "https://a.example/persist", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_crawling(&store, &id).await;

    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("checkpoint.json");
    store.save_state(&path).await.unwrap();

    let restored = MemoryTaskStore::with_defaults();
    restored.load_state(&path).await.unwrap();
    let task = restored.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Crawling);

    // The live-fingerprint index survives the round trip.
    let err = restored
        .create_task(&host_id, "https://a.example/persist", NewTaskOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
}
