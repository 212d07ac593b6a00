//! Control plane integration tests: pause/resume, cancel, restarts,
//! bulk restart, and priority changes.
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use crawl_orchestrator::config::ProxyConfig;
use crawl_orchestrator::control::{BulkRestartFilter, ControlPlane, RestartOptions};
use crawl_orchestrator::core::{
    BlobStore, ErrorKind, ParserTag, Priority, TaskStatus, TaskStore,
};
use crawl_orchestrator::proxy::ProxyAllocator;
use crawl_orchestrator::storage::FileBlobStore;
use crawl_orchestrator::store::{
    AttemptOutcome, MemoryTaskStore, NewHost, NewTaskOptions, TaskPatch,
};
use crawl_orchestrator::{HostId, TaskId};
use tempfile::TempDir;

struct Fixture {
    store: Arc<MemoryTaskStore>,
    blobs: Arc<FileBlobStore>,
    control: ControlPlane,
    host_id: HostId,
    _blob_dir: TempDir,
}

async fn fixture() -> Fixture {
    let store = Arc::new(MemoryTaskStore::with_defaults());
    let allocator = Arc::new(ProxyAllocator::new(ProxyConfig::default()));
    let blob_dir = TempDir::new().unwrap();
    let blobs = Arc::new(FileBlobStore::new(blob_dir.path()).unwrap());
    let control = ControlPlane::new(
        store.clone() as Arc<dyn TaskStore>,
        allocator,
        blobs.clone() as Arc<dyn BlobStore>,
    );
    let host_id = control
        .create_host(NewHost::new(
            "host-a",
            "https://a.example",
            ParserTag::new("generic"),
        ))
        .await
        .unwrap();
    Fixture {
        store,
        blobs,
        control,
        host_id,
        _blob_dir: blob_dir,
    }
}

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

/// Drive to `Completed`, writing a real blob for attempt 1.
async fn drive_to_completed(f: &Fixture, id: &TaskId) {
    drive_to_crawling(&f.store, id).await;
    let blob_ref = f
        .blobs
        .put_if_absent(id, 1, Bytes::from_static(b"<html>body</html>"))
        .await
        .unwrap()
        .blob_ref();
    f.store
        .record_attempt(
            id,
            AttemptOutcome::DownloadSuccess {
                blob_ref,
                http_code: 200,
                latency_ms: 10,
                proxy_id: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(f
        .store
        .transition(
            id,
            &[TaskStatus::Downloaded],
            TaskStatus::QueuedParse,
            TaskPatch::none(),
        )
        .await
        .unwrap());
    assert!(f
        .store
        .transition(
            id,
            &[TaskStatus::QueuedParse],
            TaskStatus::Parsing,
            TaskPatch::none(),
        )
        .await
        .unwrap());
    f.store
        .record_attempt(id, AttemptOutcome::ParseSuccess, Utc::now())
        .await
        .unwrap();
}

async fn drive_to_failed(f: &Fixture, id: &TaskId) {
    drive_to_crawling(&f.store, id).await;
    f.store
        .record_attempt(
            id,
            AttemptOutcome::TerminalFailure {
                error: "blocked".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn pause_resume_preserves_retry_count() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();

    // Consume one retry first so the law is observable.
    drive_to_crawling(&f.store, &id).await;
    f.store
        .record_attempt(
            &id,
            AttemptOutcome::TransientFailure {
                error: "timeout".to_string(),
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert_eq!(f.store.get_task(&id).await.unwrap().retry_count, 1);

    f.control.pause(&id).await.unwrap();
    assert_eq!(f.store.get_task(&id).await.unwrap().status, TaskStatus::Paused);

    let before_resume = Utc::now();
    f.control.resume(&id).await.unwrap();
    let task = f.store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 1);
    assert!(task.scheduled_at >= before_resume);
}

#[tokio::test]
async fn pause_rejects_terminal_tasks() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &id).await;

    let err = f.control.pause(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
}

#[tokio::test]
async fn cancel_spares_terminal_history() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    f.control.cancel(&id).await.unwrap();
    assert_eq!(
        f.store.get_task(&id).await.unwrap().status,
        TaskStatus::Cancelled
    );

    let done = f
        .control
        .submit(&f.host_id, "https://a.example/y", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &done).await;
    let err = f.control.cancel(&done).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalTransition);
    assert_eq!(
        f.store.get_task(&done).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn restart_full_resets_to_fresh_submission() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &id).await;

    f.control
        .restart_full(&id, RestartOptions {
            reset_retries: true,
            ..RestartOptions::default()
        })
        .await
        .unwrap();

    let task = f.store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Pending);
    assert_eq!(task.retry_count, 0);
    assert!(task.started_at.is_none());
    assert!(task.completed_at.is_none());
    assert!(task.error.is_none());

    // The restarted row holds the fingerprint again.
    let err = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
}

#[tokio::test]
async fn restart_full_refuses_when_a_live_duplicate_exists() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &id).await;

    // Resubmission after completion is legal and takes the fingerprint.
    let fresh = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    assert_ne!(fresh, id);

    let err = f
        .control
        .restart_full(&id, RestartOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Duplicate);
}

#[tokio::test]
async fn restart_parse_only_requires_the_blob() {
    let f = fixture().await;
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &id).await;

    f.control.restart_parse_only(&id).await.unwrap();
    let task = f.store.get_task(&id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Downloaded);
    assert!(task.completed_at.is_none());
    // The download evidence is untouched.
    assert!(task.started_at.is_some());
    assert!(task.blob_ref.is_some());
}

#[tokio::test]
async fn restart_parse_only_surfaces_missing_html() {
    let f = fixture().await;

    // Failed before any download: no blob reference at all.
    let never_downloaded = f
        .control
        .submit(&f.host_id, "https://a.example/no-blob", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_failed(&f, &never_downloaded).await;
    let err = f.control.restart_parse_only(&never_downloaded).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HtmlNotAvailable);

    // Completed, but the blob has since been deleted.
    let id = f
        .control
        .submit(&f.host_id, "https://a.example/x", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_completed(&f, &id).await;
    let blob = f.store.get_task(&id).await.unwrap().blob_ref.unwrap();
    std::fs::remove_file(f._blob_dir.path().join(blob.as_str())).unwrap();

    let err = f.control.restart_parse_only(&id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::HtmlNotAvailable);
    // The task is left untouched.
    assert_eq!(
        f.store.get_task(&id).await.unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn bulk_restart_failed_is_inclusive_on_failed_after() {
    let f = fixture().await;
    let old = f
        .control
        .submit(&f.host_id, "https://a.example/old", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_failed(&f, &old).await;
    let boundary = f.store.get_task(&old).await.unwrap().last_transition_at;

    let newer = f
        .control
        .submit(&f.host_id, "https://a.example/new", NewTaskOptions::default())
        .await
        .unwrap();
    drive_to_failed(&f, &newer).await;

    // A bound equal to the older failure's timestamp includes it.
    let report = f
        .control
        .bulk_restart_failed(
            BulkRestartFilter {
                host_id: Some(f.host_id.clone()),
                failed_after: Some(boundary),
            },
            100,
        )
        .await
        .unwrap();
    assert_eq!(report.restarted.len(), 2);
    assert!(report.failed.is_empty());

    for id in [&old, &newer] {
        let task = f.store.get_task(id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.retry_count, 0);
    }
}

#[tokio::test]
async fn change_priority_does_not_reroute_queued_messages() {
    let f = fixture().await;
    let id = f
        .control
        .submit(
            &f.host_id,
            "https://a.example/x",
            NewTaskOptions {
                priority: Priority::new(5),
                ..NewTaskOptions::default()
            },
        )
        .await
        .unwrap();

    f.control
        .change_priority(&id, Priority::new(1).unwrap())
        .await
        .unwrap();
    let task = f.store.get_task(&id).await.unwrap();
    assert_eq!(task.priority, Priority::new(1).unwrap());
    // The status is untouched; only future dispatches see the new
    // priority route.
    assert_eq!(task.status, TaskStatus::Pending);
}

#[tokio::test]
async fn submit_batch_reports_and_dispatchable_state() {
    let f = fixture().await;
    let report = f
        .control
        .submit_batch(
            &f.host_id,
            vec![
                "https://a.example/1".to_string(),
                "https://a.example/2".to_string(),
                "https://a.example/1".to_string(),
            ],
            NewTaskOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(report.inserted.len(), 2);
    assert_eq!(report.duplicates.len(), 1);
}
