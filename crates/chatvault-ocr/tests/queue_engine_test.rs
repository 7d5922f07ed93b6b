//! End-to-end queue behaviour against the in-memory store, real files in a
//! temp directory, and the mock provider.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage};
use tempfile::TempDir;
use uuid::Uuid;

use chatvault_db::{MemoryMedia, MemoryStore};
use chatvault_ocr::{
    CreateOcrJobRequest, Error, EventBus, EventEnvelope, MediaItem, MediaRepository, MediaType,
    MockOcrProvider, OcrConfig, OcrDocument, OcrDocumentStatus, OcrJobMode, OcrJobStatus,
    OcrJobSummary, OcrQueue, ProviderChain, Result, ServerEvent, TickOutcome,
    STALE_PROCESSING_ERROR,
};

const OPERATOR: &str = "admin@example.com";

struct Harness {
    store: MemoryStore,
    dir: TempDir,
    group: Uuid,
    provider: MockOcrProvider,
    events: EventBus,
    queue: OcrQueue,
}

fn png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbaImage::from_pixel(width, height, Rgba([20, 20, 20, 255]));
    let mut bytes = Vec::new();
    DynamicImage::ImageRgba8(img)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .unwrap();
    bytes
}

fn base_config(dir: &TempDir) -> OcrConfig {
    OcrConfig::default()
        .with_media_root(dir.path())
        .with_retry_backoff(Duration::ZERO)
}

fn harness() -> Harness {
    harness_with(MockOcrProvider::new(), |c| c)
}

fn harness_with(provider: MockOcrProvider, tweak: impl FnOnce(OcrConfig) -> OcrConfig) -> Harness {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let group = store.add_group("Family scans", true);
    let events = EventBus::default();
    let queue = OcrQueue::builder(tweak(base_config(&dir)))
        .with_memory_store(&store)
        .with_provider(Arc::new(provider.clone()))
        .with_progress_sink(Arc::new(events.clone()))
        .build()
        .unwrap();
    Harness {
        store,
        dir,
        group,
        provider,
        events,
        queue,
    }
}

fn request(mode: OcrJobMode) -> CreateOcrJobRequest {
    CreateOcrJobRequest {
        requested_by: OPERATOR.into(),
        mode,
        group_id: None,
    }
}

impl Harness {
    fn add_image(&self, message: Option<&str>, name: &str) -> Uuid {
        std::fs::write(self.dir.path().join(name), png(16, 12)).unwrap();
        self.store
            .add_media(self.group, message, name, Some("image/png"), MediaType::Image)
    }

    fn add_file(&self, name: &str, bytes: &[u8], mime: &str, media_type: MediaType) -> Uuid {
        std::fs::write(self.dir.path().join(name), bytes).unwrap();
        self.store
            .add_media(self.group, None, name, Some(mime), media_type)
    }

    fn doc(&self, media_id: Uuid) -> OcrDocument {
        self.store
            .all_documents()
            .into_iter()
            .find(|d| d.media_id == media_id)
            .expect("document for media")
    }

    /// Tick until a tick claims nothing.
    async fn drain(&self) {
        for _ in 0..50 {
            if matches!(
                self.queue.tick().await.unwrap(),
                TickOutcome::Ran { claimed: 0, .. }
            ) {
                return;
            }
        }
        panic!("queue did not drain");
    }
}

fn assert_counts_consistent(summary: &OcrJobSummary) {
    let c = &summary.counts;
    assert_eq!(
        c.succeeded + c.failed + c.skipped + c.processing + c.queued,
        c.total
    );
    assert_eq!(summary.job.total_items, c.total);
    assert!(summary.job.succeeded_items + summary.job.failed_items + summary.job.skipped_items
        <= summary.job.total_items);
}

fn drain_events(rx: &mut tokio::sync::broadcast::Receiver<EventEnvelope>) -> Vec<EventEnvelope> {
    let mut out = Vec::new();
    while let Ok(envelope) = rx.try_recv() {
        out.push(envelope);
    }
    out
}

// =============================================================================
// JOB LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_missing_job_runs_to_completion() {
    let h = harness();
    let media: Vec<Uuid> = (0..3)
        .map(|i| h.add_image(None, &format!("IMG-{i}.png")))
        .collect();

    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    assert_eq!(created.queued_count, 3);
    assert_eq!(created.job.status, OcrJobStatus::Running);
    assert!(created.job.started_at.is_some());

    h.drain().await;

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.succeeded, 3);
    assert!(summary.job.finished_at.is_some());
    assert_counts_consistent(&summary);
    assert_eq!(h.provider.call_count(), 3);

    for media_id in media {
        let doc = h.doc(media_id);
        assert_eq!(doc.status, OcrDocumentStatus::Succeeded);
        assert_eq!(doc.text.as_deref(), Some("Mock OCR text"));
        assert_eq!(doc.provider.as_deref(), Some("mock"));
        assert_eq!(doc.language.as_deref(), Some("eng"));
        assert!(doc.error_message.is_none());
    }
}

#[tokio::test]
async fn test_job_without_candidates_completes_immediately() {
    let h = harness();
    let quiet = h.store.add_group("Muted", false);
    h.store
        .add_media(quiet, None, "muted.png", Some("image/png"), MediaType::Image);
    h.add_image(None, "elsewhere.png");

    let created = h
        .queue
        .create_job(CreateOcrJobRequest {
            group_id: Some(quiet),
            ..request(OcrJobMode::Missing)
        })
        .await
        .unwrap();

    assert_eq!(created.queued_count, 0);
    assert_eq!(created.job.status, OcrJobStatus::Completed);
    assert!(created.job.finished_at.is_some());
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_ineligible_media_types_are_not_queued() {
    let h = harness();
    h.add_image(None, "photo.png");
    h.add_file("voice.ogg", b"OggS", "audio/ogg", MediaType::Audio);
    h.add_file("clip.mp4", b"\0\0\0\x18ftyp", "video/mp4", MediaType::Video);

    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    assert_eq!(created.queued_count, 1);
}

#[tokio::test]
async fn test_refresh_is_idempotent() {
    let h = harness();
    h.add_image(None, "a.png");
    h.add_image(None, "b.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let first = h.queue.refresh_job(created.job_id).await.unwrap();
    let second = h.queue.refresh_job(created.job_id).await.unwrap();

    assert_eq!(first.counts, second.counts);
    assert_eq!(first.job.status, second.job.status);
    assert_eq!(first.job.finished_at, second.job.finished_at);
    assert_counts_consistent(&second);
}

// =============================================================================
// ENQUEUE MODES
// =============================================================================

#[tokio::test]
async fn test_missing_never_resets_and_all_resets_everything() {
    let h = harness();
    let a = h.add_image(None, "a.png");
    let b = h.add_image(None, "b.png");

    let first = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let again = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    assert_eq!(again.queued_count, 0);
    assert_eq!(h.doc(a).status, OcrDocumentStatus::Succeeded);
    assert_eq!(h.doc(a).job_id, Some(first.job_id));

    let all = h.queue.create_job(request(OcrJobMode::All)).await.unwrap();
    assert_eq!(all.queued_count, 2);
    for media_id in [a, b] {
        let doc = h.doc(media_id);
        assert_eq!(doc.status, OcrDocumentStatus::Queued);
        assert_eq!(doc.job_id, Some(all.job_id));
        assert_eq!(doc.attempts, 0);
        assert!(doc.text.is_none());
        assert!(doc.result_json.is_none());
    }

    // Re-enqueued documents no longer count toward the first job.
    let detached = h.queue.get_job(first.job_id).await.unwrap();
    assert_eq!(detached.counts.total, 0);
    assert_eq!(detached.job.status, OcrJobStatus::Completed);
}

#[tokio::test]
async fn test_failed_mode_requeues_failures_and_adds_new_media() {
    let h = harness_with(MockOcrProvider::new().failing_first(1), |c| {
        c.with_max_attempts(1).with_concurrency(1)
    });
    let a = h.add_image(None, "a.png");
    let b = h.add_image(None, "b.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let (failed, succeeded) = if h.doc(a).status == OcrDocumentStatus::Failed {
        (a, b)
    } else {
        (b, a)
    };
    assert_eq!(h.doc(failed).status, OcrDocumentStatus::Failed);
    assert_eq!(h.doc(succeeded).status, OcrDocumentStatus::Succeeded);

    let c = h.add_image(None, "c.png");
    let retry = h.queue.create_job(request(OcrJobMode::Failed)).await.unwrap();
    assert_eq!(retry.queued_count, 2);
    assert_eq!(h.doc(failed).status, OcrDocumentStatus::Queued);
    assert_eq!(h.doc(failed).attempts, 0);
    assert_eq!(h.doc(failed).job_id, Some(retry.job_id));
    assert_eq!(h.doc(succeeded).status, OcrDocumentStatus::Succeeded);
    assert_eq!(h.doc(c).status, OcrDocumentStatus::Queued);
}

// =============================================================================
// RETRIES
// =============================================================================

#[tokio::test]
async fn test_failure_exhausts_attempts_then_fails() {
    let h = harness_with(MockOcrProvider::new().always_failing("provider offline"), |c| c);
    let media = h.add_image(None, "a.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let mut seen = Vec::new();
    for _ in 0..3 {
        h.queue.tick().await.unwrap();
        seen.push(h.doc(media).attempts);
    }
    assert_eq!(seen, vec![1, 2, 3]);

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Failed);
    assert_eq!(doc.attempts, 3);
    assert!(doc.next_attempt_at.is_none());
    assert!(doc.error_message.unwrap().contains("provider offline"));

    // Terminal: nothing more to claim, attempts never exceed the limit.
    assert_eq!(
        h.queue.tick().await.unwrap(),
        TickOutcome::Ran { recovered: 0, claimed: 0 }
    );
    assert_eq!(h.doc(media).attempts, 3);
    assert_eq!(h.provider.call_count(), 3);

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.failed, 1);
    assert!(summary.job.last_error.unwrap().contains("provider offline"));
}

#[tokio::test]
async fn test_retry_waits_for_backoff() {
    let h = harness_with(MockOcrProvider::new().always_failing("timeout"), |c| {
        c.with_retry_backoff(Duration::from_secs(60))
    });
    let media = h.add_image(None, "a.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let before = Utc::now();
    h.queue.tick().await.unwrap();

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Queued);
    assert_eq!(doc.attempts, 1);
    assert_eq!(doc.error_message.as_deref(), Some("Provider error: timeout"));
    let next = doc.next_attempt_at.unwrap();
    assert!(next >= before + chrono::Duration::seconds(60));

    assert_eq!(
        h.queue.tick().await.unwrap(),
        TickOutcome::Ran { recovered: 0, claimed: 0 }
    );
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_transient_failure_recovers() {
    let h = harness_with(MockOcrProvider::new().failing_first(2), |c| c);
    let media = h.add_image(None, "a.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Succeeded);
    assert_eq!(doc.attempts, 2);
    assert!(doc.error_message.is_none());
}

#[tokio::test]
async fn test_missing_file_takes_failure_path() {
    let h = harness_with(MockOcrProvider::new(), |c| c.with_max_attempts(1));
    let media = h.add_image(None, "gone.png");
    std::fs::remove_file(h.dir.path().join("gone.png")).unwrap();

    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Failed);
    assert!(doc.error_message.unwrap().contains("file not found"));
    assert_eq!(h.provider.call_count(), 0);
}

#[tokio::test]
async fn test_retry_failed_reopens_completed_job() {
    let h = harness_with(MockOcrProvider::new().failing_first(2), |c| {
        c.with_max_attempts(1).with_concurrency(1)
    });
    let media: Vec<Uuid> = (0..3)
        .map(|i| h.add_image(None, &format!("IMG-{i}.png")))
        .collect();
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.failed, 2);
    assert_eq!(summary.counts.succeeded, 1);

    let retried = h.queue.retry_failed(created.job_id, OPERATOR).await.unwrap();
    assert_eq!(retried, 2);

    let reopened = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(reopened.job.status, OcrJobStatus::Running);
    assert!(reopened.job.finished_at.is_none());
    assert_eq!(reopened.counts.queued, 2);
    for doc in media.iter().map(|m| h.doc(*m)) {
        if doc.status == OcrDocumentStatus::Queued {
            assert_eq!(doc.attempts, 0);
            assert!(doc.error_message.is_none());
        }
    }

    h.drain().await;
    let done = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(done.job.status, OcrJobStatus::Completed);
    assert_eq!(done.counts.succeeded, 3);
    assert!(done.job.finished_at.is_some());
}

// =============================================================================
// CANCELLATION
// =============================================================================

#[tokio::test]
async fn test_cancel_skips_queued_documents_and_sticks() {
    let h = harness();
    let media: Vec<Uuid> = (0..3)
        .map(|i| h.add_image(None, &format!("IMG-{i}.png")))
        .collect();
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let job = h.queue.cancel_job(created.job_id, OPERATOR).await.unwrap();
    assert_eq!(job.status, OcrJobStatus::Cancelled);
    assert!(job.finished_at.is_some());

    for doc in media.iter().map(|m| h.doc(*m)) {
        assert_eq!(doc.status, OcrDocumentStatus::Skipped);
        assert_eq!(doc.error_message.as_deref(), Some("job cancelled"));
    }

    assert_eq!(
        h.queue.tick().await.unwrap(),
        TickOutcome::Ran { recovered: 0, claimed: 0 }
    );
    let refreshed = h.queue.refresh_job(created.job_id).await.unwrap();
    assert_eq!(refreshed.job.status, OcrJobStatus::Cancelled);
    assert_eq!(refreshed.counts.skipped, 3);
    assert_counts_consistent(&refreshed);

    // Cancelling again is a no-op; retrying a cancelled job is rejected.
    let again = h.queue.cancel_job(created.job_id, OPERATOR).await.unwrap();
    assert_eq!(again.finished_at, job.finished_at);
    assert!(matches!(
        h.queue.retry_failed(created.job_id, OPERATOR).await,
        Err(Error::InvalidInput(_))
    ));
}

#[tokio::test]
async fn test_cancel_skips_processing_documents() {
    let h = harness();
    let media = h.add_image(None, "a.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    // Simulate a claim held by a worker elsewhere.
    let mut doc = h.doc(media);
    doc.status = OcrDocumentStatus::Processing;
    doc.started_at = Some(Utc::now());
    h.store.put_document(doc);

    h.queue.cancel_job(created.job_id, OPERATOR).await.unwrap();
    assert_eq!(h.doc(media).status, OcrDocumentStatus::Skipped);
}

// =============================================================================
// SKIPS
// =============================================================================

#[tokio::test]
async fn test_unmonitored_group_is_skipped() {
    let h = harness();
    let media = h.add_image(None, "a.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.store.set_monitored(h.group, false);

    h.drain().await;

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Skipped);
    assert_eq!(doc.error_message.as_deref(), Some("group no longer monitored"));
    assert_eq!(h.provider.call_count(), 0);

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.skipped, 1);
}

#[tokio::test]
async fn test_oversized_input_is_skipped() {
    let h = harness_with(MockOcrProvider::new(), |c| c.with_max_file_bytes(16));
    let media = h.add_image(None, "big.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Skipped);
    assert_eq!(doc.error_message.as_deref(), Some("exceeds size limit"));
    assert_eq!(doc.attempts, 0);
}

#[tokio::test]
async fn test_unsupported_type_is_skipped() {
    let h = harness_with(MockOcrProvider::new().with_supported(&["image/"]), |c| c);
    let media = h.add_file("scan.pdf", b"%PDF-1.7", "application/pdf", MediaType::Document);
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Skipped);
    assert_eq!(doc.error_message.as_deref(), Some("unsupported file type"));
}

// =============================================================================
// BUNDLES
// =============================================================================

#[tokio::test]
async fn test_bundle_uses_one_call_for_all_siblings() {
    // Default concurrency and batch size, with a provider slow enough that
    // siblings claimed together would overlap.
    let h = harness_with(
        MockOcrProvider::new()
            .with_text("Page one\nPage two")
            .with_latency(Duration::from_millis(20)),
        |c| c,
    );
    assert!(h.queue.config().batch_size >= 2);
    let media: Vec<Uuid> = (0..3)
        .map(|i| h.add_image(Some("3EB0C767D26A"), &format!("page-{i}.png")))
        .collect();
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    assert_eq!(created.queued_count, 3);

    assert_eq!(
        h.queue.tick().await.unwrap(),
        TickOutcome::Ran { recovered: 0, claimed: 1 }
    );
    h.drain().await;

    assert_eq!(h.provider.call_count(), 1);
    let call = &h.provider.calls()[0];
    assert_eq!(call.mime_type, "image/png");
    assert!(call.filename.starts_with("bundle-"));

    let expected: Vec<String> = media.iter().map(|m| m.to_string()).collect();
    for media_id in &media {
        let doc = h.doc(*media_id);
        assert_eq!(doc.status, OcrDocumentStatus::Succeeded);
        assert_eq!(doc.text.as_deref(), Some("Page one\nPage two"));
        let result = doc.result_json.clone().unwrap();
        assert_eq!(result["bundled"], true);
        let bundled: Vec<String> = result["bundled_media_ids"]
            .as_array()
            .unwrap()
            .iter()
            .map(|v| v.as_str().unwrap().to_string())
            .collect();
        assert_eq!(bundled, expected);
        assert_eq!(doc.bundled_media_ids(), media);
    }

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.succeeded, 3);
}

#[tokio::test]
async fn test_separate_bundles_share_a_tick() {
    let h = harness_with(
        MockOcrProvider::new().with_latency(Duration::from_millis(20)),
        |c| c.with_batch_size(4),
    );
    for i in 0..2 {
        h.add_image(Some("MSG-A"), &format!("a-{i}.png"));
        h.add_image(Some("MSG-B"), &format!("b-{i}.png"));
    }
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    assert_eq!(
        h.queue.tick().await.unwrap(),
        TickOutcome::Ran { recovered: 0, claimed: 2 }
    );
    h.drain().await;

    assert_eq!(h.provider.call_count(), 2);
    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.counts.succeeded, 4);
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
}

#[tokio::test]
async fn test_late_sibling_is_skipped_as_bundled() {
    let h = harness();
    h.add_image(Some("MSG-7"), "first.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    // A second photo of the same message arrives after the first was read.
    let late = h.add_image(Some("MSG-7"), "second.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    assert_eq!(created.queued_count, 1);
    h.drain().await;

    let doc = h.doc(late);
    assert_eq!(doc.status, OcrDocumentStatus::Skipped);
    assert_eq!(doc.error_message.as_deref(), Some("bundled by another result"));
    assert_eq!(h.provider.call_count(), 1);
}

// =============================================================================
// CONCURRENCY & RECOVERY
// =============================================================================

#[tokio::test]
async fn test_concurrency_is_bounded_per_tick() {
    let h = harness_with(
        MockOcrProvider::new().with_latency(Duration::from_millis(40)),
        |c| c.with_concurrency(2).with_batch_size(6),
    );
    for i in 0..6 {
        h.add_image(None, &format!("IMG-{i}.png"));
    }
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let outcome = h.queue.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Ran { recovered: 0, claimed: 6 });
    assert_eq!(h.provider.call_count(), 6);
    assert!(h.provider.peak_concurrency() <= 2);
}

#[tokio::test]
async fn test_overlapping_tick_is_skipped() {
    let h = harness_with(
        MockOcrProvider::new().with_latency(Duration::from_millis(50)),
        |c| c,
    );
    h.add_image(None, "a.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let (first, second) = tokio::join!(h.queue.tick(), h.queue.tick());
    let outcomes = [first.unwrap(), second.unwrap()];
    assert!(outcomes.contains(&TickOutcome::Overlapped));
    assert!(outcomes.contains(&TickOutcome::Ran { recovered: 0, claimed: 1 }));
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn test_stale_claims_are_recovered() {
    let h = harness();
    let media = h.add_image(None, "a.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let mut doc = h.doc(media);
    doc.status = OcrDocumentStatus::Processing;
    doc.started_at = Some(Utc::now() - chrono::Duration::hours(2));
    h.store.put_document(doc);

    let outcome = h.queue.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Ran { recovered: 1, claimed: 1 });

    // The lost claim counted as an attempt.
    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Succeeded);
    assert_eq!(doc.attempts, 1);
}

#[tokio::test]
async fn test_stale_claim_on_last_attempt_fails_document() {
    let h = harness();
    let media = h.add_image(None, "poison.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    // A document that already took down two workers.
    let mut doc = h.doc(media);
    doc.status = OcrDocumentStatus::Processing;
    doc.attempts = 2;
    doc.started_at = Some(Utc::now() - chrono::Duration::hours(2));
    h.store.put_document(doc);

    let outcome = h.queue.tick().await.unwrap();
    assert_eq!(outcome, TickOutcome::Ran { recovered: 1, claimed: 0 });

    let doc = h.doc(media);
    assert_eq!(doc.status, OcrDocumentStatus::Failed);
    assert_eq!(doc.attempts, 3);
    assert_eq!(doc.error_message.as_deref(), Some(STALE_PROCESSING_ERROR));
    assert_eq!(h.provider.call_count(), 0);

    let summary = h.queue.get_job(created.job_id).await.unwrap();
    assert_eq!(summary.job.status, OcrJobStatus::Completed);
    assert_eq!(summary.counts.failed, 1);
}

#[tokio::test]
async fn test_poller_processes_until_shutdown() {
    let h = harness_with(MockOcrProvider::new(), |c| {
        c.with_poll_interval(Duration::from_millis(20))
    });
    h.add_image(None, "a.png");
    h.add_image(None, "b.png");

    let handle = h.queue.start();
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let mut status = OcrJobStatus::Running;
    for _ in 0..100 {
        status = h.queue.get_job(created.job_id).await.unwrap().job.status;
        if status == OcrJobStatus::Completed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(status, OcrJobStatus::Completed);

    handle.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_disabled_poller_exits_immediately() {
    let h = harness_with(MockOcrProvider::new(), |c| c.with_enabled(false));
    h.add_image(None, "a.png");
    let handle = h.queue.start();
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(handle.is_finished());
    handle.shutdown().await.unwrap();
    assert_eq!(h.provider.call_count(), 0);
}

// =============================================================================
// API SURFACE & EVENTS
// =============================================================================

#[tokio::test]
async fn test_list_jobs_and_documents() {
    let h = harness_with(MockOcrProvider::new().failing_first(1), |c| {
        c.with_max_attempts(1).with_concurrency(1)
    });
    h.add_image(None, "a.png");
    h.add_image(None, "b.png");
    let first = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;
    let second = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();

    let jobs = h.queue.list_jobs(10, 0).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0].job.id, second.job_id);
    assert_eq!(jobs[1].job.id, first.job_id);
    assert_eq!(jobs[1].counts.total, 2);

    let failed = h
        .queue
        .list_documents(first.job_id, Some(OcrDocumentStatus::Failed), 10, 0)
        .await
        .unwrap();
    assert_eq!(failed.len(), 1);
    let all = h
        .queue
        .list_documents(first.job_id, None, 10, 0)
        .await
        .unwrap();
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn test_result_for_media_follows_monitoring() {
    let h = harness();
    let media = h.add_image(None, "a.png");
    h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let doc = h.queue.result_for_media(media).await.unwrap().unwrap();
    assert_eq!(doc.status, OcrDocumentStatus::Succeeded);

    h.store.set_monitored(h.group, false);
    assert!(h.queue.result_for_media(media).await.unwrap().is_none());
}

#[tokio::test]
async fn test_progress_events_reach_admin_audience() {
    let h = harness();
    let mut rx = h.events.subscribe();
    h.add_image(None, "a.png");

    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    let events = drain_events(&mut rx);
    assert!(matches!(
        events[0].payload,
        ServerEvent::OcrJobCreated { queued_count: 1, .. }
    ));
    assert_eq!(events[0].actor.kind, "user");
    assert_eq!(events[0].actor.id.as_deref(), Some(OPERATOR));
    assert!(events.iter().all(|e| e.audience == "admin"));

    h.drain().await;
    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e.payload,
        ServerEvent::OcrDocumentUpdated { status: OcrDocumentStatus::Succeeded, .. }
    )));
    let last_progress = events
        .iter()
        .rev()
        .find_map(|e| match &e.payload {
            ServerEvent::OcrJobProgress { job_id, status, counts } => {
                Some((*job_id, *status, *counts))
            }
            _ => None,
        })
        .unwrap();
    assert_eq!(last_progress.0, created.job_id);
    assert_eq!(last_progress.1, OcrJobStatus::Completed);
    assert_eq!(last_progress.2.succeeded, 1);
}

#[tokio::test]
async fn test_operator_events_carry_user_actor() {
    let h = harness_with(MockOcrProvider::new().always_failing("offline"), |c| {
        c.with_max_attempts(1)
    });
    h.add_image(None, "a.png");
    let created = h.queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    h.drain().await;

    let mut rx = h.events.subscribe();
    h.queue.retry_failed(created.job_id, "ops@example.com").await.unwrap();
    h.queue.cancel_job(created.job_id, "lead@example.com").await.unwrap();

    let events = drain_events(&mut rx);
    let actor_of = |wanted: &str| {
        events
            .iter()
            .find(|e| e.event_type == wanted)
            .map(|e| (e.actor.kind.clone(), e.actor.id.clone()))
            .unwrap()
    };
    assert_eq!(
        actor_of("ocr.job.retried"),
        ("user".to_string(), Some("ops@example.com".to_string()))
    );
    assert_eq!(
        actor_of("ocr.job.cancelled"),
        ("user".to_string(), Some("lead@example.com".to_string()))
    );
    // Aggregate updates stay attributed to the system.
    assert!(events
        .iter()
        .filter(|e| e.event_type == "ocr.job.progress")
        .all(|e| e.actor.kind == "system"));
}

// =============================================================================
// FAILURE HANDLING
// =============================================================================

/// Media index whose candidate lookup is down.
struct UnavailableMedia(MemoryMedia);

#[async_trait]
impl MediaRepository for UnavailableMedia {
    async fn get(&self, media_id: Uuid) -> Result<Option<MediaItem>> {
        self.0.get(media_id).await
    }

    async fn find_ocr_candidates(&self, _group_id: Option<Uuid>) -> Result<Vec<MediaItem>> {
        Err(Error::Internal("media index unavailable".into()))
    }

    async fn find_bundle_by_message(&self, message_id: &str) -> Result<Vec<MediaItem>> {
        self.0.find_bundle_by_message(message_id).await
    }
}

#[tokio::test]
async fn test_failed_enqueue_does_not_leave_job_queued() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let queue = OcrQueue::builder(base_config(&dir))
        .with_memory_store(&store)
        .with_media_repository(Arc::new(UnavailableMedia(store.media())))
        .with_provider(Arc::new(MockOcrProvider::new()))
        .build()
        .unwrap();

    let err = queue
        .create_job(request(OcrJobMode::Missing))
        .await
        .unwrap_err();
    assert!(err.to_string().contains("media index unavailable"));

    let jobs = queue.list_jobs(10, 0).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert!(!jobs[0].job.status.is_active());
    assert_eq!(jobs[0].job.status, OcrJobStatus::Completed);
    assert_eq!(jobs[0].counts.total, 0);
}

#[tokio::test]
async fn test_fallback_provider_is_recorded() {
    let store = MemoryStore::new();
    let dir = tempfile::tempdir().unwrap();
    let group = store.add_group("Family scans", true);
    std::fs::write(dir.path().join("a.png"), png(16, 12)).unwrap();
    let media = store.add_media(group, None, "a.png", Some("image/png"), MediaType::Image);

    let primary = MockOcrProvider::new()
        .with_name("tesseract")
        .always_failing("binary missing");
    let fallback = MockOcrProvider::new().with_name("azure");
    let chain = ProviderChain::new(Arc::new(primary.clone()))
        .with_fallback(Arc::new(fallback.clone()));
    let queue = OcrQueue::builder(base_config(&dir))
        .with_memory_store(&store)
        .with_provider(Arc::new(chain))
        .build()
        .unwrap();

    queue.create_job(request(OcrJobMode::Missing)).await.unwrap();
    queue.tick().await.unwrap();

    let doc = queue.result_for_media(media).await.unwrap().unwrap();
    assert_eq!(doc.status, OcrDocumentStatus::Succeeded);
    assert_eq!(doc.provider.as_deref(), Some("azure"));
    assert_eq!(primary.call_count(), 1);
    assert_eq!(fallback.call_count(), 1);
}
