//! OCR queue engine and job API.
//!
//! [`OcrQueue`] owns the job lifecycle: creating jobs and enqueueing their
//! documents, cancelling, retrying failures, and answering status queries.
//! Document processing lives in [`crate::processor`], the poller in
//! [`crate::poller`]. All coordination between concurrent workers happens
//! through the document repository's claim; the only in-process state is the
//! tick re-entrancy flag and the wake-up notifier.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chatvault_core::defaults::{PAGE_LIMIT_MAX, PROGRESS_AUDIENCE};
use chatvault_core::{
    CreateOcrJobRequest, CreatedOcrJob, Error, EventActor, EventBus, FileStore, GroupDirectory,
    MediaRepository, OcrDocument, OcrDocumentRepository, OcrDocumentStatus, OcrJob,
    OcrJobRepository, OcrJobSummary, OcrProvider, ProgressSink, Result, RetryPolicy, ServerEvent,
};
use chatvault_db::{Database, MemoryStore};

use crate::bundle::BundleBuilder;
use crate::config::OcrConfig;
use crate::files::LocalFileStore;
use crate::providers::ProviderRegistry;

/// Shared engine state; cloned handles of [`OcrQueue`] point at one of these.
pub(crate) struct QueueInner {
    pub(crate) config: OcrConfig,
    pub(crate) policy: RetryPolicy,
    pub(crate) jobs: Arc<dyn OcrJobRepository>,
    pub(crate) documents: Arc<dyn OcrDocumentRepository>,
    pub(crate) media: Arc<dyn MediaRepository>,
    pub(crate) groups: Arc<dyn GroupDirectory>,
    pub(crate) files: Arc<dyn FileStore>,
    pub(crate) bundles: BundleBuilder,
    pub(crate) provider: Arc<dyn OcrProvider>,
    pub(crate) progress: Arc<dyn ProgressSink>,
    /// Set while a tick runs; see [`OcrQueue::tick`].
    pub(crate) ticking: AtomicBool,
    pub(crate) wake: Notify,
}

impl QueueInner {
    pub(crate) fn publish(&self, event: ServerEvent) {
        self.progress.publish(PROGRESS_AUDIENCE, event);
    }

    /// Publish an event caused by the operator `actor`.
    fn publish_as(&self, event: ServerEvent, actor: &str) {
        self.progress
            .publish_as(PROGRESS_AUDIENCE, event, EventActor::user(actor));
    }

    pub(crate) fn publish_progress(&self, summary: &OcrJobSummary) {
        self.publish(ServerEvent::OcrJobProgress {
            job_id: summary.job.id,
            status: summary.job.status,
            counts: summary.counts,
        });
    }

    /// Recompute a job's aggregates and broadcast them.
    pub(crate) async fn refresh(&self, job_id: Uuid) -> Result<OcrJobSummary> {
        let summary = self.jobs.refresh(job_id).await?;
        debug!(
            subsystem = "ocr",
            component = "queue",
            op = "refresh_job",
            job_id = %job_id,
            status = summary.job.status.as_str(),
            processed = summary.counts.processed(),
            total = summary.counts.total,
            "Job aggregates refreshed"
        );
        self.publish_progress(&summary);
        Ok(summary)
    }

    async fn require_job(&self, job_id: Uuid) -> Result<OcrJob> {
        self.jobs
            .get(job_id)
            .await?
            .ok_or(Error::JobNotFound(job_id))
    }
}

/// The OCR queue engine. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct OcrQueue {
    pub(crate) inner: Arc<QueueInner>,
}

impl OcrQueue {
    pub fn builder(config: OcrConfig) -> OcrQueueBuilder {
        OcrQueueBuilder::new(config)
    }

    pub fn config(&self) -> &OcrConfig {
        &self.inner.config
    }

    /// Nudge the poller to tick now instead of at the next interval.
    pub fn wake(&self) {
        self.inner.wake.notify_one();
    }

    // ─── Job API ───────────────────────────────────────────────────────────

    /// Create a job and enqueue documents for its candidate media.
    ///
    /// A job with nothing to queue completes immediately. If enqueueing fails
    /// the job is refreshed from whatever was queued before the error is
    /// returned, so it never stays `queued` with no documents.
    pub async fn create_job(&self, req: CreateOcrJobRequest) -> Result<CreatedOcrJob> {
        if req.requested_by.trim().is_empty() {
            return Err(Error::InvalidInput("requested_by must not be empty".into()));
        }

        let inner = &self.inner;
        let job = inner.jobs.create(&req).await?;

        let (candidates, queued_count) = match self.enqueue_candidates(job.id, &req).await {
            Ok(enqueued) => enqueued,
            Err(e) => {
                warn!(
                    subsystem = "ocr",
                    component = "queue",
                    op = "create_job",
                    job_id = %job.id,
                    error = %e,
                    "Enqueue failed, settling job"
                );
                if let Err(refresh_err) = inner.refresh(job.id).await {
                    error!(
                        subsystem = "ocr",
                        component = "queue",
                        job_id = %job.id,
                        error = %refresh_err,
                        "Could not settle job after failed enqueue"
                    );
                }
                return Err(e);
            }
        };

        inner.publish_as(
            ServerEvent::OcrJobCreated {
                job_id: job.id,
                mode: req.mode,
                group_id: req.group_id,
                queued_count,
            },
            &req.requested_by,
        );
        let summary = inner.refresh(job.id).await?;

        info!(
            subsystem = "ocr",
            component = "queue",
            op = "create_job",
            job_id = %job.id,
            mode = req.mode.as_str(),
            group_id = ?req.group_id,
            requested_by = %req.requested_by,
            candidates,
            queued_count,
            status = summary.job.status.as_str(),
            "OCR job created"
        );

        if queued_count > 0 {
            self.wake();
        }

        Ok(CreatedOcrJob {
            job_id: job.id,
            queued_count,
            job: summary.job,
        })
    }

    /// Returns the candidate count and how many documents were queued.
    async fn enqueue_candidates(
        &self,
        job_id: Uuid,
        req: &CreateOcrJobRequest,
    ) -> Result<(usize, i64)> {
        let candidates = self.inner.media.find_ocr_candidates(req.group_id).await?;
        let media_ids: Vec<Uuid> = candidates.iter().map(|m| m.id).collect();
        let queued = self
            .inner
            .documents
            .enqueue(job_id, req.mode, &media_ids)
            .await?;
        Ok((media_ids.len(), queued))
    }

    /// Jobs newest first, each with live counts.
    pub async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<OcrJobSummary>> {
        let (limit, offset) = clamp_page(limit, offset);
        let jobs = self.inner.jobs.list(limit, offset).await?;

        let mut summaries = Vec::with_capacity(jobs.len());
        for job in jobs {
            let counts = self.inner.jobs.counts(job.id).await?;
            summaries.push(OcrJobSummary { job, counts });
        }
        Ok(summaries)
    }

    pub async fn get_job(&self, job_id: Uuid) -> Result<OcrJobSummary> {
        let job = self.inner.require_job(job_id).await?;
        let counts = self.inner.jobs.counts(job_id).await?;
        Ok(OcrJobSummary { job, counts })
    }

    /// Documents currently attached to a job, optionally filtered by status.
    pub async fn list_documents(
        &self,
        job_id: Uuid,
        status: Option<OcrDocumentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OcrDocument>> {
        self.inner.require_job(job_id).await?;
        let (limit, offset) = clamp_page(limit, offset);
        self.inner
            .documents
            .list_for_job(job_id, status, limit, offset)
            .await
    }

    /// Cancel a job on behalf of `actor`. Documents at rest are skipped;
    /// in-flight ones finish.
    pub async fn cancel_job(&self, job_id: Uuid, actor: &str) -> Result<OcrJob> {
        let before = self.inner.require_job(job_id).await?;
        let job = self.inner.jobs.cancel(job_id).await?;

        if before.status.is_active() {
            info!(
                subsystem = "ocr",
                component = "queue",
                op = "cancel_job",
                job_id = %job_id,
                actor,
                skipped = job.skipped_items,
                "OCR job cancelled"
            );
            self.inner.publish_as(
                ServerEvent::OcrJobCancelled {
                    job_id,
                    skipped: job.skipped_items,
                },
                actor,
            );
            let counts = self.inner.jobs.counts(job_id).await?;
            self.inner.publish_progress(&OcrJobSummary {
                job: job.clone(),
                counts,
            });
        }
        Ok(job)
    }

    /// Requeue a job's failed documents on behalf of `actor`. Returns how
    /// many were requeued.
    pub async fn retry_failed(&self, job_id: Uuid, actor: &str) -> Result<i64> {
        let retried = self.inner.jobs.retry_failed(job_id).await?;

        info!(
            subsystem = "ocr",
            component = "queue",
            op = "retry_failed",
            job_id = %job_id,
            actor,
            retried,
            "Failed OCR documents requeued"
        );

        if retried > 0 {
            self.inner
                .publish_as(ServerEvent::OcrJobRetried { job_id, retried }, actor);
            let summary = self.get_job(job_id).await?;
            self.inner.publish_progress(&summary);
            self.wake();
        }
        Ok(retried)
    }

    /// OCR result for a media item, hidden once its group stops being monitored.
    pub async fn result_for_media(&self, media_id: Uuid) -> Result<Option<OcrDocument>> {
        let Some(media) = self.inner.media.get(media_id).await? else {
            return Ok(None);
        };
        if !self.inner.groups.is_monitored(media.group_id).await? {
            return Ok(None);
        }
        self.inner.documents.get_by_media(media_id).await
    }

    /// Recompute a job's aggregates from its documents and broadcast them.
    pub async fn refresh_job(&self, job_id: Uuid) -> Result<OcrJobSummary> {
        self.inner.refresh(job_id).await
    }
}

fn clamp_page(limit: i64, offset: i64) -> (i64, i64) {
    (limit.clamp(1, PAGE_LIMIT_MAX), offset.max(0))
}

/// Builder for [`OcrQueue`].
///
/// Repositories are required; the file store, providers and progress sink
/// default to [`LocalFileStore`], the registry's chain for the config, and a
/// fresh [`EventBus`].
pub struct OcrQueueBuilder {
    config: OcrConfig,
    jobs: Option<Arc<dyn OcrJobRepository>>,
    documents: Option<Arc<dyn OcrDocumentRepository>>,
    media: Option<Arc<dyn MediaRepository>>,
    groups: Option<Arc<dyn GroupDirectory>>,
    files: Option<Arc<dyn FileStore>>,
    provider: Option<Arc<dyn OcrProvider>>,
    registry: Option<ProviderRegistry>,
    progress: Option<Arc<dyn ProgressSink>>,
}

impl OcrQueueBuilder {
    pub fn new(config: OcrConfig) -> Self {
        Self {
            config,
            jobs: None,
            documents: None,
            media: None,
            groups: None,
            files: None,
            provider: None,
            registry: None,
            progress: None,
        }
    }

    /// Use the PostgreSQL repositories of `db`.
    pub fn with_database(self, db: &Database) -> Self {
        self.with_job_repository(Arc::new(db.ocr_jobs.clone()))
            .with_document_repository(Arc::new(db.ocr_documents.clone()))
            .with_media_repository(Arc::new(db.media.clone()))
            .with_group_directory(Arc::new(db.groups.clone()))
    }

    /// Use the in-memory repositories of `store`.
    pub fn with_memory_store(self, store: &MemoryStore) -> Self {
        self.with_job_repository(Arc::new(store.jobs()))
            .with_document_repository(Arc::new(store.documents()))
            .with_media_repository(Arc::new(store.media()))
            .with_group_directory(Arc::new(store.groups()))
    }

    pub fn with_job_repository(mut self, jobs: Arc<dyn OcrJobRepository>) -> Self {
        self.jobs = Some(jobs);
        self
    }

    pub fn with_document_repository(mut self, documents: Arc<dyn OcrDocumentRepository>) -> Self {
        self.documents = Some(documents);
        self
    }

    pub fn with_media_repository(mut self, media: Arc<dyn MediaRepository>) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_group_directory(mut self, groups: Arc<dyn GroupDirectory>) -> Self {
        self.groups = Some(groups);
        self
    }

    pub fn with_file_store(mut self, files: Arc<dyn FileStore>) -> Self {
        self.files = Some(files);
        self
    }

    /// Use `provider` directly instead of building a chain from the registry.
    pub fn with_provider(mut self, provider: Arc<dyn OcrProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Registry used to resolve the configured provider ids.
    pub fn with_registry(mut self, registry: ProviderRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_progress_sink(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn build(self) -> Result<OcrQueue> {
        let missing = |what: &str| Error::Config(format!("OCR queue requires a {}", what));

        let jobs = self.jobs.ok_or_else(|| missing("job repository"))?;
        let documents = self.documents.ok_or_else(|| missing("document repository"))?;
        let media = self.media.ok_or_else(|| missing("media repository"))?;
        let groups = self.groups.ok_or_else(|| missing("group directory"))?;

        let files = self.files.unwrap_or_else(|| {
            Arc::new(LocalFileStore::new(self.config.media_root.clone())) as Arc<dyn FileStore>
        });

        let provider = match self.provider {
            Some(provider) => provider,
            None => {
                let registry = self.registry.unwrap_or_else(ProviderRegistry::with_defaults);
                Arc::new(registry.build_chain(&self.config)?) as Arc<dyn OcrProvider>
            }
        };

        let progress = self
            .progress
            .unwrap_or_else(|| Arc::new(EventBus::default()) as Arc<dyn ProgressSink>);

        Ok(OcrQueue {
            inner: Arc::new(QueueInner {
                policy: self.config.retry_policy(),
                bundles: BundleBuilder::new(media.clone(), files.clone()),
                config: self.config,
                jobs,
                documents,
                media,
                groups,
                files,
                provider,
                progress,
                ticking: AtomicBool::new(false),
                wake: Notify::new(),
            }),
        })
    }
}
