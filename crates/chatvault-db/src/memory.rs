//! In-memory implementation of the OCR repositories.
//!
//! Mirrors the PostgreSQL semantics closely enough to drive the queue engine
//! without a database: claims are serialized by one mutex, which gives the
//! same "no row handed out twice" guarantee `SKIP LOCKED` gives the real
//! store. Used by engine tests and by dry runs of the worker binary.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use chatvault_core::{
    new_v7, CreateOcrJobRequest, Error, GroupDirectory, MediaItem, MediaRepository, MediaType,
    OcrDocument, OcrDocumentRepository, OcrDocumentStatus, OcrJob, OcrJobCounts, OcrJobMode,
    OcrJobRepository, OcrJobStatus, OcrJobSummary, OcrSuccess, Result, RetryDecision,
    RetryPolicy, SkipReason, StaleRecovery, STALE_PROCESSING_ERROR,
};

use crate::ocr_documents::first_per_bundle;

#[derive(Debug, Clone)]
struct GroupRecord {
    name: String,
    monitored: bool,
}

#[derive(Default)]
struct MemoryState {
    groups: HashMap<Uuid, GroupRecord>,
    /// Insertion order doubles as media creation order.
    media: Vec<MediaItem>,
    jobs: HashMap<Uuid, OcrJob>,
    documents: HashMap<Uuid, OcrDocument>,
}

impl MemoryState {
    fn document_by_media(&self, media_id: Uuid) -> Option<&OcrDocument> {
        self.documents.values().find(|d| d.media_id == media_id)
    }

    fn document_id_by_media(&self, media_id: Uuid) -> Option<Uuid> {
        self.document_by_media(media_id).map(|d| d.id)
    }

    fn bundle_key(&self, media_id: Uuid) -> Option<String> {
        self.media
            .iter()
            .find(|m| m.id == media_id)
            .and_then(|m| m.bundle_key())
            .map(String::from)
    }

    fn counts(&self, job_id: Uuid) -> OcrJobCounts {
        let mut counts = OcrJobCounts::default();
        for doc in self.documents.values().filter(|d| d.job_id == Some(job_id)) {
            counts.record(doc.status);
        }
        counts
    }

    fn store_aggregates(&mut self, job_id: Uuid, now: DateTime<Utc>) -> Result<OcrJobSummary> {
        let counts = self.counts(job_id);
        let last_error = self
            .documents
            .values()
            .filter(|d| d.job_id == Some(job_id) && d.error_message.is_some())
            .max_by_key(|d| d.updated_at)
            .and_then(|d| d.error_message.clone());

        let job = self
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        let status = counts.resolve_status(job.status);

        if job.started_at.is_none() && status == OcrJobStatus::Running {
            job.started_at = Some(now);
        }
        if status == OcrJobStatus::Completed && job.status != OcrJobStatus::Completed {
            job.finished_at = Some(now);
        }
        job.status = status;
        job.total_items = counts.total;
        job.processed_items = counts.processed();
        job.succeeded_items = counts.succeeded;
        job.failed_items = counts.failed;
        job.skipped_items = counts.skipped;
        job.last_error = last_error;
        job.updated_at = now;

        Ok(OcrJobSummary {
            job: job.clone(),
            counts,
        })
    }
}

fn new_document(job_id: Uuid, media_id: Uuid, now: DateTime<Utc>) -> OcrDocument {
    OcrDocument {
        id: new_v7(),
        job_id: Some(job_id),
        media_id,
        status: OcrDocumentStatus::Queued,
        attempts: 0,
        next_attempt_at: None,
        error_message: None,
        provider: None,
        language: None,
        text: None,
        result_json: None,
        created_at: now,
        started_at: None,
        finished_at: None,
        updated_at: now,
    }
}

fn reset_to_queued(doc: &mut OcrDocument, now: DateTime<Utc>) {
    doc.status = OcrDocumentStatus::Queued;
    doc.attempts = 0;
    doc.next_attempt_at = None;
    doc.error_message = None;
    doc.started_at = None;
    doc.finished_at = None;
    doc.updated_at = now;
}

fn clear_result(doc: &mut OcrDocument) {
    doc.provider = None;
    doc.language = None;
    doc.text = None;
    doc.result_json = None;
}

/// Shared in-memory store. Clone handles share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A panic while holding the lock leaves plain data behind; keep going.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn jobs(&self) -> MemoryJobs {
        MemoryJobs(self.clone())
    }

    pub fn documents(&self) -> MemoryDocuments {
        MemoryDocuments(self.clone())
    }

    pub fn media(&self) -> MemoryMedia {
        MemoryMedia(self.clone())
    }

    pub fn groups(&self) -> MemoryGroups {
        MemoryGroups(self.clone())
    }

    // ─── Seeding ───────────────────────────────────────────────────────────

    /// Register a chat group and return its id.
    pub fn add_group(&self, name: &str, monitored: bool) -> Uuid {
        let id = new_v7();
        self.lock().groups.insert(
            id,
            GroupRecord {
                name: name.to_string(),
                monitored,
            },
        );
        id
    }

    pub fn set_monitored(&self, group_id: Uuid, monitored: bool) {
        if let Some(group) = self.lock().groups.get_mut(&group_id) {
            group.monitored = monitored;
        }
    }

    pub fn group_name(&self, group_id: Uuid) -> Option<String> {
        self.lock().groups.get(&group_id).map(|g| g.name.clone())
    }

    /// Add a media record and return its id.
    pub fn add_media(
        &self,
        group_id: Uuid,
        message_id: Option<&str>,
        file_path: &str,
        mime_type: Option<&str>,
        media_type: MediaType,
    ) -> Uuid {
        let item = MediaItem {
            id: new_v7(),
            group_id,
            message_id: message_id.map(String::from),
            file_path: file_path.to_string(),
            mime_type: mime_type.map(String::from),
            media_type,
        };
        let id = item.id;
        self.lock().media.push(item);
        id
    }

    /// Delete a media record and, like the cascading foreign key, its document.
    pub fn remove_media(&self, media_id: Uuid) {
        let mut state = self.lock();
        state.media.retain(|m| m.id != media_id);
        state.documents.retain(|_, d| d.media_id != media_id);
    }

    /// Snapshot of every document, oldest first.
    pub fn all_documents(&self) -> Vec<OcrDocument> {
        let mut docs: Vec<OcrDocument> = self.lock().documents.values().cloned().collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        docs
    }

    /// Overwrite a document, e.g. to simulate a crashed worker.
    pub fn put_document(&self, doc: OcrDocument) {
        self.lock().documents.insert(doc.id, doc);
    }
}

/// [`OcrJobRepository`] view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryJobs(MemoryStore);

/// [`OcrDocumentRepository`] view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryDocuments(MemoryStore);

/// [`MediaRepository`] view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryMedia(MemoryStore);

/// [`GroupDirectory`] view of a [`MemoryStore`].
#[derive(Clone)]
pub struct MemoryGroups(MemoryStore);

#[async_trait]
impl OcrJobRepository for MemoryJobs {
    async fn create(&self, req: &CreateOcrJobRequest) -> Result<OcrJob> {
        let now = Utc::now();
        let job = OcrJob {
            id: new_v7(),
            mode: req.mode,
            group_id: req.group_id,
            requested_by: req.requested_by.clone(),
            status: OcrJobStatus::Queued,
            total_items: 0,
            processed_items: 0,
            succeeded_items: 0,
            failed_items: 0,
            skipped_items: 0,
            last_error: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        };
        self.0.lock().jobs.insert(job.id, job.clone());
        Ok(job)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<OcrJob>> {
        Ok(self.0.lock().jobs.get(&job_id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<OcrJob>> {
        let mut jobs: Vec<OcrJob> = self.0.lock().jobs.values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn counts(&self, job_id: Uuid) -> Result<OcrJobCounts> {
        Ok(self.0.lock().counts(job_id))
    }

    async fn refresh(&self, job_id: Uuid) -> Result<OcrJobSummary> {
        self.0.lock().store_aggregates(job_id, Utc::now())
    }

    async fn cancel(&self, job_id: Uuid) -> Result<OcrJob> {
        let now = Utc::now();
        let mut state = self.0.lock();

        let job = state
            .jobs
            .get_mut(&job_id)
            .ok_or(Error::JobNotFound(job_id))?;
        if !job.status.is_active() {
            return Ok(job.clone());
        }
        job.status = OcrJobStatus::Cancelled;
        job.finished_at = Some(now);

        for doc in state.documents.values_mut().filter(|d| {
            d.job_id == Some(job_id)
                && matches!(
                    d.status,
                    OcrDocumentStatus::Queued | OcrDocumentStatus::Processing
                )
        }) {
            doc.status = OcrDocumentStatus::Skipped;
            doc.error_message = Some(SkipReason::JobCancelled.message().to_string());
            doc.next_attempt_at = None;
            doc.finished_at = Some(now);
            doc.updated_at = now;
        }

        Ok(state.store_aggregates(job_id, now)?.job)
    }

    async fn retry_failed(&self, job_id: Uuid) -> Result<i64> {
        let now = Utc::now();
        let mut state = self.0.lock();

        let status = state
            .jobs
            .get(&job_id)
            .map(|j| j.status)
            .ok_or(Error::JobNotFound(job_id))?;
        if status == OcrJobStatus::Cancelled {
            return Err(Error::InvalidInput(format!(
                "OCR job {job_id} is cancelled"
            )));
        }

        let mut retried = 0;
        for doc in state
            .documents
            .values_mut()
            .filter(|d| d.job_id == Some(job_id) && d.status == OcrDocumentStatus::Failed)
        {
            reset_to_queued(doc, now);
            clear_result(doc);
            retried += 1;
        }

        if retried > 0 && status == OcrJobStatus::Completed {
            if let Some(job) = state.jobs.get_mut(&job_id) {
                job.status = OcrJobStatus::Running;
                job.finished_at = None;
            }
        }
        state.store_aggregates(job_id, now)?;
        Ok(retried)
    }
}

#[async_trait]
impl OcrDocumentRepository for MemoryDocuments {
    async fn enqueue(&self, job_id: Uuid, mode: OcrJobMode, media_ids: &[Uuid]) -> Result<i64> {
        let now = Utc::now();
        let mut state = self.0.lock();
        let mut queued = 0;

        for &media_id in media_ids {
            match state.document_id_by_media(media_id) {
                None => {
                    let doc = new_document(job_id, media_id, now);
                    state.documents.insert(doc.id, doc);
                    queued += 1;
                }
                Some(id) => {
                    let Some(doc) = state.documents.get_mut(&id) else {
                        continue;
                    };
                    match mode {
                        OcrJobMode::Missing => {}
                        OcrJobMode::All => {
                            reset_to_queued(doc, now);
                            clear_result(doc);
                            doc.job_id = Some(job_id);
                            queued += 1;
                        }
                        OcrJobMode::Failed if doc.status == OcrDocumentStatus::Failed => {
                            reset_to_queued(doc, now);
                            doc.job_id = Some(job_id);
                            queued += 1;
                        }
                        OcrJobMode::Failed => {}
                    }
                }
            }
        }
        Ok(queued)
    }

    async fn claim_batch(&self, limit: i64) -> Result<Vec<OcrDocument>> {
        let now = Utc::now();
        let mut state = self.0.lock();

        let in_flight: HashSet<String> = state
            .documents
            .values()
            .filter(|d| d.status == OcrDocumentStatus::Processing)
            .filter_map(|d| state.bundle_key(d.media_id))
            .collect();

        let mut eligible: Vec<(DateTime<Utc>, Uuid, Option<String>)> = state
            .documents
            .values()
            .filter(|d| d.status == OcrDocumentStatus::Queued)
            .filter(|d| d.next_attempt_at.map_or(true, |at| at <= now))
            .filter(|d| {
                d.job_id
                    .and_then(|j| state.jobs.get(&j))
                    .is_some_and(|j| j.status.is_active())
            })
            .map(|d| (d.created_at, d.id, state.bundle_key(d.media_id)))
            .filter(|(_, _, key)| key.as_ref().map_or(true, |k| !in_flight.contains(k)))
            .collect();
        eligible.sort();

        let mut ids = first_per_bundle(eligible.into_iter().map(|(_, id, key)| (id, key)));
        ids.truncate(limit.max(0) as usize);

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(doc) = state.documents.get_mut(&id) {
                doc.status = OcrDocumentStatus::Processing;
                doc.started_at = Some(now);
                doc.updated_at = now;
                claimed.push(doc.clone());
            }
        }
        Ok(claimed)
    }

    async fn get(&self, document_id: Uuid) -> Result<Option<OcrDocument>> {
        Ok(self.0.lock().documents.get(&document_id).cloned())
    }

    async fn get_by_media(&self, media_id: Uuid) -> Result<Option<OcrDocument>> {
        Ok(self.0.lock().document_by_media(media_id).cloned())
    }

    async fn list_for_job(
        &self,
        job_id: Uuid,
        status: Option<OcrDocumentStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<OcrDocument>> {
        let mut docs: Vec<OcrDocument> = self
            .0
            .lock()
            .documents
            .values()
            .filter(|d| d.job_id == Some(job_id))
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        docs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(docs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn has_succeeded_sibling(
        &self,
        message_id: &str,
        exclude_document_id: Uuid,
    ) -> Result<bool> {
        let state = self.0.lock();
        let found = state
            .media
            .iter()
            .filter(|m| m.media_type.is_bundleable() && m.message_id.as_deref() == Some(message_id))
            .filter_map(|m| state.document_by_media(m.id))
            .any(|d| d.id != exclude_document_id && d.status == OcrDocumentStatus::Succeeded);
        Ok(found)
    }

    async fn mark_skipped(&self, document_id: Uuid, reason: SkipReason) -> Result<bool> {
        let now = Utc::now();
        let mut state = self.0.lock();
        match state.documents.get_mut(&document_id) {
            Some(doc) if doc.status == OcrDocumentStatus::Processing => {
                doc.status = OcrDocumentStatus::Skipped;
                doc.error_message = Some(reason.message().to_string());
                doc.next_attempt_at = None;
                doc.finished_at = Some(now);
                doc.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn mark_succeeded(&self, document_id: Uuid, success: &OcrSuccess) -> Result<Vec<Uuid>> {
        let now = Utc::now();
        let payload = success.result_json();
        let extraction = &success.extraction;
        let mut state = self.0.lock();

        let (own_job, own_media) = state
            .documents
            .get(&document_id)
            .map(|d| (d.job_id, d.media_id))
            .ok_or_else(|| Error::NotFound(format!("OCR document {document_id}")))?;

        let mut targets = vec![own_media];
        targets.extend(success.media_ids.iter().copied().filter(|id| *id != own_media));

        let mut job_ids = Vec::new();
        for media_id in targets {
            let id = match state.document_id_by_media(media_id) {
                Some(id) => id,
                None => {
                    let mut doc = new_document(Uuid::nil(), media_id, now);
                    doc.job_id = own_job;
                    doc.started_at = Some(now);
                    let id = doc.id;
                    state.documents.insert(id, doc);
                    id
                }
            };
            if let Some(doc) = state.documents.get_mut(&id) {
                doc.status = OcrDocumentStatus::Succeeded;
                doc.text = Some(extraction.text.clone());
                doc.provider = Some(extraction.provider.clone());
                doc.language = Some(extraction.language.clone());
                doc.result_json = Some(payload.clone());
                doc.error_message = None;
                doc.next_attempt_at = None;
                doc.finished_at = Some(now);
                doc.updated_at = now;
                job_ids.extend(doc.job_id);
            }
        }

        job_ids.sort();
        job_ids.dedup();
        Ok(job_ids)
    }

    async fn record_failure(
        &self,
        document_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryDecision>> {
        let now = Utc::now();
        let mut state = self.0.lock();
        let Some(doc) = state
            .documents
            .get_mut(&document_id)
            .filter(|d| d.status == OcrDocumentStatus::Processing)
        else {
            return Ok(None);
        };

        let decision = policy.decide(doc.attempts, now);
        doc.attempts = decision.attempts();
        doc.error_message = Some(error.to_string());
        doc.updated_at = now;
        match decision {
            RetryDecision::Retry {
                next_attempt_at, ..
            } => {
                doc.status = OcrDocumentStatus::Queued;
                doc.next_attempt_at = Some(next_attempt_at);
                doc.started_at = None;
            }
            RetryDecision::GiveUp { .. } => {
                doc.status = OcrDocumentStatus::Failed;
                doc.next_attempt_at = None;
                doc.finished_at = Some(now);
            }
        }
        Ok(Some(decision))
    }

    async fn requeue_stale(
        &self,
        started_before: DateTime<Utc>,
        policy: &RetryPolicy,
    ) -> Result<StaleRecovery> {
        let now = Utc::now();
        let mut recovery = StaleRecovery::default();
        for doc in self.0.lock().documents.values_mut().filter(|d| {
            d.status == OcrDocumentStatus::Processing
                && d.started_at.is_some_and(|at| at < started_before)
        }) {
            let decision = policy.decide(doc.attempts, now);
            doc.attempts = decision.attempts();
            doc.error_message = Some(STALE_PROCESSING_ERROR.to_string());
            doc.updated_at = now;
            match decision {
                RetryDecision::Retry {
                    next_attempt_at, ..
                } => {
                    doc.status = OcrDocumentStatus::Queued;
                    doc.next_attempt_at = Some(next_attempt_at);
                    doc.started_at = None;
                    recovery.requeued += 1;
                }
                RetryDecision::GiveUp { .. } => {
                    doc.status = OcrDocumentStatus::Failed;
                    doc.next_attempt_at = None;
                    doc.finished_at = Some(now);
                    recovery.failed += 1;
                    recovery.failed_job_ids.extend(doc.job_id);
                }
            }
        }
        recovery.failed_job_ids.sort();
        recovery.failed_job_ids.dedup();
        Ok(recovery)
    }
}

#[async_trait]
impl MediaRepository for MemoryMedia {
    async fn get(&self, media_id: Uuid) -> Result<Option<MediaItem>> {
        Ok(self.0.lock().media.iter().find(|m| m.id == media_id).cloned())
    }

    async fn find_ocr_candidates(&self, group_id: Option<Uuid>) -> Result<Vec<MediaItem>> {
        let state = self.0.lock();
        Ok(state
            .media
            .iter()
            .filter(|m| m.media_type.is_ocr_eligible())
            .filter(|m| group_id.map_or(true, |g| m.group_id == g))
            .filter(|m| state.groups.get(&m.group_id).is_some_and(|g| g.monitored))
            .cloned()
            .collect())
    }

    async fn find_bundle_by_message(&self, message_id: &str) -> Result<Vec<MediaItem>> {
        Ok(self
            .0
            .lock()
            .media
            .iter()
            .filter(|m| m.media_type.is_bundleable() && m.message_id.as_deref() == Some(message_id))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl GroupDirectory for MemoryGroups {
    async fn is_monitored(&self, group_id: Uuid) -> Result<bool> {
        Ok(self
            .0
            .lock()
            .groups
            .get(&group_id)
            .is_some_and(|g| g.monitored))
    }
}
