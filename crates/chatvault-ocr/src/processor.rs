//! Processing of one claimed document.

use std::time::Instant;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use chatvault_core::{
    OcrDocument, OcrDocumentStatus, OcrSuccess, Result, RetryDecision, ServerEvent, SkipReason,
};

use crate::queue::QueueInner;

/// How processing of a claimed document ended.
#[derive(Debug, Clone)]
pub(crate) enum Outcome {
    Succeeded {
        job_ids: Vec<Uuid>,
        media_ids: Vec<Uuid>,
        /// Provider that produced the text, which may be a fallback.
        provider: String,
    },
    Skipped(SkipReason),
    Failed(RetryDecision),
    /// The document left `processing` (cancelled, recovered, deleted)
    /// before this worker could write a result.
    Released,
}

impl QueueInner {
    /// Process a claimed document to a terminal state or a scheduled retry.
    ///
    /// Never returns an error: anything that goes wrong is logged and routed
    /// into the document's failure path so siblings in the batch carry on.
    pub(crate) async fn process(&self, claimed: OcrDocument) {
        let start = Instant::now();
        let document_id = claimed.id;

        let outcome = match self.run_pipeline(&claimed).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    subsystem = "ocr",
                    component = "processor",
                    document_id = %document_id,
                    error = %e,
                    "OCR document processing error"
                );
                match self.fail(document_id, &e.to_string()).await {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!(
                            subsystem = "ocr",
                            component = "processor",
                            document_id = %document_id,
                            error = %e,
                            "Failed to record OCR failure; stale recovery will requeue"
                        );
                        return;
                    }
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        match &outcome {
            Outcome::Succeeded {
                media_ids,
                provider,
                ..
            } => info!(
                subsystem = "ocr",
                component = "processor",
                document_id = %document_id,
                media_id = %claimed.media_id,
                provider = %provider,
                bundle_size = media_ids.len(),
                duration_ms,
                "OCR document succeeded"
            ),
            Outcome::Skipped(reason) => debug!(
                subsystem = "ocr",
                component = "processor",
                document_id = %document_id,
                skip_reason = reason.message(),
                duration_ms,
                "OCR document skipped"
            ),
            Outcome::Failed(decision) => warn!(
                subsystem = "ocr",
                component = "processor",
                document_id = %document_id,
                attempts = decision.attempts(),
                final_attempt = decision.is_final(),
                duration_ms,
                "OCR document failed"
            ),
            Outcome::Released => debug!(
                subsystem = "ocr",
                component = "processor",
                document_id = %document_id,
                "OCR document no longer claimed, result dropped"
            ),
        }

        self.announce(&claimed, &outcome).await;
    }

    async fn run_pipeline(&self, claimed: &OcrDocument) -> Result<Outcome> {
        let Some(doc) = self.documents.get(claimed.id).await? else {
            return Ok(Outcome::Released);
        };
        if doc.status != OcrDocumentStatus::Processing {
            return Ok(Outcome::Released);
        }

        let Some(media) = self.media.get(doc.media_id).await? else {
            return self.skip(doc.id, SkipReason::MediaNotFound).await;
        };

        if let Some(message_id) = media.bundle_key() {
            if self
                .documents
                .has_succeeded_sibling(message_id, doc.id)
                .await?
            {
                return self.skip(doc.id, SkipReason::BundledElsewhere).await;
            }
        }

        if !self.groups.is_monitored(media.group_id).await? {
            return self.skip(doc.id, SkipReason::GroupNotMonitored).await;
        }

        if !self.files.exists(&media.file_path).await {
            return self
                .fail(doc.id, &format!("file not found: {}", media.file_path))
                .await;
        }

        let input = self.bundles.build(&media).await?;
        if input.bytes.len() > self.config.max_file_bytes {
            return self.skip(doc.id, SkipReason::ExceedsSizeLimit).await;
        }
        if !self.provider.supports(&input.mime_type, &input.filename) {
            return self.skip(doc.id, SkipReason::UnsupportedType).await;
        }

        debug!(
            subsystem = "ocr",
            component = "processor",
            document_id = %doc.id,
            input_bytes = input.bytes.len(),
            bundle_size = input.media_ids.len(),
            "Extracting text"
        );

        let extraction = match self
            .provider
            .extract(
                &input.bytes,
                &input.mime_type,
                &input.filename,
                &self.config.default_language,
            )
            .await
        {
            Ok(extraction) => extraction,
            Err(e) => return self.fail(doc.id, &e.to_string()).await,
        };
        debug!(
            subsystem = "ocr",
            component = "processor",
            document_id = %doc.id,
            provider = %extraction.provider,
            text_chars = extraction.text.chars().count(),
            "Text extracted"
        );

        let success = OcrSuccess {
            extraction,
            media_ids: input.media_ids,
        };
        let job_ids = self.documents.mark_succeeded(doc.id, &success).await?;
        Ok(Outcome::Succeeded {
            job_ids,
            media_ids: success.media_ids,
            provider: success.extraction.provider,
        })
    }

    async fn skip(&self, document_id: Uuid, reason: SkipReason) -> Result<Outcome> {
        if self.documents.mark_skipped(document_id, reason).await? {
            Ok(Outcome::Skipped(reason))
        } else {
            Ok(Outcome::Released)
        }
    }

    async fn fail(&self, document_id: Uuid, error: &str) -> Result<Outcome> {
        Ok(self
            .documents
            .record_failure(document_id, error, &self.policy)
            .await?
            .map(Outcome::Failed)
            .unwrap_or(Outcome::Released))
    }

    /// Broadcast the new document states and refresh affected jobs.
    async fn announce(&self, claimed: &OcrDocument, outcome: &Outcome) {
        let job_ids: Vec<Uuid> = match outcome {
            Outcome::Released => return,
            Outcome::Failed(RetryDecision::Retry { .. }) => {
                self.publish_document(self.documents.get(claimed.id).await, claimed.id);
                return;
            }
            Outcome::Succeeded {
                job_ids, media_ids, ..
            } => {
                for media_id in media_ids {
                    let doc = self.documents.get_by_media(*media_id).await;
                    self.publish_document(doc, claimed.id);
                }
                job_ids.clone()
            }
            Outcome::Skipped(_) | Outcome::Failed(RetryDecision::GiveUp { .. }) => {
                self.publish_document(self.documents.get(claimed.id).await, claimed.id);
                claimed.job_id.into_iter().collect()
            }
        };

        for job_id in job_ids {
            if let Err(e) = self.refresh(job_id).await {
                error!(
                    subsystem = "ocr",
                    component = "processor",
                    job_id = %job_id,
                    document_id = %claimed.id,
                    error = %e,
                    "Job aggregate refresh failed"
                );
            }
        }
    }

    fn publish_document(&self, lookup: Result<Option<OcrDocument>>, claimed_id: Uuid) {
        match lookup {
            Ok(Some(doc)) => self.publish(ServerEvent::OcrDocumentUpdated {
                document_id: doc.id,
                media_id: doc.media_id,
                job_id: doc.job_id,
                status: doc.status,
                error: doc.error_message,
            }),
            Ok(None) => {}
            Err(e) => warn!(
                subsystem = "ocr",
                component = "processor",
                document_id = %claimed_id,
                error = %e,
                "Could not load document for progress event"
            ),
        }
    }
}
