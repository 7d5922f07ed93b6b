//! Azure AI Vision Read API provider.
//!
//! The Read API is asynchronous: the image is submitted once, the service
//! answers `202 Accepted` with an `Operation-Location` URL, and that URL is
//! polled until the operation reports `succeeded` or `failed`.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use chatvault_core::defaults::{
    AZURE_OPERATION_TIMEOUT_SECS, AZURE_POLL_INTERVAL_MS, AZURE_READ_API_PATH,
};
use chatvault_core::{Error, OcrExtraction, OcrProvider, Result};

use super::{essence, extension};

const SUBSCRIPTION_KEY_HEADER: &str = "Ocp-Apim-Subscription-Key";
const OPERATION_LOCATION_HEADER: &str = "Operation-Location";

const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/bmp",
    "image/gif",
    "image/tiff",
    "application/pdf",
];

const SUPPORTED_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "tif", "tiff", "pdf"];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReadOperation {
    status: String,
    analyze_result: Option<AnalyzeResult>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResult {
    #[serde(default)]
    read_results: Vec<ReadPage>,
}

#[derive(Debug, Deserialize)]
struct ReadPage {
    #[serde(default)]
    lines: Vec<ReadLine>,
}

#[derive(Debug, Deserialize)]
struct ReadLine {
    text: String,
}

impl ReadOperation {
    /// Lines joined by newlines, pages separated by a blank line.
    fn text(&self) -> String {
        self.analyze_result
            .as_ref()
            .map(|result| {
                result
                    .read_results
                    .iter()
                    .map(|page| {
                        page.lines
                            .iter()
                            .map(|line| line.text.as_str())
                            .collect::<Vec<_>>()
                            .join("\n")
                    })
                    .filter(|page| !page.is_empty())
                    .collect::<Vec<_>>()
                    .join("\n\n")
            })
            .unwrap_or_default()
    }
}

/// Map a tesseract-style language code to the ISO 639-1 code Azure expects.
fn azure_language(language: &str) -> Option<&str> {
    let language = language.trim();
    if language.len() == 2 {
        return Some(language);
    }
    match language {
        "eng" => Some("en"),
        "deu" | "ger" => Some("de"),
        "fra" | "fre" => Some("fr"),
        "spa" => Some("es"),
        "ita" => Some("it"),
        "por" => Some("pt"),
        "nld" | "dut" => Some("nl"),
        _ => None,
    }
}

/// OCR through Azure AI Vision (Read API v3.2).
///
/// Missing credentials are reported per call as provider errors so documents
/// retry and recover once configuration is fixed.
#[derive(Debug, Clone)]
pub struct AzureReadProvider {
    client: reqwest::Client,
    endpoint: Option<String>,
    key: Option<String>,
    poll_interval: Duration,
    operation_timeout: Duration,
    request_timeout: Duration,
}

impl AzureReadProvider {
    pub fn new(endpoint: Option<String>, key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            key,
            poll_interval: Duration::from_millis(AZURE_POLL_INTERVAL_MS),
            operation_timeout: Duration::from_secs(AZURE_OPERATION_TIMEOUT_SECS),
            request_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.endpoint.is_some() && self.key.is_some()
    }

    fn credentials(&self) -> Result<(&str, &str)> {
        match (self.endpoint.as_deref(), self.key.as_deref()) {
            (Some(endpoint), Some(key)) => Ok((endpoint, key)),
            _ => Err(Error::Provider(
                "Azure Vision endpoint or key not configured".into(),
            )),
        }
    }

    async fn submit(&self, endpoint: &str, key: &str, data: &[u8], language: &str) -> Result<String> {
        let mut url = format!("{}/{}", endpoint, AZURE_READ_API_PATH);
        if let Some(code) = azure_language(language) {
            url.push_str("?language=");
            url.push_str(code);
        }

        let response = self
            .client
            .post(&url)
            .header(SUBSCRIPTION_KEY_HEADER, key)
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(data.to_vec())
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(|e| Error::Provider(format!("Azure read request failed: {}", e)))?;

        let status = response.status();
        if status != StatusCode::ACCEPTED && !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Provider(format!(
                "Azure Read API returned {}: {}",
                status, body
            )));
        }

        response
            .headers()
            .get(OPERATION_LOCATION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(String::from)
            .ok_or_else(|| Error::Provider("Azure response missing Operation-Location".into()))
    }

    async fn poll(&self, operation_url: &str, key: &str) -> Result<(ReadOperation, JsonValue)> {
        let deadline = Instant::now() + self.operation_timeout;
        loop {
            tokio::time::sleep(self.poll_interval).await;

            let response = self
                .client
                .get(operation_url)
                .header(SUBSCRIPTION_KEY_HEADER, key)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| Error::Provider(format!("Azure status request failed: {}", e)))?;

            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                return Err(Error::Provider(format!(
                    "Azure operation status returned {}: {}",
                    status, body
                )));
            }

            let raw: JsonValue = response.json().await.map_err(|e| {
                Error::Provider(format!("Failed to parse Azure operation status: {}", e))
            })?;
            let operation: ReadOperation = serde_json::from_value(raw.clone())?;

            match operation.status.as_str() {
                "succeeded" => return Ok((operation, raw)),
                "failed" => {
                    return Err(Error::Provider("Azure read operation failed".into()));
                }
                other => debug!(
                    subsystem = "ocr",
                    component = "azure",
                    status = other,
                    "Azure read operation pending"
                ),
            }

            if Instant::now() >= deadline {
                warn!(
                    subsystem = "ocr",
                    component = "azure",
                    timeout_secs = self.operation_timeout.as_secs(),
                    "Azure read operation timed out"
                );
                return Err(Error::Provider(format!(
                    "Azure read operation timed out after {}s",
                    self.operation_timeout.as_secs()
                )));
            }
        }
    }
}

#[async_trait]
impl OcrProvider for AzureReadProvider {
    fn name(&self) -> &str {
        "azure"
    }

    fn supports(&self, mime_type: &str, filename: &str) -> bool {
        SUPPORTED_MIME_TYPES.contains(&essence(mime_type).as_str())
            || extension(filename).is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
    }

    async fn extract(
        &self,
        data: &[u8],
        _mime_type: &str,
        _filename: &str,
        language: &str,
    ) -> Result<OcrExtraction> {
        let (endpoint, key) = self.credentials()?;
        let start = Instant::now();

        let operation_url = self.submit(endpoint, key, data, language).await?;
        let (operation, raw) = self.poll(&operation_url, key).await?;
        let text = operation.text();

        debug!(
            subsystem = "ocr",
            component = "azure",
            op = "extract",
            input_bytes = data.len(),
            text_len = text.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "Azure extraction complete"
        );

        Ok(OcrExtraction {
            text,
            raw_result: raw,
            provider: self.name().to_string(),
            language: language.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_azure_language_mapping() {
        assert_eq!(azure_language("eng"), Some("en"));
        assert_eq!(azure_language("de"), Some("de"));
        assert_eq!(azure_language("chi_sim"), None);
    }

    #[test]
    fn test_read_operation_text_joins_lines_and_pages() {
        let operation: ReadOperation = serde_json::from_value(json!({
            "status": "succeeded",
            "analyzeResult": {
                "readResults": [
                    {"page": 1, "lines": [{"text": "Invoice"}, {"text": "Total 42"}]},
                    {"page": 2, "lines": []},
                    {"page": 3, "lines": [{"text": "Thanks"}]}
                ]
            }
        }))
        .unwrap();
        assert_eq!(operation.text(), "Invoice\nTotal 42\n\nThanks");
    }

    #[test]
    fn test_supports_pdf_and_images() {
        let provider = AzureReadProvider::new(None, None);
        assert!(provider.supports("application/pdf", "scan.pdf"));
        assert!(provider.supports("image/png", "a.png"));
        assert!(!provider.supports("audio/ogg", "voice.ogg"));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_provider_error() {
        let provider = AzureReadProvider::new(Some("https://example.invalid".into()), None);
        assert!(!provider.is_configured());
        let err = provider
            .extract(b"x", "image/png", "a.png", "eng")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
