//! Tesseract OCR via the `tesseract` command-line tool.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;
use tracing::debug;

use chatvault_core::{Error, OcrExtraction, OcrProvider, Result};

use super::{essence, extension};

const SUPPORTED_MIME_TYPES: &[&str] = &[
    "image/png",
    "image/jpeg",
    "image/jpg",
    "image/tiff",
    "image/bmp",
    "image/gif",
    "image/webp",
    "image/x-portable-anymap",
];

const SUPPORTED_EXTENSIONS: &[&str] = &[
    "png", "jpg", "jpeg", "tif", "tiff", "bmp", "gif", "webp", "pnm",
];

/// Run a command with a timeout, returning stdout.
async fn run_cmd_with_timeout(cmd: &mut Command, timeout: Duration) -> Result<String> {
    let output = tokio::time::timeout(timeout, cmd.output())
        .await
        .map_err(|_| {
            Error::Provider(format!(
                "tesseract timed out after {}s",
                timeout.as_secs_f64()
            ))
        })?
        .map_err(|e| Error::Provider(format!("Failed to execute tesseract: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(Error::Provider(format!(
            "tesseract failed (exit {}): {}",
            output.status,
            stderr.trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Local OCR backed by the tesseract CLI.
#[derive(Debug, Clone)]
pub struct TesseractProvider {
    cmd: String,
    timeout: Duration,
}

impl TesseractProvider {
    pub fn new(cmd: impl Into<String>, timeout: Duration) -> Self {
        Self {
            cmd: cmd.into(),
            timeout,
        }
    }

    /// Temp file suffix so tesseract/leptonica can sniff the format.
    fn suffix(mime_type: &str, filename: &str) -> String {
        let ext = extension(filename)
            .filter(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
            .or_else(|| match essence(mime_type).as_str() {
                "image/jpeg" | "image/jpg" => Some("jpg".to_string()),
                "image/tiff" => Some("tif".to_string()),
                "image/x-portable-anymap" => Some("pnm".to_string()),
                other => other.strip_prefix("image/").map(String::from),
            })
            .unwrap_or_else(|| "png".to_string());
        format!(".{}", ext)
    }
}

#[async_trait]
impl OcrProvider for TesseractProvider {
    fn name(&self) -> &str {
        "tesseract"
    }

    fn supports(&self, mime_type: &str, filename: &str) -> bool {
        SUPPORTED_MIME_TYPES.contains(&essence(mime_type).as_str())
            || extension(filename).is_some_and(|e| SUPPORTED_EXTENSIONS.contains(&e.as_str()))
    }

    async fn extract(
        &self,
        data: &[u8],
        mime_type: &str,
        filename: &str,
        language: &str,
    ) -> Result<OcrExtraction> {
        let input = tempfile::Builder::new()
            .prefix("chatvault-ocr-")
            .suffix(&Self::suffix(mime_type, filename))
            .tempfile()?;
        tokio::fs::write(input.path(), data).await?;

        let mut cmd = Command::new(&self.cmd);
        cmd.arg(input.path())
            .arg("stdout")
            .arg("-l")
            .arg(language)
            .kill_on_drop(true);

        let stdout = run_cmd_with_timeout(&mut cmd, self.timeout).await?;
        let text = stdout.trim().to_string();

        debug!(
            subsystem = "ocr",
            component = "tesseract",
            op = "extract",
            input_bytes = data.len(),
            text_len = text.len(),
            "Tesseract extraction complete"
        );

        Ok(OcrExtraction {
            raw_result: json!({
                "engine": "tesseract",
                "command": self.cmd,
                "characters": text.chars().count(),
            }),
            text,
            provider: self.name().to_string(),
            language: language.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supports_images_only() {
        let provider = TesseractProvider::new("tesseract", Duration::from_secs(5));
        assert!(provider.supports("image/jpeg", "IMG-0001.jpg"));
        assert!(provider.supports("application/octet-stream", "scan.TIFF"));
        assert!(!provider.supports("application/pdf", "scan.pdf"));
        assert!(!provider.supports("audio/ogg", "voice.opus"));
    }

    #[test]
    fn test_suffix_prefers_known_extension() {
        assert_eq!(TesseractProvider::suffix("image/png", "a.jpeg"), ".jpeg");
        assert_eq!(TesseractProvider::suffix("image/png", "blob"), ".png");
        assert_eq!(TesseractProvider::suffix("image/x-portable-anymap", "blob"), ".pnm");
        assert_eq!(TesseractProvider::suffix("image/jpeg", "blob"), ".jpg");
        assert_eq!(TesseractProvider::suffix("application/octet-stream", "blob"), ".png");
    }

    // `sh <file> stdout -l <lang>` runs the temp file as a script, which lets
    // these tests drive the command plumbing without tesseract installed.
    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_captures_stdout() {
        let provider = TesseractProvider::new("sh", Duration::from_secs(10));
        let result = provider
            .extract(b"echo '  Hello from the scan  '", "image/png", "a.png", "eng")
            .await
            .unwrap();
        assert_eq!(result.text, "Hello from the scan");
        assert_eq!(result.provider, "tesseract");
        assert_eq!(result.raw_result["characters"], 19);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_reports_stderr_on_failure() {
        let provider = TesseractProvider::new("sh", Duration::from_secs(10));
        let err = provider
            .extract(b"echo 'Error opening data file' >&2; exit 1", "image/png", "a.png", "xyz")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
        assert!(err.to_string().contains("Error opening data file"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_extract_times_out() {
        let provider = TesseractProvider::new("sh", Duration::from_millis(200));
        let err = provider
            .extract(b"sleep 5", "image/png", "a.png", "eng")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_provider_error() {
        let provider = TesseractProvider::new("/nonexistent/tesseract", Duration::from_secs(5));
        let err = provider
            .extract(b"", "image/png", "a.png", "eng")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Provider(_)));
    }
}
