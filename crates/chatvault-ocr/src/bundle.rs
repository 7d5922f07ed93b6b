//! Bundle builder: decides which bytes go to the OCR provider.
//!
//! WhatsApp delivers a multi-photo message (typically the pages of a scanned
//! document) as separate attachments sharing one message id. When every
//! image of such a message decodes, they are stacked into one PNG so the
//! provider runs once and returns one text. Anything unusable falls back to
//! the single file behind the document.

use std::io::Cursor;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageFormat, Rgba, RgbaImage};
use tracing::debug;
use uuid::Uuid;

use chatvault_core::{Error, FileStore, MediaItem, MediaRepository, Result};

const BUNDLE_MIME: &str = "image/png";

/// Bytes and metadata handed to a provider for one claimed document.
#[derive(Debug, Clone)]
pub struct OcrInput {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub filename: String,
    /// Media ids whose files make up `bytes`, in bundle order.
    pub media_ids: Vec<Uuid>,
}

impl OcrInput {
    pub fn is_bundle(&self) -> bool {
        self.media_ids.len() > 1
    }
}

/// Assembles [`OcrInput`]s from media records and stored files.
#[derive(Clone)]
pub struct BundleBuilder {
    media: Arc<dyn MediaRepository>,
    files: Arc<dyn FileStore>,
}

impl BundleBuilder {
    pub fn new(media: Arc<dyn MediaRepository>, files: Arc<dyn FileStore>) -> Self {
        Self { media, files }
    }

    /// Build the provider input for `item`.
    ///
    /// Errors only when the item's own file cannot be read.
    pub async fn build(&self, item: &MediaItem) -> Result<OcrInput> {
        if let Some(message_id) = item.bundle_key() {
            match self.try_bundle(item, message_id).await {
                Ok(Some(input)) => return Ok(input),
                Ok(None) => {}
                Err(e) => {
                    debug!(
                        subsystem = "ocr",
                        component = "bundle",
                        media_id = %item.id,
                        error = %e,
                        "Bundle unusable, falling back to single file"
                    );
                }
            }
        }
        self.single(item).await
    }

    async fn single(&self, item: &MediaItem) -> Result<OcrInput> {
        let bytes = self.files.read_bytes(&item.file_path).await?;
        Ok(OcrInput {
            bytes,
            mime_type: item.mime_or_default().to_string(),
            filename: item.filename(),
            media_ids: vec![item.id],
        })
    }

    /// `Ok(None)` when the message has no other usable images.
    async fn try_bundle(&self, item: &MediaItem, message_id: &str) -> Result<Option<OcrInput>> {
        let siblings = self.media.find_bundle_by_message(message_id).await?;
        if siblings.len() <= 1 || !siblings.iter().any(|m| m.id == item.id) {
            return Ok(None);
        }

        let mut buffers = Vec::with_capacity(siblings.len());
        for sibling in &siblings {
            if !self.files.exists(&sibling.file_path).await {
                return Ok(None);
            }
            buffers.push(self.files.read_bytes(&sibling.file_path).await?);
        }

        let bytes = tokio::task::spawn_blocking(move || stack_vertically(&buffers))
            .await
            .map_err(|e| Error::Internal(format!("Bundle composition panicked: {}", e)))??;

        debug!(
            subsystem = "ocr",
            component = "bundle",
            media_id = %item.id,
            bundle_size = siblings.len(),
            composite_bytes = bytes.len(),
            "Built multi-image bundle"
        );

        Ok(Some(OcrInput {
            bytes,
            mime_type: BUNDLE_MIME.to_string(),
            filename: format!("bundle-{}.png", item.id),
            media_ids: siblings.iter().map(|m| m.id).collect(),
        }))
    }
}

/// Decode every buffer, scale each to the widest image's width, and stack
/// them top to bottom on white. Returns PNG bytes.
pub fn stack_vertically(buffers: &[Vec<u8>]) -> Result<Vec<u8>> {
    let images = buffers
        .iter()
        .map(|buf| image::load_from_memory(buf).map_err(Error::from))
        .collect::<Result<Vec<DynamicImage>>>()?;

    if images.iter().any(|img| img.width() == 0 || img.height() == 0) {
        return Err(Error::Image("image without dimensions".into()));
    }

    let width = images.iter().map(|img| img.width()).max().unwrap_or(0);
    if width == 0 {
        return Err(Error::Image("nothing to stack".into()));
    }

    let scaled: Vec<DynamicImage> = images
        .into_iter()
        .map(|img| {
            let (w, h) = img.dimensions();
            if w == width {
                img
            } else {
                let height = ((u64::from(h) * u64::from(width)) / u64::from(w)).max(1);
                img.resize_exact(width, height as u32, FilterType::Triangle)
            }
        })
        .collect();

    let height = scaled
        .iter()
        .try_fold(0u32, |acc, img| acc.checked_add(img.height()))
        .ok_or_else(|| Error::Image("bundle too tall".into()))?;

    let mut canvas = RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]));
    let mut offset: i64 = 0;
    for img in &scaled {
        imageops::overlay(&mut canvas, &img.to_rgba8(), 0, offset);
        offset += i64::from(img.height());
    }

    let flattened = DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(canvas).to_rgb8());
    let mut bytes = Vec::new();
    flattened.write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)?;
    Ok(bytes)
}
