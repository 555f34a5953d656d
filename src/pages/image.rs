//! Single images, treated as one-page documents.

use crate::prelude::*;

use super::{Blob, PageRange, PageSource, Payload, PayloadKind};

/// Image types that LLM providers generally accept.
pub const SUPPORTED_IMAGE_TYPES: &[&str] =
    &["image/png", "image/jpeg", "image/gif", "image/webp"];

/// A single image.
#[derive(Debug)]
pub struct ImageSource {
    blob: Blob,
}

impl ImageSource {
    /// Load an image from disk.
    pub async fn open(path: &Path, mime_type: &str) -> Result<Self> {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Self {
            blob: Blob {
                mime_type: mime_type.to_owned(),
                data,
            },
        })
    }
}

#[async_trait]
impl PageSource for ImageSource {
    fn page_count(&self) -> usize {
        1
    }

    fn resolve_kind(&self, requested: PayloadKind) -> Result<PayloadKind> {
        match requested {
            PayloadKind::Text => Err(anyhow!(
                "cannot extract text from an image; use --payload image"
            )),
            PayloadKind::Pdf | PayloadKind::Image => Ok(PayloadKind::Image),
        }
    }

    async fn page_content(&self, range: PageRange, _kind: PayloadKind) -> Result<Payload> {
        if range != PageRange::single(0) {
            return Err(anyhow!("an image only has one page, not {}", range));
        }
        Ok(Payload::Blobs(vec![self.blob.clone()]))
    }
}
