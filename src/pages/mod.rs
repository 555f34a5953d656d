//! Page sources: where the content for each unit of work comes from.
//!
//! A [`PageSource`] knows how many pages a document has, and can produce the
//! content of any contiguous page range as text, a PDF sub-document, or page
//! images. The dispatcher never talks to a page source directly; each unit
//! carries a [`LazyPayload`] which extracts its content on first use.

use std::{fmt, ops::RangeInclusive, sync::Arc};

use clap::{Args, ValueEnum};
use schemars::JsonSchema;
use tokio::sync::OnceCell;

use crate::prelude::*;

pub mod image;
pub mod poppler;
pub mod text;

/// A contiguous, inclusive range of 0-based page indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRange {
    first: usize,
    last: usize,
}

impl PageRange {
    /// Create a new range. Panics if `first > last`.
    pub fn new(first: usize, last: usize) -> Self {
        assert!(first <= last, "invalid page range {first}..={last}");
        Self { first, last }
    }

    /// A range containing exactly one page.
    pub fn single(index: usize) -> Self {
        Self::new(index, index)
    }

    /// The last page index (0-based, inclusive).
    pub fn last(&self) -> usize {
        self.last
    }

    /// The number of pages in this range.
    pub fn len(&self) -> usize {
        self.last - self.first + 1
    }

    /// Is this a single page?
    pub fn is_single(&self) -> bool {
        self.first == self.last
    }

    /// The first page number, counting from 1, as humans and Poppler do.
    pub fn first_page_number(&self) -> usize {
        self.first + 1
    }

    /// The last page number, counting from 1.
    pub fn last_page_number(&self) -> usize {
        self.last + 1
    }

    /// Iterate over the 0-based page indices.
    pub fn indices(&self) -> RangeInclusive<usize> {
        self.first..=self.last
    }
}

impl fmt::Display for PageRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single() {
            write!(f, "{}", self.first_page_number())
        } else {
            write!(f, "{}-{}", self.first_page_number(), self.last_page_number())
        }
    }
}

/// Binary content with a MIME type.
#[derive(Clone, PartialEq, Eq)]
pub struct Blob {
    pub mime_type: String,
    pub data: Vec<u8>,
}

impl fmt::Debug for Blob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Blob")
            .field("mime_type", &self.mime_type)
            .field("len", &self.data.len())
            .finish()
    }
}

/// The content we send to the LLM for one unit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Payload {
    /// Extracted text.
    Text(String),
    /// A PDF sub-document, or one image per page.
    Blobs(Vec<Blob>),
}

/// What kind of payload should we extract from each page range?
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, JsonSchema, Serialize, ValueEnum,
)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    /// Send the pages as a PDF sub-document. Works with Anthropic and Gemini
    /// models, which read PDFs natively.
    #[default]
    Pdf,
    /// Rasterize each page to PNG.
    Image,
    /// Extract the text layer.
    Text,
}

/// Options controlling how we split a document into units.
#[derive(Args, Clone, Debug)]
pub struct PageSourceOptions {
    /// What to send to the LLM for each unit.
    #[clap(long, value_enum, default_value_t = PayloadKind::default())]
    pub payload: PayloadKind,

    /// How many consecutive pages to analyze together as one unit.
    #[clap(long, default_value = "1", value_parser = clap::value_parser!(u32).range(1..))]
    pub chunk_size: u32,

    /// Only analyze the first N pages of the document.
    #[clap(long, value_parser = clap::value_parser!(u32).range(1..))]
    pub max_pages: Option<u32>,

    /// The DPI to use when rasterizing pages with `--payload image`.
    #[clap(long, default_value = "150")]
    pub rasterize_dpi: u32,
}

/// A document we can pull page content out of.
#[async_trait]
pub trait PageSource: fmt::Debug + Send + Sync + 'static {
    /// How many pages does this document have?
    fn page_count(&self) -> usize;

    /// Which payload kind will we actually produce if `requested` is asked
    /// for? Fails if this source can't produce anything suitable.
    fn resolve_kind(&self, requested: PayloadKind) -> Result<PayloadKind>;

    /// Extract the content of `range`.
    async fn page_content(&self, range: PageRange, kind: PayloadKind) -> Result<Payload>;
}

/// Open a document, choosing a page source based on its contents.
#[instrument(level = "debug", skip(opts))]
pub async fn open_page_source(
    path: &Path,
    opts: &PageSourceOptions,
) -> Result<Arc<dyn PageSource>> {
    if !path.exists() {
        return Err(anyhow!("document not found: {}", path.display()));
    }
    let mime_type = infer::get_from_path(path)
        .with_context(|| format!("failed to read {}", path.display()))?
        .map(|ty| ty.mime_type());
    debug!(?mime_type, "Detected document type");

    let source: Arc<dyn PageSource> = match mime_type {
        Some("application/pdf") => {
            Arc::new(poppler::PopplerSource::open(path, opts.rasterize_dpi).await?)
        }
        Some(mime_type) if image::SUPPORTED_IMAGE_TYPES.contains(&mime_type) => {
            Arc::new(image::ImageSource::open(path, mime_type).await?)
        }
        Some(mime_type) => {
            return Err(anyhow!(
                "unsupported document type {} for {}",
                mime_type,
                path.display()
            ));
        }
        None => Arc::new(text::TextSource::open(path).await?),
    };
    Ok(source)
}

/// A unit's payload, extracted the first time it is needed and then reused
/// across retries.
pub struct LazyPayload {
    source: Arc<dyn PageSource>,
    range: PageRange,
    kind: PayloadKind,
    cell: OnceCell<Payload>,
}

impl LazyPayload {
    /// Create a new lazy payload.
    pub fn new(source: Arc<dyn PageSource>, range: PageRange, kind: PayloadKind) -> Self {
        Self {
            source,
            range,
            kind,
            cell: OnceCell::new(),
        }
    }

    /// Get the payload, extracting it if we haven't already.
    pub async fn get(&self) -> Result<&Payload> {
        self.cell
            .get_or_try_init(|| self.source.page_content(self.range, self.kind))
            .await
            .with_context(|| format!("failed to extract pages {}", self.range))
    }
}

impl fmt::Debug for LazyPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyPayload")
            .field("range", &self.range)
            .field("kind", &self.kind)
            .field("loaded", &self.cell.initialized())
            .finish()
    }
}
