//! Plain-text documents, with pages separated by form feeds (the same
//! convention `pdftotext` uses).

use crate::prelude::*;

use super::{PageRange, PageSource, Payload, PayloadKind};

/// Page separator used by `pdftotext` and friends.
pub const FORM_FEED: char = '\u{c}';

/// A text document held in memory.
#[derive(Debug)]
pub struct TextSource {
    pages: Vec<String>,
}

impl TextSource {
    /// Load a text document from disk.
    pub async fn open(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let text = String::from_utf8(bytes).with_context(|| {
            format!("{} is neither a PDF, an image nor UTF-8 text", path.display())
        })?;
        Ok(Self::from_text(&text))
    }

    /// Split `text` into pages.
    pub fn from_text(text: &str) -> Self {
        Self {
            pages: split_pages(text),
        }
    }
}

#[async_trait]
impl PageSource for TextSource {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn resolve_kind(&self, requested: PayloadKind) -> Result<PayloadKind> {
        if requested != PayloadKind::Text {
            info!(?requested, "Document is plain text, sending text payloads");
        }
        Ok(PayloadKind::Text)
    }

    async fn page_content(&self, range: PageRange, _kind: PayloadKind) -> Result<Payload> {
        let pages = self.pages.get(range.indices()).ok_or_else(|| {
            anyhow!("pages {} out of range ({} pages)", range, self.pages.len())
        })?;
        Ok(Payload::Text(join_pages(range, pages)))
    }
}

/// Split form-feed-separated text into pages. A trailing separator doesn't
/// start a new page.
pub fn split_pages(text: &str) -> Vec<String> {
    let mut pages = text
        .split(FORM_FEED)
        .map(str::to_owned)
        .collect::<Vec<_>>();
    if pages.last().is_some_and(|page| page.trim().is_empty()) {
        pages.pop();
    }
    pages
}

/// Combine the text of several pages into one payload, with a header before
/// each page so the model can cite page numbers.
pub fn join_pages(range: PageRange, pages: &[impl AsRef<str>]) -> String {
    if range.is_single()
        && let Some(page) = pages.first()
    {
        return page.as_ref().trim_end().to_owned();
    }
    let mut out = String::new();
    for (page_number, page) in range.indices().map(|i| i + 1).zip(pages) {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("=== PAGE {page_number} ===\n"));
        out.push_str(page.as_ref().trim_end());
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trailing_form_feed_does_not_add_a_page() {
        assert_eq!(split_pages("a\u{c}b\u{c}"), vec!["a", "b"]);
        assert_eq!(split_pages("a\u{c}b"), vec!["a", "b"]);
        assert!(split_pages("").is_empty());
    }

    #[test]
    fn multi_page_ranges_get_headers() {
        let joined = join_pages(PageRange::new(2, 3), &["third", "fourth"]);
        assert_eq!(joined, "=== PAGE 3 ===\nthird\n\n=== PAGE 4 ===\nfourth\n");
        assert_eq!(join_pages(PageRange::single(0), &["only\n"]), "only");
    }

    #[tokio::test]
    async fn out_of_range_pages_are_an_error() {
        let source = TextSource::from_text("a\u{c}b");
        assert_eq!(source.page_count(), 2);
        assert!(
            source
                .page_content(PageRange::new(1, 2), PayloadKind::Text)
                .await
                .is_err()
        );
    }
}
