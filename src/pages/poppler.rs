//! PDF page extraction using the Poppler command-line tools.
//!
//! We shell out to `pdfinfo`, `pdftotext`, `pdfseparate`, `pdfunite` and
//! `pdftocairo` rather than linking a PDF library. Each of these can use a
//! full CPU core, so every invocation holds a permit from a per-source
//! semaphore sized to the number of CPUs.

use std::{process::Output, sync::LazyLock};

use regex::Regex;
use tokio::{process::Command, sync::Semaphore};

use crate::{async_utils::check_for_command_failure, prelude::*};

use super::{
    Blob, PageRange, PageSource, Payload, PayloadKind,
    text::{join_pages, split_pages},
};

static ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Poppler reports some recoverable damage as "errors".
static DOWNGRADE_TO_WARNING_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)error: xref num").expect("failed to compile regex")
});

/// Does this line of Poppler stderr contain a real error?
fn is_error_line(line: &str) -> bool {
    ERROR_REGEX.is_match(line) && !DOWNGRADE_TO_WARNING_REGEX.is_match(line)
}

/// A PDF on disk.
#[derive(Debug)]
pub struct PopplerSource {
    path: PathBuf,
    page_count: usize,
    rasterize_dpi: u32,
    cpu_semaphore: Semaphore,
}

impl PopplerSource {
    /// Open a PDF and count its pages.
    #[instrument(level = "debug", skip_all, fields(path = %path.display()))]
    pub async fn open(path: &Path, rasterize_dpi: u32) -> Result<Self> {
        let page_count = get_pdf_page_count(path).await?;
        Ok(Self {
            path: path.to_owned(),
            page_count,
            rasterize_dpi,
            cpu_semaphore: Semaphore::new(num_cpus::get()),
        })
    }

    /// Run a Poppler tool while holding a CPU permit.
    async fn run(&self, command_name: &str, cmd: &mut Command) -> Result<Output> {
        let _permit = self
            .cpu_semaphore
            .acquire()
            .await
            .context("Could not acquire CPU permit")?;
        let output = cmd.output().await.with_context(|| {
            format!("failed to run {} on {:?}", command_name, self.path.display())
        })?;
        check_for_command_failure(command_name, &output, Some(&is_error_line))?;
        Ok(output)
    }

    async fn extract_text(&self, range: PageRange) -> Result<Payload> {
        let mut cmd = Command::new("pdftotext");
        cmd.arg("-layout")
            .args(page_args(range))
            .arg(&self.path)
            .arg("-");
        let output = self.run("pdftotext", &mut cmd).await?;
        let text =
            String::from_utf8(output.stdout).context("pdftotext output was not valid UTF-8")?;
        let mut pages = split_pages(&text);
        // Blank trailing pages vanish in `split_pages`.
        pages.resize(range.len(), String::new());
        Ok(Payload::Text(join_pages(range, &pages)))
    }

    async fn extract_pdf(&self, range: PageRange) -> Result<Payload> {
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let pattern = tmpdir.path().join("page-%d.pdf");
        let mut cmd = Command::new("pdfseparate");
        cmd.args(page_args(range)).arg(&self.path).arg(&pattern);
        self.run("pdfseparate", &mut cmd).await?;

        let page_paths = range
            .indices()
            .map(|i| tmpdir.path().join(format!("page-{}.pdf", i + 1)))
            .collect::<Vec<_>>();
        let pdf_path = if range.is_single() {
            page_paths[0].clone()
        } else {
            let combined = tmpdir.path().join("combined.pdf");
            let mut cmd = Command::new("pdfunite");
            cmd.args(&page_paths).arg(&combined);
            self.run("pdfunite", &mut cmd).await?;
            combined
        };
        let data = tokio::fs::read(&pdf_path)
            .await
            .with_context(|| format!("failed to read {:?}", pdf_path.display()))?;
        Ok(Payload::Blobs(vec![Blob {
            mime_type: "application/pdf".to_owned(),
            data,
        }]))
    }

    async fn extract_images(&self, range: PageRange) -> Result<Payload> {
        let tmpdir = tempfile::TempDir::with_prefix("pages")?;
        let mut cmd = Command::new("pdftocairo");
        cmd.arg("-png")
            .arg("-r")
            .arg(self.rasterize_dpi.to_string())
            .args(page_args(range))
            .arg(&self.path)
            .arg(tmpdir.path().join("page"));
        self.run("pdftocairo", &mut cmd).await?;

        // `pdftocairo` zero-pads page numbers to a fixed width, so sorting by
        // name gives page order.
        let mut png_paths = vec![];
        let mut entries = tokio::fs::read_dir(tmpdir.path())
            .await
            .context("failed to list rasterized pages")?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .context("failed to list rasterized pages")?
        {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "png") {
                png_paths.push(path);
            }
        }
        png_paths.sort();
        if png_paths.len() != range.len() {
            return Err(anyhow!(
                "pdftocairo produced {} images for pages {}",
                png_paths.len(),
                range
            ));
        }

        let mut blobs = Vec::with_capacity(png_paths.len());
        for path in png_paths {
            let data = tokio::fs::read(&path)
                .await
                .with_context(|| format!("failed to read {:?}", path.display()))?;
            blobs.push(Blob {
                mime_type: "image/png".to_owned(),
                data,
            });
        }
        Ok(Payload::Blobs(blobs))
    }
}

#[async_trait]
impl PageSource for PopplerSource {
    fn page_count(&self) -> usize {
        self.page_count
    }

    fn resolve_kind(&self, requested: PayloadKind) -> Result<PayloadKind> {
        Ok(requested)
    }

    #[instrument(level = "debug", skip(self), fields(range = %range))]
    async fn page_content(&self, range: PageRange, kind: PayloadKind) -> Result<Payload> {
        if range.last() >= self.page_count {
            return Err(anyhow!(
                "pages {} out of range ({} pages)",
                range,
                self.page_count
            ));
        }
        match kind {
            PayloadKind::Text => self.extract_text(range).await,
            PayloadKind::Pdf => self.extract_pdf(range).await,
            PayloadKind::Image => self.extract_images(range).await,
        }
    }
}

/// `-f` and `-l` arguments selecting `range`. Poppler counts pages from 1,
/// inclusive.
fn page_args(range: PageRange) -> [String; 4] {
    [
        "-f".to_owned(),
        range.first_page_number().to_string(),
        "-l".to_owned(),
        range.last_page_number().to_string(),
    ]
}

/// Get the number of pages in a PDF file.
#[instrument(level = "debug", skip_all, fields(path = %path.display()))]
pub async fn get_pdf_page_count(path: &Path) -> Result<usize> {
    let output = Command::new("pdfinfo")
        .arg(path)
        .output()
        .await
        .with_context(|| format!("failed to run pdfinfo on {:?}", path.display()))?;
    check_for_command_failure("pdfinfo", &output, None)?;

    let output =
        String::from_utf8(output.stdout).context("pdfinfo output was not valid UTF-8")?;
    let page_count_str = output
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(key, _)| key.trim() == "Pages")
        .map(|(_, value)| value.trim())
        .ok_or_else(|| anyhow!("failed to find page count in pdfinfo output"))?;
    page_count_str.parse::<usize>().with_context(|| {
        format!(
            "failed to parse page count for {:?} from pdfinfo output",
            path.display()
        )
    })
}
