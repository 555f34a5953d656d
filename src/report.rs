//! Rendering a [`BatchResult`] for humans and machines.

use std::fmt::Write as _;

use clap::ValueEnum;

use crate::{
    async_utils::io::write_output, prelude::*, queues::dispatch::ErrorKind,
    results::BatchResult, ui::Ui,
};

/// Report formats.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    /// The full batch result, as pretty-printed JSON.
    #[default]
    Json,
    /// One row per unit.
    Csv,
    /// A readable report with every unit's analysis.
    Text,
}

/// Render `batch` in `format`.
pub fn render(batch: &BatchResult, format: ReportFormat) -> Result<Vec<u8>> {
    match format {
        ReportFormat::Json => {
            let mut json =
                serde_json::to_vec_pretty(batch).context("failed to serialize report")?;
            json.push(b'\n');
            Ok(json)
        }
        ReportFormat::Csv => render_csv(batch),
        ReportFormat::Text => Ok(render_text(batch).into_bytes()),
    }
}

/// Render `batch` and write it to `path`, or to stdout.
#[instrument(level = "debug", skip(batch))]
pub async fn write_report(
    batch: &BatchResult,
    format: ReportFormat,
    path: Option<&Path>,
) -> Result<()> {
    let data = render(batch, format)?;
    write_output(path, &data).await
}

/// A flattened unit, for CSV output.
#[derive(Debug, Serialize)]
struct CsvRow<'a> {
    index: usize,
    label: &'a str,
    first_page: usize,
    last_page: usize,
    status: &'static str,
    attempts: u32,
    input_tokens: u64,
    output_tokens: u64,
    input_cost: f64,
    output_cost: f64,
    total_cost: f64,
    elapsed_secs: f64,
    error_kind: Option<&'static str>,
    error: Option<&'a str>,
    output: Option<&'a str>,
}

fn render_csv(batch: &BatchResult) -> Result<Vec<u8>> {
    let mut wtr = csv::Writer::from_writer(vec![]);
    for unit in &batch.units {
        let result = &unit.result;
        let error = result.error.as_ref();
        wtr.serialize(CsvRow {
            index: result.index,
            label: &result.label,
            first_page: result.first_page,
            last_page: result.last_page,
            status: if result.is_ok() { "ok" } else { "failed" },
            attempts: result.attempts,
            input_tokens: result.token_usage.input_tokens,
            output_tokens: result.token_usage.output_tokens,
            input_cost: unit.cost.input_cost,
            output_cost: unit.cost.output_cost,
            total_cost: unit.cost.total_cost,
            elapsed_secs: result.elapsed.as_secs_f64(),
            error_kind: error.map(|e| match e.kind {
                ErrorKind::Transient => "transient",
                ErrorKind::Permanent => "permanent",
            }),
            error: error.map(|e| e.message.as_str()),
            output: result.output.as_deref(),
        })
        .context("failed to write CSV row")?;
    }
    wtr.into_inner()
        .map_err(|err| anyhow!("failed to flush CSV: {err}"))
}

fn render_text(batch: &BatchResult) -> String {
    let rule = "=".repeat(80);
    let mut out = String::new();
    // Writing to a `String` can't fail.
    let _ = writeln!(out, "PDF Analysis Report");
    let _ = writeln!(out, "===================");
    let _ = writeln!(out);
    let _ = writeln!(out, "Source PDF: {}", batch.document);
    let _ = writeln!(out, "Model: {}", batch.model);
    let _ = writeln!(out, "Total Pages: {}", batch.total_pages);
    let _ = writeln!(
        out,
        "Units: {} ({} succeeded, {} failed)",
        batch.unit_count, batch.succeeded, batch.failed
    );
    let _ = writeln!(
        out,
        "Tokens: {} input, {} output",
        batch.token_usage.input_tokens, batch.token_usage.output_tokens
    );
    let _ = writeln!(out, "Total Cost: ${:.6}", batch.cost.total_cost);
    let _ = writeln!(
        out,
        "Generated: {}",
        batch.generated_at.format("%Y-%m-%d %H:%M:%S")
    );
    let _ = writeln!(out);
    let _ = writeln!(out, "{rule}");
    for unit in &batch.units {
        let result = &unit.result;
        let _ = writeln!(out);
        let _ = writeln!(out, "## {}", capitalize(&result.label));
        let _ = writeln!(out);
        match (&result.output, &result.error) {
            (Some(output), _) => {
                let _ = writeln!(out, "{}", output.trim_end());
            }
            (None, Some(error)) => {
                let _ = writeln!(
                    out,
                    "ERROR ({:?}, {} attempt(s)): {}",
                    error.kind, result.attempts, error.message
                );
            }
            (None, None) => {
                let _ = writeln!(out, "ERROR: no output");
            }
        }
    }
    out
}

fn capitalize(label: &str) -> String {
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Print a short summary of `batch` to stderr.
pub fn display_summary(ui: &Ui, batch: &BatchResult) {
    ui.display_message(
        "📄",
        &format!(
            "{}: {} page(s) in {} unit(s), {:.1}s",
            batch.document_name(),
            batch.total_pages,
            batch.unit_count,
            batch.wall_clock.as_secs_f64(),
        ),
    );
    ui.display_message("✅", &format!("{} unit(s) succeeded", batch.succeeded));
    if batch.failed > 0 {
        ui.display_message("❌", &format!("{} unit(s) failed", batch.failed));
    }
    ui.display_message(
        "🔢",
        &format!(
            "{} input tokens, {} output tokens ({})",
            batch.token_usage.input_tokens, batch.token_usage.output_tokens, batch.model
        ),
    );
    let fallback = if batch.price.fallback {
        format!(" (priced as {})", batch.price.priced_as)
    } else {
        String::new()
    };
    ui.display_message(
        "💸",
        &format!(
            "${:.6} input + ${:.6} output = ${:.6}{fallback}",
            batch.cost.input_cost, batch.cost.output_cost, batch.cost.total_cost
        ),
    );
}

#[cfg(test)]
mod tests {
    use crate::results::tests::sample_batch;

    use super::*;

    #[test]
    fn json_report_is_the_full_batch() -> Result<()> {
        let batch = sample_batch();
        let json = render(&batch, ReportFormat::Json)?;
        let value = serde_json::from_slice::<Value>(&json)?;
        assert_eq!(value["unit_count"], json!(3));
        assert_eq!(value["units"].as_array().map(Vec::len), Some(3));
        assert_eq!(value["run_id"], json!(batch.run_id));
        Ok(())
    }

    #[test]
    fn csv_report_has_one_row_per_unit() -> Result<()> {
        let data = String::from_utf8(render(&sample_batch(), ReportFormat::Csv)?)?;
        let mut rdr = csv::Reader::from_reader(data.as_bytes());
        let headers = rdr.headers()?.clone();
        assert_eq!(&headers[0], "index");
        assert_eq!(&headers[4], "status");
        let rows = rdr.records().collect::<Result<Vec<_>, _>>()?;
        assert_eq!(rows.len(), 3);
        assert_eq!(&rows[1][4], "failed");
        assert_eq!(&rows[1][12], "transient");
        assert_eq!(&rows[2][14], "Analysis of page 3");
        Ok(())
    }

    #[test]
    fn text_report_shows_successes_and_failures() -> Result<()> {
        let text = String::from_utf8(render(&sample_batch(), ReportFormat::Text)?)?;
        assert!(text.starts_with("PDF Analysis Report\n"));
        assert!(text.contains("Source PDF: /tmp/report.pdf\n"));
        assert!(text.contains("Units: 3 (2 succeeded, 1 failed)\n"));
        assert!(text.contains("## Page 1\n\nAnalysis of page 1\n"));
        assert!(text.contains("## Page 2\n\nERROR (Transient, 3 attempt(s)): overloaded_error\n"));
        Ok(())
    }

    #[test]
    fn summary_does_not_panic_with_hidden_ui() {
        let ui = Ui::init_for_tests();
        display_summary(&ui, &sample_batch());
    }

    #[tokio::test]
    async fn writes_reports_to_files() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("report.csv");
        write_report(&sample_batch(), ReportFormat::Csv, Some(&path)).await?;
        let written = tokio::fs::read_to_string(&path).await?;
        assert!(written.starts_with("index,label,"));
        Ok(())
    }
}
