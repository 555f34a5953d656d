//! CLI test cases.
//!
//! Most tests use the offline `echo` driver and a plain-text fixture, so they
//! need neither credentials nor poppler-utils. The rest are ignored by
//! default.

use std::process::Command;

use assert_cmd::prelude::*;
use predicates::prelude::*;
use serde_json::Value;

/// A three-page text document. Page 2 makes the echo driver fail.
static PAGES_TXT: &str = "tests/fixtures/pages.txt";

/// A two-page PDF.
static TWO_PAGES_PDF: &str = "tests/fixtures/two_pages.pdf";

/// Create a new `Command` with our binary.
fn cmd() -> Command {
    let mut cmd = Command::cargo_bin("pdf-analyzer").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

/// An `analyze` command using the echo driver.
fn echo_analyze(document: &str) -> Command {
    let mut cmd = cmd();
    cmd.arg("analyze")
        .arg(document)
        .args(["--driver", "echo", "--retry-delay-ms", "10"]);
    cmd
}

/// Run `cmd` successfully and parse its JSON output.
fn json_output(cmd: &mut Command) -> Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

#[test]
fn test_help() {
    cmd().arg("--help").assert().success();
}

#[test]
fn test_version() {
    cmd().arg("--version").assert().success();
}

#[test]
fn test_analyze_help_lists_options() {
    cmd()
        .args(["analyze", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--jobs"))
        .stdout(predicate::str::contains("--max-attempts"))
        .stdout(predicate::str::contains("--chunk-size"));
}

#[test]
fn test_missing_document_is_a_setup_error() {
    echo_analyze("tests/fixtures/no_such_document.pdf")
        .assert()
        .failure()
        .stderr(predicate::str::contains("document not found"));
}

#[test]
fn test_missing_credentials_are_a_setup_error() {
    cmd()
        .env_remove("ANTHROPIC_API_KEY")
        .args(["analyze", PAGES_TXT])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ANTHROPIC_API_KEY"));
}

#[test]
fn test_zero_jobs_is_rejected() {
    echo_analyze(PAGES_TXT)
        .args(["--jobs", "0"])
        .assert()
        .failure();
}

#[test]
fn test_zero_max_pages_is_rejected() {
    echo_analyze(PAGES_TXT)
        .args(["--max-pages", "0"])
        .assert()
        .failure()
        .stdout(predicate::str::is_empty());
}

#[test]
fn test_empty_document_is_a_setup_error() {
    echo_analyze("tests/fixtures/empty.txt")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no pages"));
}

#[test]
fn test_partial_failure_still_succeeds() {
    let report = json_output(&mut echo_analyze(PAGES_TXT));
    assert_eq!(report["unit_count"], 3);
    assert_eq!(report["succeeded"], 2);
    assert_eq!(report["failed"], 1);

    let units = report["units"].as_array().unwrap();
    assert_eq!(units.len(), 3);
    for (index, unit) in units.iter().enumerate() {
        assert_eq!(unit["index"], index);
    }
    assert_eq!(units[0]["status"], "ok");
    assert_eq!(units[0]["output"], "Page one text");
    assert_eq!(units[1]["status"], "failed");
    assert_eq!(units[1]["error"]["kind"], "permanent");
    assert_eq!(units[1]["attempts"], 1);
    assert_eq!(units[1]["input_tokens"], 0);
    assert_eq!(units[2]["label"], "page 3");

    let unit_input_tokens = units
        .iter()
        .map(|unit| unit["input_tokens"].as_u64().unwrap())
        .sum::<u64>();
    assert_eq!(report["input_tokens"].as_u64().unwrap(), unit_input_tokens);
}

#[test]
fn test_chunked_and_capped_batches() {
    let report = json_output(
        echo_analyze(PAGES_TXT).args(["--chunk-size", "2", "--jobs", "1", "--waves"]),
    );
    let units = report["units"].as_array().unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units[0]["label"], "chunk 1, pages 1-2");
    assert_eq!(units[1]["label"], "chunk 2, page 3");
    assert_eq!(units[1]["first_page"], 3);

    let report = json_output(echo_analyze(PAGES_TXT).args(["--max-pages", "1"]));
    assert_eq!(report["total_pages"], 3);
    assert_eq!(report["unit_count"], 1);
    assert_eq!(report["failed"], 0);
}

#[test]
fn test_csv_report_to_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.csv");
    echo_analyze(PAGES_TXT)
        .args(["--format", "csv", "-o"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
    let csv = std::fs::read_to_string(&path).unwrap();
    let lines = csv.lines().collect::<Vec<_>>();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("index,label,first_page,last_page,status"));
    assert!(lines[2].contains(",failed,"));
}

#[test]
fn test_text_report() {
    echo_analyze(PAGES_TXT)
        .args(["--format", "text"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("PDF Analysis Report"))
        .stdout(predicate::str::contains("## Page 3\n\nPage three text\n"))
        .stdout(predicate::str::contains("ERROR (Permanent"));
}

#[test]
fn test_custom_prompt_and_price_table() {
    let dir = tempfile::tempdir().unwrap();
    let prompt = dir.path().join("prompt.toml");
    std::fs::write(
        &prompt,
        "user = \"Summarize {{page_label}} of {{document_name}}.\"\n",
    )
    .unwrap();
    let prices = dir.path().join("prices.json");
    std::fs::write(
        &prices,
        r#"{"models": {"echo": {"input_per_million": 2.0, "output_per_million": 0.0}}}"#,
    )
    .unwrap();

    let report = json_output(
        echo_analyze(PAGES_TXT)
            .arg("--prompt")
            .arg(&prompt)
            .arg("--price-table")
            .arg(&prices),
    );
    assert_eq!(report["price"]["fallback"], false);
    assert_eq!(report["price"]["priced_as"], "echo");
    let input_tokens = report["input_tokens"].as_u64().unwrap() as f64;
    let input_cost = report["input_cost"].as_f64().unwrap();
    assert!((input_cost - input_tokens / 1e6 * 2.0).abs() < 1e-12);
    assert_eq!(report["output_cost"].as_f64().unwrap(), 0.0);
}

#[test]
fn test_bad_prompt_template_is_a_setup_error() {
    let dir = tempfile::tempdir().unwrap();
    let prompt = dir.path().join("prompt.toml");
    std::fs::write(&prompt, "user = \"{{no_such_binding}}\"\n").unwrap();
    echo_analyze(PAGES_TXT)
        .arg("--prompt")
        .arg(&prompt)
        .assert()
        .failure();
}

#[test]
fn test_schema_output() {
    for schema in ["BatchResult", "PriceTable", "ChatPrompt"] {
        cmd()
            .args(["schema", schema])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"$schema\""));
    }
}

#[test]
#[ignore = "Requires poppler-utils to be installed"]
fn test_pdf_text_payload() {
    let report = json_output(echo_analyze(TWO_PAGES_PDF).args(["--payload", "text"]));
    assert_eq!(report["unit_count"], 2);
    let output = report["units"][1]["output"].as_str().unwrap();
    assert!(output.contains("Second page"), "{output:?}");
}

#[test]
#[ignore = "Requires poppler-utils to be installed"]
fn test_pdf_blob_payloads() {
    for payload in ["pdf", "image"] {
        let report = json_output(
            echo_analyze(TWO_PAGES_PDF).args(["--payload", payload, "--chunk-size", "2"]),
        );
        assert_eq!(report["unit_count"], 1);
        assert_eq!(report["succeeded"], 1);
    }
}

#[test]
#[ignore = "Needs ANTHROPIC_API_KEY and costs money"]
fn test_anthropic_pdf_analysis() {
    let report = json_output(
        cmd()
            .arg("analyze")
            .arg(TWO_PAGES_PDF)
            .args(["--level", "executive", "--jobs", "2"]),
    );
    assert_eq!(report["succeeded"], 2);
    assert!(report["total_cost"].as_f64().unwrap() > 0.0);
}
