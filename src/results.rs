//! The final, immutable result of a batch.

use std::time::Duration;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use uuid::Uuid;

use crate::{
    cost::{Cost, ResolvedPrice, aggregate},
    drivers::TokenUsage,
    prelude::*,
    queues::dispatch::{UnitResult, duration_secs},
};

/// One unit's result, plus what it cost.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct UnitReport {
    #[serde(flatten)]
    pub result: UnitResult,

    #[serde(flatten)]
    pub cost: Cost,
}

/// Everything we know about a finished batch.
#[derive(Clone, Debug, Deserialize, JsonSchema, Serialize)]
pub struct BatchResult {
    /// A unique ID for this run.
    pub run_id: Uuid,

    /// The document we analyzed.
    pub document: String,

    /// The model we used.
    pub model: String,

    /// How we priced the model.
    pub price: ResolvedPrice,

    /// Pages in the document, before any `--max-pages` cap.
    pub total_pages: usize,

    /// How many units we dispatched.
    pub unit_count: usize,

    pub succeeded: usize,
    pub failed: usize,

    /// One entry per unit, in page order.
    pub units: Vec<UnitReport>,

    /// Token totals, summed over units.
    #[serde(flatten)]
    pub token_usage: TokenUsage,

    /// Cost totals, summed over units.
    #[serde(flatten)]
    pub cost: Cost,

    /// Wall-clock time for the whole batch.
    #[serde(rename = "wall_clock_secs", with = "duration_secs")]
    #[schemars(with = "f64")]
    pub wall_clock: Duration,

    /// When the report was generated.
    pub generated_at: DateTime<Utc>,
}

impl BatchResult {
    /// Fold unit results into a batch result.
    pub fn build(
        document: &Path,
        price: ResolvedPrice,
        total_pages: usize,
        results: Vec<UnitResult>,
        wall_clock: Duration,
    ) -> Self {
        let summary = aggregate(&results, &price.price);
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        let unit_count = results.len();
        let units = results
            .into_iter()
            .zip(summary.unit_costs)
            .map(|(result, cost)| UnitReport { result, cost })
            .collect();
        Self {
            run_id: Uuid::new_v4(),
            document: document.display().to_string(),
            model: price.model.clone(),
            price,
            total_pages,
            unit_count,
            succeeded,
            failed: unit_count - succeeded,
            units,
            token_usage: summary.token_usage,
            cost: summary.cost,
            wall_clock,
            generated_at: Utc::now(),
        }
    }

    /// The document's file name, for display.
    pub fn document_name(&self) -> &str {
        Path::new(&self.document)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(&self.document)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use crate::{
        cost::PriceTable,
        queues::dispatch::{ErrorKind, UnitError, UnitStatus},
    };

    use super::*;

    /// A small batch with one failure, for report tests.
    pub(crate) fn sample_batch() -> BatchResult {
        let ok = |index: usize, input_tokens, output_tokens| UnitResult {
            index,
            label: format!("page {}", index + 1),
            first_page: index + 1,
            last_page: index + 1,
            status: UnitStatus::Ok,
            output: Some(format!("Analysis of page {}", index + 1)),
            error: None,
            retry_errors: vec![],
            attempts: 1,
            token_usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            elapsed: Duration::from_millis(1500),
            completed_at: Utc::now(),
        };
        let failed = UnitResult {
            status: UnitStatus::Failed,
            output: None,
            error: Some(UnitError {
                kind: ErrorKind::Transient,
                message: "overloaded_error".to_owned(),
            }),
            retry_errors: vec!["overloaded_error".to_owned(), "overloaded_error".to_owned()],
            attempts: 3,
            token_usage: TokenUsage::default(),
            ..ok(1, 0, 0)
        };
        BatchResult::build(
            Path::new("/tmp/report.pdf"),
            PriceTable::builtin().lookup("claude-3-5-haiku-20241022"),
            3,
            vec![ok(0, 1000, 200), failed, ok(2, 3000, 400)],
            Duration::from_secs(4),
        )
    }

    #[test]
    fn totals_are_folded_from_units() {
        let batch = sample_batch();
        assert_eq!(batch.unit_count, 3);
        assert_eq!(batch.units.len(), batch.unit_count);
        assert_eq!(batch.succeeded, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(
            batch.token_usage,
            TokenUsage {
                input_tokens: 4000,
                output_tokens: 600,
            }
        );
        let unit_total = batch.units.iter().map(|u| u.cost.total_cost).sum::<f64>();
        assert!((unit_total - batch.cost.total_cost).abs() < 1e-12);
        assert_eq!(batch.units[1].cost, Cost::default());
        assert_eq!(batch.document_name(), "report.pdf");
    }

    #[test]
    fn serializes_flat_totals() -> Result<()> {
        let value = serde_json::to_value(sample_batch())?;
        assert_eq!(value["input_tokens"], json!(4000));
        assert_eq!(value["wall_clock_secs"], json!(4.0));
        assert_eq!(value["units"][1]["status"], json!("failed"));
        assert_eq!(value["units"][1]["error"]["kind"], json!("transient"));
        assert_eq!(value["units"][0]["elapsed_secs"], json!(1.5));
        let round_trip = serde_json::from_value::<BatchResult>(value)?;
        assert_eq!(round_trip.units.len(), 3);
        Ok(())
    }
}
