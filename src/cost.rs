//! Token pricing and cost aggregation.

use std::{collections::BTreeMap, ops::AddAssign};

use schemars::JsonSchema;

use crate::{
    async_utils::io::read_json_or_toml, drivers::TokenUsage, prelude::*,
    queues::dispatch::UnitResult,
};

/// The model we price unknown models as, unless a price table says otherwise.
const BUILTIN_DEFAULT_MODEL: &str = "claude-3-5-haiku-20241022";

/// Built-in prices, in dollars per million tokens.
const BUILTIN_PRICES: &[(&str, f64, f64)] = &[
    ("claude-3-5-haiku-20241022", 0.25, 1.25),
    ("claude-3-haiku-20240307", 0.25, 1.25),
    ("claude-3-5-sonnet-20241022", 3.0, 15.0),
    ("claude-3-opus-20240229", 15.0, 75.0),
    ("gemini-2.5-flash-lite", 0.10, 0.40),
    ("gemini-2.5-flash", 0.30, 2.50),
    ("gpt-4o-mini", 0.15, 0.60),
];

/// Price of one model, in dollars per million tokens.
#[derive(Clone, Copy, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ModelPrice {
    /// Dollars per million input tokens.
    pub input_per_million: f64,

    /// Dollars per million output tokens.
    pub output_per_million: f64,
}

/// A price table file. Entries override the built-in table.
///
/// ```toml
/// default_model = "gpt-4o-mini"
///
/// [models.gpt-4o-mini]
/// input_per_million = 0.15
/// output_per_million = 0.60
/// ```
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
#[serde(deny_unknown_fields)]
pub struct PriceTableFile {
    /// The model to use for pricing models missing from the table.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Prices by model name.
    #[serde(default)]
    pub models: BTreeMap<String, ModelPrice>,
}

/// Model prices, with a fallback for unknown models.
#[derive(Clone, Debug)]
pub struct PriceTable {
    default_model: String,
    models: BTreeMap<String, ModelPrice>,
}

impl PriceTable {
    /// Our built-in prices.
    pub fn builtin() -> Self {
        let models = BUILTIN_PRICES
            .iter()
            .map(|&(model, input_per_million, output_per_million)| {
                (
                    model.to_owned(),
                    ModelPrice {
                        input_per_million,
                        output_per_million,
                    },
                )
            })
            .collect();
        Self {
            default_model: BUILTIN_DEFAULT_MODEL.to_owned(),
            models,
        }
    }

    /// Load the built-in table, with entries from `path` merged over it.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut table = Self::builtin();
        if let Some(path) = path {
            let file = read_json_or_toml::<PriceTableFile>(path)
                .await
                .with_context(|| format!("could not load price table {}", path.display()))?;
            table.merge(file)?;
        }
        Ok(table)
    }

    /// Merge `file` over this table.
    fn merge(&mut self, file: PriceTableFile) -> Result<()> {
        for (model, price) in file.models {
            if price.input_per_million < 0.0 || price.output_per_million < 0.0 {
                return Err(anyhow!("negative price for model {model:?}"));
            }
            self.models.insert(model, price);
        }
        if let Some(default_model) = file.default_model {
            if !self.models.contains_key(&default_model) {
                return Err(anyhow!(
                    "default model {default_model:?} has no price table entry"
                ));
            }
            self.default_model = default_model;
        }
        Ok(())
    }

    /// Look up the price for `model`. Never fails: unknown models are priced
    /// as the default model.
    ///
    /// Gateway-style names like `anthropic/claude-3-5-haiku-20241022` are
    /// also tried without their prefix.
    pub fn lookup(&self, model: &str) -> ResolvedPrice {
        let unprefixed = model.rsplit('/').next().unwrap_or(model);
        let found = [model, unprefixed]
            .into_iter()
            .find_map(|name| self.models.get_key_value(name));
        let (priced_as, price, fallback) = match found {
            Some((name, price)) => (name.clone(), *price, false),
            None => {
                let price = self.models.get(&self.default_model).copied().unwrap_or(
                    ModelPrice {
                        input_per_million: 0.0,
                        output_per_million: 0.0,
                    },
                );
                (self.default_model.clone(), price, true)
            }
        };
        ResolvedPrice {
            model: model.to_owned(),
            priced_as,
            price,
            fallback,
        }
    }
}

/// The price actually used for a model.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct ResolvedPrice {
    /// The model we asked about.
    pub model: String,

    /// The price table entry we used.
    pub priced_as: String,

    #[serde(flatten)]
    pub price: ModelPrice,

    /// Was `model` missing from the table?
    pub fallback: bool,
}

/// A cost, in dollars.
#[derive(Clone, Copy, Debug, Default, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct Cost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl Cost {
    /// The cost of `usage` at `price`.
    pub fn for_usage(usage: TokenUsage, price: &ModelPrice) -> Self {
        let input_cost = usage.input_tokens as f64 / 1_000_000.0 * price.input_per_million;
        let output_cost =
            usage.output_tokens as f64 / 1_000_000.0 * price.output_per_million;
        Self {
            input_cost,
            output_cost,
            total_cost: input_cost + output_cost,
        }
    }
}

impl AddAssign for Cost {
    fn add_assign(&mut self, other: Self) {
        self.input_cost += other.input_cost;
        self.output_cost += other.output_cost;
        self.total_cost += other.total_cost;
    }
}

/// Per-unit costs, and their totals.
#[derive(Clone, Debug, PartialEq)]
pub struct CostSummary {
    /// One entry per unit, in unit order.
    pub unit_costs: Vec<Cost>,
    pub token_usage: TokenUsage,
    pub cost: Cost,
}

/// Price every unit, and fold the totals from the per-unit values.
pub fn aggregate(results: &[UnitResult], price: &ModelPrice) -> CostSummary {
    let mut token_usage = TokenUsage::default();
    let mut cost = Cost::default();
    let unit_costs = results
        .iter()
        .map(|result| {
            let unit_cost = Cost::for_usage(result.token_usage, price);
            token_usage += result.token_usage;
            cost += unit_cost;
            unit_cost
        })
        .collect();
    CostSummary {
        unit_costs,
        token_usage,
        cost,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;

    use crate::queues::dispatch::UnitStatus;

    use super::*;

    fn unit(index: usize, input_tokens: u64, output_tokens: u64) -> UnitResult {
        UnitResult {
            index,
            label: format!("page {}", index + 1),
            first_page: index + 1,
            last_page: index + 1,
            status: UnitStatus::Ok,
            output: Some("ok".to_owned()),
            error: None,
            retry_errors: vec![],
            attempts: 1,
            token_usage: TokenUsage {
                input_tokens,
                output_tokens,
            },
            elapsed: Duration::from_millis(10),
            completed_at: Utc::now(),
        }
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-12,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn aggregates_costs_per_million_tokens() {
        let results = [unit(0, 100, 50), unit(1, 200, 100)];
        let price = ModelPrice {
            input_per_million: 1.0,
            output_per_million: 2.0,
        };
        let summary = aggregate(&results, &price);
        assert_eq!(
            summary.token_usage,
            TokenUsage {
                input_tokens: 300,
                output_tokens: 150,
            }
        );
        assert_close(summary.cost.input_cost, 300.0 / 1e6 * 1.0);
        assert_close(summary.cost.output_cost, 150.0 / 1e6 * 2.0);
        assert_close(summary.cost.total_cost, (300.0 / 1e6) * 1.0 + (150.0 / 1e6) * 2.0);

        let unit_total = summary.unit_costs.iter().map(|c| c.total_cost).sum::<f64>();
        assert_close(unit_total, summary.cost.total_cost);

        // Folding is pure.
        assert_eq!(aggregate(&results, &price), summary);
    }

    #[test]
    fn unknown_models_fall_back_to_the_default() {
        let table = PriceTable::builtin();
        let resolved = table.lookup("some-new-model");
        assert!(resolved.fallback);
        assert_eq!(resolved.priced_as, BUILTIN_DEFAULT_MODEL);
        assert_eq!(resolved.price.input_per_million, 0.25);

        let known = table.lookup("gpt-4o-mini");
        assert!(!known.fallback);
        assert_eq!(known.price.output_per_million, 0.60);
    }

    #[test]
    fn gateway_prefixes_are_stripped() {
        let resolved = PriceTable::builtin().lookup("anthropic/claude-3-opus-20240229");
        assert!(!resolved.fallback);
        assert_eq!(resolved.model, "anthropic/claude-3-opus-20240229");
        assert_eq!(resolved.priced_as, "claude-3-opus-20240229");
    }

    #[tokio::test]
    async fn price_table_files_override_builtins() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("prices.toml");
        tokio::fs::write(
            &path,
            r#"
default_model = "local-llama"

[models.local-llama]
input_per_million = 0.0
output_per_million = 0.0

[models.gpt-4o-mini]
input_per_million = 1.5
output_per_million = 6.0
"#,
        )
        .await?;
        let table = PriceTable::load(Some(&path)).await?;
        assert_eq!(table.lookup("gpt-4o-mini").price.input_per_million, 1.5);
        assert_eq!(table.lookup("unheard-of").priced_as, "local-llama");
        assert!(!table.lookup("claude-3-5-sonnet-20241022").fallback);
        Ok(())
    }

    #[test]
    fn default_model_must_be_priced() {
        let mut table = PriceTable::builtin();
        let file = PriceTableFile {
            default_model: Some("missing".to_owned()),
            models: BTreeMap::new(),
        };
        assert!(table.merge(file).is_err());
    }
}
