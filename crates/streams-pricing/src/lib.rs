//! Usage-cost estimation against the LiteLLM pricing dataset
//!
//! The dataset is fetched lazily, exactly once per process: the first caller
//! triggers the load, concurrent callers share the in-flight fetch, and the
//! result (or an empty dataset on failure) is cached forever. A fetch
//! failure therefore degrades every estimate to zero instead of surfacing an
//! error; a live dashboard keeps rendering through network trouble.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use streams_core::{Result, StreamsError, UsageTotals};

/// Token count above which the above-200k rates apply.
pub const TIERED_THRESHOLD: u64 = 200_000;

/// Prefixes tried, in order, when a model name has no exact dataset key.
const PROVIDER_PREFIXES: &[&str] = &[
    "anthropic/",
    "anthropic.claude-",
    "claude-3-5-",
    "claude-3-",
    "claude-",
    "openrouter/openai/",
];

/// Per-model rate card, read verbatim from the dataset. Rates are USD per
/// token; the above-200k variants apply to tokens beyond the threshold.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_token: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_token: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_token_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_token_cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_cost_per_token_above_200k_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_cost_per_token_above_200k_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_token_cost_above_200k_tokens: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_token_cost_above_200k_tokens: Option<f64>,
}

pub type PricingDataset = HashMap<String, ModelPricing>;

/// Source of the raw pricing dataset
#[async_trait]
pub trait PricingSource: Send + Sync {
    async fn fetch(&self) -> Result<serde_json::Value>;
}

/// Fetches the dataset document over HTTP.
pub struct HttpPricingSource {
    client: reqwest::Client,
    url: String,
}

impl HttpPricingSource {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl PricingSource for HttpPricingSource {
    async fn fetch(&self) -> Result<serde_json::Value> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| StreamsError::TransportError(format!("Pricing fetch failed: {e}")))?;

        if !response.status().is_success() {
            return Err(StreamsError::TransportError(format!(
                "Pricing fetch failed: HTTP {}",
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| StreamsError::TransportError(format!("Pricing fetch failed: {e}")))
    }
}

/// Whether a dataset key names a Claude model.
fn is_claude_model(model_name: &str) -> bool {
    let lower = model_name.to_lowercase();
    lower.starts_with("claude-")
        || lower.contains("anthropic/claude-")
        || lower.contains("anthropic.claude-")
}

/// Narrow the raw document to Claude rate cards, dropping everything else to
/// keep later lookups unambiguous.
fn filter_dataset(raw: serde_json::Value) -> PricingDataset {
    let mut dataset = PricingDataset::new();
    let serde_json::Value::Object(entries) = raw else {
        return dataset;
    };
    for (model_name, model_data) in entries {
        if !model_data.is_object() || !is_claude_model(&model_name) {
            continue;
        }
        match serde_json::from_value::<ModelPricing>(model_data) {
            Ok(pricing) => {
                dataset.insert(model_name, pricing);
            }
            Err(e) => debug!("Skipping malformed pricing record {}: {}", model_name, e),
        }
    }
    dataset
}

/// Find the rate card for a model name: exact key first, then exact after
/// each provider prefix, then a case-insensitive substring match in either
/// direction. `None` means the model contributes zero cost.
fn match_model_pricing<'a>(dataset: &'a PricingDataset, model_name: &str) -> Option<&'a ModelPricing> {
    if let Some(pricing) = dataset.get(model_name) {
        return Some(pricing);
    }
    for prefix in PROVIDER_PREFIXES {
        if let Some(pricing) = dataset.get(&format!("{prefix}{model_name}")) {
            return Some(pricing);
        }
    }

    let lower = model_name.to_lowercase();
    dataset
        .iter()
        .find(|(key, _)| {
            let comparison = key.to_lowercase();
            comparison.contains(&lower) || lower.contains(&comparison)
        })
        .map(|(_, pricing)| pricing)
}

/// Cost of one counter under the 200k tiering rule. Below the threshold all
/// tokens are charged at the base rate; above it, the excess is charged at
/// the tiered rate when one exists, and at the base rate otherwise (the
/// excess is never left unpriced).
fn tiered_cost(total_tokens: u64, base_rate: Option<f64>, tiered_rate: Option<f64>) -> f64 {
    if total_tokens == 0 {
        return 0.0;
    }

    if total_tokens > TIERED_THRESHOLD {
        if let Some(tiered_rate) = tiered_rate {
            let below = TIERED_THRESHOLD as f64;
            let above = (total_tokens - TIERED_THRESHOLD) as f64;
            let mut cost = above * tiered_rate;
            if let Some(base_rate) = base_rate {
                cost += below * base_rate;
            }
            return cost;
        }
    }

    match base_rate {
        Some(base_rate) => total_tokens as f64 * base_rate,
        None => 0.0,
    }
}

/// Cost of one model's aggregate usage against its rate card.
pub fn cost_from_pricing(totals: &UsageTotals, pricing: &ModelPricing) -> f64 {
    let input = tiered_cost(
        totals.input_tokens,
        pricing.input_cost_per_token,
        pricing.input_cost_per_token_above_200k_tokens,
    );
    let output = tiered_cost(
        totals.output_tokens,
        pricing.output_cost_per_token,
        pricing.output_cost_per_token_above_200k_tokens,
    );
    let cache_creation = tiered_cost(
        totals.cache_creation_tokens,
        pricing.cache_creation_input_token_cost,
        pricing.cache_creation_input_token_cost_above_200k_tokens,
    );
    let cache_read = tiered_cost(
        totals.cache_read_tokens,
        pricing.cache_read_input_token_cost,
        pricing.cache_read_input_token_cost_above_200k_tokens,
    );

    input + output + cache_creation + cache_read
}

/// Resolves model names to rate cards and prices aggregate usage.
pub struct PricingResolver {
    source: Arc<dyn PricingSource>,
    dataset: OnceCell<PricingDataset>,
}

impl PricingResolver {
    pub fn new(source: Arc<dyn PricingSource>) -> Self {
        Self {
            source,
            dataset: OnceCell::new(),
        }
    }

    pub fn over_http(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self::new(Arc::new(HttpPricingSource::new(client, url)))
    }

    /// The cached dataset, loading it on first use. Concurrent callers share
    /// one fetch; a failed fetch is cached as an empty dataset for the rest
    /// of the process.
    async fn dataset(&self) -> &PricingDataset {
        self.dataset
            .get_or_init(|| async {
                match self.source.fetch().await {
                    Ok(raw) => {
                        let dataset = filter_dataset(raw);
                        debug!("Loaded pricing dataset: {} Claude models", dataset.len());
                        dataset
                    }
                    Err(e) => {
                        warn!("Pricing dataset unavailable, costs degrade to 0: {}", e);
                        PricingDataset::new()
                    }
                }
            })
            .await
    }

    /// Total estimated cost for the given per-model usage totals. Unknown
    /// models are skipped silently; this never fails.
    pub async fn resolve_cost(&self, totals_by_model: &HashMap<String, UsageTotals>) -> f64 {
        let dataset = self.dataset().await;
        let mut total_cost = 0.0;

        for (model_name, totals) in totals_by_model {
            let Some(pricing) = match_model_pricing(dataset, model_name) else {
                debug!("No pricing found for model: {}", model_name);
                continue;
            };
            total_cost += cost_from_pricing(totals, pricing);
        }

        total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dataset(entries: &[(&str, ModelPricing)]) -> PricingDataset {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    fn basic_pricing() -> ModelPricing {
        ModelPricing {
            input_cost_per_token: Some(0.000003),
            output_cost_per_token: Some(0.000015),
            ..Default::default()
        }
    }

    #[test]
    fn claude_model_filter() {
        assert!(is_claude_model("claude-sonnet-4-5"));
        assert!(is_claude_model("anthropic/claude-sonnet-4-5"));
        assert!(is_claude_model("us.anthropic.claude-sonnet-4-5-v1:0"));
        assert!(!is_claude_model("gpt-4o"));
        assert!(!is_claude_model("gemini-2.0-flash"));
    }

    #[test]
    fn filter_dataset_drops_non_claude_records() {
        let raw = serde_json::json!({
            "claude-sonnet-4-5": {"input_cost_per_token": 0.000003},
            "gpt-4o": {"input_cost_per_token": 0.0000025},
            "claude-bad": "not an object"
        });
        let dataset = filter_dataset(raw);
        assert_eq!(dataset.len(), 1);
        assert!(dataset.contains_key("claude-sonnet-4-5"));
    }

    #[test]
    fn tiered_cost_below_threshold_uses_base_rate() {
        assert_eq!(tiered_cost(1000, Some(0.000015), None), 0.015);
        assert_eq!(tiered_cost(1000, None, Some(0.000006)), 0.0);
        assert_eq!(tiered_cost(0, Some(0.000003), None), 0.0);
    }

    #[test]
    fn tiered_cost_above_threshold_splits_at_200k() {
        // 200_000 * 0.000003 + 50_000 * 0.000006 = 0.6 + 0.3 = 0.9
        let cost = tiered_cost(250_000, Some(0.000003), Some(0.000006));
        assert!((cost - 0.9).abs() < 1e-12);
    }

    #[test]
    fn missing_tiered_rate_charges_everything_at_base() {
        // 250_000 * 0.000003 = 0.75; the 50k excess is not left unpriced.
        let cost = tiered_cost(250_000, Some(0.000003), None);
        assert!((cost - 0.75).abs() < 1e-12);
    }

    #[test]
    fn documented_cost_scenario() {
        let pricing = ModelPricing {
            input_cost_per_token: Some(0.000003),
            input_cost_per_token_above_200k_tokens: Some(0.000006),
            output_cost_per_token: Some(0.000015),
            ..Default::default()
        };
        let totals = UsageTotals {
            input_tokens: 250_000,
            output_tokens: 1000,
            ..Default::default()
        };
        let cost = cost_from_pricing(&totals, &pricing);
        assert!((cost - 0.915).abs() < 1e-12);
    }

    #[test]
    fn match_prefers_exact_then_prefix_then_substring() {
        let ds = dataset(&[
            ("anthropic/claude-sonnet-4-5-20250101", basic_pricing()),
            ("claude-opus-4-5", basic_pricing()),
        ]);

        // Exact.
        assert!(match_model_pricing(&ds, "claude-opus-4-5").is_some());
        // Prefix fallback resolves before substring matching.
        assert!(match_model_pricing(&ds, "claude-sonnet-4-5-20250101").is_some());
        // Substring in either direction.
        assert!(match_model_pricing(&ds, "opus-4-5").is_some());
        assert!(match_model_pricing(&ds, "claude-opus-4-5-20251101-preview").is_some());
        // Miss.
        assert!(match_model_pricing(&ds, "gpt-4o").is_none());
    }

    #[test]
    fn prefix_fallback_wins_over_substring() {
        let mut prefixed = basic_pricing();
        prefixed.input_cost_per_token = Some(1.0);
        let mut substring = basic_pricing();
        substring.input_cost_per_token = Some(2.0);
        let ds = dataset(&[
            ("anthropic/claude-sonnet-4-5-20250101", prefixed),
            ("claude-sonnet-4-5", substring),
        ]);

        let matched = match_model_pricing(&ds, "claude-sonnet-4-5-20250101").unwrap();
        assert_eq!(matched.input_cost_per_token, Some(1.0));
    }
}
