use analysis_core::{AnalysisError, BaseScorer, CancellationToken, StockScore, SubScoreProvider};
use async_trait::async_trait;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::adjustment::{guarded_fetch, FetchOutcome};
use crate::config::OrchestratorConfig;
use crate::http_provider::HttpSubScoreProvider;
use crate::rate_limiter::RateLimiter;

/// One core factor feeding the base score.
#[derive(Clone)]
pub struct FactorSource {
    pub name: String,
    pub weight: f64,
    pub timeout: Duration,
    client: Arc<dyn SubScoreProvider>,
}

/// Base scorer that combines core factor sub-scores by weight.
///
/// Missing factors shrink `data_quality` instead of failing the symbol; the symbol
/// only fails when no factor answers at all.
pub struct FactorScorer {
    factors: Vec<FactorSource>,
    rate_limiter: Arc<RateLimiter>,
}

impl FactorScorer {
    pub fn new(rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            factors: Vec::new(),
            rate_limiter,
        }
    }

    pub fn default_weight(name: &str) -> f64 {
        match name {
            "technical" => 0.20,
            "fundamental" => 0.40,
            "quantitative" => 0.15,
            "news_sentiment" => 0.25,
            _ => 0.10,
        }
    }

    pub fn with_factor(
        mut self,
        name: impl Into<String>,
        weight: f64,
        timeout: Duration,
        client: Arc<dyn SubScoreProvider>,
    ) -> Self {
        self.factors.push(FactorSource {
            name: name.into(),
            weight: if weight.is_finite() { weight.max(0.0) } else { 0.0 },
            timeout,
            client,
        });
        self
    }

    pub fn from_config(config: &OrchestratorConfig, rate_limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let timeout = config.provider_timeout();
        let endpoints = [
            ("technical", &config.technical_provider_url),
            ("fundamental", &config.fundamental_provider_url),
            ("quantitative", &config.quant_provider_url),
            ("news_sentiment", &config.news_provider_url),
        ];

        let mut scorer = Self::new(rate_limiter);
        for (name, url) in endpoints {
            if let Some(url) = url {
                let client = HttpSubScoreProvider::new(name, url.clone(), timeout)?;
                scorer = scorer.with_factor(name, Self::default_weight(name), timeout, Arc::new(client));
            }
        }
        if scorer.factors.is_empty() {
            tracing::warn!("No base factor endpoints configured; every symbol will fail to score");
        }
        Ok(scorer)
    }

    pub fn factor_count(&self) -> usize {
        self.factors.len()
    }
}

/// Data-quality penalty when factors disagree (one bullish, another bearish).
fn conflict_penalty(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let has_bullish = values.iter().any(|&v| v >= 0.65);
    let has_bearish = values.iter().any(|&v| v <= 0.35);
    if !(has_bullish && has_bearish) {
        return 0.0;
    }
    let max = values.iter().copied().fold(f64::MIN, f64::max);
    let min = values.iter().copied().fold(f64::MAX, f64::min);
    (max - min) * 0.30
}

#[async_trait]
impl BaseScorer for FactorScorer {
    async fn score(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<StockScore, AnalysisError> {
        if self.factors.is_empty() {
            return Err(AnalysisError::provider_unavailable(
                "base",
                "no factor providers configured",
            ));
        }

        let fetches = self.factors.iter().map(|factor| async move {
            let outcome = guarded_fetch(
                factor.client.as_ref(),
                &factor.name,
                symbol,
                factor.timeout,
                &self.rate_limiter,
                cancel,
            )
            .await;
            (factor, outcome)
        });
        let outcomes = join_all(fetches).await;

        let total_weight: f64 = self.factors.iter().map(|f| f.weight).sum();
        let mut weighted_sum = 0.0;
        let mut available_weight = 0.0;
        let mut factor_scores = BTreeMap::new();

        for (factor, outcome) in &outcomes {
            if let FetchOutcome::Value(value) = outcome {
                weighted_sum += value * factor.weight;
                available_weight += factor.weight;
                factor_scores.insert(factor.name.clone(), *value);
            }
        }

        if factor_scores.is_empty() || available_weight <= 0.0 {
            return Err(AnalysisError::provider_unavailable(
                "base",
                format!("no factor data for {}", symbol),
            ));
        }

        let overall = weighted_sum / available_weight;
        let coverage = if total_weight > 0.0 {
            available_weight / total_weight
        } else {
            0.0
        };
        let values: Vec<f64> = factor_scores.values().copied().collect();
        let data_quality = (coverage - conflict_penalty(&values)).max(0.05);

        tracing::debug!(
            "Base score for {}: {:.3} from {}/{} factors (quality {:.2})",
            symbol,
            overall,
            factor_scores.len(),
            self.factors.len(),
            data_quality
        );

        Ok(StockScore::new(symbol, overall, factor_scores, data_quality))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limiter::RateLimit;

    struct Fixed(Option<f64>);

    #[async_trait]
    impl SubScoreProvider for Fixed {
        async fn fetch_sub_score(&self, _symbol: &str) -> Option<f64> {
            self.0
        }
    }

    fn limiter() -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(RateLimit::new(100, Duration::from_secs(60))))
    }

    fn scorer(factors: &[(&str, f64, Option<f64>)]) -> FactorScorer {
        factors.iter().fold(FactorScorer::new(limiter()), |s, (name, weight, value)| {
            s.with_factor(*name, *weight, Duration::from_secs(1), Arc::new(Fixed(*value)))
        })
    }

    #[tokio::test]
    async fn test_weighted_combination() {
        let s = scorer(&[("technical", 0.2, Some(0.5)), ("fundamental", 0.4, Some(0.8))]);
        let score = s.score("AAPL", &CancellationToken::new()).await.unwrap();
        // (0.5*0.2 + 0.8*0.4) / 0.6 = 0.7
        assert!((score.overall_score - 0.7).abs() < 1e-9);
        assert_eq!(score.factor_scores.len(), 2);
        assert!((score.data_quality - 1.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_missing_factor_lowers_quality() {
        let s = scorer(&[("technical", 0.5, Some(0.6)), ("fundamental", 0.5, None)]);
        let score = s.score("MSFT", &CancellationToken::new()).await.unwrap();
        assert!((score.overall_score - 0.6).abs() < 1e-9);
        assert!((score.data_quality - 0.5).abs() < 1e-9);
        assert!(!score.factor_scores.contains_key("fundamental"));
    }

    #[tokio::test]
    async fn test_conflicting_factors_penalize_quality() {
        let s = scorer(&[("technical", 0.5, Some(0.9)), ("fundamental", 0.5, Some(0.1))]);
        let score = s.score("TSLA", &CancellationToken::new()).await.unwrap();
        assert!((score.overall_score - 0.5).abs() < 1e-9);
        // coverage 1.0 minus 0.8 * 0.30
        assert!((score.data_quality - 0.76).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_no_factor_data_fails_symbol() {
        let s = scorer(&[("technical", 0.5, None)]);
        let err = s.score("ZZZ", &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::ProviderUnavailable { .. }));

        let empty = FactorScorer::new(limiter());
        assert!(empty.score("ZZZ", &CancellationToken::new()).await.is_err());
    }
}
