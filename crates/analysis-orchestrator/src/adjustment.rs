use analysis_core::{
    AdjustmentStepResult, CancellationToken, ProviderKind, StepStatus, StockScore,
    SubScoreProvider, BUY_THRESHOLD, SELL_THRESHOLD,
};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::rate_limiter::RateLimiter;
use crate::registry::{ProviderRegistry, RegisteredProvider};

/// What a single provider fetch produced.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    Value(f64),
    Unavailable(String),
    Disabled,
}

/// Adjusted score plus the per-stage trail.
#[derive(Debug, Clone)]
pub struct ChainOutcome {
    pub score: StockScore,
    pub steps: Vec<AdjustmentStepResult>,
    pub fetch_time: Duration,
    pub adjust_time: Duration,
}

/// Blends a base score with optional provider sub-scores in a fixed order.
///
/// Fetches run concurrently and land in a per-provider map; the blend then walks
/// `ProviderKind::ADJUSTMENT_ORDER`, so completion order never affects the result.
pub struct ScoreAdjustmentChain {
    registry: Arc<ProviderRegistry>,
    rate_limiter: Arc<RateLimiter>,
}

impl ScoreAdjustmentChain {
    pub fn new(registry: Arc<ProviderRegistry>, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            registry,
            rate_limiter,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Run every stage in `selected` against `base`. Provider failures never escape.
    pub async fn adjust(
        &self,
        base: &StockScore,
        selected: &[ProviderKind],
        cancel: &CancellationToken,
    ) -> ChainOutcome {
        let fetch_start = Instant::now();
        let outcomes = self.fetch_all(&base.symbol, selected, cancel).await;
        let fetch_time = fetch_start.elapsed();

        let adjust_start = Instant::now();
        let (score, steps) = apply_stages(base, &outcomes, |kind| {
            self.registry
                .get(kind)
                .map(|p| p.descriptor.weight)
                .unwrap_or(0.0)
        });

        ChainOutcome {
            score,
            steps,
            fetch_time,
            adjust_time: adjust_start.elapsed(),
        }
    }

    async fn fetch_all(
        &self,
        symbol: &str,
        selected: &[ProviderKind],
        cancel: &CancellationToken,
    ) -> HashMap<ProviderKind, FetchOutcome> {
        let fetches = self
            .registry
            .iter()
            .filter(|p| selected.contains(&p.descriptor.kind))
            .map(|provider| async move {
                let outcome = self.fetch_one(provider, symbol, cancel).await;
                (provider.descriptor.kind, outcome)
            });

        join_all(fetches).await.into_iter().collect()
    }

    async fn fetch_one(
        &self,
        provider: &RegisteredProvider,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> FetchOutcome {
        let Some(client) = provider.client() else {
            return FetchOutcome::Disabled;
        };
        guarded_fetch(
            client.as_ref(),
            &provider.descriptor.name,
            symbol,
            provider.descriptor.timeout,
            &self.rate_limiter,
            cancel,
        )
        .await
    }
}

/// One provider call under the rate limit, a timeout and the request's cancellation.
///
/// Panics, timeouts, refusals and out-of-range values all come back as `Unavailable`.
pub(crate) async fn guarded_fetch(
    client: &dyn SubScoreProvider,
    name: &str,
    symbol: &str,
    timeout: Duration,
    rate_limiter: &RateLimiter,
    cancel: &CancellationToken,
) -> FetchOutcome {
    if !rate_limiter.allow(name) {
        return FetchOutcome::Unavailable(format!("{} rate limit reached", name));
    }

    let fetch = AssertUnwindSafe(client.fetch_sub_score(symbol)).catch_unwind();

    let outcome = tokio::select! {
        _ = cancel.cancelled() => FetchOutcome::Unavailable("request cancelled".to_string()),
        res = tokio::time::timeout(timeout, fetch) => match res {
            Ok(Ok(Some(value))) if value.is_finite() && (0.0..=1.0).contains(&value) => {
                FetchOutcome::Value(value)
            }
            Ok(Ok(Some(value))) => {
                FetchOutcome::Unavailable(format!("malformed sub-score {}", value))
            }
            Ok(Ok(None)) => FetchOutcome::Unavailable("no data".to_string()),
            Ok(Err(_)) => FetchOutcome::Unavailable("provider panicked".to_string()),
            Err(_) => FetchOutcome::Unavailable(format!(
                "timed out after {}ms",
                timeout.as_millis()
            )),
        },
    };

    if let FetchOutcome::Unavailable(reason) = &outcome {
        tracing::warn!("Provider {} unavailable for {}: {}", name, symbol, reason);
    }
    outcome
}

/// Sequential blend over the fixed stage order.
///
/// Each applied stage computes `previous * (1 - w) + component * w`; stages with
/// no value leave the score untouched and record why.
pub fn apply_stages<W>(
    base: &StockScore,
    outcomes: &HashMap<ProviderKind, FetchOutcome>,
    weight_of: W,
) -> (StockScore, Vec<AdjustmentStepResult>)
where
    W: Fn(ProviderKind) -> f64,
{
    let mut current = base.clone();
    let mut steps = Vec::with_capacity(ProviderKind::ADJUSTMENT_ORDER.len());

    for kind in ProviderKind::ADJUSTMENT_ORDER {
        let outcome = outcomes.get(&kind).unwrap_or(&FetchOutcome::Disabled);
        let step = match outcome {
            FetchOutcome::Value(component) => {
                let w = weight_of(kind).clamp(0.0, 1.0);
                let previous = current.overall_score;
                let adjusted = previous * (1.0 - w) + component * w;
                current = current.adjusted(kind.name(), *component, adjusted);

                let mut warnings = Vec::new();
                let mut opportunities = Vec::new();
                if *component >= BUY_THRESHOLD {
                    opportunities.push(format!(
                        "Strong {} signal ({:.0}%)",
                        kind.name(),
                        component * 100.0
                    ));
                } else if *component <= SELL_THRESHOLD {
                    warnings.push(format!(
                        "Weak {} signal ({:.0}%)",
                        kind.name(),
                        component * 100.0
                    ));
                }

                AdjustmentStepResult {
                    provider: kind,
                    status: StepStatus::Applied,
                    component: Some(*component),
                    delta: current.overall_score - previous,
                    warnings,
                    opportunities,
                }
            }
            FetchOutcome::Unavailable(reason) => AdjustmentStepResult {
                provider: kind,
                status: StepStatus::Unavailable,
                component: None,
                delta: 0.0,
                warnings: vec![format!("{} unavailable: {}", kind.name(), reason)],
                opportunities: Vec::new(),
            },
            FetchOutcome::Disabled => AdjustmentStepResult {
                provider: kind,
                status: StepStatus::Disabled,
                component: None,
                delta: 0.0,
                warnings: Vec::new(),
                opportunities: Vec::new(),
            },
        };
        steps.push(step);
    }

    (current, steps)
}
