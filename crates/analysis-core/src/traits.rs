use async_trait::async_trait;
use std::time::Duration;

use crate::{AnalysisError, CancellationToken, StockScore};

/// A data source that contributes one 0-1 sub-score per symbol.
///
/// Failures are reported as `None` ("nothing to say"), never as errors.
#[async_trait]
pub trait SubScoreProvider: Send + Sync {
    async fn fetch_sub_score(&self, symbol: &str) -> Option<f64>;
}

/// Produces the unadjusted score for a symbol.
#[async_trait]
pub trait BaseScorer: Send + Sync {
    async fn score(
        &self,
        symbol: &str,
        cancel: &CancellationToken,
    ) -> Result<StockScore, AnalysisError>;
}

/// Sanitizes a raw symbol, returning `None` if it is not acceptable.
pub trait SymbolValidator: Send + Sync {
    fn validate(&self, symbol: &str) -> Option<String>;
}

/// Persistent key/value store backing the in-process cache.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, AnalysisError>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AnalysisError>;

    async fn delete(&self, key: &str) -> Result<(), AnalysisError>;
}
