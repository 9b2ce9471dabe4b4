use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{AnalysisError, ErrorKind};

/// Scores at or above this are a buy.
pub const BUY_THRESHOLD: f64 = 0.70;
/// Scores at or below this are a sell.
pub const SELL_THRESHOLD: f64 = 0.30;

/// Request mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisMode {
    Single,
    Sector,
    #[serde(alias = "multi")]
    Multiple,
}

impl AnalysisMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisMode::Single => "single",
            AnalysisMode::Sector => "sector",
            AnalysisMode::Multiple => "multiple",
        }
    }
}

/// Optional providers that can adjust a base score.
///
/// The declaration order is the adjustment order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Macroeconomic,
    Sentiment,
    Esg,
    ShortInterest,
}

impl ProviderKind {
    /// Fixed order in which adjustment stages run, whatever subset is enabled.
    pub const ADJUSTMENT_ORDER: [ProviderKind; 4] = [
        ProviderKind::Macroeconomic,
        ProviderKind::Sentiment,
        ProviderKind::Esg,
        ProviderKind::ShortInterest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ProviderKind::Macroeconomic => "macroeconomic",
            ProviderKind::Sentiment => "sentiment",
            ProviderKind::Esg => "esg",
            ProviderKind::ShortInterest => "short_interest",
        }
    }
}

/// Caller-tunable options. Unset provider flags mean "participate if enabled".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOptions {
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_results: Option<usize>,
    #[serde(default)]
    pub enable_macro: Option<bool>,
    #[serde(default)]
    pub enable_sentiment: Option<bool>,
    #[serde(default, rename = "enableESG", alias = "enableEsg")]
    pub enable_esg: Option<bool>,
    #[serde(default)]
    pub enable_short_interest: Option<bool>,
}

impl RequestOptions {
    pub fn participates(&self, kind: ProviderKind) -> bool {
        let flag = match kind {
            ProviderKind::Macroeconomic => self.enable_macro,
            ProviderKind::Sentiment => self.enable_sentiment,
            ProviderKind::Esg => self.enable_esg,
            ProviderKind::ShortInterest => self.enable_short_interest,
        };
        flag.unwrap_or(true)
    }

    /// Turn every optional provider off.
    pub fn without_providers() -> Self {
        Self {
            enable_macro: Some(false),
            enable_sentiment: Some(false),
            enable_esg: Some(false),
            enable_short_interest: Some(false),
            ..Default::default()
        }
    }

    pub fn with_provider(mut self, kind: ProviderKind, enabled: bool) -> Self {
        let slot = match kind {
            ProviderKind::Macroeconomic => &mut self.enable_macro,
            ProviderKind::Sentiment => &mut self.enable_sentiment,
            ProviderKind::Esg => &mut self.enable_esg,
            ProviderKind::ShortInterest => &mut self.enable_short_interest,
        };
        *slot = Some(enabled);
        self
    }
}

/// Inbound request as received from a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub mode: AnalysisMode,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub sector_id: Option<String>,
    #[serde(default)]
    pub options: RequestOptions,
    #[serde(default)]
    pub request_id: Option<String>,
}

impl AnalysisRequest {
    pub fn single(symbol: impl Into<String>) -> Self {
        Self {
            mode: AnalysisMode::Single,
            symbols: vec![symbol.into()],
            sector_id: None,
            options: RequestOptions::default(),
            request_id: None,
        }
    }

    pub fn multiple<S: Into<String>>(symbols: impl IntoIterator<Item = S>) -> Self {
        Self {
            mode: AnalysisMode::Multiple,
            symbols: symbols.into_iter().map(Into::into).collect(),
            sector_id: None,
            options: RequestOptions::default(),
            request_id: None,
        }
    }

    pub fn sector(sector_id: impl Into<String>) -> Self {
        Self {
            mode: AnalysisMode::Sector,
            symbols: Vec::new(),
            sector_id: Some(sector_id.into()),
            options: RequestOptions::default(),
            request_id: None,
        }
    }

    pub fn with_options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }
}

/// A request that passed validation. Never modified after acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceptedRequest {
    pub request_id: String,
    pub mode: AnalysisMode,
    /// Sanitized, de-duplicated, in caller order.
    pub symbols: Vec<String>,
    pub sector_id: Option<String>,
    pub timeout: Duration,
    pub max_results: usize,
    /// Optional providers the caller asked for, in adjustment order.
    pub providers: Vec<ProviderKind>,
}

/// Per-symbol score. Every value is kept within [0, 1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockScore {
    pub symbol: String,
    pub overall_score: f64,
    pub factor_scores: BTreeMap<String, f64>,
    pub data_quality: f64,
    pub timestamp: DateTime<Utc>,
}

impl StockScore {
    pub fn new(
        symbol: impl Into<String>,
        overall_score: f64,
        factor_scores: BTreeMap<String, f64>,
        data_quality: f64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            overall_score: clamp_unit(overall_score),
            factor_scores: factor_scores
                .into_iter()
                .map(|(name, value)| (name, clamp_unit(value)))
                .collect(),
            data_quality: clamp_unit(data_quality),
            timestamp: Utc::now(),
        }
    }

    /// New score carrying `factor` as an extra factor and `overall` as the overall score.
    pub fn adjusted(&self, factor: &str, component: f64, overall: f64) -> Self {
        let mut factor_scores = self.factor_scores.clone();
        factor_scores.insert(factor.to_string(), clamp_unit(component));
        Self {
            symbol: self.symbol.clone(),
            overall_score: clamp_unit(overall),
            factor_scores,
            data_quality: self.data_quality,
            timestamp: Utc::now(),
        }
    }
}

/// Clamp into [0, 1]; non-finite values collapse to 0.
pub fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Hold,
    Sell,
}

impl Action {
    /// Classify a score. Scores above 1 are read as 0-100 and scaled down first.
    pub fn from_score(score: f64) -> Self {
        if !score.is_finite() {
            return Action::Hold;
        }
        let normalized = if score > 1.0 { score / 100.0 } else { score };
        if normalized >= BUY_THRESHOLD {
            Action::Buy
        } else if normalized <= SELL_THRESHOLD {
            Action::Sell
        } else {
            Action::Hold
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Applied,
    Unavailable,
    Disabled,
}

/// Outcome of one adjustment stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustmentStepResult {
    pub provider: ProviderKind,
    pub status: StepStatus,
    pub component: Option<f64>,
    pub delta: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub opportunities: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    Active,
    Unavailable,
    Disabled,
}

/// One entry of `topSelections`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockSelection {
    pub symbol: String,
    pub overall_score: f64,
    pub action: Action,
    pub factor_scores: BTreeMap<String, f64>,
    pub data_quality: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub adjustments: Vec<AdjustmentStepResult>,
}

impl StockSelection {
    pub fn from_score(score: StockScore, adjustments: Vec<AdjustmentStepResult>) -> Self {
        Self {
            action: Action::from_score(score.overall_score),
            symbol: score.symbol,
            overall_score: score.overall_score,
            factor_scores: score.factor_scores,
            data_quality: score.data_quality,
            timestamp: score.timestamp,
            adjustments,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseMetadata {
    pub request_id: String,
    pub mode: Option<AnalysisMode>,
    pub provider_status: BTreeMap<String, ProviderStatus>,
    pub cache_hit_rate: f64,
    pub from_cache: bool,
    pub symbols_requested: usize,
    pub symbols_analyzed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceBreakdown {
    pub fetch_ms: u64,
    pub adjust_ms: u64,
    pub cache_ms: u64,
    pub total_ms: u64,
}

/// Final response handed to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisResponse {
    pub success: bool,
    pub top_selections: Vec<StockSelection>,
    pub metadata: ResponseMetadata,
    pub performance_breakdown: PerformanceBreakdown,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl AnalysisResponse {
    /// Failed response: no selections, at least one error.
    pub fn failure(metadata: ResponseMetadata, error: &AnalysisError) -> Self {
        Self {
            success: false,
            top_selections: Vec::new(),
            metadata,
            performance_breakdown: PerformanceBreakdown::default(),
            errors: vec![error.public_message()],
            error_kind: Some(error.kind()),
        }
    }
}
