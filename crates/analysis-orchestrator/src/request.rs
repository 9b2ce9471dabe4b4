use analysis_core::{
    AcceptedRequest, AnalysisError, AnalysisMode, AnalysisRequest, ProviderKind, SymbolValidator,
};
use std::collections::HashSet;
use std::time::Duration;

use crate::config::OrchestratorConfig;
use crate::sector::Sector;

/// Limits applied while accepting a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestLimits {
    pub max_batch_size: usize,
    pub default_timeout: Duration,
    pub max_timeout: Duration,
    pub default_max_results: usize,
}

impl From<&OrchestratorConfig> for RequestLimits {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            max_batch_size: config.max_batch_size,
            default_timeout: Duration::from_millis(config.default_timeout_ms),
            max_timeout: Duration::from_millis(config.max_timeout_ms),
            default_max_results: config.default_max_results,
        }
    }
}

/// Validate and normalize an inbound request. Allocates nothing beyond the returned value.
pub fn accept(
    request: &AnalysisRequest,
    limits: &RequestLimits,
    validator: &dyn SymbolValidator,
) -> Result<AcceptedRequest, AnalysisError> {
    let sector = match (request.mode, request.sector_id.as_deref()) {
        (AnalysisMode::Sector, Some(id)) => Some(id.parse::<Sector>()?),
        (AnalysisMode::Sector, None) => {
            return Err(AnalysisError::Validation(
                "sector mode requires a sectorId".to_string(),
            ))
        }
        (_, Some(_)) => {
            return Err(AnalysisError::Validation(
                "sectorId is only valid in sector mode".to_string(),
            ))
        }
        (_, None) => None,
    };

    let raw: Vec<String> = match sector {
        // A resolved universe is capped at the batch limit; the caller sent no symbols to reject.
        Some(sector) if request.symbols.is_empty() => {
            let mut universe = sector.symbol_list();
            universe.truncate(limits.max_batch_size);
            universe
        }
        _ => request.symbols.clone(),
    };
    if raw.is_empty() {
        return Err(AnalysisError::Validation(
            "symbols must not be empty".to_string(),
        ));
    }
    if raw.len() > limits.max_batch_size {
        return Err(AnalysisError::Validation(format!(
            "too many symbols: {} (maximum {})",
            raw.len(),
            limits.max_batch_size
        )));
    }

    let mut seen = HashSet::with_capacity(raw.len());
    let mut symbols = Vec::with_capacity(raw.len());
    for symbol in &raw {
        let sanitized = validator
            .validate(symbol)
            .ok_or_else(|| AnalysisError::Validation(format!("invalid symbol '{}'", symbol)))?;
        if seen.insert(sanitized.clone()) {
            symbols.push(sanitized);
        }
    }

    if request.mode == AnalysisMode::Single && symbols.len() != 1 {
        return Err(AnalysisError::Validation(format!(
            "single mode takes exactly one symbol, got {}",
            symbols.len()
        )));
    }

    let timeout = match request.options.timeout_ms {
        Some(0) => {
            return Err(AnalysisError::Validation(
                "timeoutMs must be positive".to_string(),
            ))
        }
        Some(ms) => Duration::from_millis(ms),
        None => limits.default_timeout,
    };
    if timeout > limits.max_timeout {
        return Err(AnalysisError::Validation(format!(
            "timeoutMs {} exceeds maximum {}",
            timeout.as_millis(),
            limits.max_timeout.as_millis()
        )));
    }

    let max_results = request
        .options
        .max_results
        .unwrap_or(limits.default_max_results);
    if max_results == 0 {
        return Err(AnalysisError::Validation(
            "maxResults must be positive".to_string(),
        ));
    }

    let request_id = match request.request_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => id.to_string(),
        _ => uuid::Uuid::new_v4().to_string(),
    };

    let providers = ProviderKind::ADJUSTMENT_ORDER
        .into_iter()
        .filter(|kind| request.options.participates(*kind))
        .collect();

    Ok(AcceptedRequest {
        request_id,
        mode: request.mode,
        symbols,
        sector_id: sector.map(|s| s.id().to_string()),
        timeout,
        max_results,
        providers,
    })
}
