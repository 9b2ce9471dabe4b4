use analysis_core::{
    AcceptedRequest, AnalysisError, AnalysisMode, AnalysisRequest, AnalysisResponse, BaseScorer,
    CancellationToken, DefaultSymbolValidator, PerformanceBreakdown, ProviderKind,
    ProviderStatus, ResponseMetadata, StepStatus, StockSelection, SymbolValidator,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::Instrument;

pub mod adjustment;
pub mod batch;
pub mod cache;
pub mod config;
pub mod events;
pub mod handles;
pub mod http_provider;
pub mod memory;
pub mod rate_limiter;
pub mod registry;
pub mod request;
pub mod scoring;
pub mod sector;
pub mod stats;
pub mod store;

#[cfg(test)]
mod tests;

pub use adjustment::{ChainOutcome, FetchOutcome, ScoreAdjustmentChain};
pub use batch::{BatchEngine, BatchOutcome, BatchSettings, WindowReport};
pub use cache::CacheLayer;
pub use config::OrchestratorConfig;
pub use events::{EventBus, LifecycleEvent};
pub use handles::{ActiveRequestHandle, HandleGuard, HandleTable};
pub use http_provider::HttpSubScoreProvider;
pub use memory::{MemoryProbe, ProcessMemoryProbe};
pub use rate_limiter::{RateLimit, RateLimiter};
pub use registry::{ProviderDescriptor, ProviderRegistry};
pub use request::RequestLimits;
pub use scoring::FactorScorer;
pub use sector::Sector;
pub use stats::{StatsCollector, StatsSnapshot};
pub use store::RedisCacheStore;

/// Entry point for analysis requests.
///
/// Built once at startup and shared by reference; every piece of mutable state
/// (handles, cache, counters) lives inside it.
///
/// `from_config` starts the stale handle sweeper. An orchestrator assembled with
/// `new` has none until `start_stale_sweeper` is called. The sweeper stops when
/// the orchestrator is dropped.
pub struct AnalysisOrchestrator {
    config: OrchestratorConfig,
    limits: RequestLimits,
    validator: Arc<dyn SymbolValidator>,
    scorer: Arc<dyn BaseScorer>,
    chain: Arc<ScoreAdjustmentChain>,
    cache: Arc<CacheLayer>,
    probe: Arc<dyn MemoryProbe>,
    batch: BatchEngine,
    handles: Arc<HandleTable>,
    stats: StatsCollector,
    events: EventBus,
    sweeper: Option<JoinHandle<()>>,
}

impl Drop for AnalysisOrchestrator {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}

/// What the batch phase produced before it is turned into a response.
struct BatchSummary {
    selections: Vec<StockSelection>,
    errors: Vec<String>,
    applied: HashSet<ProviderKind>,
    fetch_time: Duration,
    adjust_time: Duration,
}

impl AnalysisOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        registry: ProviderRegistry,
        scorer: Arc<dyn BaseScorer>,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let cache = Arc::new(CacheLayer::new());
        let probe: Arc<dyn MemoryProbe> = Arc::new(ProcessMemoryProbe);
        let batch = BatchEngine::new(
            BatchSettings::from(&config),
            Arc::clone(&cache),
            Arc::clone(&probe),
        );

        Self {
            limits: RequestLimits::from(&config),
            validator: Arc::new(DefaultSymbolValidator::default()),
            scorer,
            chain: Arc::new(ScoreAdjustmentChain::new(Arc::new(registry), rate_limiter)),
            cache,
            probe,
            batch,
            handles: Arc::new(HandleTable::new(
                config.max_concurrent_requests,
                config.stale_handle_threshold(),
            )),
            stats: StatsCollector::new(),
            events: EventBus::default(),
            sweeper: None,
            config,
        }
    }

    /// Wire everything from configuration: HTTP providers for configured endpoints
    /// and, if `REDIS_URL` is set and reachable, a persistent cache tier.
    pub async fn from_config(config: OrchestratorConfig) -> anyhow::Result<Self> {
        config.validate()?;

        let rate_limiter = Arc::new(RateLimiter::new(RateLimit::new(
            config.provider_rate_limit,
            Duration::from_secs(config.provider_rate_window_secs),
        )));
        let registry = ProviderRegistry::from_config(&config)?;
        let scorer = FactorScorer::from_config(&config, Arc::clone(&rate_limiter))?;

        let mut orchestrator = Self::new(config, registry, Arc::new(scorer), rate_limiter);

        if let Some(url) = orchestrator.config.redis_url.clone() {
            match RedisCacheStore::connect(&url).await {
                Ok(store) => {
                    tracing::info!("Persistent cache store connected");
                    orchestrator = orchestrator.with_cache(CacheLayer::new().with_store(Arc::new(store)));
                }
                Err(e) => tracing::warn!("Redis unavailable, continuing with in-process cache only: {}", e),
            }
        }

        orchestrator.start_stale_sweeper();
        Ok(orchestrator)
    }

    pub fn with_cache(mut self, cache: CacheLayer) -> Self {
        self.cache = Arc::new(cache);
        self.rebuild_batch_engine();
        self
    }

    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self.rebuild_batch_engine();
        self
    }

    pub fn with_validator(mut self, validator: Arc<dyn SymbolValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        if self.sweeper.is_some() {
            self.start_stale_sweeper();
        }
        self
    }

    fn rebuild_batch_engine(&mut self) {
        self.batch = BatchEngine::new(
            BatchSettings::from(&self.config),
            Arc::clone(&self.cache),
            Arc::clone(&self.probe),
        );
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProviderRegistry {
        self.chain.registry()
    }

    pub fn cache(&self) -> &CacheLayer {
        &self.cache
    }

    pub fn handles(&self) -> &Arc<HandleTable> {
        &self.handles
    }

    pub fn active_requests(&self) -> usize {
        self.handles.len()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Cancel an in-flight request. Returns false if no such request is active.
    pub fn cancel(&self, request_id: &str) -> bool {
        self.handles.cancel(request_id)
    }

    /// Start (or restart) the background task that reclaims abandoned request handles.
    pub fn start_stale_sweeper(&mut self) {
        if let Some(previous) = self.sweeper.take() {
            previous.abort();
        }
        self.sweeper = Some(
            self.handles
                .spawn_sweeper(self.config.sweep_interval(), self.events.clone()),
        );
    }

    pub fn has_stale_sweeper(&self) -> bool {
        self.sweeper.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Analyze a request. Always returns a structured response; failures are
    /// reported through `success`, `errors` and `error_kind`.
    pub async fn submit(&self, request: AnalysisRequest) -> AnalysisResponse {
        let started = Instant::now();

        let accepted = match request::accept(&request, &self.limits, self.validator.as_ref()) {
            Ok(accepted) => accepted,
            Err(err) => return self.reject(request.request_id.clone(), request.mode, &err),
        };

        let guard = match self.handles.try_register(&accepted.request_id) {
            Ok(guard) => guard,
            Err(err) => {
                return self.reject(Some(accepted.request_id.clone()), accepted.mode, &err)
            }
        };

        let span = tracing::info_span!(
            "analysis",
            request_id = %accepted.request_id,
            mode = accepted.mode.as_str()
        );
        self.run(&accepted, &guard, started).instrument(span).await
    }

    fn reject(
        &self,
        request_id: Option<String>,
        mode: AnalysisMode,
        err: &AnalysisError,
    ) -> AnalysisResponse {
        self.stats.record_rejection();
        tracing::warn!("Rejected {} request: {}", mode.as_str(), err);
        self.events.emit(LifecycleEvent::Rejected {
            request_id: request_id.clone(),
            kind: err.kind(),
            reason: err.public_message(),
        });

        AnalysisResponse::failure(
            ResponseMetadata {
                request_id: request_id.unwrap_or_default(),
                mode: Some(mode),
                cache_hit_rate: self.stats.cache_hit_rate(),
                ..Default::default()
            },
            err,
        )
    }

    async fn run(
        &self,
        request: &AcceptedRequest,
        guard: &HandleGuard<'_>,
        started: Instant,
    ) -> AnalysisResponse {
        self.stats.record_request(request.mode);
        self.events.emit(LifecycleEvent::Accepted {
            request_id: request.request_id.clone(),
            mode: request.mode,
            symbols: request.symbols.len(),
        });
        tracing::info!(
            "Starting {} analysis for {} symbols (timeout {}ms)",
            request.mode.as_str(),
            request.symbols.len(),
            request.timeout.as_millis()
        );

        let cache_start = Instant::now();
        let key = CacheLayer::derive_key(request);
        if let Some(cached) = self.cache.get(&key).await {
            match serde_json::from_value::<AnalysisResponse>(cached) {
                Ok(response) => {
                    return self.serve_cached(request, response, cache_start.elapsed(), started)
                }
                Err(e) => tracing::warn!("Discarding unreadable cached response {}: {}", key, e),
            }
        }
        self.stats.record_cache_miss();
        tracing::debug!("Cache miss for {}", key);
        let lookup_time = cache_start.elapsed();

        let token = guard.token().clone();
        let raced = tokio::select! {
            summary = self.analyze(request, token.clone()) => Ok(summary),
            _ = tokio::time::sleep(request.timeout) => Err(AnalysisError::Timeout {
                timeout_ms: duration_ms(request.timeout),
            }),
            _ = token.cancelled() => Err(AnalysisError::Cancelled),
        };

        let summary = match raced {
            Ok(summary) => summary,
            Err(err) => {
                // Dropping the analysis future above already aborted its workers;
                // cancelling reaches anything still holding the token.
                token.cancel();
                self.stats.record_timeout(started.elapsed());
                self.events.emit(LifecycleEvent::TimedOut {
                    request_id: request.request_id.clone(),
                    timeout_ms: duration_ms(request.timeout),
                });
                tracing::warn!("Analysis abandoned after {}ms: {}", started.elapsed().as_millis(), err);
                let mut response =
                    AnalysisResponse::failure(self.metadata(request, &HashSet::new(), 0), &err);
                response.performance_breakdown.cache_ms = duration_ms(lookup_time);
                response.performance_breakdown.total_ms = duration_ms(started.elapsed());
                return response;
            }
        };

        let mut response = self.build_response(request, summary);

        let write_start = Instant::now();
        if response.success {
            match serde_json::to_value(&response) {
                Ok(value) => {
                    self.cache
                        .set(&key, value, self.config.cache_ttl(request.mode))
                        .await
                }
                Err(e) => tracing::error!("Could not serialize response for caching: {}", e),
            }
        }
        response.performance_breakdown.cache_ms = duration_ms(lookup_time + write_start.elapsed());
        response.performance_breakdown.total_ms = duration_ms(started.elapsed());

        self.stats.record_outcome(started.elapsed(), response.success);
        self.events.emit(LifecycleEvent::Completed {
            request_id: request.request_id.clone(),
            success: response.success,
            selections: response.top_selections.len(),
            total_ms: response.performance_breakdown.total_ms,
        });
        tracing::info!(
            "Analysis complete: {} selections, {} errors in {}ms",
            response.top_selections.len(),
            response.errors.len(),
            response.performance_breakdown.total_ms
        );

        response
    }

    fn serve_cached(
        &self,
        request: &AcceptedRequest,
        mut response: AnalysisResponse,
        cache_time: Duration,
        started: Instant,
    ) -> AnalysisResponse {
        self.stats.record_cache_hit();
        tracing::debug!("Serving {} from cache", request.request_id);

        if request.mode != AnalysisMode::Sector {
            let position: HashMap<&str, usize> = request
                .symbols
                .iter()
                .enumerate()
                .map(|(i, s)| (s.as_str(), i))
                .collect();
            response
                .top_selections
                .sort_by_key(|s| position.get(s.symbol.as_str()).copied().unwrap_or(usize::MAX));
        }

        response.metadata.request_id = request.request_id.clone();
        response.metadata.from_cache = true;
        response.metadata.cache_hit_rate = self.stats.cache_hit_rate();
        response.performance_breakdown = PerformanceBreakdown {
            fetch_ms: 0,
            adjust_ms: 0,
            cache_ms: duration_ms(cache_time),
            total_ms: duration_ms(started.elapsed()),
        };

        self.stats.record_outcome(started.elapsed(), true);
        self.events.emit(LifecycleEvent::CacheHit {
            request_id: request.request_id.clone(),
        });
        response
    }

    /// Score and adjust every symbol through the batch engine.
    async fn analyze(&self, request: &AcceptedRequest, token: CancellationToken) -> BatchSummary {
        let scorer = Arc::clone(&self.scorer);
        let chain = Arc::clone(&self.chain);
        let providers: Arc<[ProviderKind]> = request.providers.clone().into();

        let work = move |symbol: String| {
            let scorer = Arc::clone(&scorer);
            let chain = Arc::clone(&chain);
            let providers = Arc::clone(&providers);
            let token = token.clone();
            async move {
                if token.is_cancelled() {
                    return Err(AnalysisError::Cancelled);
                }
                let base = scorer.score(&symbol, &token).await?;
                Ok(chain.adjust(&base, &providers, &token).await)
            }
        };

        let batch_start = Instant::now();
        let outcomes = self
            .batch
            .run_batch(&request.symbols, work, |report| {
                self.events.emit(LifecycleEvent::BatchWindowCompleted {
                    request_id: request.request_id.clone(),
                    window: report.index,
                    total_windows: report.total_windows,
                    failed: report.failed,
                    delay_ms: duration_ms(report.delay),
                });
            })
            .await;
        let fetch_time = batch_start.elapsed();

        let mut summary = BatchSummary {
            selections: Vec::with_capacity(outcomes.len()),
            errors: Vec::new(),
            applied: HashSet::new(),
            fetch_time,
            adjust_time: Duration::ZERO,
        };

        for outcome in outcomes {
            match outcome.result {
                Ok(adjusted) => {
                    self.events.emit(LifecycleEvent::SymbolCompleted {
                        request_id: request.request_id.clone(),
                        symbol: outcome.symbol,
                        score: adjusted.score.overall_score,
                    });
                    summary.adjust_time += adjusted.adjust_time;
                    summary.applied.extend(
                        adjusted
                            .steps
                            .iter()
                            .filter(|step| step.status == StepStatus::Applied)
                            .map(|step| step.provider),
                    );
                    summary
                        .selections
                        .push(StockSelection::from_score(adjusted.score, adjusted.steps));
                }
                Err(err) => {
                    if matches!(err, AnalysisError::Internal(_)) {
                        tracing::error!("Internal failure analyzing {}: {}", outcome.symbol, err);
                    } else {
                        tracing::warn!("Could not analyze {}: {}", outcome.symbol, err);
                    }
                    summary
                        .errors
                        .push(format!("{}: {}", outcome.symbol, err.public_message()));
                    self.events.emit(LifecycleEvent::SymbolFailed {
                        request_id: request.request_id.clone(),
                        symbol: outcome.symbol,
                        reason: err.public_message(),
                    });
                }
            }
        }

        summary
    }

    fn build_response(&self, request: &AcceptedRequest, summary: BatchSummary) -> AnalysisResponse {
        let BatchSummary {
            mut selections,
            errors,
            applied,
            fetch_time,
            adjust_time,
        } = summary;

        let analyzed = selections.len();
        let metadata = self.metadata(request, &applied, analyzed);

        if selections.is_empty() {
            let mut response = AnalysisResponse::failure(
                metadata,
                &AnalysisError::provider_unavailable("base", "no symbol could be analyzed"),
            );
            response.errors.extend(errors);
            response.performance_breakdown.fetch_ms = duration_ms(fetch_time);
            return response;
        }

        if request.mode == AnalysisMode::Sector {
            // Stable, so ties keep universe order.
            selections.sort_by(|a, b| b.overall_score.total_cmp(&a.overall_score));
            selections.truncate(request.max_results);
        }

        AnalysisResponse {
            success: true,
            top_selections: selections,
            metadata,
            performance_breakdown: PerformanceBreakdown {
                fetch_ms: duration_ms(fetch_time),
                adjust_ms: duration_ms(adjust_time),
                cache_ms: 0,
                total_ms: 0,
            },
            errors,
            error_kind: None,
        }
    }

    fn metadata(
        &self,
        request: &AcceptedRequest,
        applied: &HashSet<ProviderKind>,
        analyzed: usize,
    ) -> ResponseMetadata {
        let registry = self.chain.registry();
        let provider_status: BTreeMap<String, ProviderStatus> = ProviderKind::ADJUSTMENT_ORDER
            .into_iter()
            .map(|kind| {
                let status = if !registry.is_enabled(kind) || !request.providers.contains(&kind) {
                    ProviderStatus::Disabled
                } else if applied.contains(&kind) {
                    ProviderStatus::Active
                } else {
                    ProviderStatus::Unavailable
                };
                (kind.name().to_string(), status)
            })
            .collect();

        ResponseMetadata {
            request_id: request.request_id.clone(),
            mode: Some(request.mode),
            provider_status,
            cache_hit_rate: self.stats.cache_hit_rate(),
            from_cache: false,
            symbols_requested: request.symbols.len(),
            symbols_analyzed: analyzed,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
