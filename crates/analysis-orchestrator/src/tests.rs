#[cfg(test)]
mod orchestrator_tests {
    use crate::events::LifecycleEvent;
    use crate::memory::MemoryProbe;
    use crate::{
        AnalysisOrchestrator, OrchestratorConfig, ProviderDescriptor, ProviderRegistry,
        RateLimit, RateLimiter, Sector,
    };
    use analysis_core::{
        Action, AnalysisError, AnalysisMode, AnalysisRequest, AnalysisResponse, BaseScorer,
        CancellationToken, ErrorKind, ProviderKind, ProviderStatus, RequestOptions, StockScore,
        SubScoreProvider,
    };
    use async_trait::async_trait;
    use std::collections::{BTreeMap, HashMap, HashSet};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    /// Base scorer driven by per-symbol tables.
    #[derive(Default)]
    struct TableScorer {
        scores: HashMap<&'static str, f64>,
        delays_ms: HashMap<&'static str, u64>,
        failing: HashSet<&'static str>,
        calls: AtomicUsize,
    }

    impl TableScorer {
        fn with_score(mut self, symbol: &'static str, score: f64) -> Self {
            self.scores.insert(symbol, score);
            self
        }

        fn with_delay(mut self, symbol: &'static str, ms: u64) -> Self {
            self.delays_ms.insert(symbol, ms);
            self
        }

        fn failing_on(mut self, symbol: &'static str) -> Self {
            self.failing.insert(symbol);
            self
        }
    }

    #[async_trait]
    impl BaseScorer for TableScorer {
        async fn score(
            &self,
            symbol: &str,
            _cancel: &CancellationToken,
        ) -> Result<StockScore, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ms) = self.delays_ms.get(symbol) {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
            }
            if self.failing.contains(symbol) {
                return Err(AnalysisError::provider_unavailable("base", "no factor data"));
            }
            let score = self.scores.get(symbol).copied().unwrap_or(0.5);
            let mut factors = BTreeMap::new();
            factors.insert("fundamental".to_string(), score);
            Ok(StockScore::new(symbol, score, factors, 1.0))
        }
    }

    /// Provider that counts calls and records whether any call ran to completion.
    struct CountingProvider {
        value: Option<f64>,
        delay: Duration,
        calls: AtomicUsize,
        completed: AtomicUsize,
    }

    impl CountingProvider {
        fn new(value: Option<f64>, delay_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                value,
                delay: Duration::from_millis(delay_ms),
                calls: AtomicUsize::new(0),
                completed: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl SubScoreProvider for CountingProvider {
        async fn fetch_sub_score(&self, _symbol: &str) -> Option<f64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.completed.fetch_add(1, Ordering::SeqCst);
            self.value
        }
    }

    struct NoPressure;

    impl MemoryProbe for NoPressure {
        fn used_bytes(&self) -> Option<u64> {
            None
        }
    }

    fn test_config() -> OrchestratorConfig {
        OrchestratorConfig {
            batch_base_delay_ms: 0,
            batch_latency_factor: 0.0,
            ..OrchestratorConfig::default()
        }
    }

    fn registry_with(providers: &[(ProviderKind, Arc<CountingProvider>)]) -> ProviderRegistry {
        providers
            .iter()
            .fold(ProviderRegistry::new(), |registry, (kind, client)| {
                let client: Arc<dyn SubScoreProvider> = client.clone();
                registry.with_descriptor(
                    ProviderDescriptor::new(*kind, 0.5, Duration::from_secs(10)),
                    Some(client),
                )
            })
    }

    fn build(
        config: OrchestratorConfig,
        registry: ProviderRegistry,
        scorer: Arc<TableScorer>,
    ) -> AnalysisOrchestrator {
        let rate_limiter = Arc::new(RateLimiter::new(RateLimit::new(
            10_000,
            Duration::from_secs(60),
        )));
        AnalysisOrchestrator::new(config, registry, scorer, rate_limiter)
            .with_memory_probe(Arc::new(NoPressure))
    }

    fn simple(scorer: TableScorer) -> AnalysisOrchestrator {
        build(test_config(), ProviderRegistry::new(), Arc::new(scorer))
    }

    fn assert_failure_shape(response: &AnalysisResponse) {
        assert!(!response.success);
        assert!(response.top_selections.is_empty());
        assert!(!response.errors.is_empty());
        assert!(response.error_kind.is_some());
    }

    fn symbols(response: &AnalysisResponse) -> Vec<&str> {
        response
            .top_selections
            .iter()
            .map(|s| s.symbol.as_str())
            .collect()
    }

    async fn wait_for_active(orchestrator: &AnalysisOrchestrator, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while orchestrator.active_requests() < n {
            assert!(Instant::now() < deadline, "requests never became active");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_failed_responses_have_no_selections_and_carry_errors() {
        let orchestrator = simple(TableScorer::default().failing_on("BAD").with_delay("SLOW", 500));

        let invalid = orchestrator
            .submit(AnalysisRequest::multiple(Vec::<String>::new()))
            .await;
        assert_failure_shape(&invalid);
        assert_eq!(invalid.error_kind, Some(ErrorKind::Validation));

        let all_failed = orchestrator.submit(AnalysisRequest::single("BAD")).await;
        assert_failure_shape(&all_failed);
        assert!(all_failed.errors.iter().any(|e| e.starts_with("BAD:")));

        let timed_out = orchestrator
            .submit(AnalysisRequest::single("SLOW").with_options(RequestOptions {
                timeout_ms: Some(50),
                ..Default::default()
            }))
            .await;
        assert_failure_shape(&timed_out);
        assert_eq!(timed_out.error_kind, Some(ErrorKind::Timeout));

        assert_eq!(orchestrator.active_requests(), 0);
    }

    #[tokio::test]
    async fn test_single_symbol_without_providers() {
        let orchestrator = simple(TableScorer::default().with_score("AAPL", 0.62));
        let response = orchestrator
            .submit(
                AnalysisRequest::single("aapl").with_options(RequestOptions::without_providers()),
            )
            .await;

        assert!(response.success);
        assert_eq!(response.top_selections.len(), 1);
        let selection = &response.top_selections[0];
        assert_eq!(selection.symbol, "AAPL");
        assert!((0.0..=1.0).contains(&selection.overall_score));
        assert!(response
            .metadata
            .provider_status
            .values()
            .all(|s| *s == ProviderStatus::Disabled));
        assert_eq!(response.metadata.mode, Some(AnalysisMode::Single));
        assert!(response.errors.is_empty());
    }

    #[tokio::test]
    async fn test_repeat_request_is_served_from_cache() {
        let macro_provider = CountingProvider::new(Some(0.8), 1);
        let scorer = Arc::new(TableScorer::default().with_score("AAPL", 0.6).with_score("MSFT", 0.4));
        let orchestrator = build(
            test_config(),
            registry_with(&[(ProviderKind::Macroeconomic, Arc::clone(&macro_provider))]),
            Arc::clone(&scorer),
        );

        let first = orchestrator
            .submit(AnalysisRequest::multiple(["AAPL", "MSFT"]))
            .await;
        assert!(first.success);
        assert!(!first.metadata.from_cache);
        assert_eq!(macro_provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);

        // Same request shape, different caller order and id.
        let second = orchestrator
            .submit(AnalysisRequest::multiple(["MSFT", "AAPL"]).with_request_id("again"))
            .await;
        assert!(second.success);
        assert!(second.metadata.from_cache);
        assert_eq!(second.metadata.request_id, "again");
        assert_eq!(macro_provider.calls.load(Ordering::SeqCst), 2);
        assert_eq!(scorer.calls.load(Ordering::SeqCst), 2);
        assert_eq!(symbols(&second), vec!["MSFT", "AAPL"]);

        let score_of = |response: &AnalysisResponse, symbol: &str| {
            response
                .top_selections
                .iter()
                .find(|s| s.symbol == symbol)
                .map(|s| s.overall_score.to_bits())
        };
        assert_eq!(score_of(&first, "AAPL"), score_of(&second, "AAPL"));
        assert_eq!(score_of(&first, "MSFT"), score_of(&second, "MSFT"));

        let stats = orchestrator.stats();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert!((second.metadata.cache_hit_rate - 0.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_degrades_when_providers_are_missing_or_failing() {
        let macro_provider = CountingProvider::new(Some(1.0), 1);
        let sentiment = CountingProvider::new(None, 1);
        let orchestrator = build(
            test_config(),
            registry_with(&[
                (ProviderKind::Macroeconomic, macro_provider),
                (ProviderKind::Sentiment, sentiment),
            ]),
            Arc::new(TableScorer::default().with_score("NVDA", 0.5)),
        );

        let response = orchestrator.submit(AnalysisRequest::single("NVDA")).await;
        assert!(response.success);
        assert_eq!(response.top_selections.len(), 1);

        let status = &response.metadata.provider_status;
        assert_eq!(status["macroeconomic"], ProviderStatus::Active);
        assert_eq!(status["sentiment"], ProviderStatus::Unavailable);
        assert_eq!(status["esg"], ProviderStatus::Disabled);
        assert_eq!(status["short_interest"], ProviderStatus::Disabled);

        // 0.5 blended with macro 1.0 at weight 0.5; sentiment skipped.
        assert!((response.top_selections[0].overall_score - 0.75).abs() < 1e-9);
        assert_eq!(response.top_selections[0].action, Action::Buy);
    }

    #[tokio::test]
    async fn test_request_flags_disable_registered_providers() {
        let macro_provider = CountingProvider::new(Some(0.9), 1);
        let orchestrator = build(
            test_config(),
            registry_with(&[(ProviderKind::Macroeconomic, Arc::clone(&macro_provider))]),
            Arc::new(TableScorer::default()),
        );

        let options = RequestOptions::default().with_provider(ProviderKind::Macroeconomic, false);
        let response = orchestrator
            .submit(AnalysisRequest::single("AAPL").with_options(options))
            .await;

        assert!(response.success);
        assert_eq!(
            response.metadata.provider_status["macroeconomic"],
            ProviderStatus::Disabled
        );
        assert_eq!(macro_provider.calls.load(Ordering::SeqCst), 0);
        assert_eq!(response.top_selections[0].overall_score, 0.5);
    }

    #[tokio::test]
    async fn test_action_thresholds_end_to_end() {
        let orchestrator = simple(
            TableScorer::default()
                .with_score("UP", 0.70)
                .with_score("DOWN", 0.30)
                .with_score("FLAT", 0.50),
        );
        let response = orchestrator
            .submit(AnalysisRequest::multiple(["UP", "DOWN", "FLAT"]))
            .await;

        let actions: Vec<Action> = response.top_selections.iter().map(|s| s.action).collect();
        assert_eq!(actions, vec![Action::Buy, Action::Sell, Action::Hold]);
        assert_eq!(Action::from_score(75.0), Action::Buy);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_ceiling_fails_fast() {
        let orchestrator = Arc::new(build(
            OrchestratorConfig {
                max_concurrent_requests: 2,
                ..test_config()
            },
            ProviderRegistry::new(),
            Arc::new(TableScorer::default().with_delay("SLOW1", 300).with_delay("SLOW2", 300)),
        ));

        let mut running = Vec::new();
        for symbol in ["SLOW1", "SLOW2"] {
            let orchestrator = Arc::clone(&orchestrator);
            running.push(tokio::spawn(async move {
                orchestrator.submit(AnalysisRequest::single(symbol)).await
            }));
        }
        wait_for_active(&orchestrator, 2).await;

        let started = Instant::now();
        let rejected = orchestrator.submit(AnalysisRequest::single("AAPL")).await;
        assert!(started.elapsed() < Duration::from_millis(100));
        assert_failure_shape(&rejected);
        assert_eq!(rejected.error_kind, Some(ErrorKind::ConcurrencyLimit));

        for task in running {
            assert!(task.await.unwrap().success);
        }
        assert_eq!(orchestrator.active_requests(), 0);
        assert_eq!(orchestrator.stats().rejections, 1);
    }

    #[tokio::test]
    async fn test_duplicate_active_request_id_is_rejected() {
        let orchestrator = Arc::new(simple(TableScorer::default().with_delay("SLOW", 200)));

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .submit(AnalysisRequest::single("SLOW").with_request_id("dup"))
                    .await
            })
        };
        wait_for_active(&orchestrator, 1).await;

        let second = orchestrator
            .submit(AnalysisRequest::single("AAPL").with_request_id("dup"))
            .await;
        assert_eq!(second.error_kind, Some(ErrorKind::Validation));
        assert!(first.await.unwrap().success);

        // Once released the id is free again.
        let third = orchestrator
            .submit(AnalysisRequest::single("AAPL").with_request_id("dup"))
            .await;
        assert!(third.success);
    }

    #[tokio::test]
    async fn test_stale_handles_are_swept() {
        let orchestrator = simple(TableScorer::default());
        let mut events = orchestrator.subscribe();

        std::mem::forget(orchestrator.handles().try_register("ghost").unwrap());
        assert_eq!(orchestrator.active_requests(), 1);

        let threshold = orchestrator.config().stale_handle_threshold();
        let reclaimed = orchestrator
            .handles()
            .sweep_stale_at(tokio::time::Instant::now() + threshold + Duration::from_secs(1));
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(orchestrator.active_requests(), 0);

        // The table has room again after the sweep.
        let response = orchestrator.submit(AnalysisRequest::single("AAPL")).await;
        assert!(response.success);
        assert!(matches!(
            events.recv().await.unwrap(),
            LifecycleEvent::Accepted { .. }
        ));
    }

    #[tokio::test]
    async fn test_configured_orchestrator_sweeps_on_its_own() {
        let orchestrator = AnalysisOrchestrator::from_config(OrchestratorConfig {
            stale_handle_secs: 1,
            sweep_interval_secs: 1,
            ..test_config()
        })
        .await
        .unwrap();
        assert!(orchestrator.has_stale_sweeper());
        let mut events = orchestrator.subscribe();

        std::mem::forget(orchestrator.handles().try_register("ghost").unwrap());
        assert_eq!(orchestrator.active_requests(), 1);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("sweeper should reclaim the handle")
            .unwrap();
        assert!(matches!(
            event,
            LifecycleEvent::HandleReclaimed { ref request_id, .. } if request_id == "ghost"
        ));
        assert_eq!(orchestrator.active_requests(), 0);

        let assembled = simple(TableScorer::default());
        assert!(!assembled.has_stale_sweeper());
    }

    #[tokio::test]
    async fn test_batch_results_follow_caller_order() {
        let orchestrator = simple(
            TableScorer::default()
                .with_delay("C", 60)
                .with_delay("A", 5)
                .with_delay("B", 30),
        );
        let response = orchestrator
            .submit(AnalysisRequest::multiple(["C", "A", "B"]))
            .await;

        assert!(response.success);
        assert_eq!(symbols(&response), vec!["C", "A", "B"]);
    }

    #[tokio::test]
    async fn test_partial_failure_keeps_other_symbols() {
        let orchestrator = simple(TableScorer::default().failing_on("B"));
        let response = orchestrator
            .submit(AnalysisRequest::multiple(["A", "B", "C"]))
            .await;

        assert!(response.success);
        assert_eq!(symbols(&response), vec!["A", "C"]);
        assert_eq!(response.errors.len(), 1);
        assert!(response.errors[0].starts_with("B:"));
        assert_eq!(response.metadata.symbols_requested, 3);
        assert_eq!(response.metadata.symbols_analyzed, 2);
    }

    #[tokio::test]
    async fn test_timeout_cancels_in_flight_provider_work() {
        let slow = CountingProvider::new(Some(0.9), 400);
        let orchestrator = build(
            test_config(),
            registry_with(&[(ProviderKind::Esg, Arc::clone(&slow))]),
            Arc::new(TableScorer::default()),
        );
        let mut events = orchestrator.subscribe();

        let started = Instant::now();
        let response = orchestrator
            .submit(AnalysisRequest::single("AAPL").with_options(RequestOptions {
                timeout_ms: Some(100),
                ..Default::default()
            }))
            .await;

        assert!(started.elapsed() < Duration::from_millis(1_000));
        assert_failure_shape(&response);
        assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
        assert!(response.performance_breakdown.total_ms >= 100);
        assert!(response.performance_breakdown.total_ms < 1_000);
        assert_eq!(orchestrator.active_requests(), 0);
        assert_eq!(orchestrator.stats().timeouts, 1);

        // Left running, the fetch would have finished by now.
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(slow.calls.load(Ordering::SeqCst), 1);
        assert_eq!(slow.completed.load(Ordering::SeqCst), 0);

        let mut saw_timeout = false;
        while let Ok(event) = events.try_recv() {
            saw_timeout |= matches!(event, LifecycleEvent::TimedOut { timeout_ms: 100, .. });
        }
        assert!(saw_timeout);
    }

    #[tokio::test]
    async fn test_explicit_cancel_stops_request() {
        let orchestrator = Arc::new(simple(TableScorer::default().with_delay("SLOW", 2_000)));

        let pending = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                orchestrator
                    .submit(AnalysisRequest::single("SLOW").with_request_id("stop-me"))
                    .await
            })
        };
        wait_for_active(&orchestrator, 1).await;

        assert!(orchestrator.cancel("stop-me"));
        let response = pending.await.unwrap();
        assert_failure_shape(&response);
        assert_eq!(response.error_kind, Some(ErrorKind::Timeout));
        assert!(!orchestrator.cancel("stop-me"));
    }

    #[tokio::test]
    async fn test_sector_results_are_ranked_and_truncated() {
        let universe = Sector::Energy.symbols();
        let scorer = universe
            .iter()
            .enumerate()
            .fold(TableScorer::default(), |scorer, (i, symbol)| {
                scorer.with_score(*symbol, 0.1 + i as f64 * 0.05)
            });
        let orchestrator = simple(scorer);

        let response = orchestrator
            .submit(AnalysisRequest::sector("energy").with_options(RequestOptions {
                max_results: Some(3),
                ..RequestOptions::without_providers()
            }))
            .await;

        assert!(response.success);
        assert_eq!(response.top_selections.len(), 3);
        let expected: Vec<&str> = universe.iter().rev().take(3).copied().collect();
        assert_eq!(symbols(&response), expected);
        assert_eq!(response.metadata.symbols_analyzed, universe.len());
    }

    #[tokio::test]
    async fn test_lifecycle_events_for_a_request() {
        let orchestrator = simple(TableScorer::default().failing_on("B"));
        let mut events = orchestrator.subscribe();

        orchestrator
            .submit(AnalysisRequest::multiple(["A", "B"]).with_request_id("evt"))
            .await;

        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.request_id(), Some("evt"));
            seen.push(event);
        }
        assert!(matches!(seen.first(), Some(LifecycleEvent::Accepted { symbols: 2, .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, LifecycleEvent::BatchWindowCompleted { failed: 1, .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, LifecycleEvent::SymbolCompleted { symbol, .. } if symbol == "A")));
        assert!(seen
            .iter()
            .any(|e| matches!(e, LifecycleEvent::SymbolFailed { symbol, .. } if symbol == "B")));
        assert!(matches!(
            seen.last(),
            Some(LifecycleEvent::Completed { success: true, selections: 1, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stats_under_concurrent_requests() {
        let orchestrator = Arc::new(simple(TableScorer::default().with_delay("X", 5)));
        let mut tasks = Vec::new();

        for i in 0..20 {
            let orchestrator = Arc::clone(&orchestrator);
            tasks.push(tokio::spawn(async move {
                let symbol = if i % 2 == 0 { "X" } else { "Y" };
                orchestrator
                    .submit(AnalysisRequest::single(symbol).with_request_id(format!("req-{}", i)))
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().success);
        }

        let stats = orchestrator.stats();
        assert_eq!(stats.total_requests, 20);
        assert_eq!(stats.successes, 20);
        assert_eq!(stats.cache_hits + stats.cache_misses, 20);
        assert_eq!(stats.by_mode["single"], 20);
        assert_eq!(orchestrator.active_requests(), 0);
    }
}
