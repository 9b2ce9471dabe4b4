use analysis_core::AnalysisError;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::cache::CacheLayer;
use crate::config::OrchestratorConfig;
use crate::memory::MemoryProbe;

#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub window: usize,
    pub max_workers: usize,
    pub base_delay: Duration,
    pub latency_factor: f64,
    pub max_delay: Duration,
    pub memory_threshold_bytes: u64,
    pub evict_fraction: f64,
}

impl From<&OrchestratorConfig> for BatchSettings {
    fn from(config: &OrchestratorConfig) -> Self {
        Self {
            window: config.batch_window.max(1),
            max_workers: config.max_concurrent_workers.max(1),
            base_delay: Duration::from_millis(config.batch_base_delay_ms),
            latency_factor: config.batch_latency_factor,
            max_delay: Duration::from_millis(config.batch_max_delay_ms),
            memory_threshold_bytes: config.memory_threshold_bytes(),
            evict_fraction: config.evict_fraction,
        }
    }
}

/// Settled result for one symbol.
#[derive(Debug)]
pub struct BatchOutcome<T> {
    pub symbol: String,
    pub result: Result<T, AnalysisError>,
    pub elapsed: Duration,
}

/// Summary of one completed window, handed to the progress callback.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowReport {
    pub index: usize,
    pub total_windows: usize,
    pub completed: usize,
    pub failed: usize,
    pub avg_latency: Duration,
    /// Pause before the next window (zero after the last one).
    pub delay: Duration,
    /// Entries evicted by memory-pressure relief, if it ran.
    pub evicted: Option<usize>,
}

/// Bounded fan-out over symbols in fixed-size windows.
///
/// The worker semaphore is shared by every batch running on this engine, so the
/// cap holds across concurrent requests too.
pub struct BatchEngine {
    settings: BatchSettings,
    semaphore: Arc<Semaphore>,
    cache: Arc<CacheLayer>,
    probe: Arc<dyn MemoryProbe>,
}

impl BatchEngine {
    pub fn new(settings: BatchSettings, cache: Arc<CacheLayer>, probe: Arc<dyn MemoryProbe>) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(settings.max_workers.max(1))),
            settings,
            cache,
            probe,
        }
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    /// Delay before the next window, scaled by what the last window observed.
    pub fn adaptive_delay(&self, avg_latency: Duration) -> Duration {
        let scaled = avg_latency.as_secs_f64() * self.settings.latency_factor;
        let delay = self.settings.base_delay + Duration::from_secs_f64(scaled.max(0.0));
        delay.min(self.settings.max_delay)
    }

    /// Evict low-value cache entries and release capacity when memory use is over threshold.
    pub fn relieve_memory_pressure(&self) -> Option<usize> {
        let used = self.probe.used_bytes()?;
        if used <= self.settings.memory_threshold_bytes {
            return None;
        }
        let evicted = self.cache.evict_low_value(self.settings.evict_fraction);
        self.cache.shrink();
        tracing::warn!(
            "Memory pressure: {}MB in use (threshold {}MB), evicted {} cache entries",
            used / (1024 * 1024),
            self.settings.memory_threshold_bytes / (1024 * 1024),
            evicted
        );
        Some(evicted)
    }

    /// Run `work` for every symbol and return one outcome per symbol, in input order.
    ///
    /// A failing or panicking item never aborts the batch. Dropping the returned
    /// future aborts every in-flight worker.
    pub async fn run_batch<T, F, Fut, P>(
        &self,
        symbols: &[String],
        work: F,
        on_window: P,
    ) -> Vec<BatchOutcome<T>>
    where
        T: Send + 'static,
        F: Fn(String) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<T, AnalysisError>> + Send + 'static,
        P: Fn(&WindowReport) + Send + Sync,
    {
        let window = self.settings.window.max(1);
        let total_windows = symbols.len().div_ceil(window);
        let mut outcomes: Vec<Option<BatchOutcome<T>>> = symbols.iter().map(|_| None).collect();

        for (window_index, chunk) in symbols.chunks(window).enumerate() {
            let offset = window_index * window;
            let mut tasks = JoinSet::new();

            for (i, symbol) in chunk.iter().enumerate() {
                let semaphore = Arc::clone(&self.semaphore);
                let work = work.clone();
                let symbol = symbol.clone();
                let index = offset + i;

                tasks.spawn(async move {
                    let _permit = match semaphore.acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => {
                            let err = AnalysisError::Internal("worker pool closed".to_string());
                            return (index, symbol, Err(err), Duration::ZERO);
                        }
                    };
                    let started = Instant::now();
                    let result = work(symbol.clone()).await;
                    (index, symbol, result, started.elapsed())
                });
            }

            let mut latencies = Vec::with_capacity(chunk.len());
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((index, symbol, result, elapsed)) => {
                        latencies.push(elapsed);
                        outcomes[index] = Some(BatchOutcome {
                            symbol,
                            result,
                            elapsed,
                        });
                    }
                    Err(e) => tracing::error!("Batch worker task failed: {}", e),
                }
            }

            // Workers that panicked never reported back.
            for (i, symbol) in chunk.iter().enumerate() {
                let slot = &mut outcomes[offset + i];
                if slot.is_none() {
                    *slot = Some(BatchOutcome {
                        symbol: symbol.clone(),
                        result: Err(AnalysisError::Internal(format!(
                            "worker for {} terminated unexpectedly",
                            symbol
                        ))),
                        elapsed: Duration::ZERO,
                    });
                }
            }

            let avg_latency = if latencies.is_empty() {
                Duration::ZERO
            } else {
                latencies.iter().sum::<Duration>() / latencies.len() as u32
            };
            let failed = outcomes[offset..offset + chunk.len()]
                .iter()
                .flatten()
                .filter(|o| o.result.is_err())
                .count();

            let expired = self.cache.purge_expired();
            if expired > 0 {
                tracing::debug!("Purged {} expired cache entries", expired);
            }
            let evicted = self.relieve_memory_pressure();
            let is_last = window_index + 1 == total_windows;
            let delay = if is_last {
                Duration::ZERO
            } else {
                self.adaptive_delay(avg_latency)
            };

            let report = WindowReport {
                index: window_index,
                total_windows,
                completed: chunk.len(),
                failed,
                avg_latency,
                delay,
                evicted,
            };
            tracing::debug!(
                "Batch window {}/{} done: {} symbols, {} failed, avg {}ms, next delay {}ms",
                window_index + 1,
                total_windows,
                chunk.len(),
                failed,
                avg_latency.as_millis(),
                delay.as_millis()
            );
            on_window(&report);

            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
        }

        outcomes.into_iter().flatten().collect()
    }
}
