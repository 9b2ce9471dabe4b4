use analysis_core::{AnalysisError, CancellationToken};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::events::{EventBus, LifecycleEvent};

/// Tracking record for one in-flight request.
#[derive(Debug, Clone)]
pub struct ActiveRequestHandle {
    pub request_id: String,
    pub token: CancellationToken,
    pub started_at: Instant,
    generation: u64,
}

/// Process-wide table of active requests with a hard ceiling.
///
/// `active` is reserved before the map insert and released after the map
/// remove, so it never undercounts what the map holds.
pub struct HandleTable {
    handles: DashMap<String, ActiveRequestHandle>,
    active: AtomicUsize,
    ceiling: usize,
    stale_after: Duration,
    generation: AtomicU64,
}

impl HandleTable {
    pub fn new(ceiling: usize, stale_after: Duration) -> Self {
        Self {
            handles: DashMap::new(),
            active: AtomicUsize::new(0),
            ceiling,
            stale_after,
            generation: AtomicU64::new(0),
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.handles.contains_key(request_id)
    }

    /// Claim a slot and insert a handle in one step.
    ///
    /// Fails with `ConcurrencyLimit` when the table is full and `Validation`
    /// when `request_id` is already active. Dropping the guard removes the
    /// handle and cancels its token.
    pub fn try_register(&self, request_id: &str) -> Result<HandleGuard<'_>, AnalysisError> {
        let reserved = self
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.ceiling).then_some(n + 1)
            });
        if reserved.is_err() {
            return Err(AnalysisError::ConcurrencyLimit {
                limit: self.ceiling,
            });
        }

        let handle = ActiveRequestHandle {
            request_id: request_id.to_string(),
            token: CancellationToken::new(),
            started_at: Instant::now(),
            generation: self.generation.fetch_add(1, Ordering::Relaxed),
        };

        match self.handles.entry(request_id.to_string()) {
            Entry::Occupied(_) => {
                self.active.fetch_sub(1, Ordering::AcqRel);
                Err(AnalysisError::Validation(format!(
                    "request id '{}' is already active",
                    request_id
                )))
            }
            Entry::Vacant(slot) => {
                slot.insert(handle.clone());
                Ok(HandleGuard {
                    table: self,
                    handle,
                })
            }
        }
    }

    /// Cancel an active request by id. Returns false if it is not active.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.handles.get(request_id) {
            Some(handle) => {
                handle.token.cancel();
                true
            }
            None => false,
        }
    }

    fn release(&self, handle: &ActiveRequestHandle) {
        let removed = self
            .handles
            .remove_if(&handle.request_id, |_, current| {
                current.generation == handle.generation
            });
        if removed.is_some() {
            self.active.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Remove every handle older than the stale threshold as of `now`, cancelling its token.
    pub fn sweep_stale_at(&self, now: Instant) -> Vec<(String, Duration)> {
        let stale: Vec<(String, u64)> = self
            .handles
            .iter()
            .filter(|h| now.saturating_duration_since(h.started_at) >= self.stale_after)
            .map(|h| (h.request_id.clone(), h.generation))
            .collect();

        let mut reclaimed = Vec::with_capacity(stale.len());
        for (request_id, generation) in stale {
            if let Some((_, handle)) = self
                .handles
                .remove_if(&request_id, |_, h| h.generation == generation)
            {
                self.active.fetch_sub(1, Ordering::AcqRel);
                handle.token.cancel();
                let age = now.saturating_duration_since(handle.started_at);
                tracing::warn!(
                    "Reclaimed stale request handle {} after {}s",
                    request_id,
                    age.as_secs()
                );
                reclaimed.push((request_id, age));
            }
        }
        reclaimed
    }

    pub fn sweep_stale(&self) -> Vec<(String, Duration)> {
        self.sweep_stale_at(Instant::now())
    }

    /// Periodically reclaim stale handles. The task stops once the table is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, every: Duration, events: EventBus) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                let Some(table) = weak.upgrade() else {
                    break;
                };
                for (request_id, age) in table.sweep_stale() {
                    events.emit(LifecycleEvent::HandleReclaimed {
                        request_id,
                        age_ms: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
                    });
                }
            }
            tracing::debug!("Stale handle sweeper stopped");
        })
    }
}

/// Owns one table slot for the life of a request.
pub struct HandleGuard<'a> {
    table: &'a HandleTable,
    handle: ActiveRequestHandle,
}

impl HandleGuard<'_> {
    pub fn request_id(&self) -> &str {
        &self.handle.request_id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.handle.token
    }

    pub fn started_at(&self) -> Instant {
        self.handle.started_at
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        self.handle.token.cancel();
        self.table.release(&self.handle);
    }
}
