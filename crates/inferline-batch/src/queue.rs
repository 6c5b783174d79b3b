//! Batching queue — admission, batch assembly and dispatch.
//!
//! Two background tasks run per queue:
//! - the assembler closes the open batch once its oldest request has
//!   waited `max_wait`;
//! - the dispatcher waits for a free executor slot, takes the oldest ready
//!   batch and spawns its execution.
//!
//! Both share one mutex-protected [`QueueState`] with `submit`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use inferline_cache::{ResultCache, weigh};
use inferline_core::config::{BatchingConfig, CacheConfig, CacheWeigher};
use inferline_core::{Fingerprint, Payload, Prediction, Request, ServeError, deadline_after};
use inferline_executor::{ModelBinding, Slot, SlotPool};
use inferline_metrics::MetricsAggregator;

use crate::state::{Delivery, Item, QueueState, Served, Ticket};

/// Tunables for one batching queue.
#[derive(Debug, Clone)]
pub struct BatchSettings {
    pub max_batch_size: usize,
    pub max_wait: Duration,
    pub max_queue_depth: usize,
    pub request_timeout: Duration,
    pub weigher: CacheWeigher,
}

impl BatchSettings {
    pub fn from_config(batching: &BatchingConfig, cache: &CacheConfig) -> Self {
        Self {
            max_batch_size: batching.max_batch_size,
            max_wait: batching.max_wait(),
            max_queue_depth: batching.max_queue_depth,
            request_timeout: batching.request_timeout(),
            weigher: cache.weigh_by,
        }
    }
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self::from_config(&BatchingConfig::default(), &CacheConfig::default())
    }
}

/// Counters and gauges reported on the status endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub batches_dispatched: u64,
    pub requests_coalesced: u64,
    pub requests_expired: u64,
    pub requests_rejected: u64,
    pub queue_depth: usize,
    pub in_flight: usize,
}

pub struct BatchingQueue {
    settings: BatchSettings,
    model: Arc<dyn ModelBinding>,
    cache: Arc<ResultCache>,
    pool: Arc<SlotPool>,
    metrics: Arc<MetricsAggregator>,
    state: Mutex<QueueState>,
    assembler_wake: Notify,
    dispatcher_wake: Notify,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    next_request: AtomicU64,
}

/// Withdraws a waiter when its `submit` call ends, for any reason.
///
/// After a normal delivery the entry is already gone and this is a no-op.
struct WaiterGuard<'a> {
    queue: &'a BatchingQueue,
    fingerprint: Fingerprint,
    id: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.queue.state();
        if state.withdraw(&self.fingerprint, self.id) {
            debug!(fingerprint = ?self.fingerprint, "queued request withdrawn");
            self.queue.metrics.record_queue_depth(state.depth());
        }
    }
}

impl BatchingQueue {
    /// Create the queue and spawn its assembler and dispatcher tasks.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        settings: BatchSettings,
        model: Arc<dyn ModelBinding>,
        cache: Arc<ResultCache>,
        pool: Arc<SlotPool>,
        metrics: Arc<MetricsAggregator>,
    ) -> Arc<Self> {
        let state = QueueState::new(settings.max_batch_size, settings.max_queue_depth);
        let queue = Arc::new(Self {
            settings,
            model,
            cache,
            pool,
            metrics,
            state: Mutex::new(state),
            assembler_wake: Notify::new(),
            dispatcher_wake: Notify::new(),
            tasks: Mutex::new(Vec::new()),
            next_request: AtomicU64::new(0),
        });

        let assembler = tokio::spawn(Arc::clone(&queue).assemble());
        let dispatcher = tokio::spawn(Arc::clone(&queue).dispatch());
        queue
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend([assembler, dispatcher]);

        info!(
            max_batch_size = queue.settings.max_batch_size,
            max_wait_ms = queue.settings.max_wait.as_millis() as u64,
            max_queue_depth = queue.settings.max_queue_depth,
            slots = queue.pool.size(),
            "batching queue started"
        );
        queue
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Submit one request and wait for its prediction.
    ///
    /// `deadline` tightens the configured request timeout; it never
    /// extends it.
    pub async fn submit(
        &self,
        payload: Payload,
        deadline: Option<Instant>,
    ) -> Result<Prediction, ServeError> {
        let n = self.next_request.fetch_add(1, Ordering::Relaxed);
        let request = Request::new(format!("req-{n}"), payload, self.model.identity());
        let timeout_at = deadline_after(request.arrival, self.settings.request_timeout);
        let request = request.with_deadline(deadline.map_or(timeout_at, |d| d.min(timeout_at)));

        let arrival = request.arrival;
        let outcome = self.admit_and_wait(request).await;
        match &outcome {
            Ok(served) => {
                self.metrics
                    .record_completion(arrival.elapsed(), served.batch_size, served.cache_hit)
            }
            Err(e) => self.metrics.record_error(e.code()),
        }
        outcome.map(|served| served.prediction)
    }

    async fn admit_and_wait(&self, request: Request) -> Delivery {
        if request.payload.is_empty() {
            return Err(ServeError::InvalidInput("inputs must not be empty".to_string()));
        }
        if request.is_expired(Instant::now()) {
            self.state().counters.requests_expired += 1;
            debug!(request = %request.id, "request expired before admission");
            return Err(ServeError::DeadlineExceeded);
        }

        let Request {
            id: request_id,
            payload,
            arrival,
            deadline,
            fingerprint,
        } = request;
        let deadline =
            deadline.unwrap_or_else(|| deadline_after(arrival, self.settings.request_timeout));

        let ticket = self.admit(fingerprint, payload, arrival)?;
        let Ticket { id, rx, .. } = match ticket {
            Admitted::Hit(prediction) => {
                return Ok(Served {
                    prediction,
                    batch_size: 0,
                    cache_hit: true,
                });
            }
            Admitted::Waiting(ticket) => ticket,
        };

        let _guard = WaiterGuard {
            queue: self,
            fingerprint,
            id,
        };
        match tokio::time::timeout_at(tokio::time::Instant::from_std(deadline), rx).await {
            Ok(Ok(delivery)) => delivery,
            // Sender dropped without a delivery: the queue was torn down.
            Ok(Err(_)) => Err(ServeError::ShuttingDown),
            Err(_) => {
                self.state().counters.requests_expired += 1;
                debug!(request = %request_id, fingerprint = ?fingerprint, "request deadline exceeded");
                Err(ServeError::DeadlineExceeded)
            }
        }
    }

    fn admit(
        &self,
        fingerprint: Fingerprint,
        payload: Payload,
        now: Instant,
    ) -> Result<Admitted, ServeError> {
        let mut state = self.state();
        if state.shutting_down {
            return Err(ServeError::ShuttingDown);
        }

        // Checked under the queue lock: a finishing batch caches its
        // results before it releases its fingerprints.
        if let Some(prediction) = self.cache.get(&fingerprint) {
            return Ok(Admitted::Hit(prediction));
        }

        if let Some(ticket) = state.attach(&fingerprint) {
            debug!(fingerprint = ?fingerprint, "request coalesced onto in-flight work");
            return Ok(Admitted::Waiting(ticket));
        }

        let ticket = state
            .enqueue(
                Item {
                    fingerprint,
                    payload,
                },
                now,
            )
            .inspect_err(|e| debug!(error = %e, "request rejected"))?;
        if ticket.opened {
            self.assembler_wake.notify_one();
        }
        if ticket.closed {
            debug!("batch closed at max size");
            self.dispatcher_wake.notify_one();
        }
        self.metrics.record_queue_depth(state.depth());
        Ok(Admitted::Waiting(ticket))
    }

    /// Close the open batch whenever it reaches `max_wait`.
    async fn assemble(self: Arc<Self>) {
        loop {
            let closes_at = {
                let state = self.state();
                if state.shutting_down {
                    break;
                }
                state.open_closes_at(self.settings.max_wait)
            };

            match closes_at {
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(tokio::time::Instant::from_std(at)) => {}
                        _ = self.assembler_wake.notified() => {}
                    }
                }
                None => self.assembler_wake.notified().await,
            }

            let closed = {
                let mut state = self.state();
                let due = state
                    .open_closes_at(self.settings.max_wait)
                    .is_some_and(|at| at <= Instant::now());
                due && state.close_open()
            };
            if closed {
                debug!("batch closed at max wait");
                self.dispatcher_wake.notify_one();
            }
        }
        debug!("batch assembler stopped");
    }

    /// Run ready batches on free slots until shut down and drained.
    async fn dispatch(self: Arc<Self>) {
        let mut running = JoinSet::new();
        loop {
            while running.try_join_next().is_some() {}

            let (has_ready, done) = {
                let state = self.state();
                (state.has_ready(), state.shutting_down && state.drained())
            };
            if done {
                break;
            }
            if !has_ready {
                self.dispatcher_wake.notified().await;
                continue;
            }

            let slot = match self.pool.acquire().await {
                Ok(slot) => slot,
                Err(e) => {
                    let failed = self.state().abort_all(ServeError::ShuttingDown);
                    warn!(error = %e, failed, "executor pool closed, queue aborted");
                    break;
                }
            };

            // Items may have been withdrawn while waiting for the slot.
            let batch = {
                let mut state = self.state();
                let batch = state.take_ready();
                self.metrics.record_queue_depth(state.depth());
                batch
            };
            let Some(batch) = batch else {
                self.pool.release(slot);
                continue;
            };
            self.metrics.update_slots(self.pool.busy());
            running.spawn(Arc::clone(&self).execute(slot, batch));
        }

        while running.join_next().await.is_some() {}
        debug!("batch dispatcher stopped");
    }

    async fn execute(self: Arc<Self>, slot: Slot, batch: Vec<Item>) {
        let size = batch.len();
        let started = Instant::now();
        debug!(slot = slot.index(), size, "executing batch");

        let (fingerprints, inputs): (Vec<Fingerprint>, Vec<Payload>) = batch
            .into_iter()
            .map(|item| (item.fingerprint, item.payload))
            .unzip();
        let results = slot.run(Arc::clone(&self.model), inputs).await;
        self.metrics.record_batch(size, started.elapsed());

        for (fingerprint, result) in fingerprints.iter().zip(&results) {
            if let Ok(prediction) = result {
                let weight = weigh(prediction, self.settings.weigher);
                self.cache.put(*fingerprint, prediction.clone(), weight);
            }
        }

        let senders: Vec<_> = {
            let mut state = self.state();
            fingerprints
                .iter()
                .zip(results)
                .map(|(fingerprint, result)| (state.finish(fingerprint), result))
                .collect()
        };
        for (waiters, result) in senders {
            let delivery = result.map(|prediction| Served {
                prediction,
                batch_size: size,
                cache_hit: false,
            });
            for tx in waiters {
                let _ = tx.send(delivery.clone());
            }
        }

        self.metrics.update_cache(&self.cache.stats());
        self.metrics.update_slots(self.pool.busy());
    }

    /// Stop admitting requests and drain everything already queued.
    ///
    /// Returns once every pending batch has executed and been delivered.
    pub async fn shutdown(&self) {
        {
            let mut state = self.state();
            if state.shutting_down {
                return;
            }
            state.shutting_down = true;
            state.close_open();
            info!(pending = state.depth(), "batching queue draining");
        }
        self.assembler_wake.notify_one();
        self.dispatcher_wake.notify_one();

        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "batching task failed during shutdown");
            }
        }
        self.metrics.record_queue_depth(0);
        info!("batching queue drained");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state().shutting_down
    }

    pub fn stats(&self) -> BatchStats {
        let state = self.state();
        BatchStats {
            batches_dispatched: state.counters.batches_dispatched,
            requests_coalesced: state.counters.requests_coalesced,
            requests_expired: state.counters.requests_expired,
            requests_rejected: state.counters.requests_rejected,
            queue_depth: state.depth(),
            in_flight: state.in_flight(),
        }
    }
}

enum Admitted {
    Hit(Prediction),
    Waiting(Ticket),
}
