//! # Generation Scheduler
//!
//! Asynchronous front door of the runtime.
//!
//! ## Architecture
//!
//! ```text
//!   submit() ──> validate ──> GenerationCache::lookup
//!                                 │ Hit / Joined: return future
//!                                 │ Miss
//!                                 ▼
//!                        [bounded job queue] ──> worker 1..N ──> ProcEngineClient
//!                                                     │
//!                                                     └──> cache.complete(ticket)
//! ```
//!
//! `submit` never blocks unless the overload policy is `Block`. Workers are
//! capped by the number of engine sessions, so a worker never waits for a
//! session.
//!
//! ## Shutdown
//!
//! Dropping the scheduler closes the queue. Workers finish the job they are
//! running; queued jobs resolve with `Shutdown` without reaching the engine.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use lotgen_core::{
    AttributeValue, GenerationError, GenerationOptions, GenerationRequest, InitialShape, LotgenResult, PackageId,
};

use crate::cache::{CacheStats, GenerationCache, PendingTicket};
use crate::client::{ClientStats, ProcEngineClient};
use crate::config::{ConfigError, ConfigResult, OverloadPolicy, RuntimeConfig};
use crate::future::{GenerationFuture, Outcome};

/// A queued cache miss.
struct Job {
    request: GenerationRequest,
    ticket: PendingTicket,
}

/// State shared with the workers.
struct Shared {
    client: Arc<ProcEngineClient>,
    cache: GenerationCache,
    shutdown: AtomicBool,
    submitted: AtomicU64,
    rejected: AtomicU64,
    abandoned: AtomicU64,
}

/// Scheduler counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests submitted.
    pub submitted: u64,
    /// Requests resolved with `Overloaded`.
    pub rejected: u64,
    /// Queued jobs dropped because every handle cancelled.
    pub abandoned: u64,
    /// Jobs waiting for a worker.
    pub queued: usize,
    /// Worker threads.
    pub workers: usize,
    /// Cache counters.
    pub cache: CacheStats,
    /// Engine client counters.
    pub client: ClientStats,
}

/// Worker pool in front of the engine client and the cache.
pub struct GenerationScheduler {
    shared: Arc<Shared>,
    tx: Option<Sender<Job>>,
    queue: Receiver<Job>,
    workers: Vec<JoinHandle<()>>,
    policy: OverloadPolicy,
    default_deadline: Option<Duration>,
}

impl GenerationScheduler {
    /// Starts the workers.
    ///
    /// # Errors
    ///
    /// `Invalid` for a bad config, `Spawn` if a thread cannot start.
    pub fn new(client: Arc<ProcEngineClient>, config: &RuntimeConfig) -> ConfigResult<Self> {
        config.validate()?;
        let worker_count = config.workers.min(client.session_count());
        let (tx, rx) = bounded::<Job>(config.queue_capacity);

        let shared = Arc::new(Shared {
            client,
            cache: GenerationCache::new(config.cache_capacity_bytes),
            shutdown: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        });

        let mut scheduler = Self {
            shared,
            tx: Some(tx),
            queue: rx,
            workers: Vec::with_capacity(worker_count),
            policy: config.overload_policy(),
            default_deadline: config.default_deadline(),
        };
        for index in 0..worker_count {
            let shared = Arc::clone(&scheduler.shared);
            let rx = scheduler.queue.clone();
            let handle = thread::Builder::new()
                .name(format!("lotgen-worker-{index}"))
                .spawn(move || worker_loop(&shared, &rx))
                .map_err(ConfigError::Spawn)?;
            scheduler.workers.push(handle);
        }

        tracing::info!(
            workers = worker_count,
            queue_capacity = config.queue_capacity,
            cache_capacity_bytes = config.cache_capacity_bytes,
            "generation scheduler started"
        );
        Ok(scheduler)
    }

    /// Submits a shape for generation.
    ///
    /// The shape is copied; later edits do not affect this request.
    pub fn submit(&self, shape: &InitialShape, seed: u64, options: GenerationOptions) -> GenerationFuture {
        self.submit_request(GenerationRequest::new(shape, seed, options))
    }

    /// Submits a prepared request.
    ///
    /// Invalid shapes, unloadable packages and mistyped overrides resolve
    /// the returned future immediately, without queueing. Identical in-flight requests share one computation.
    pub fn submit_request(&self, request: GenerationRequest) -> GenerationFuture {
        self.shared.submitted.fetch_add(1, Ordering::Relaxed);
        let Some(tx) = self.tx.as_ref().filter(|_| !self.shared.shutdown.load(Ordering::Acquire)) else {
            return GenerationFuture::failed(GenerationError::Shutdown);
        };
        if let Err(e) = self.precheck(&request) {
            tracing::debug!(fingerprint = %request.fingerprint(), error = %e, "request rejected before queueing");
            return GenerationFuture::failed(e);
        }

        let request = match (request.deadline(), self.default_deadline) {
            (None, Some(deadline)) => request.with_deadline(deadline),
            _ => request,
        };
        self.shared.cache.get_or_compute(&request, |ticket| {
            self.enqueue(
                tx,
                Job {
                    request: request.clone(),
                    ticket,
                },
            );
        })
    }

    /// Submits and waits.
    ///
    /// # Errors
    ///
    /// Whatever the future resolves with.
    pub fn generate_blocking(&self, shape: &InitialShape, seed: u64, options: GenerationOptions) -> Outcome {
        self.submit(shape, seed, options).wait()
    }

    /// Evaluates the rule's attributes without producing geometry.
    ///
    /// # Errors
    ///
    /// As [`Self::generate_blocking`].
    pub fn evaluate_attributes(&self, shape: &InitialShape, seed: u64) -> LotgenResult<Vec<(String, AttributeValue)>> {
        let result = self.generate_blocking(shape, seed, GenerationOptions::attributes_only())?;
        Ok(result.evaluated_attributes().to_vec())
    }

    /// Marks every cached result of `package` stale and forgets the loaded
    /// package, so the next request reloads it.
    ///
    /// Returns the new package generation.
    pub fn invalidate_rule_package(&self, package: &PackageId) -> u64 {
        let generation = self.shared.cache.invalidate(package);
        self.shared.client.packages().evict(package);
        tracing::info!(%package, generation, "rule package invalidated");
        generation
    }

    /// The cache.
    #[must_use]
    pub fn cache(&self) -> &GenerationCache {
        &self.shared.cache
    }

    /// The engine client.
    #[must_use]
    pub fn client(&self) -> &Arc<ProcEngineClient> {
        &self.shared.client
    }

    /// Snapshot of every counter.
    #[must_use]
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            submitted: self.shared.submitted.load(Ordering::Relaxed),
            rejected: self.shared.rejected.load(Ordering::Relaxed),
            abandoned: self.shared.abandoned.load(Ordering::Relaxed),
            queued: self.queue.len(),
            workers: self.workers.len(),
            cache: self.shared.cache.stats(),
            client: self.shared.client.stats(),
        }
    }

    /// Stops accepting work, resolves queued jobs with `Shutdown` and
    /// joins the workers. Called on drop.
    pub fn shutdown(&mut self) {
        if self.shared.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.tx = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
        tracing::info!("generation scheduler stopped");
    }

    /// Everything that can fail before the engine: shape validation,
    /// package load and override types.
    ///
    /// Runs on the submitting thread. The first submit for a package pays
    /// for its load; later ones hit the registry cache.
    fn precheck(&self, request: &GenerationRequest) -> LotgenResult<()> {
        request.validate()?;
        let shape = request.shape();
        let packages = self.shared.client.packages();
        let defaults = match packages.peek_defaults(&shape.package, &shape.start_rule) {
            Some(defaults) => defaults,
            None => {
                let package = packages.load(&shape.package)?;
                packages.default_attributes(&package, &shape.start_rule)?
            }
        };
        shape.attributes.check_against(&defaults)
    }

    fn enqueue(&self, tx: &Sender<Job>, job: Job) {
        let sent = match self.policy {
            OverloadPolicy::FailFast => tx.try_send(job).map_err(|e| e.into_inner()),
            OverloadPolicy::Block { timeout } => tx.send_timeout(job, timeout).map_err(|e| e.into_inner()),
        };
        if let Err(job) = sent {
            self.shared.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(fingerprint = %job.request.fingerprint(), "job queue full");
            self.shared.cache.complete(job.ticket, Err(GenerationError::Overloaded));
        }
    }
}

impl Drop for GenerationScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for GenerationScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationScheduler")
            .field("workers", &self.workers.len())
            .field("policy", &self.policy)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Worker main loop. Exits when the queue is closed and empty.
fn worker_loop(shared: &Shared, rx: &Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        let ticket = match shared.cache.abandon_if_unwatched(job.ticket) {
            Ok(()) => {
                shared.abandoned.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(fingerprint = %job.request.fingerprint(), "job dropped, no one waiting");
                continue;
            }
            Err(ticket) => ticket,
        };

        if shared.shutdown.load(Ordering::Acquire) {
            shared.cache.complete(ticket, Err(GenerationError::Shutdown));
            continue;
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.client.generate(&job.request)))
            .unwrap_or_else(|_| {
                tracing::error!(fingerprint = %job.request.fingerprint(), "engine panicked");
                Err(GenerationError::Engine {
                    diagnostic: "engine panicked".into(),
                })
            })
            .map(Arc::new);
        shared.cache.complete(ticket, outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineInput, EngineSession, GenerationCallbacks, ProceduralEngine};
    use crate::package::{PackageRegistry, StaticPackageProvider};
    use lotgen_core::Ring;

    struct Noop;

    impl EngineSession for Noop {
        fn generate(&mut self, input: &EngineInput, sink: &mut dyn GenerationCallbacks) -> LotgenResult<()> {
            if input.seed == 666 {
                panic!("boom");
            }
            sink.report_float(0, "seed", input.seed as f64);
            Ok(())
        }
    }

    impl ProceduralEngine for Noop {
        fn open_session(&self) -> LotgenResult<Box<dyn EngineSession>> {
            Ok(Box::new(Noop))
        }
    }

    fn scheduler(workers: usize) -> GenerationScheduler {
        let provider = StaticPackageProvider::new().with_package("lot", "Default$Lot", []);
        let client = ProcEngineClient::new(Arc::new(Noop), Arc::new(PackageRegistry::new(provider)), 2).unwrap();
        let config = RuntimeConfig {
            workers,
            ..RuntimeConfig::default()
        };
        GenerationScheduler::new(Arc::new(client), &config).unwrap()
    }

    fn shape() -> InitialShape {
        InitialShape::new(
            Ring::new([[0.0, 0.0, 0.0], [4.0, 0.0, 0.0], [4.0, 4.0, 0.0]]),
            "lot",
            "Default$Lot",
        )
    }

    #[test]
    fn test_workers_capped_by_sessions() {
        assert_eq!(scheduler(8).stats().workers, 2);
    }

    #[test]
    fn test_generate_and_hit() {
        let s = scheduler(2);
        let first = s.generate_blocking(&shape(), 7, GenerationOptions::default()).unwrap();
        let second = s.generate_blocking(&shape(), 7, GenerationOptions::default()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(s.stats().cache.hits, 1);
        assert_eq!(s.stats().client.native_calls, 1);
    }

    #[test]
    fn test_panicking_engine_resolves_future() {
        let s = scheduler(1);
        let err = s.generate_blocking(&shape(), 666, GenerationOptions::default()).unwrap_err();
        assert!(matches!(err, GenerationError::Engine { .. }));
        assert_eq!(s.stats().client.sessions_replaced, 1);
        // The worker survives.
        assert!(s.generate_blocking(&shape(), 1, GenerationOptions::default()).is_ok());
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut s = scheduler(1);
        s.shutdown();
        let f = s.submit(&shape(), 1, GenerationOptions::default());
        assert_eq!(f.wait().unwrap_err(), GenerationError::Shutdown);
    }
}
