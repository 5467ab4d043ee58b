//! # Engine Client
//!
//! Runs one request on one engine session and decodes the result.
//!
//! The engine is expensive to enter and sessions are not shareable, so the
//! client owns a fixed pool of them. A call checks a session out, drives it
//! with a fresh [`CallbackDecoder`], and hands the session back when the
//! call returns. A session whose call panicked is discarded and replaced
//! by a newly opened one.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crossbeam_channel::{bounded, Receiver, Sender};
use lotgen_core::{GenerationError, GenerationRequest, GenerationResult, LotgenResult};

use crate::decoder::CallbackDecoder;
use crate::engine::{EngineInput, EngineSession, ProceduralEngine};
use crate::log::EngineLog;
use crate::package::PackageRegistry;

/// Fixed pool of engine sessions.
pub struct SessionPool {
    tx: Sender<Box<dyn EngineSession>>,
    rx: Receiver<Box<dyn EngineSession>>,
    size: usize,
    replaced: AtomicU64,
}

impl SessionPool {
    /// Opens `size` sessions on `engine`.
    ///
    /// # Errors
    ///
    /// The first `open_session` failure.
    pub fn open(engine: &dyn ProceduralEngine, size: usize) -> LotgenResult<Self> {
        let size = size.max(1);
        let (tx, rx) = bounded(size);
        for _ in 0..size {
            let session = engine.open_session()?;
            // Capacity equals size, so this never blocks.
            let _ = tx.try_send(session);
        }
        tracing::info!(engine = engine.name(), sessions = size, "engine sessions opened");
        Ok(Self {
            tx,
            rx,
            size,
            replaced: AtomicU64::new(0),
        })
    }

    /// Number of sessions.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Sessions not checked out right now.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.rx.len()
    }

    /// Sessions reopened after a panicking call.
    #[must_use]
    pub fn replaced(&self) -> u64 {
        self.replaced.load(Ordering::Relaxed)
    }

    /// Blocks until a session is free. `engine` reopens it if the call panics.
    fn checkout<'a>(&'a self, engine: &'a dyn ProceduralEngine) -> LotgenResult<SessionGuard<'a>> {
        let session = self.rx.recv().map_err(|_| GenerationError::Shutdown)?;
        Ok(SessionGuard {
            session: Some(session),
            pool: self,
            engine,
        })
    }

    fn replace(&self, engine: &dyn ProceduralEngine) {
        match engine.open_session() {
            Ok(session) => {
                self.replaced.fetch_add(1, Ordering::Relaxed);
                let _ = self.tx.try_send(session);
                tracing::warn!(engine = engine.name(), "engine session replaced after panic");
            }
            Err(e) => tracing::error!(engine = engine.name(), error = %e, "engine session lost after panic"),
        }
    }
}

impl std::fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPool")
            .field("size", &self.size)
            .field("idle", &self.idle())
            .field("replaced", &self.replaced())
            .finish()
    }
}

/// Checked-out session, returned to the pool on drop.
struct SessionGuard<'a> {
    session: Option<Box<dyn EngineSession>>,
    pool: &'a SessionPool,
    engine: &'a dyn ProceduralEngine,
}

impl SessionGuard<'_> {
    fn session(&mut self) -> LotgenResult<&mut (dyn EngineSession + 'static)> {
        self.session.as_deref_mut().ok_or(GenerationError::Shutdown)
    }
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if std::thread::panicking() {
            // Never reuse a session that panicked mid-call.
            drop(session);
            self.pool.replace(self.engine);
        } else {
            let _ = self.pool.tx.try_send(session);
        }
    }
}

/// In-flight call marker. Decrements on drop, also when the engine panics.
struct ActiveCall<'a> {
    counter: &'a AtomicUsize,
    count: usize,
}

impl<'a> ActiveCall<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        let count = counter.fetch_add(1, Ordering::AcqRel) + 1;
        Self { counter, count }
    }
}

impl Drop for ActiveCall<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Counters of the client.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Engine `generate` calls made.
    pub native_calls: u64,
    /// Calls that failed.
    pub failures: u64,
    /// Calls running right now.
    pub active: usize,
    /// Highest number of calls ever running at once.
    pub peak_active: usize,
    /// Sessions reopened after a panicking call.
    pub sessions_replaced: u64,
}

/// Synchronous engine client.
pub struct ProcEngineClient {
    engine: Arc<dyn ProceduralEngine>,
    packages: Arc<PackageRegistry>,
    sessions: SessionPool,
    log: Option<Arc<EngineLog>>,
    native_calls: AtomicU64,
    failures: AtomicU64,
    active: AtomicUsize,
    peak_active: AtomicUsize,
}

impl ProcEngineClient {
    /// Creates a client with `sessions` engine sessions.
    ///
    /// # Errors
    ///
    /// `Engine` if a session cannot be opened.
    pub fn new(engine: Arc<dyn ProceduralEngine>, packages: Arc<PackageRegistry>, sessions: usize) -> LotgenResult<Self> {
        let pool = SessionPool::open(engine.as_ref(), sessions)?;
        Ok(Self {
            engine,
            packages,
            sessions: pool,
            log: None,
            native_calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            active: AtomicUsize::new(0),
            peak_active: AtomicUsize::new(0),
        })
    }

    /// Routes engine log lines into `log`.
    #[must_use]
    pub fn with_log(mut self, log: Arc<EngineLog>) -> Self {
        self.log = Some(log);
        self
    }

    /// The package registry.
    #[must_use]
    pub fn packages(&self) -> &Arc<PackageRegistry> {
        &self.packages
    }

    /// Number of engine sessions.
    #[must_use]
    pub const fn session_count(&self) -> usize {
        self.sessions.size()
    }

    /// Engine log, if one is attached.
    #[must_use]
    pub fn log(&self) -> Option<&Arc<EngineLog>> {
        self.log.as_ref()
    }

    /// Runs `request` synchronously on the calling thread.
    ///
    /// Blocks while every session is busy.
    ///
    /// # Errors
    ///
    /// - `InvalidShape` if the shape fails validation
    /// - `RuleLoad` if the package or its start rule cannot be loaded
    /// - `AttributeTypeMismatch` if an override does not match its declaration
    /// - `Engine` if the engine call fails or breaks the emission protocol
    pub fn generate(&self, request: &GenerationRequest) -> LotgenResult<GenerationResult> {
        request.validate()?;
        let shape = request.shape();
        let package = self.packages.load(&shape.package)?;
        let defaults = self.packages.default_attributes(&package, &shape.start_rule)?;
        shape.attributes.check_against(&defaults)?;

        let input = EngineInput::new(request, package);
        let mut decoder = CallbackDecoder::new(request.options());
        if let Some(log) = &self.log {
            decoder = decoder.with_log(Arc::clone(log));
        }

        let mut guard = self.sessions.checkout(self.engine.as_ref())?;
        let started = Instant::now();
        let active = ActiveCall::enter(&self.active);
        self.peak_active.fetch_max(active.count, Ordering::AcqRel);
        self.native_calls.fetch_add(1, Ordering::Relaxed);

        let call = guard.session().and_then(|session| session.generate(&input, &mut decoder));

        drop(active);
        drop(guard);

        let outcome = match call {
            Ok(()) => decoder.finish(),
            Err(GenerationError::Engine { diagnostic }) => Err(GenerationError::Engine {
                diagnostic: with_shape_errors(diagnostic, decoder.generate_errors()),
            }),
            Err(other) => Err(other),
        };

        match &outcome {
            Ok(result) => tracing::debug!(
                fingerprint = %request.fingerprint(),
                package = %shape.package,
                faces = result.mesh().faces.len(),
                materials = result.materials().len(),
                elapsed_us = started.elapsed().as_micros() as u64,
                "generated"
            ),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    fingerprint = %request.fingerprint(),
                    package = %shape.package,
                    error = %e,
                    "generation failed"
                );
            }
        }
        outcome
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> ClientStats {
        ClientStats {
            native_calls: self.native_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Acquire),
            peak_active: self.peak_active.load(Ordering::Acquire),
            sessions_replaced: self.sessions.replaced(),
        }
    }
}

impl std::fmt::Debug for ProcEngineClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcEngineClient")
            .field("engine", &self.engine.name())
            .field("sessions", &self.sessions)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

fn with_shape_errors(diagnostic: String, shape_errors: &[String]) -> String {
    if shape_errors.is_empty() {
        diagnostic
    } else {
        format!("{diagnostic} ({})", shape_errors.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{GenerationCallbacks, MeshEmission};
    use crate::package::StaticPackageProvider;
    use lotgen_core::{AttributeValue, GenerationOptions, InitialShape, Ring};

    struct Triangle;

    impl EngineSession for Triangle {
        fn generate(&mut self, input: &EngineInput, sink: &mut dyn GenerationCallbacks) -> LotgenResult<()> {
            assert_ne!(input.seed, 66, "session state corrupted");
            if input.seed == 13 {
                sink.generate_error(0, "unlucky");
                return Err(GenerationError::Engine {
                    diagnostic: "call failed".into(),
                });
            }
            sink.add_mesh(MeshEmission {
                node: 0,
                vertices: input.shape.coords.clone(),
                face_counts: input.shape.face_counts.clone(),
                vertex_indices: input.shape.indices.clone(),
                ..MeshEmission::default()
            });
            Ok(())
        }
    }

    impl ProceduralEngine for Triangle {
        fn open_session(&self) -> LotgenResult<Box<dyn EngineSession>> {
            Ok(Box::new(Triangle))
        }
    }

    fn client() -> ProcEngineClient {
        let provider = StaticPackageProvider::new().with_package(
            "lot",
            "Default$Lot",
            [("Default$height".to_owned(), AttributeValue::Float(5.0))],
        );
        ProcEngineClient::new(Arc::new(Triangle), Arc::new(PackageRegistry::new(provider)), 2).unwrap()
    }

    fn shape() -> InitialShape {
        InitialShape::new(
            Ring::new([[0.0, 0.0, 0.0], [10.0, 0.0, 0.0], [0.0, 10.0, 0.0]]),
            "lot",
            "Default$Lot",
        )
    }

    #[test]
    fn test_generate_returns_session() {
        let client = client();
        let request = GenerationRequest::new(&shape(), 1, GenerationOptions::default());
        let result = client.generate(&request).unwrap();
        assert_eq!(result.mesh().faces.len(), 1);
        assert_eq!(client.sessions.idle(), 2);
        assert_eq!(client.stats().native_calls, 1);
        assert_eq!(client.stats().peak_active, 1);
    }

    #[test]
    fn test_engine_failure_carries_shape_errors() {
        let client = client();
        let request = GenerationRequest::new(&shape(), 13, GenerationOptions::default());
        let GenerationError::Engine { diagnostic } = client.generate(&request).unwrap_err() else {
            panic!("expected engine error");
        };
        assert!(diagnostic.contains("unlucky"));
        assert_eq!(client.sessions.idle(), 2);
        assert_eq!(client.stats().failures, 1);
    }

    #[test]
    fn test_type_mismatch_never_calls_engine() {
        let client = client();
        let mut bad = shape();
        bad.attributes.set_override("Default$height", "tall").unwrap();
        let request = GenerationRequest::new(&bad, 1, GenerationOptions::default());
        assert!(matches!(
            client.generate(&request),
            Err(GenerationError::AttributeTypeMismatch { .. })
        ));
        assert_eq!(client.stats().native_calls, 0);
    }

    #[test]
    fn test_short_name_override_is_type_checked() {
        let client = client();
        let mut bad = shape();
        bad.attributes.set_override("height", "tall").unwrap();
        let request = GenerationRequest::new(&bad, 1, GenerationOptions::default());
        assert_eq!(
            client.generate(&request).unwrap_err(),
            GenerationError::AttributeTypeMismatch {
                name: "height".into(),
                expected: lotgen_core::AttributeType::Float,
                found: lotgen_core::AttributeType::String,
            }
        );
        assert_eq!(client.stats().native_calls, 0);
    }

    #[test]
    fn test_panicked_session_is_replaced() {
        let client = client();
        let request = GenerationRequest::new(&shape(), 66, GenerationOptions::default());
        let caught = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| client.generate(&request)));
        assert!(caught.is_err());

        let stats = client.stats();
        assert_eq!(stats.sessions_replaced, 1);
        assert_eq!(stats.active, 0);
        assert_eq!(client.sessions.idle(), 2);

        let request = GenerationRequest::new(&shape(), 1, GenerationOptions::default());
        assert!(client.generate(&request).is_ok());
    }
}
