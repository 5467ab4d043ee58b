//! # LOTGEN Runtime
//!
//! Turns footprint shapes into procedural models by driving an external
//! shape-grammar engine.
//!
//! ## Architecture
//!
//! ```text
//!   GenerationScheduler::submit(shape)
//!        │ validate, fingerprint
//!        ▼
//!   GenerationCache ── Hit/Joined ──> GenerationFuture
//!        │ Miss
//!        ▼
//!   job queue ──> worker ──> ProcEngineClient ──> EngineSession
//!                                  │                   │ callbacks
//!                                  │                   ▼
//!                                  │            CallbackDecoder
//!                                  ▼
//!                         Arc<GenerationResult> ──> every waiter
//! ```
//!
//! ## Design Principles
//!
//! 1. **One call per key** - Identical in-flight requests share one engine call
//! 2. **Bounded everything** - Fixed sessions, fixed workers, bounded queue, byte-capped cache
//! 3. **Fail before native work** - Bad shapes and mistyped overrides never reach the engine
//! 4. **No shared builders** - Each decoder belongs to exactly one call
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use lotgen_runtime::{ExtrudeEngine, GenerationScheduler, PackageRegistry, ProcEngineClient,
//!     RuntimeConfig, StaticPackageProvider};
//!
//! let provider = StaticPackageProvider::new()
//!     .with_package("simple_extrude", "Default$Lot", [("Default$height".into(), 5.0.into())]);
//! let client = ProcEngineClient::new(Arc::new(ExtrudeEngine::new()), Arc::new(PackageRegistry::new(provider)), 4)?;
//! let scheduler = GenerationScheduler::new(Arc::new(client), &RuntimeConfig::default())?;
//!
//! let result = scheduler.submit(&shape, 42, Default::default()).wait()?;
//! println!("{} faces", result.mesh().faces.len());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod cache;
pub mod client;
pub mod config;
pub mod decoder;
pub mod engine;
pub mod extrude;
pub mod future;
pub mod log;
pub mod package;
pub mod scheduler;

pub use cache::{CacheStats, GenerationCache, Lookup, PendingTicket, DEFAULT_CACHE_CAPACITY};
pub use client::{ClientStats, ProcEngineClient, SessionPool};
pub use config::{ConfigError, ConfigResult, OverloadMode, OverloadPolicy, RuntimeConfig};
pub use decoder::{CallbackDecoder, DecodeStats, MAX_UV_SETS};
pub use engine::{
    EncodedShape, EngineInput, EngineSession, GenerationCallbacks, InstanceEmission, MeshEmission, ProceduralEngine,
    RawMaterial, UvSet,
};
pub use extrude::ExtrudeEngine;
pub use future::{GenerationFuture, Outcome};
pub use log::{EngineLog, LogLevel, LogMessage, LogSummary};
pub use package::{
    ManifestAttribute, ManifestPackageProvider, PackageHandle, PackageManifest, PackageRegistry, RulePackageProvider,
    StaticPackageProvider,
};
pub use scheduler::{GenerationScheduler, SchedulerStats};
