//! # Generation Requests
//!
//! A request is an immutable snapshot: the shape is deep-copied when the
//! request is built, so later edits by the caller never reach a worker.
//!
//! The [`Fingerprint`] is the cache key and the dedup key. It is SipHash-1-3
//! (128 bit) with a fixed key, so it is stable across processes and runs.

use std::fmt;
use std::hash::Hasher;
use std::time::Duration;

use siphasher::sip128::{Hasher128, SipHasher13};

use crate::error::LotgenResult;
use crate::shape::{InitialShape, PackageId};

/// Fixed SipHash key. Changing it invalidates every stored fingerprint.
const FINGERPRINT_KEY: (u64, u64) = (0x6c6f_7467_656e_5f66, 0x7072_696e_745f_7631);

/// Which report entries the decoder keeps.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum ReportVerbosity {
    /// Keep nothing.
    Silent = 0,
    /// Keep `report()` values only.
    #[default]
    Values = 1,
    /// Keep values plus CGA/asset diagnostics.
    Diagnostics = 2,
    /// Keep everything, including `print()` output.
    All = 3,
}

/// What the engine should produce.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OutputMode {
    /// Full geometry, materials, instances and reports.
    #[default]
    Geometry = 0,
    /// Evaluate attributes only, no geometry.
    AttributesOnly = 1,
}

/// Per-request knobs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct GenerationOptions {
    /// Level-of-detail bias passed to the rule.
    pub lod_bias: i32,
    /// Report filter.
    pub report_verbosity: ReportVerbosity,
    /// Geometry or attribute evaluation.
    pub output: OutputMode,
}

impl GenerationOptions {
    /// Options for attribute evaluation.
    #[must_use]
    pub const fn attributes_only() -> Self {
        Self {
            lod_bias: 0,
            report_verbosity: ReportVerbosity::Silent,
            output: OutputMode::AttributesOnly,
        }
    }
}

/// 128-bit request fingerprint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub u128);

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Immutable input of one generation.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    shape: InitialShape,
    seed: u64,
    options: GenerationOptions,
    deadline: Option<Duration>,
    fingerprint: Fingerprint,
}

impl GenerationRequest {
    /// Snapshots `shape` into a new request.
    #[must_use]
    pub fn new(shape: &InitialShape, seed: u64, options: GenerationOptions) -> Self {
        let shape = shape.clone();
        let fingerprint = compute_fingerprint(&shape, seed, options);
        Self {
            shape,
            seed,
            options,
            deadline: None,
            fingerprint,
        }
    }

    /// Sets a deadline relative to submission. Not part of the fingerprint.
    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// The shape snapshot.
    #[must_use]
    pub fn shape(&self) -> &InitialShape {
        &self.shape
    }

    /// Rule package of the shape.
    #[must_use]
    pub fn package(&self) -> &PackageId {
        &self.shape.package
    }

    /// Random seed.
    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    /// Options.
    #[must_use]
    pub const fn options(&self) -> GenerationOptions {
        self.options
    }

    /// Optional deadline.
    #[must_use]
    pub const fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    /// Cache and dedup key.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Runs shape validation. Same as `shape().validate()`.
    ///
    /// # Errors
    ///
    /// `InvalidShape` for bad geometry.
    pub fn validate(&self) -> LotgenResult<()> {
        self.shape.validate()
    }
}

fn compute_fingerprint(shape: &InitialShape, seed: u64, options: GenerationOptions) -> Fingerprint {
    let mut hasher = SipHasher13::new_with_keys(FINGERPRINT_KEY.0, FINGERPRINT_KEY.1);
    shape.fingerprint_into(&mut hasher);
    hasher.write_u64(seed);
    hasher.write_i32(options.lod_bias);
    hasher.write_u8(options.report_verbosity as u8);
    hasher.write_u8(options.output as u8);
    Fingerprint(hasher.finish128().as_u128())
}
