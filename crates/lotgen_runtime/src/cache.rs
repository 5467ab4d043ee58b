//! # Generation Cache
//!
//! Fingerprint → result map with single-flight computation.
//!
//! ## Entry Lifecycle
//!
//! ```text
//!   lookup (miss) ──> Pending(slot) ──complete(Ok)──> Ready(Arc<result>)
//!                          │
//!                          └──complete(Err) / abandon──> removed
//! ```
//!
//! Every entry is tagged with the generation counter of its rule package.
//! `invalidate` bumps the counter; entries with an older tag are stale and
//! are dropped the next time they are looked up (or by `sweep`). Stale
//! pending work still resolves its own waiters but is never inserted.
//!
//! All bookkeeping happens under one mutex, so "is anyone computing this
//! fingerprint?" and "then I will" are a single atomic step.

use std::collections::HashMap;
use std::sync::Arc;

use lotgen_core::{Fingerprint, GenerationError, GenerationRequest, GenerationResult, PackageId};
use parking_lot::Mutex;

use crate::future::{GenerationFuture, Outcome, OutcomeSlot};

/// Default capacity: 256 MiB of results.
pub const DEFAULT_CACHE_CAPACITY: usize = 256 * 1024 * 1024;

enum Slot {
    Ready(Arc<GenerationResult>),
    Pending(Arc<OutcomeSlot>),
}

struct Entry {
    slot: Slot,
    package: PackageId,
    generation: u64,
    last_used: u64,
    bytes: usize,
}

/// Cache statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from a ready entry.
    pub hits: u64,
    /// Lookups that joined an in-flight computation.
    pub joins: u64,
    /// Lookups that started a computation.
    pub misses: u64,
    /// Results inserted.
    pub insertions: u64,
    /// Entries evicted for capacity.
    pub evictions: u64,
    /// Stale entries dropped after invalidation.
    pub stale_dropped: u64,
    /// Package invalidations.
    pub invalidations: u64,
    /// Ready entries currently held.
    pub ready_entries: usize,
    /// Pending entries currently held.
    pub pending_entries: usize,
    /// Bytes currently held.
    pub used_bytes: usize,
    /// Configured capacity.
    pub capacity_bytes: usize,
}

/// The right to complete one pending computation.
///
/// Handed out exactly once per miss. Whoever holds it must eventually call
/// [`GenerationCache::complete`] or [`GenerationCache::abandon_if_unwatched`].
#[must_use = "a pending ticket must be completed or its waiters hang"]
pub struct PendingTicket {
    fingerprint: Fingerprint,
    package: PackageId,
    generation: u64,
    slot: Arc<OutcomeSlot>,
}

impl PendingTicket {
    /// Fingerprint being computed.
    #[must_use]
    pub const fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Package generation the computation belongs to.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Number of handles still waiting.
    #[must_use]
    pub fn interested(&self) -> usize {
        self.slot.interested()
    }
}

impl std::fmt::Debug for PendingTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingTicket")
            .field("fingerprint", &self.fingerprint)
            .field("package", &self.package)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Result of [`GenerationCache::lookup`].
#[derive(Debug)]
pub enum Lookup {
    /// A ready result.
    Hit(GenerationFuture),
    /// Joined a computation someone else started.
    Joined(GenerationFuture),
    /// Nobody is computing this; the caller must.
    Miss(PendingTicket, GenerationFuture),
}

struct Inner {
    entries: HashMap<Fingerprint, Entry>,
    generations: HashMap<PackageId, u64>,
    used_bytes: usize,
    tick: u64,
    stats: CacheStats,
}

impl Inner {
    fn generation_of(&self, package: &PackageId) -> u64 {
        self.generations.get(package).copied().unwrap_or(0)
    }

    fn remove(&mut self, fingerprint: &Fingerprint) -> Option<Entry> {
        let entry = self.entries.remove(fingerprint)?;
        self.used_bytes -= entry.bytes;
        Some(entry)
    }

    fn evict_to(&mut self, capacity: usize) {
        while self.used_bytes > capacity {
            let victim = self
                .entries
                .iter()
                .filter(|(_, e)| matches!(e.slot, Slot::Ready(_)))
                .min_by_key(|(_, e)| e.last_used)
                .map(|(fp, _)| *fp);
            let Some(fingerprint) = victim else { break };
            self.remove(&fingerprint);
            self.stats.evictions += 1;
        }
    }
}

/// Thread-safe generation cache.
pub struct GenerationCache {
    inner: Mutex<Inner>,
    capacity_bytes: usize,
}

impl GenerationCache {
    /// Creates a cache holding at most `capacity_bytes` of results.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                generations: HashMap::new(),
                used_bytes: 0,
                tick: 0,
                stats: CacheStats::default(),
            }),
            capacity_bytes,
        }
    }

    /// Finds or registers the computation for `request`.
    ///
    /// Exactly one concurrent caller per fingerprint (and package
    /// generation) gets `Miss`; everyone else gets `Joined` until the
    /// result is in, then `Hit`.
    pub fn lookup(&self, request: &GenerationRequest) -> Lookup {
        let fingerprint = request.fingerprint();
        let deadline = request.deadline();
        let mut inner = self.inner.lock();
        inner.tick += 1;
        let tick = inner.tick;
        let current = inner.generation_of(request.package());

        let stale = inner
            .entries
            .get(&fingerprint)
            .is_some_and(|e| e.generation != current);
        if stale {
            inner.remove(&fingerprint);
            inner.stats.stale_dropped += 1;
        }

        if let Some(entry) = inner.entries.get_mut(&fingerprint) {
            entry.last_used = tick;
            let lookup = match &entry.slot {
                Slot::Ready(result) => Lookup::Hit(GenerationFuture::resolved(Ok(Arc::clone(result)))),
                Slot::Pending(slot) => Lookup::Joined(slot.subscribe(deadline)),
            };
            match lookup {
                Lookup::Hit(_) => inner.stats.hits += 1,
                _ => inner.stats.joins += 1,
            }
            return lookup;
        }

        let slot = OutcomeSlot::new();
        let future = slot.subscribe(deadline);
        inner.entries.insert(
            fingerprint,
            Entry {
                slot: Slot::Pending(Arc::clone(&slot)),
                package: request.package().clone(),
                generation: current,
                last_used: tick,
                bytes: 0,
            },
        );
        inner.stats.misses += 1;

        let ticket = PendingTicket {
            fingerprint,
            package: request.package().clone(),
            generation: current,
            slot,
        };
        Lookup::Miss(ticket, future)
    }

    /// Looks up `request`, calling `start` with the ticket on a miss.
    pub fn get_or_compute<F>(&self, request: &GenerationRequest, start: F) -> GenerationFuture
    where
        F: FnOnce(PendingTicket),
    {
        match self.lookup(request) {
            Lookup::Hit(future) | Lookup::Joined(future) => future,
            Lookup::Miss(ticket, future) => {
                start(ticket);
                future
            }
        }
    }

    /// Delivers the outcome of a computation to its waiters.
    ///
    /// Successful results are inserted if the ticket's package generation
    /// is still current and the result fits. Errors are never cached.
    pub fn complete(&self, ticket: PendingTicket, outcome: Outcome) {
        {
            let mut inner = self.inner.lock();
            let ours = inner.entries.get(&ticket.fingerprint).is_some_and(|e| match &e.slot {
                Slot::Pending(slot) => Arc::ptr_eq(slot, &ticket.slot),
                Slot::Ready(_) => false,
            });
            if ours {
                let entry = inner.remove(&ticket.fingerprint);
                let current = inner.generation_of(&ticket.package);

                match (&outcome, entry) {
                    (Ok(result), Some(mut entry))
                        if ticket.generation == current && result.byte_size() <= self.capacity_bytes =>
                    {
                        let bytes = result.byte_size();
                        entry.slot = Slot::Ready(Arc::clone(result));
                        entry.bytes = bytes;
                        inner.used_bytes += bytes;
                        inner.entries.insert(ticket.fingerprint, entry);
                        inner.stats.insertions += 1;
                        inner.evict_to(self.capacity_bytes);
                    }
                    (Ok(result), _) if result.byte_size() > self.capacity_bytes => {
                        tracing::debug!(
                            fingerprint = %ticket.fingerprint,
                            bytes = result.byte_size(),
                            "result larger than cache capacity, not cached"
                        );
                    }
                    _ => {}
                }
            } else {
                tracing::trace!(
                    fingerprint = %ticket.fingerprint,
                    "completing computation no longer registered in the cache"
                );
            }
        }
        ticket.slot.complete(outcome);
    }

    /// Drops a pending computation if every handle has cancelled.
    ///
    /// Returns the ticket back if someone is still waiting. Checked under
    /// the cache lock, so a concurrent `lookup` either joins before the
    /// check (and keeps the job alive) or starts a fresh computation.
    ///
    /// # Errors
    ///
    /// Gives the ticket back when the computation is still wanted.
    pub fn abandon_if_unwatched(&self, ticket: PendingTicket) -> Result<(), PendingTicket> {
        {
            let mut inner = self.inner.lock();
            if ticket.slot.interested() > 0 {
                return Err(ticket);
            }
            let ours = inner.entries.get(&ticket.fingerprint).is_some_and(|e| match &e.slot {
                Slot::Pending(slot) => Arc::ptr_eq(slot, &ticket.slot),
                Slot::Ready(_) => false,
            });
            if ours {
                inner.remove(&ticket.fingerprint);
            }
        }
        ticket.slot.complete(Err(GenerationError::Cancelled));
        Ok(())
    }

    /// Marks every entry of `package` stale. O(1).
    ///
    /// Returns the new generation.
    pub fn invalidate(&self, package: &PackageId) -> u64 {
        let mut inner = self.inner.lock();
        inner.stats.invalidations += 1;
        let generation = inner.generations.entry(package.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Current generation of `package`.
    pub fn generation_of(&self, package: &PackageId) -> u64 {
        self.inner.lock().generation_of(package)
    }

    /// Drops every stale entry now. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        let mut inner = self.inner.lock();
        let stale: Vec<Fingerprint> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.generation != inner.generation_of(&e.package))
            .map(|(fp, _)| *fp)
            .collect();
        for fingerprint in &stale {
            inner.remove(fingerprint);
        }
        inner.stats.stale_dropped += stale.len() as u64;
        stale.len()
    }

    /// Drops every entry. In-flight computations still resolve their waiters.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.used_bytes = 0;
    }

    /// A ready result, without registering anything.
    pub fn peek(&self, request: &GenerationRequest) -> Option<Arc<GenerationResult>> {
        let inner = self.inner.lock();
        let current = inner.generation_of(request.package());
        match inner.entries.get(&request.fingerprint()) {
            Some(Entry { slot: Slot::Ready(result), generation, .. }) if *generation == current => {
                Some(Arc::clone(result))
            }
            _ => None,
        }
    }

    /// Current statistics.
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        let pending = inner
            .entries
            .values()
            .filter(|e| matches!(e.slot, Slot::Pending(_)))
            .count();
        CacheStats {
            ready_entries: inner.entries.len() - pending,
            pending_entries: pending,
            used_bytes: inner.used_bytes,
            capacity_bytes: self.capacity_bytes,
            ..inner.stats.clone()
        }
    }

    /// Configured capacity in bytes.
    #[must_use]
    pub const fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }
}

impl Default for GenerationCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}
