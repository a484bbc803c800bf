//! Idempotency guard — per-worker duplicate suppression.
//!
//! The broker delivers at least once, so every stage checks the request id
//! against a process-local seen-set before doing any work. The set is never
//! persisted or shared across worker instances; the guarantee is "at most
//! once per worker lifetime", bounded further by capacity and TTL.
//!
//! Check-then-mark happens under one lock via [`IdempotencyGuard::claim`].
//! A claim is in flight until it is committed; dropping it uncommitted
//! forgets the id again so a redelivery can retry.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

const MIN_TTL: Duration = Duration::from_secs(1);

/// Bounds for the seen-set.
#[derive(Debug, Clone, Copy)]
pub struct GuardConfig {
    /// Maximum number of remembered ids; the oldest is evicted first.
    pub capacity: usize,
    /// How long an id is remembered after it was first claimed.
    pub ttl: Duration,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            ttl: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    InFlight,
    Done,
}

#[derive(Debug)]
struct Record {
    state: State,
    marked_at: Instant,
    generation: u64,
}

#[derive(Debug, Default)]
struct SeenSet {
    records: HashMap<String, Record>,
    /// Insertion order as (id, generation); stale entries are skipped.
    order: VecDeque<(String, u64)>,
    next_generation: u64,
}

impl SeenSet {
    fn purge(&mut self, now: Instant, config: &GuardConfig) {
        while let Some((id, generation)) = self.order.front() {
            let expired = match self.records.get(id) {
                Some(r) if r.generation == *generation => now.duration_since(r.marked_at) >= config.ttl,
                _ => true, // stale order entry
            };
            let over_capacity = self.records.len() > config.capacity;
            if !expired && !over_capacity {
                break;
            }
            if let Some((id, generation)) = self.order.pop_front() {
                if self.records.get(&id).is_some_and(|r| r.generation == generation) {
                    self.records.remove(&id);
                }
            }
        }
    }

    fn insert(&mut self, id: &str, state: State, now: Instant) -> u64 {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.records.insert(
            id.to_string(),
            Record { state, marked_at: now, generation },
        );
        self.order.push_back((id.to_string(), generation));
        generation
    }
}

/// Process-local, bounded seen-set keyed by request id.
#[derive(Debug)]
pub struct IdempotencyGuard {
    config: GuardConfig,
    inner: Mutex<SeenSet>,
}

impl Default for IdempotencyGuard {
    fn default() -> Self {
        Self::new(GuardConfig::default())
    }
}

impl IdempotencyGuard {
    /// Zero bounds would forget every id on insert; they are raised to one
    /// entry and one second.
    pub fn new(mut config: GuardConfig) -> Self {
        if config.capacity == 0 || config.ttl < MIN_TTL {
            tracing::warn!(
                capacity = config.capacity,
                ttl_ms = config.ttl.as_millis() as u64,
                "idempotency bounds too small; clamping"
            );
            config.capacity = config.capacity.max(1);
            config.ttl = config.ttl.max(MIN_TTL);
        }
        Self {
            config,
            inner: Mutex::new(SeenSet::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SeenSet> {
        // A panic while holding the lock leaves the set consistent.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether `request_id` is currently remembered (in flight or done).
    pub fn seen(&self, request_id: &str) -> bool {
        let mut set = self.lock();
        set.purge(Instant::now(), &self.config);
        set.records.contains_key(request_id)
    }

    /// Remember `request_id` as processed.
    pub fn mark_seen(&self, request_id: &str) {
        let mut set = self.lock();
        let now = Instant::now();
        set.insert(request_id, State::Done, now);
        set.purge(now, &self.config);
    }

    /// Atomically check and mark `request_id` as in flight.
    ///
    /// Returns `None` if the id is already remembered, including when
    /// another delivery of the same id is still being processed.
    pub fn claim(self: &Arc<Self>, request_id: &str) -> Option<Claim> {
        let mut set = self.lock();
        let now = Instant::now();
        set.purge(now, &self.config);
        if set.records.contains_key(request_id) {
            return None;
        }
        let generation = set.insert(request_id, State::InFlight, now);
        set.purge(now, &self.config);

        Some(Claim {
            guard: Arc::clone(self),
            request_id: request_id.to_string(),
            generation,
            committed: false,
        })
    }

    /// Number of remembered ids.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn settle(&self, request_id: &str, generation: u64, commit: bool) {
        let mut set = self.lock();
        let Some(record) = set.records.get_mut(request_id) else {
            return;
        };
        if record.generation != generation || record.state != State::InFlight {
            return;
        }
        if commit {
            record.state = State::Done;
        } else {
            set.records.remove(request_id);
        }
    }
}

/// Exclusive right to process one request id.
#[derive(Debug)]
#[must_use = "dropping a claim releases it"]
pub struct Claim {
    guard: Arc<IdempotencyGuard>,
    request_id: String,
    generation: u64,
    committed: bool,
}

impl Claim {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Record the request as processed.
    pub fn commit(mut self) {
        self.committed = true;
        self.guard.settle(&self.request_id, self.generation, true);
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if !self.committed {
            tracing::debug!(request_id = %self.request_id, "releasing idempotency claim");
            self.guard.settle(&self.request_id, self.generation, false);
        }
    }
}
