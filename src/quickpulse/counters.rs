//! Lock-free aggregate counters behind the live metrics stream.
//!
//! Request and dependency activity is packed into one 64-bit word each:
//! the call count in the top 20 bits, the summed duration in milliseconds
//! in the bottom 44. One word per concern keeps the per-envelope update a
//! single atomic add and lets the snapshot swap reset everything at once.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::model::{Data, Envelope};

/// Count saturates at 20 bits.
const MAX_COUNT: u64 = (1 << 20) - 1;

/// Summed duration saturates at 44 bits of milliseconds.
const MAX_DURATION_MILLIS: u64 = (1 << 44) - 1;

fn encode(count: u64, duration_millis: u64) -> u64 {
    (count << 44) | duration_millis
}

fn decode(word: u64) -> (u64, u64) {
    (word >> 44, word & MAX_DURATION_MILLIS)
}

/// Adds one call of `duration_millis` to a packed word. A field that
/// would overflow resets the word to zero for the current interval; the
/// precision loss is bounded to that interval.
fn add_to_word(word: u64, duration_millis: u64) -> u64 {
    let (count, total) = decode(word);
    let count = count + 1;
    let total = total.saturating_add(duration_millis);
    if count > MAX_COUNT || total > MAX_DURATION_MILLIS {
        0
    } else {
        encode(count, total)
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    unsuccessful_requests: AtomicU32,
    dependencies: AtomicU64,
    unsuccessful_dependencies: AtomicU32,
    exceptions: AtomicU32,
}

/// One interval's worth of aggregates, read after the swap.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub requests: u64,
    pub request_duration_millis: u64,
    pub unsuccessful_requests: u32,
    pub dependencies: u64,
    pub dependency_duration_millis: u64,
    pub unsuccessful_dependencies: u32,
    pub exceptions: u32,
}

/// The process-wide aggregate the live metrics loop snapshots once per
/// second.
///
/// `add` takes a read lock only long enough to clone the current
/// [`Counters`] handle; the atomic update itself runs with no lock held.
/// `get_and_restart` swaps in a fresh instance, so an update that
/// completed before the swap lands in the snapshot being read and a later
/// one lands in the next.
#[derive(Debug)]
pub struct LiveCounters {
    active: RwLock<Arc<Counters>>,
}

impl Default for LiveCounters {
    fn default() -> Self {
        LiveCounters {
            active: RwLock::new(Arc::new(Counters::default())),
        }
    }
}

impl LiveCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds one envelope into the current interval.
    pub fn add(&self, envelope: &Envelope) {
        let counters = self.current();
        match &envelope.data {
            Data::RequestData(_) => {
                let duration = envelope.duration_millis().unwrap_or(0).max(0) as u64;
                fetch_add_call(&counters.requests, duration);
                if envelope.success() == Some(false) {
                    counters.unsuccessful_requests.fetch_add(1, Ordering::Relaxed);
                }
            }
            Data::RemoteDependencyData(_) => {
                let duration = envelope.duration_millis().unwrap_or(0).max(0) as u64;
                fetch_add_call(&counters.dependencies, duration);
                if envelope.success() == Some(false) {
                    counters
                        .unsuccessful_dependencies
                        .fetch_add(1, Ordering::Relaxed);
                }
            }
            Data::ExceptionData(_) => {
                counters.exceptions.fetch_add(1, Ordering::Relaxed);
            }
            Data::MessageData(_) | Data::EventData(_) => {}
        }
    }

    /// Atomically swaps the counters for a zeroed instance and reads the
    /// retired one.
    pub fn get_and_restart(&self) -> Snapshot {
        let retired = {
            let mut active = self.active.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *active, Arc::new(Counters::default()))
        };
        let (requests, request_duration_millis) = decode(retired.requests.load(Ordering::Relaxed));
        let (dependencies, dependency_duration_millis) =
            decode(retired.dependencies.load(Ordering::Relaxed));
        Snapshot {
            requests,
            request_duration_millis,
            unsuccessful_requests: retired.unsuccessful_requests.load(Ordering::Relaxed),
            dependencies,
            dependency_duration_millis,
            unsuccessful_dependencies: retired.unsuccessful_dependencies.load(Ordering::Relaxed),
            exceptions: retired.exceptions.load(Ordering::Relaxed),
        }
    }

    fn current(&self) -> Arc<Counters> {
        self.active
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

fn fetch_add_call(word: &AtomicU64, duration_millis: u64) {
    let _ = word.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
        Some(add_to_word(current, duration_millis))
    });
}
