//! Idle connections kept for reuse.
//!
//! A pooled stream is only handed out for the exact destination, transport
//! and TLS flag it was opened for. Streams idle past the timeout are
//! dropped on the next access or sweep.

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::time::{Duration, Instant};

use crate::backend::{BoxStream, Destination, TransportKind};

/// Spare streams kept per key.
const MAX_IDLE_PER_KEY: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PoolKey {
    pub dest: Destination,
    pub transport: TransportKind,
    pub tls: bool,
}

impl PoolKey {
    pub fn new(dest: &Destination, transport: TransportKind, tls: bool) -> Self {
        Self {
            dest: dest.clone(),
            transport,
            tls,
        }
    }
}

struct Idle {
    stream: BoxStream,
    since: Instant,
}

pub struct ConnectionPool {
    idle: Mutex<FxHashMap<PoolKey, Vec<Idle>>>,
    idle_timeout: Duration,
}

impl ConnectionPool {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle: Mutex::new(FxHashMap::default()),
            idle_timeout,
        }
    }

    /// Newest still-fresh stream for `key`.
    pub fn take(&self, key: &PoolKey) -> Option<BoxStream> {
        let mut idle = self.idle.lock();
        let streams = idle.get_mut(key)?;
        streams.retain(|s| s.since.elapsed() < self.idle_timeout);
        let stream = streams.pop().map(|s| s.stream);
        if streams.is_empty() {
            idle.remove(key);
        }
        stream
    }

    /// Park a stream. Returns `false` (and drops it) when the key is full.
    pub fn put(&self, key: PoolKey, stream: BoxStream) -> bool {
        let mut idle = self.idle.lock();
        let streams = idle.entry(key).or_default();
        if streams.len() >= MAX_IDLE_PER_KEY {
            return false;
        }
        streams.push(Idle {
            stream,
            since: Instant::now(),
        });
        true
    }

    pub fn has_idle(&self, key: &PoolKey) -> bool {
        self.idle.lock().get(key).is_some_and(|s| !s.is_empty())
    }

    /// Drop expired streams. Returns how many were dropped.
    pub fn sweep(&self) -> usize {
        // Collect outside the map walk so streams close after the lock is gone
        let mut expired = Vec::new();
        {
            let mut idle = self.idle.lock();
            idle.retain(|_, streams| {
                let (keep, old): (Vec<_>, Vec<_>) = streams
                    .drain(..)
                    .partition(|s| s.since.elapsed() < self.idle_timeout);
                *streams = keep;
                expired.extend(old);
                !streams.is_empty()
            });
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.idle.lock().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
