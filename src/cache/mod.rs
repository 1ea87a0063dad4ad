//! Record cache with TTL expiration, LRU capacity bound and line-oriented
//! persistence.
//!
//! Two instances run in the daemon: domain -> IP list, and host -> routing
//! metadata. Each instance serializes access through a single mutex; no I/O
//! happens while it is held.

mod records;

pub use records::{DomainRecord, HostMeta};

use lru::LruCache;
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

use crate::error::CacheError;

/// Wall-clock source for expiry. Persisted entries outlive the process, so
/// times are Unix milliseconds rather than `Instant`s.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }
}

/// A clock that only moves when told to.
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: AtomicU64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A value that can be stored in a [`RecordCache`] and written as one line.
///
/// `encode` must not produce tabs or newlines.
pub trait Record: Clone + Send + Sync + 'static {
    fn encode(&self) -> String;
    fn decode(s: &str) -> Option<Self>;
}

/// Whether `key` can be stored and written back as a single record line.
pub fn is_storable_key(key: &str) -> bool {
    !key.is_empty() && !key.chars().any(|c| c.is_control() || c.is_whitespace())
}

struct Slot<V> {
    value: V,
    expires_at: u64,
    last_used: u64,
}

/// TTL- and capacity-bounded cache keyed by lowercase host names or IP
/// literals.
pub struct RecordCache<V> {
    name: &'static str,
    inner: Mutex<LruCache<String, Slot<V>>>,
    clock: Arc<dyn Clock>,
    path: Option<PathBuf>,
}

impl<V: Record> RecordCache<V> {
    pub fn new(name: &'static str, capacity: usize, clock: Arc<dyn Clock>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            name,
            inner: Mutex::new(LruCache::new(capacity)),
            clock,
            path: None,
        }
    }

    /// Persist to (and load from) `path`.
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Look up a live entry. Expired entries are removed and reported as a miss.
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_with_ttl(key).map(|(value, _)| value)
    }

    /// Like [`get`](Self::get), also returning the remaining lifetime.
    pub fn get_with_ttl(&self, key: &str) -> Option<(V, Duration)> {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let expires_at = inner.peek(key)?.expires_at;
        if now >= expires_at {
            inner.pop(key);
            return None;
        }

        let slot = inner.get_mut(key)?;
        slot.last_used = now;
        Some((slot.value.clone(), Duration::from_millis(expires_at - now)))
    }

    /// Insert or replace an entry, evicting least-recently-used entries past
    /// capacity. Keys that cannot be persisted as one line are ignored.
    pub fn put(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        if !is_storable_key(&key) {
            warn!(cache = self.name, key = ?key, "refusing unstorable cache key");
            return;
        }

        let now = self.clock.now_ms();
        let slot = Slot {
            value,
            expires_at: now.saturating_add(ttl.as_millis() as u64),
            last_used: now,
        };
        self.inner.lock().put(key, slot);
    }

    /// Read-modify-write a single entry under the lock, creating it from
    /// `V::default()` when absent or expired. The expiry is pushed to
    /// `now + ttl`.
    ///
    /// For an unstorable key `f` runs against a fresh default that is not
    /// kept.
    pub fn update<R>(&self, key: &str, ttl: Duration, f: impl FnOnce(&mut V) -> R) -> R
    where
        V: Default,
    {
        if !is_storable_key(key) {
            warn!(cache = self.name, key = ?key, "refusing unstorable cache key");
            return f(&mut V::default());
        }

        let now = self.clock.now_ms();
        let expires_at = now.saturating_add(ttl.as_millis() as u64);
        let mut inner = self.inner.lock();

        let live = inner.peek(key).is_some_and(|slot| now < slot.expires_at);
        if !live {
            inner.put(
                key.to_string(),
                Slot {
                    value: V::default(),
                    expires_at,
                    last_used: now,
                },
            );
        }

        match inner.get_mut(key) {
            Some(slot) => {
                slot.expires_at = expires_at;
                slot.last_used = now;
                f(&mut slot.value)
            }
            None => f(&mut V::default()),
        }
    }

    /// Remove an entry. Returns whether it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().pop(key).is_some()
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let mut inner = self.inner.lock();

        let expired: Vec<String> = inner
            .iter()
            .filter(|(_, slot)| now >= slot.expires_at)
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            inner.pop(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.inner.lock().cap().get()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Write live entries to the configured path, oldest first.
    ///
    /// Format: `key<TAB>expires_at_ms<TAB>last_used_ms<TAB>value`.
    pub fn save(&self) -> Result<usize, CacheError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let now = self.clock.now_ms();
        let (text, count) = {
            let inner = self.inner.lock();
            let mut text = String::with_capacity(inner.len() * 64);
            let mut count = 0;
            for (key, slot) in inner.iter().rev() {
                if now >= slot.expires_at || !is_storable_key(key) {
                    continue;
                }
                let _ = writeln!(
                    text,
                    "{}\t{}\t{}\t{}",
                    key,
                    slot.expires_at,
                    slot.last_used,
                    slot.value.encode()
                );
                count += 1;
            }
            (text, count)
        };

        write_atomic(path, text.as_bytes())?;
        debug!(cache = self.name, entries = count, path = %path.display(), "cache saved");
        Ok(count)
    }

    /// Merge entries from the configured path. A missing file is an empty
    /// cache; corrupt lines are skipped.
    pub fn load(&self) -> Result<usize, CacheError> {
        let Some(path) = &self.path else {
            return Ok(0);
        };

        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = self.clock.now_ms();
        let mut records = Vec::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match parse_line::<V>(line) {
                Some(record) if record.1 > now => records.push(record),
                Some(_) => {}
                None => {
                    let err = CacheError::Corrupt { line: index + 1 };
                    warn!(cache = self.name, error = %err, "skipping cache record");
                }
            }
        }

        records.sort_by_key(|(_, _, last_used, _)| *last_used);
        let loaded = records.len();

        let mut inner = self.inner.lock();
        for (key, expires_at, last_used, value) in records {
            inner.put(
                key,
                Slot {
                    value,
                    expires_at,
                    last_used,
                },
            );
        }

        debug!(cache = self.name, entries = loaded, path = %path.display(), "cache loaded");
        Ok(loaded)
    }
}

fn parse_line<V: Record>(line: &str) -> Option<(String, u64, u64, V)> {
    let mut fields = line.splitn(4, '\t');
    let key = fields.next()?;
    let expires_at = fields.next()?.parse().ok()?;
    let last_used = fields.next()?.parse().ok()?;
    let value = V::decode(fields.next()?)?;

    if !is_storable_key(key) {
        return None;
    }
    Some((key.to_string(), expires_at, last_used, value))
}

fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)
}
