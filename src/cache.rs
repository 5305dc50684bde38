//! Multi-category TTL cache in front of the RPC layer.
//!
//! Each category has its own TTL and its own lock. Entries are stored as
//! `serde_json::Value` and cloned on read. When a cache directory is set, each
//! category is persisted to `<dir>/<category>.json` every few writes so a
//! restart starts warm; persistence is best effort and never fails a caller.

use crate::utils::{Clock, SystemClock, elapsed_between, from_unix_secs, to_unix_secs};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

/// Writes to one category between automatic flushes to disk.
const FLUSH_EVERY_WRITES: u64 = 5;
/// Upper bound on the "expiring soon" warning window.
const WARNING_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheCategory {
    /// Live pool state (reserves, slot0).
    PairPrices,
    TvlData,
    /// Pool metadata that rarely changes (token addresses, fee tier).
    PoolRegistry,
    GasEstimates,
    HealthFlags,
}

impl CacheCategory {
    pub const ALL: [CacheCategory; 5] = [
        CacheCategory::PairPrices,
        CacheCategory::TvlData,
        CacheCategory::PoolRegistry,
        CacheCategory::GasEstimates,
        CacheCategory::HealthFlags,
    ];

    pub fn ttl(self) -> Duration {
        match self {
            CacheCategory::PairPrices => Duration::from_secs(10),
            CacheCategory::TvlData => Duration::from_secs(300),
            CacheCategory::PoolRegistry => Duration::from_secs(600),
            CacheCategory::GasEstimates => Duration::from_secs(120),
            CacheCategory::HealthFlags => Duration::from_secs(30 * 24 * 3600),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CacheCategory::PairPrices => "pair_prices",
            CacheCategory::TvlData => "tvl_data",
            CacheCategory::PoolRegistry => "pool_registry",
            CacheCategory::GasEstimates => "gas_estimates",
            CacheCategory::HealthFlags => "health_flags",
        }
    }

    /// Categories whose staleness directly degrades detection.
    pub fn is_critical(self) -> bool {
        matches!(
            self,
            CacheCategory::PairPrices | CacheCategory::TvlData | CacheCategory::PoolRegistry
        )
    }

    fn index(self) -> usize {
        match self {
            CacheCategory::PairPrices => 0,
            CacheCategory::TvlData => 1,
            CacheCategory::PoolRegistry => 2,
            CacheCategory::GasEstimates => 3,
            CacheCategory::HealthFlags => 4,
        }
    }
}

impl fmt::Display for CacheCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Value,
    pub written_at: SystemTime,
}

impl CacheEntry {
    fn is_stale(&self, now: SystemTime, ttl: Duration) -> bool {
        elapsed_between(self.written_at, now) > ttl
    }
}

/// On-disk shape of one entry.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    payload: Value,
    written_at: f64,
}

#[derive(Default)]
struct Shard {
    entries: RwLock<HashMap<String, CacheEntry>>,
    writes_since_flush: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    /// Bumped for every snapshot taken for disk.
    generation: AtomicU64,
    /// Generation of the snapshot currently on disk.
    persisted: Arc<Mutex<u64>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CategoryStats {
    pub category: CacheCategory,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
}

impl CategoryStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Freshness of a category, measured on its most recently written entry.
#[derive(Debug, Clone, Serialize)]
pub struct ExpirationStatus {
    pub category: CacheCategory,
    pub expired: bool,
    pub time_remaining: Duration,
    pub percent_fresh: f64,
    pub entry_count: usize,
    pub ttl: Duration,
}

pub struct MultiTierCache {
    shards: [Shard; 5],
    dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl MultiTierCache {
    /// Memory-only cache.
    pub fn in_memory(clock: Arc<dyn Clock>) -> Self {
        Self {
            shards: Default::default(),
            dir: None,
            clock,
        }
    }

    /// Cache persisted under `dir`, warmed from whatever is already there.
    pub fn persistent(dir: impl Into<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        let dir = dir.into();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(dir = %dir.display(), error = %e, "[CACHE] cannot create cache dir");
        }
        let cache = Self {
            shards: Default::default(),
            dir: Some(dir),
            clock,
        };
        for category in CacheCategory::ALL {
            cache.load(category);
        }
        cache
    }

    pub fn with_system_clock(dir: Option<PathBuf>) -> Self {
        match dir {
            Some(dir) => Self::persistent(dir, Arc::new(SystemClock)),
            None => Self::in_memory(Arc::new(SystemClock)),
        }
    }

    /// Composite key: parts lower-cased and joined with `:`.
    pub fn key(parts: &[&str]) -> String {
        parts
            .iter()
            .map(|p| p.to_lowercase())
            .collect::<Vec<_>>()
            .join(":")
    }

    fn shard(&self, category: CacheCategory) -> &Shard {
        &self.shards[category.index()]
    }

    pub fn get(&self, category: CacheCategory, key: &str) -> Option<Value> {
        let shard = self.shard(category);
        let ttl = category.ttl();
        let now = self.clock.now();
        {
            let entries = shard.entries.read();
            match entries.get(key) {
                None => {
                    shard.misses.fetch_add(1, Ordering::Relaxed);
                    return None;
                }
                Some(entry) if !entry.is_stale(now, ttl) => {
                    shard.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry.payload.clone());
                }
                Some(_) => {}
            }
        }
        // Stale: evict, unless someone refreshed it between the two locks.
        let mut entries = shard.entries.write();
        if let Some(entry) = entries.get(key) {
            if !entry.is_stale(now, ttl) {
                shard.hits.fetch_add(1, Ordering::Relaxed);
                return Some(entry.payload.clone());
            }
            entries.remove(key);
        }
        shard.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Typed read. A payload that no longer deserializes counts as a miss.
    pub fn get_as<T: DeserializeOwned>(&self, category: CacheCategory, key: &str) -> Option<T> {
        let value = self.get(category, key)?;
        match serde_json::from_value(value) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::debug!(%category, key, error = %e, "[CACHE] undecodable entry ignored");
                None
            }
        }
    }

    pub fn set(&self, category: CacheCategory, key: &str, payload: Value) {
        let shard = self.shard(category);
        {
            let mut entries = shard.entries.write();
            entries.insert(
                key.to_string(),
                CacheEntry {
                    payload,
                    written_at: self.clock.now(),
                },
            );
        }
        shard.writes.fetch_add(1, Ordering::Relaxed);
        let pending = shard.writes_since_flush.fetch_add(1, Ordering::Relaxed) + 1;
        if pending >= FLUSH_EVERY_WRITES {
            shard.writes_since_flush.store(0, Ordering::Relaxed);
            self.flush(category, true);
        }
    }

    pub fn set_as<T: Serialize>(&self, category: CacheCategory, key: &str, payload: &T) {
        match serde_json::to_value(payload) {
            Ok(value) => self.set(category, key, value),
            Err(e) => {
                tracing::warn!(%category, key, error = %e, "[CACHE] payload not serializable")
            }
        }
    }

    /// Drops stale entries from one category, or from all when `None`.
    /// Returns how many were removed.
    pub fn cleanup_expired(&self, category: Option<CacheCategory>) -> usize {
        let now = self.clock.now();
        let categories: Vec<CacheCategory> = match category {
            Some(c) => vec![c],
            None => CacheCategory::ALL.to_vec(),
        };
        let mut removed = 0;
        for category in categories {
            let ttl = category.ttl();
            let mut entries = self.shard(category).entries.write();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_stale(now, ttl));
            removed += before - entries.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "[CACHE] expired entries removed");
        }
        removed
    }

    pub fn clear(&self, category: CacheCategory) {
        self.shard(category).entries.write().clear();
        self.flush(category, false);
    }

    pub fn flush_all(&self) {
        for category in CacheCategory::ALL {
            self.flush(category, false);
        }
    }

    pub fn expiration_status(&self, category: CacheCategory) -> ExpirationStatus {
        let ttl = category.ttl();
        let now = self.clock.now();
        let entries = self.shard(category).entries.read();
        let newest = entries.values().map(|e| e.written_at).max();
        let (expired, time_remaining) = match newest {
            None => (true, Duration::ZERO),
            Some(written_at) => {
                let age = elapsed_between(written_at, now);
                (age > ttl, ttl.saturating_sub(age))
            }
        };
        let percent_fresh = if ttl.is_zero() {
            0.0
        } else {
            time_remaining.as_secs_f64() / ttl.as_secs_f64() * 100.0
        };
        ExpirationStatus {
            category,
            expired,
            time_remaining,
            percent_fresh,
            entry_count: entries.len(),
            ttl,
        }
    }

    /// One line per critical category that is expired or about to expire,
    /// `None` when all of them are comfortably fresh.
    pub fn expiration_warning(&self) -> Option<String> {
        let mut lines = Vec::new();
        for category in CacheCategory::ALL.into_iter().filter(|c| c.is_critical()) {
            let status = self.expiration_status(category);
            let window = WARNING_WINDOW.min(category.ttl() / 4);
            if status.expired {
                lines.push(format!("{category}: expired"));
            } else if status.time_remaining < window {
                lines.push(format!(
                    "{category}: expires in {:.0}s",
                    status.time_remaining.as_secs_f64()
                ));
            }
        }
        (!lines.is_empty()).then(|| lines.join(", "))
    }

    pub fn stats(&self) -> Vec<CategoryStats> {
        CacheCategory::ALL
            .into_iter()
            .map(|category| {
                let shard = self.shard(category);
                CategoryStats {
                    category,
                    entries: shard.entries.read().len(),
                    hits: shard.hits.load(Ordering::Relaxed),
                    misses: shard.misses.load(Ordering::Relaxed),
                    writes: shard.writes.load(Ordering::Relaxed),
                }
            })
            .collect()
    }

    fn path_for(&self, category: CacheCategory) -> Option<PathBuf> {
        self.dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.json", category.name())))
    }

    /// Writes a snapshot of the category. With `background` set and a tokio
    /// runtime around, the disk work moves to the blocking pool. A snapshot
    /// older than the one already on disk is dropped.
    fn flush(&self, category: CacheCategory, background: bool) {
        let Some(path) = self.path_for(category) else {
            return;
        };
        let shard = self.shard(category);
        let (generation, snapshot) = {
            let entries = shard.entries.read();
            let generation = shard.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let snapshot: HashMap<String, StoredEntry> = entries
                .iter()
                .map(|(k, e)| {
                    (
                        k.clone(),
                        StoredEntry {
                            payload: e.payload.clone(),
                            written_at: to_unix_secs(e.written_at),
                        },
                    )
                })
                .collect();
            (generation, snapshot)
        };
        let persisted = shard.persisted.clone();
        let write = move || {
            let mut on_disk = persisted.lock();
            if *on_disk > generation {
                return;
            }
            match write_atomically(&path, &snapshot) {
                Ok(()) => *on_disk = generation,
                Err(e) => {
                    tracing::warn!(
                        %category,
                        path = %path.display(),
                        error = %e,
                        "[CACHE] flush failed"
                    )
                }
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if background => {
                handle.spawn_blocking(write);
            }
            _ => write(),
        }
    }

    fn load(&self, category: CacheCategory) {
        let Some(path) = self.path_for(category) else {
            return;
        };
        if !path.exists() {
            return;
        }
        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|raw| {
                serde_json::from_str::<HashMap<String, StoredEntry>>(&raw)
                    .map_err(|e| e.to_string())
            });
        match parsed {
            Ok(stored) => {
                let count = stored.len();
                let mut entries = self.shard(category).entries.write();
                for (key, entry) in stored {
                    entries.insert(
                        key,
                        CacheEntry {
                            payload: entry.payload,
                            written_at: from_unix_secs(entry.written_at),
                        },
                    );
                }
                tracing::debug!(%category, count, "[CACHE] loaded from disk");
            }
            Err(e) => {
                tracing::warn!(
                    %category,
                    path = %path.display(),
                    error = %e,
                    "[CACHE] ignoring unreadable cache file"
                );
            }
        }
    }
}

/// Each call gets its own temp file beside `path`, renamed over it once complete.
fn write_atomically<T: Serialize>(path: &Path, value: &T) -> std::io::Result<()> {
    let body = serde_json::to_vec(value).map_err(std::io::Error::other)?;
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(&body)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
