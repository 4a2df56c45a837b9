use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::warn;

use crate::sqlite::configure_connection;

use super::{CacheError, CacheLookup, CacheResult, CacheStats, QuotaUsage};

const CACHE_SCHEMA: &str = include_str!("../../../sql/cache.sql");

#[derive(Debug, Clone)]
pub struct SqliteCacheStoreBuilder {
    path: Option<PathBuf>,
    read_only: bool,
    create_if_missing: bool,
    ttl_hours: i64,
    ceilings: BTreeMap<String, u64>,
}

impl Default for SqliteCacheStoreBuilder {
    fn default() -> Self {
        Self {
            path: None,
            read_only: false,
            create_if_missing: true,
            ttl_hours: 24,
            ceilings: BTreeMap::new(),
        }
    }
}

impl SqliteCacheStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn path(mut self, path: impl AsRef<Path>) -> Self {
        self.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    pub fn ttl_hours(mut self, hours: i64) -> Self {
        self.ttl_hours = hours;
        self
    }

    pub fn ceiling(mut self, api: impl Into<String>, ceiling: u64) -> Self {
        self.ceilings.insert(api.into(), ceiling);
        self
    }

    pub fn build(self) -> CacheResult<SqliteCacheStore> {
        let path = self.path.ok_or(CacheError::MissingStore)?;
        let mut flags = if self.read_only {
            OpenFlags::SQLITE_OPEN_READ_ONLY
        } else {
            OpenFlags::SQLITE_OPEN_READ_WRITE
        };
        if !self.read_only && self.create_if_missing {
            flags |= OpenFlags::SQLITE_OPEN_CREATE;
        }
        Ok(SqliteCacheStore {
            path,
            flags,
            ttl: Duration::hours(self.ttl_hours),
            ceilings: self.ceilings,
        })
    }
}

/// Content-addressed response cache plus the per-API quota ledger, both in
/// one SQLite file so a plan run shares a single budget view.
#[derive(Debug, Clone)]
pub struct SqliteCacheStore {
    path: PathBuf,
    flags: OpenFlags,
    ttl: Duration,
    ceilings: BTreeMap<String, u64>,
}

impl SqliteCacheStore {
    pub fn builder() -> SqliteCacheStoreBuilder {
        SqliteCacheStoreBuilder::new()
    }

    fn open(&self) -> CacheResult<Connection> {
        let conn = Connection::open_with_flags(&self.path, self.flags).map_err(|source| {
            CacheError::OpenDatabase {
                path: self.path.clone(),
                source,
            }
        })?;
        configure_connection(&conn).map_err(|source| CacheError::OpenDatabase {
            path: self.path.clone(),
            source,
        })?;
        Ok(conn)
    }

    pub fn initialize(&self) -> CacheResult<()> {
        let conn = self.open()?;
        conn.execute_batch(CACHE_SCHEMA)?;
        Ok(())
    }

    /// Stable cache key over endpoint and canonically ordered parameters.
    pub fn cache_key(endpoint: &str, params: &BTreeMap<String, String>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(endpoint.as_bytes());
        for (key, value) in params {
            hasher.update(b"\x1f");
            hasher.update(key.as_bytes());
            hasher.update(b"=");
            hasher.update(value.as_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn lookup(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> CacheResult<CacheLookup> {
        let key = Self::cache_key(endpoint, params);
        let conn = self.open()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM response_cache
                 WHERE cache_key = ?1 AND expires_at > ?2",
                params![key, now.naive_utc()],
                |row| row.get(0),
            )
            .optional()?;

        let day = now.format("%Y-%m-%d").to_string();
        let (hit, miss) = if payload.is_some() { (1, 0) } else { (0, 1) };
        conn.execute(
            "INSERT INTO cache_counters (endpoint, day, hits, misses)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(endpoint, day) DO UPDATE SET
                 hits = hits + excluded.hits,
                 misses = misses + excluded.misses",
            params![endpoint, day, hit, miss],
        )?;

        Ok(match payload {
            Some(payload) => CacheLookup::Hit(payload),
            None => CacheLookup::Miss,
        })
    }

    /// Read failures degrade to a miss; the pipeline refetches instead of
    /// aborting the run.
    pub fn lookup_or_miss(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        match self.lookup(endpoint, params, now) {
            Ok(outcome) => outcome,
            Err(err) => {
                warn!(target: "cache", endpoint, error = %err, "cache read failed, treating as miss");
                CacheLookup::Miss
            }
        }
    }

    pub fn put(
        &self,
        endpoint: &str,
        params: &BTreeMap<String, String>,
        payload: &str,
        now: DateTime<Utc>,
    ) -> CacheResult<()> {
        let key = Self::cache_key(endpoint, params);
        let conn = self.open()?;
        conn.execute(
            "INSERT INTO response_cache (cache_key, endpoint, payload, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(cache_key) DO UPDATE SET
                 payload = excluded.payload,
                 created_at = excluded.created_at,
                 expires_at = excluded.expires_at",
            params![
                key,
                endpoint,
                payload,
                now.naive_utc(),
                (now + self.ttl).naive_utc()
            ],
        )?;
        Ok(())
    }

    pub fn evict_expired(&self, now: DateTime<Utc>) -> CacheResult<usize> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM response_cache WHERE expires_at <= ?1",
            params![now.naive_utc()],
        )?;
        Ok(removed)
    }

    fn calls_today(&self, conn: &Connection, api: &str, day: &str) -> CacheResult<u64> {
        let calls: Option<i64> = conn
            .query_row(
                "SELECT calls FROM quota_ledger WHERE api = ?1 AND day = ?2",
                params![api, day],
                |row| row.get(0),
            )
            .optional()?;
        Ok(calls.unwrap_or(0) as u64)
    }

    /// False once the daily ceiling for the API is reached. Counters are
    /// keyed by calendar day, so the boundary rolls atomically with the
    /// first call of the new day.
    pub fn can_call(&self, api: &str, now: DateTime<Utc>) -> CacheResult<bool> {
        let ceiling = match self.ceilings.get(api) {
            Some(ceiling) => *ceiling,
            None => return Ok(true),
        };
        let conn = self.open()?;
        let day = now.format("%Y-%m-%d").to_string();
        Ok(self.calls_today(&conn, api, &day)? < ceiling)
    }

    /// Must be paired with a successful fetch. A write failure here is
    /// fatal to the call: without the ledger row the budget would leak.
    pub fn record_call(&self, api: &str, now: DateTime<Utc>) -> CacheResult<()> {
        let conn = self.open()?;
        let day = now.format("%Y-%m-%d").to_string();
        if let Some(ceiling) = self.ceilings.get(api) {
            let used = self.calls_today(&conn, api, &day)?;
            if used >= *ceiling {
                return Err(CacheError::QuotaExhausted {
                    api: api.to_string(),
                    used,
                    ceiling: *ceiling,
                });
            }
        }
        conn.execute(
            "INSERT INTO quota_ledger (api, day, calls) VALUES (?1, ?2, 1)
             ON CONFLICT(api, day) DO UPDATE SET calls = calls + 1",
            params![api, day],
        )?;
        Ok(())
    }

    pub fn usage(&self, api: &str, now: DateTime<Utc>) -> CacheResult<QuotaUsage> {
        let conn = self.open()?;
        let day = now.format("%Y-%m-%d").to_string();
        let used = self.calls_today(&conn, api, &day)?;
        Ok(QuotaUsage {
            api: api.to_string(),
            used,
            ceiling: self.ceilings.get(api).copied().unwrap_or(u64::MAX),
        })
    }

    pub fn stats_for_day(&self, now: DateTime<Utc>) -> CacheResult<CacheStats> {
        let conn = self.open()?;
        let day = now.format("%Y-%m-%d").to_string();
        let (hits, misses): (i64, i64) = conn
            .query_row(
                "SELECT COALESCE(SUM(hits), 0), COALESCE(SUM(misses), 0)
                 FROM cache_counters WHERE day = ?1",
                params![day],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap_or((0, 0));
        Ok(CacheStats {
            hits: hits as u64,
            misses: misses as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn store(dir: &tempfile::TempDir) -> SqliteCacheStore {
        let store = SqliteCacheStore::builder()
            .path(dir.path().join("cache.sqlite"))
            .ttl_hours(24)
            .ceiling("serp_calls", 3)
            .build()
            .unwrap();
        store.initialize().unwrap();
        store
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
    }

    fn params_of(market: &str) -> BTreeMap<String, String> {
        BTreeMap::from([("market".to_string(), market.to_string())])
    }

    #[test]
    fn cache_key_is_order_independent() {
        let mut a = BTreeMap::new();
        a.insert("q".to_string(), "webp".to_string());
        a.insert("market".to_string(), "US".to_string());
        let mut b = BTreeMap::new();
        b.insert("market".to_string(), "US".to_string());
        b.insert("q".to_string(), "webp".to_string());
        assert_eq!(
            SqliteCacheStore::cache_key("kwp", &a),
            SqliteCacheStore::cache_key("kwp", &b)
        );
        assert_ne!(
            SqliteCacheStore::cache_key("kwp", &a),
            SqliteCacheStore::cache_key("gsc", &a)
        );
    }

    #[test]
    fn miss_then_hit_updates_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let params = params_of("US");

        assert_eq!(store.lookup("kwp", &params, now()).unwrap(), CacheLookup::Miss);
        store.put("kwp", &params, "{\"rows\":[]}", now()).unwrap();
        assert!(store.lookup("kwp", &params, now()).unwrap().is_hit());

        let stats = store.stats_for_day(now()).unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn expired_entries_read_as_miss() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let params = params_of("AU");
        store.put("kwp", &params, "payload", now()).unwrap();
        let later = now() + Duration::hours(25);
        assert_eq!(store.lookup("kwp", &params, later).unwrap(), CacheLookup::Miss);
        assert_eq!(store.evict_expired(later).unwrap(), 1);
    }

    #[test]
    fn quota_ceiling_blocks_further_calls() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for _ in 0..3 {
            assert!(store.can_call("serp_calls", now()).unwrap());
            store.record_call("serp_calls", now()).unwrap();
        }
        assert!(!store.can_call("serp_calls", now()).unwrap());
        assert!(matches!(
            store.record_call("serp_calls", now()),
            Err(CacheError::QuotaExhausted { .. })
        ));
        assert_eq!(store.usage("serp_calls", now()).unwrap().remaining(), 0);
    }

    #[test]
    fn day_boundary_rolls_counters() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        for _ in 0..3 {
            store.record_call("serp_calls", now()).unwrap();
        }
        let tomorrow = now() + Duration::days(1);
        assert!(store.can_call("serp_calls", tomorrow).unwrap());
        assert_eq!(store.usage("serp_calls", tomorrow).unwrap().used, 0);
    }

    #[test]
    fn unknown_api_is_unlimited() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        assert!(store.can_call("analytics", now()).unwrap());
        store.record_call("analytics", now()).unwrap();
        assert_eq!(store.usage("analytics", now()).unwrap().used, 1);
    }
}
