use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::models::{Coordinates, ResolutionStatus};
use crate::normalize::normalize;

pub const CACHE_SCHEMA_VERSION: u32 = 2;
const LEGACY_PROVIDER: &str = "legacy";
const LEGACY_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    pub version: u32,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub display_name: Option<String>,
    pub confidence: f64,
    pub provider: String,
    pub status: ResolutionStatus,
    pub cached_at: DateTime<Utc>,
}

impl CacheRecord {
    pub fn located(
        coordinates: Coordinates,
        display_name: Option<String>,
        confidence: f64,
        provider: impl Into<String>,
        status: ResolutionStatus,
    ) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            latitude: Some(coordinates.lat),
            longitude: Some(coordinates.lng),
            display_name,
            confidence: confidence.clamp(0.0, 1.0),
            provider: provider.into(),
            status,
            cached_at: Utc::now(),
        }
    }

    pub fn failed(provider: impl Into<String>) -> Self {
        Self {
            version: CACHE_SCHEMA_VERSION,
            latitude: None,
            longitude: None,
            display_name: None,
            confidence: 0.0,
            provider: provider.into(),
            status: ResolutionStatus::Unresolved,
            cached_at: Utc::now(),
        }
    }

    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }

    pub fn is_failure(&self) -> bool {
        self.coordinates().is_none()
    }

    /// Successes never expire; failures expire once they are `ttl` old.
    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        if !self.is_failure() {
            return false;
        }
        // A timestamp ahead of `now` (clock skew between writers) counts as
        // expired so the failure cannot linger indefinitely.
        match now.signed_duration_since(self.cached_at).to_std() {
            Ok(age) => age >= ttl,
            Err(_) => true,
        }
    }

    fn from_legacy(value: Value) -> Option<Self> {
        match value {
            Value::Null => Some(Self::failed(LEGACY_PROVIDER)),
            Value::Array(items) => {
                let lat = items.first()?.as_f64()?;
                let lng = items.get(1)?.as_f64()?;
                let display_name = match items.get(2) {
                    None | Some(Value::Null) => None,
                    Some(Value::String(name)) => Some(name.clone()),
                    Some(_) => return None,
                };
                let confidence = match items.get(3) {
                    None => LEGACY_CONFIDENCE,
                    Some(value) => value.as_f64()?,
                };
                if items.len() > 4 {
                    return None;
                }
                let coordinates = Coordinates::new(lat, lng);
                coordinates.is_valid().then(|| {
                    Self::located(
                        coordinates,
                        display_name,
                        confidence,
                        LEGACY_PROVIDER,
                        ResolutionStatus::Ok,
                    )
                })
            }
            Value::Object(_) => {
                let mut record: CacheRecord = serde_json::from_value(value).ok()?;
                record.version = CACHE_SCHEMA_VERSION;
                Some(record)
            }
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LegacyImportReport {
    pub imported: usize,
    pub skipped: usize,
}

/// Durable memo of pipeline outcomes keyed by normalized place name.
/// Concurrent writers race benignly: the last upsert wins.
#[derive(Clone)]
pub struct ResultCache {
    db: SharedConnection,
    failure_ttl: Duration,
}

impl ResultCache {
    pub fn new(db: SharedConnection, failure_ttl: Duration) -> Self {
        Self { db, failure_ttl }
    }

    pub fn failure_ttl(&self) -> Duration {
        self.failure_ttl
    }

    pub fn get(&self, key: &str) -> AppResult<Option<CacheRecord>> {
        let conn = self.db.lock();
        let row: Option<(u32, String)> = conn
            .query_row(
                "SELECT schema_version, payload FROM geocode_cache WHERE cache_key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((version, payload)) = row else {
            return Ok(None);
        };

        let record = match serde_json::from_str::<CacheRecord>(&payload) {
            Ok(record) if version == CACHE_SCHEMA_VERSION && record.version == version => record,
            Ok(_) | Err(_) => {
                warn!(
                    target: "result_cache",
                    key,
                    version,
                    "discarding unreadable cache entry"
                );
                conn.execute("DELETE FROM geocode_cache WHERE cache_key = ?1", [key])?;
                return Ok(None);
            }
        };

        if record.is_expired(self.failure_ttl, Utc::now()) {
            debug!(target: "result_cache", key, "cached failure expired; purging");
            conn.execute("DELETE FROM geocode_cache WHERE cache_key = ?1", [key])?;
            return Ok(None);
        }
        Ok(Some(record))
    }

    pub fn set(&self, key: &str, record: &CacheRecord) -> AppResult<()> {
        let payload = serde_json::to_string(record)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geocode_cache (cache_key, schema_version, payload, updated_at)
            VALUES (?1, ?2, ?3, DATETIME('now'))
            ON CONFLICT(cache_key) DO UPDATE SET
                schema_version = excluded.schema_version,
                payload = excluded.payload,
                updated_at = excluded.updated_at",
            params![key, record.version, payload],
        )?;
        Ok(())
    }

    pub fn invalidate(&self, key: &str) -> AppResult<bool> {
        let conn = self.db.lock();
        let removed = conn.execute("DELETE FROM geocode_cache WHERE cache_key = ?1", [key])?;
        Ok(removed > 0)
    }

    pub fn len(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM geocode_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Deletes expired failures and unreadable rows, returning how many went.
    pub fn purge_expired(&self) -> AppResult<usize> {
        let now = Utc::now();
        let mut conn = self.db.lock();
        let stale = {
            let mut stmt = conn.prepare("SELECT cache_key, payload FROM geocode_cache")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter()
                .filter(|(_, payload)| match serde_json::from_str::<CacheRecord>(payload) {
                    Ok(record) => record.is_expired(self.failure_ttl, now),
                    Err(_) => true,
                })
                .map(|(key, _)| key)
                .collect::<Vec<_>>()
        };

        let tx = conn.transaction()?;
        for key in &stale {
            tx.execute("DELETE FROM geocode_cache WHERE cache_key = ?1", [key])?;
        }
        tx.commit()?;
        if !stale.is_empty() {
            info!(target: "result_cache", purged = stale.len(), "expired cache entries purged");
        }
        Ok(stale.len())
    }

    /// Migrates a legacy JSON cache file. Keys already present are left alone.
    pub fn import_legacy_file(&self, path: &Path) -> AppResult<LegacyImportReport> {
        let contents = fs::read_to_string(path)?;
        let entries: BTreeMap<String, Value> = serde_json::from_str(&contents).map_err(|err| {
            AppError::Config(format!("invalid legacy cache {}: {err}", path.display()))
        })?;

        let mut report = LegacyImportReport::default();
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for (raw_key, value) in entries {
            let key = normalize(&raw_key);
            let record = if key.is_empty() {
                None
            } else {
                CacheRecord::from_legacy(value)
            };
            let Some(record) = record else {
                warn!(target: "result_cache", key = %raw_key, "skipping malformed legacy cache entry");
                report.skipped += 1;
                continue;
            };
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO geocode_cache (cache_key, schema_version, payload, updated_at)
                VALUES (?1, ?2, ?3, DATETIME('now'))",
                params![key, record.version, serde_json::to_string(&record)?],
            )?;
            if inserted == 0 {
                report.skipped += 1;
            } else {
                report.imported += 1;
            }
        }
        tx.commit()?;

        info!(
            target: "result_cache",
            path = %path.display(),
            imported = report.imported,
            skipped = report.skipped,
            "legacy cache migrated"
        );
        Ok(report)
    }
}
