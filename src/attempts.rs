use rand::distributions::Alphanumeric;
use rand::Rng;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use serde_json::Value;

use crate::db::{now_timestamp, SharedConnection};
use crate::era::EraBucket;
use crate::errors::AppResult;
use crate::models::Coordinates;

const RESOLUTION_ID_LEN: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeocodeAttempt {
    pub id: i64,
    pub resolution_id: String,
    pub raw_place: String,
    pub normalized_name: Option<String>,
    pub admin_hint: Option<String>,
    pub era_bucket: EraBucket,
    pub provider: String,
    pub is_winner: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub score: Option<f64>,
    pub request_payload: Option<Value>,
    pub response_payload: Option<Value>,
    pub scoring_payload: Option<Value>,
    pub created_at: String,
}

impl GeocodeAttempt {
    pub fn new(resolution_id: &str, raw_place: &str, provider: &str) -> Self {
        Self {
            id: 0,
            resolution_id: resolution_id.to_string(),
            raw_place: raw_place.to_string(),
            normalized_name: None,
            admin_hint: None,
            era_bucket: EraBucket::Unknown,
            provider: provider.to_string(),
            is_winner: false,
            latitude: None,
            longitude: None,
            score: None,
            request_payload: None,
            response_payload: None,
            scoring_payload: None,
            created_at: now_timestamp(),
        }
    }

    pub fn with_candidate(mut self, coordinates: Option<Coordinates>, score: Option<f64>) -> Self {
        self.latitude = coordinates.map(|c| c.lat);
        self.longitude = coordinates.map(|c| c.lng);
        self.score = score;
        self
    }

    pub fn winner(mut self, is_winner: bool) -> Self {
        self.is_winner = is_winner;
        self
    }
}

pub fn new_resolution_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(RESOLUTION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Append-only audit trail. Rows are never updated or deleted.
#[derive(Clone)]
pub struct AttemptRecorder {
    db: SharedConnection,
}

impl AttemptRecorder {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn record(&self, attempt: &GeocodeAttempt) -> AppResult<i64> {
        let conn = self.db.lock();
        insert_attempt(&conn, attempt)
    }

    /// Writes the attempts of one resolution in a single transaction.
    pub fn record_all(&self, attempts: &[GeocodeAttempt]) -> AppResult<usize> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        for attempt in attempts {
            insert_attempt(&tx, attempt)?;
        }
        tx.commit()?;
        Ok(attempts.len())
    }

    pub fn attempts_for(&self, raw_place: &str) -> AppResult<Vec<GeocodeAttempt>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT id, resolution_id, raw_place, normalized_name, admin_hint, era_bucket,
                provider, is_winner, latitude, longitude, score, request_payload,
                response_payload, scoring_payload, created_at
            FROM geocode_attempts
            WHERE raw_place = ?1
            ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([raw_place], parse_attempt)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM geocode_attempts", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn insert_attempt(conn: &Connection, attempt: &GeocodeAttempt) -> AppResult<i64> {
    conn.execute(
        "INSERT INTO geocode_attempts (
            resolution_id, raw_place, normalized_name, admin_hint, era_bucket, provider,
            is_winner, latitude, longitude, score, request_payload, response_payload,
            scoring_payload, created_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            attempt.resolution_id,
            attempt.raw_place,
            attempt.normalized_name,
            attempt.admin_hint,
            attempt.era_bucket.as_str(),
            attempt.provider,
            attempt.is_winner,
            attempt.latitude,
            attempt.longitude,
            attempt.score,
            payload_text(&attempt.request_payload),
            payload_text(&attempt.response_payload),
            payload_text(&attempt.scoring_payload),
            attempt.created_at,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn payload_text(value: &Option<Value>) -> Option<String> {
    value.as_ref().map(Value::to_string)
}

fn parse_payload(text: Option<String>) -> Option<Value> {
    text.and_then(|text| serde_json::from_str(&text).ok())
}

fn parse_attempt(row: &Row<'_>) -> rusqlite::Result<GeocodeAttempt> {
    let era: String = row.get(5)?;
    Ok(GeocodeAttempt {
        id: row.get(0)?,
        resolution_id: row.get(1)?,
        raw_place: row.get(2)?,
        normalized_name: row.get(3)?,
        admin_hint: row.get(4)?,
        era_bucket: EraBucket::parse(&era),
        provider: row.get(6)?,
        is_winner: row.get(7)?,
        latitude: row.get(8)?,
        longitude: row.get(9)?,
        score: row.get(10)?,
        request_payload: parse_payload(row.get(11)?),
        response_payload: parse_payload(row.get(12)?),
        scoring_payload: parse_payload(row.get(13)?),
        created_at: row.get(14)?,
    })
}
