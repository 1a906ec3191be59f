use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;
use tracing::trace;

use crate::db::SharedConnection;
use crate::errors::{AppError, AppResult};
use crate::models::{source, AdminMetadata, Coordinates, ResolutionStatus};

const SELECT_COLUMNS: &str = "id, raw_name, normalized_key, latitude, longitude, display_name,
    confidence, source, status, country, admin1, admin2, alternate_names, created_at, updated_at";

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ResolvedLocation {
    pub id: i64,
    pub raw_name: String,
    pub normalized_key: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub display_name: Option<String>,
    pub confidence: f64,
    pub source: String,
    pub status: ResolutionStatus,
    pub admin: AdminMetadata,
    pub alternate_names: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl ResolvedLocation {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }
}

/// Values written for one resolution outcome.
#[derive(Debug, Clone)]
pub struct LocationUpsert<'a> {
    pub raw_name: &'a str,
    pub normalized_key: &'a str,
    pub coordinates: Option<Coordinates>,
    pub display_name: Option<&'a str>,
    pub confidence: f64,
    pub source: &'a str,
    pub status: ResolutionStatus,
    pub admin: &'a AdminMetadata,
}

#[derive(Clone)]
pub struct LocationStore {
    db: SharedConnection,
}

impl LocationStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    /// Inserts or refreshes the row for a normalized key. Rows marked
    /// `manual_override` are never replaced by computed results; a differing
    /// raw spelling is kept as an alternate name.
    pub fn upsert(&self, record: &LocationUpsert<'_>) -> AppResult<ResolvedLocation> {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let existing = tx
            .query_row(
                &format!("SELECT {SELECT_COLUMNS} FROM resolved_locations WHERE normalized_key = ?1"),
                [record.normalized_key],
                parse_location,
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO resolved_locations (
                        raw_name, normalized_key, latitude, longitude, display_name, confidence,
                        source, status, country, admin1, admin2
                    ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    params![
                        record.raw_name,
                        record.normalized_key,
                        record.coordinates.map(|c| c.lat),
                        record.coordinates.map(|c| c.lng),
                        record.display_name,
                        record.confidence,
                        record.source,
                        record.status.as_str(),
                        record.admin.country,
                        record.admin.admin1,
                        record.admin.admin2
                    ],
                )?;
            }
            Some(current) => {
                let mut alternates = current.alternate_names.clone();
                if current.raw_name != record.raw_name
                    && !alternates.iter().any(|name| name == record.raw_name)
                {
                    alternates.push(record.raw_name.to_string());
                }
                let alternates = serde_json::to_string(&alternates)?;

                if current.status == ResolutionStatus::ManualOverride
                    && record.status != ResolutionStatus::ManualOverride
                {
                    tx.execute(
                        "UPDATE resolved_locations SET alternate_names = ?1 WHERE id = ?2",
                        params![alternates, current.id],
                    )?;
                } else {
                    tx.execute(
                        "UPDATE resolved_locations SET
                            latitude = ?1,
                            longitude = ?2,
                            display_name = COALESCE(?3, display_name),
                            confidence = ?4,
                            source = ?5,
                            status = ?6,
                            country = COALESCE(?7, country),
                            admin1 = COALESCE(?8, admin1),
                            admin2 = COALESCE(?9, admin2),
                            alternate_names = ?10,
                            updated_at = DATETIME('now')
                        WHERE id = ?11",
                        params![
                            record.coordinates.map(|c| c.lat),
                            record.coordinates.map(|c| c.lng),
                            record.display_name,
                            record.confidence,
                            record.source,
                            record.status.as_str(),
                            record.admin.country,
                            record.admin.admin1,
                            record.admin.admin2,
                            alternates,
                            current.id
                        ],
                    )?;
                }
            }
        }

        let stored = tx.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM resolved_locations WHERE normalized_key = ?1"),
            [record.normalized_key],
            parse_location,
        )?;
        tx.commit()?;
        trace!(
            target: "locations",
            id = stored.id,
            key = %stored.normalized_key,
            status = stored.status.as_str(),
            "resolved location stored"
        );
        Ok(stored)
    }

    pub fn get(&self, id: i64) -> AppResult<ResolvedLocation> {
        let conn = self.db.lock();
        conn.query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM resolved_locations WHERE id = ?1"),
            [id],
            parse_location,
        )
        .optional()?
        .ok_or(AppError::NotFound(id))
    }

    /// Earliest located row whose stored raw name equals `raw_name`.
    pub fn find_located_by_raw_name(&self, raw_name: &str) -> AppResult<Option<ResolvedLocation>> {
        let conn = self.db.lock();
        conn.query_row(
            &format!(
                "SELECT {SELECT_COLUMNS} FROM resolved_locations
                WHERE raw_name = ?1 AND latitude IS NOT NULL AND longitude IS NOT NULL
                ORDER BY id ASC LIMIT 1"
            ),
            [raw_name],
            parse_location,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn located(&self) -> AppResult<Vec<ResolvedLocation>> {
        self.query_where("latitude IS NOT NULL AND longitude IS NOT NULL", [])
    }

    pub fn with_status(&self, status: ResolutionStatus) -> AppResult<Vec<ResolvedLocation>> {
        self.query_where("status = ?1", [status.as_str()])
    }

    pub fn all(&self) -> AppResult<Vec<ResolvedLocation>> {
        self.query_where("1 = 1", [])
    }

    pub fn apply_manual_fix(&self, id: i64, coordinates: Coordinates) -> AppResult<ResolvedLocation> {
        if !coordinates.is_valid() {
            return Err(AppError::Config(format!(
                "invalid coordinates for location {id}: {}, {}",
                coordinates.lat, coordinates.lng
            )));
        }
        {
            let conn = self.db.lock();
            let affected = conn.execute(
                "UPDATE resolved_locations SET
                    latitude = ?1,
                    longitude = ?2,
                    confidence = 1.0,
                    source = ?3,
                    status = ?4,
                    updated_at = DATETIME('now')
                WHERE id = ?5",
                params![
                    coordinates.lat,
                    coordinates.lng,
                    source::MANUAL,
                    ResolutionStatus::ManualOverride.as_str(),
                    id
                ],
            )?;
            if affected == 0 {
                return Err(AppError::NotFound(id));
            }
        }
        self.get(id)
    }

    fn query_where<P: rusqlite::Params>(
        &self,
        predicate: &str,
        params: P,
    ) -> AppResult<Vec<ResolvedLocation>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM resolved_locations WHERE {predicate} ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params, parse_location)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_location(row: &Row<'_>) -> rusqlite::Result<ResolvedLocation> {
    let status: String = row.get(8)?;
    let alternates: String = row.get(12)?;
    Ok(ResolvedLocation {
        id: row.get(0)?,
        raw_name: row.get(1)?,
        normalized_key: row.get(2)?,
        latitude: row.get(3)?,
        longitude: row.get(4)?,
        display_name: row.get(5)?,
        confidence: row.get(6)?,
        source: row.get(7)?,
        status: ResolutionStatus::parse(&status).unwrap_or(ResolutionStatus::Unresolved),
        admin: AdminMetadata {
            country: row.get(9)?,
            admin1: row.get(10)?,
            admin2: row.get(11)?,
        },
        alternate_names: serde_json::from_str(&alternates).unwrap_or_default(),
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn located<'a>(raw: &'a str, key: &'a str, admin: &'a AdminMetadata) -> LocationUpsert<'a> {
        LocationUpsert {
            raw_name: raw,
            normalized_key: key,
            coordinates: Some(Coordinates::new(41.88, -87.63)),
            display_name: Some("Chicago, IL"),
            confidence: 0.9,
            source: "google",
            status: ResolutionStatus::Ok,
            admin,
        }
    }

    #[test]
    fn upsert_keeps_one_row_per_key_and_tracks_spellings() {
        let store = LocationStore::new(open_in_memory().unwrap());
        let admin = AdminMetadata::default();
        let first = store
            .upsert(&located("Chicago, Illinois, USA", "chicago, illinois", &admin))
            .unwrap();
        let second = store
            .upsert(&located("Chicago,  Illinois", "chicago, illinois", &admin))
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.alternate_names, vec!["Chicago,  Illinois".to_string()]);
        assert_eq!(store.all().unwrap().len(), 1);
    }

    #[test]
    fn manual_override_is_never_replaced_by_computed_results() {
        let store = LocationStore::new(open_in_memory().unwrap());
        let admin = AdminMetadata::default();
        let stored = store
            .upsert(&LocationUpsert {
                coordinates: None,
                status: ResolutionStatus::Unresolved,
                confidence: 0.0,
                source: source::NONE,
                display_name: None,
                ..located("Ackerman", "ackerman", &admin)
            })
            .unwrap();
        let fixed = store
            .apply_manual_fix(stored.id, Coordinates::new(33.3037, -89.1723))
            .unwrap();
        assert_eq!(fixed.status, ResolutionStatus::ManualOverride);
        assert_eq!(fixed.confidence, 1.0);

        let after = store
            .upsert(&located("Ackerman", "ackerman", &admin))
            .unwrap();
        assert_eq!(after.status, ResolutionStatus::ManualOverride);
        assert_eq!(after.latitude, Some(33.3037));
    }

    #[test]
    fn manual_fix_on_missing_row_is_not_found() {
        let store = LocationStore::new(open_in_memory().unwrap());
        let err = store
            .apply_manual_fix(42, Coordinates::new(1.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(42)));
    }

    #[test]
    fn finds_located_rows_by_raw_name() {
        let store = LocationStore::new(open_in_memory().unwrap());
        let admin = AdminMetadata::default();
        store
            .upsert(&located("Chicago, Illinois, USA", "chicago, illinois", &admin))
            .unwrap();
        assert!(store
            .find_located_by_raw_name("Chicago, Illinois, USA")
            .unwrap()
            .is_some());
        assert!(store.find_located_by_raw_name("Chicago").unwrap().is_none());
        assert_eq!(store.located().unwrap().len(), 1);
        assert_eq!(
            store.with_status(ResolutionStatus::Unresolved).unwrap().len(),
            0
        );
    }
}
