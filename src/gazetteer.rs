use std::fs;
use std::path::Path;

use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::db::SharedConnection;
use crate::era::{bucket, EraBucket};
use crate::errors::{AppError, AppResult};
use crate::models::{source, AdminMetadata, Candidate, Coordinates};
use crate::normalize::{first_segment, normalize, trailing_segments};

const TEXT_WEIGHT: f64 = 0.5;
const ADMIN_WEIGHT: f64 = 0.2;
const ERA_WEIGHT: f64 = 0.2;
const PROXIMITY_WEIGHT: f64 = 0.1;
const LONGITUDE_SCALE: f64 = 0.6;
const PROXIMITY_SPREAD: f64 = 100.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GazetteerEntry {
    #[serde(default)]
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub admin_area: Option<String>,
    #[serde(default = "unknown_era")]
    pub era_bucket: EraBucket,
    pub latitude: f64,
    pub longitude: f64,
    pub source: String,
    #[serde(default)]
    pub alternate_names: Vec<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

fn unknown_era() -> EraBucket {
    EraBucket::Unknown
}

#[derive(Debug, Clone, Default)]
pub struct GazetteerQuery<'a> {
    pub normalized_name: &'a str,
    pub admin_hint: Option<&'a str>,
    pub event_year: Option<i32>,
    pub family_coords: &'a [Coordinates],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub text_similarity: f64,
    pub admin_similarity: f64,
    pub era_overlap: f64,
    pub proximity: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScoredCandidate {
    pub entry_id: i64,
    pub name: String,
    pub admin_area: Option<String>,
    pub era_bucket: EraBucket,
    pub coordinates: Coordinates,
    pub breakdown: ScoreBreakdown,
}

#[derive(Debug, Clone, Serialize)]
pub struct GazetteerResolution {
    pub lookup_name: String,
    pub admin_hint: Option<String>,
    pub expected_era: EraBucket,
    pub scored: Vec<ScoredCandidate>,
    pub winner: Option<usize>,
    #[serde(skip)]
    pub candidate: Option<Candidate>,
}

impl GazetteerResolution {
    pub fn winner(&self) -> Option<&ScoredCandidate> {
        self.winner.and_then(|index| self.scored.get(index))
    }
}

#[derive(Clone)]
pub struct GazetteerStore {
    db: SharedConnection,
}

impl GazetteerStore {
    pub fn new(db: SharedConnection) -> Self {
        Self { db }
    }

    pub fn insert(&self, entry: &GazetteerEntry) -> AppResult<i64> {
        let conn = self.db.lock();
        insert_entry(&conn, entry)
    }

    pub fn load_entries<I>(&self, entries: I) -> AppResult<usize>
    where
        I: IntoIterator<Item = GazetteerEntry>,
    {
        let mut conn = self.db.lock();
        let tx = conn.transaction()?;
        let mut count = 0;
        for entry in entries {
            insert_entry(&tx, &entry)?;
            count += 1;
        }
        tx.commit()?;
        debug!(target: "gazetteer", count, "gazetteer entries hydrated");
        Ok(count)
    }

    pub fn load_json_file(&self, path: &Path) -> AppResult<usize> {
        let contents = fs::read_to_string(path)?;
        let entries: Vec<GazetteerEntry> = serde_json::from_str(&contents).map_err(|err| {
            AppError::Config(format!("invalid gazetteer dataset {}: {err}", path.display()))
        })?;
        self.load_entries(entries)
    }

    pub fn count(&self) -> AppResult<usize> {
        let conn = self.db.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM gazetteer_entries", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Entries of every era whose primary or alternate name equals `name`,
    /// in insertion order. Era fit is left to the scorer.
    pub fn candidates(&self, name: &str) -> AppResult<Vec<GazetteerEntry>> {
        let conn = self.db.lock();
        let mut stmt = conn.prepare(
            "SELECT g.id, g.name, g.admin_area, g.era_bucket, g.latitude, g.longitude, g.source, g.metadata
            FROM gazetteer_entries g
            WHERE g.name = ?1
               OR g.id IN (SELECT entry_id FROM gazetteer_alternate_names WHERE name = ?1)
            ORDER BY g.id ASC",
        )?;
        let rows = stmt
            .query_map([name], parse_entry)?
            .collect::<Result<Vec<_>, _>>()?;
        let mut entries = rows;
        for entry in &mut entries {
            entry.alternate_names = load_alternate_names(&conn, entry.id)?;
        }
        Ok(entries)
    }

    /// Era-aware lookup. Falls back to the leading segment of the key when the
    /// full key has no candidates, using the remaining segments as the admin
    /// hint if the caller supplied none.
    pub fn resolve(&self, query: &GazetteerQuery<'_>) -> AppResult<GazetteerResolution> {
        let expected_era = bucket(query.event_year);
        let explicit_hint = query
            .admin_hint
            .map(normalize)
            .filter(|hint| !hint.is_empty());

        let mut lookup_name = query.normalized_name.to_string();
        let mut admin_hint = explicit_hint.clone();
        let mut entries = self.candidates(&lookup_name)?;

        if entries.is_empty() {
            if let Some(first) = first_segment(query.normalized_name) {
                if first != query.normalized_name {
                    let fallback = self.candidates(first)?;
                    if !fallback.is_empty() {
                        lookup_name = first.to_string();
                        admin_hint =
                            explicit_hint.or_else(|| trailing_segments(query.normalized_name));
                        entries = fallback;
                    }
                }
            }
        }

        let scored = entries
            .iter()
            .map(|entry| ScoredCandidate {
                entry_id: entry.id,
                name: entry.name.clone(),
                admin_area: entry.admin_area.clone(),
                era_bucket: entry.era_bucket,
                coordinates: Coordinates::new(entry.latitude, entry.longitude),
                breakdown: score_entry(
                    &lookup_name,
                    admin_hint.as_deref(),
                    query.event_year,
                    query.family_coords,
                    entry,
                ),
            })
            .collect::<Vec<_>>();

        let winner = pick_winner(&scored);
        let candidate = winner.map(|index| {
            let chosen = &scored[index];
            let entry = &entries[index];
            let display = match &entry.admin_area {
                Some(admin) => format!("{}, {}", entry.name, admin),
                None => entry.name.clone(),
            };
            Candidate::new(chosen.coordinates, chosen.breakdown.total, source::GAZETTEER)
                .with_display_name(Some(display))
                .with_admin(
                    entry
                        .admin_area
                        .as_deref()
                        .map(AdminMetadata::from_admin_area)
                        .unwrap_or_default(),
                )
        });

        trace!(
            target: "gazetteer",
            lookup_name = %lookup_name,
            candidates = scored.len(),
            winner = ?winner,
            "gazetteer scoring complete"
        );

        Ok(GazetteerResolution {
            lookup_name,
            admin_hint,
            expected_era,
            scored,
            winner,
            candidate,
        })
    }
}

/// Weighted score of one entry. Each component is in [0, 1] and the total is
/// clamped to the same range.
pub fn score_entry(
    query_name: &str,
    admin_hint: Option<&str>,
    event_year: Option<i32>,
    family_coords: &[Coordinates],
    entry: &GazetteerEntry,
) -> ScoreBreakdown {
    let text_similarity = strsim::normalized_levenshtein(query_name, &entry.name);
    let admin_similarity = match (admin_hint, entry.admin_area.as_deref()) {
        (Some(hint), Some(area)) if !hint.is_empty() && !area.is_empty() => {
            strsim::normalized_levenshtein(hint, area)
        }
        _ => 0.0,
    };
    let era_overlap = era_overlap(event_year, entry.era_bucket);
    let proximity = proximity(Coordinates::new(entry.latitude, entry.longitude), family_coords);
    let total = (TEXT_WEIGHT * text_similarity
        + ADMIN_WEIGHT * admin_similarity
        + ERA_WEIGHT * era_overlap
        + PROXIMITY_WEIGHT * proximity)
        .clamp(0.0, 1.0);
    ScoreBreakdown {
        text_similarity,
        admin_similarity,
        era_overlap,
        proximity,
        total,
    }
}

pub fn era_overlap(event_year: Option<i32>, candidate: EraBucket) -> f64 {
    if candidate == EraBucket::Unknown {
        return if event_year.is_some() { 0.5 } else { 0.3 };
    }
    if candidate == bucket(event_year) {
        1.0
    } else {
        0.4
    }
}

pub fn proximity(point: Coordinates, family_coords: &[Coordinates]) -> f64 {
    family_coords
        .iter()
        .map(|family| {
            let dlat = point.lat - family.lat;
            let dlng = point.lng - family.lng;
            let distance = (dlat * dlat + LONGITUDE_SCALE * dlng * dlng) / PROXIMITY_SPREAD;
            (1.0 - distance.clamp(0.0, 1.0)).clamp(0.0, 1.0)
        })
        .fold(None, |best: Option<f64>, value| {
            Some(best.map_or(value, |current| current.max(value)))
        })
        .unwrap_or(0.0)
}

/// Index of the strictly highest total; earlier candidates win ties.
pub fn pick_winner(scored: &[ScoredCandidate]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (index, candidate) in scored.iter().enumerate() {
        match best {
            Some((_, score)) if candidate.breakdown.total <= score => {}
            _ => best = Some((index, candidate.breakdown.total)),
        }
    }
    best.map(|(index, _)| index)
}

fn insert_entry(conn: &Connection, entry: &GazetteerEntry) -> AppResult<i64> {
    let name = normalize(&entry.name);
    if name.is_empty() {
        return Err(AppError::Config("gazetteer entry name cannot be empty".into()));
    }
    if !Coordinates::new(entry.latitude, entry.longitude).is_valid() {
        return Err(AppError::Config(format!(
            "gazetteer entry {name} has invalid coordinates"
        )));
    }
    let admin = entry
        .admin_area
        .as_deref()
        .map(normalize)
        .filter(|area| !area.is_empty());
    let metadata = entry
        .metadata
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO gazetteer_entries (name, admin_area, era_bucket, latitude, longitude, source, metadata)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            name,
            admin,
            entry.era_bucket.as_str(),
            entry.latitude,
            entry.longitude,
            entry.source,
            metadata
        ],
    )?;
    let id = conn.last_insert_rowid();
    for alternate in &entry.alternate_names {
        let alternate = normalize(alternate);
        if alternate.is_empty() || alternate == name {
            continue;
        }
        conn.execute(
            "INSERT OR IGNORE INTO gazetteer_alternate_names (entry_id, name) VALUES (?1, ?2)",
            params![id, alternate],
        )?;
    }
    Ok(id)
}

fn load_alternate_names(conn: &Connection, entry_id: i64) -> AppResult<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT name FROM gazetteer_alternate_names WHERE entry_id = ?1 ORDER BY name ASC",
    )?;
    let names = stmt
        .query_map([entry_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names)
}

fn parse_entry(row: &Row<'_>) -> rusqlite::Result<GazetteerEntry> {
    let era: String = row.get(3)?;
    let metadata: Option<String> = row.get(7)?;
    Ok(GazetteerEntry {
        id: row.get(0)?,
        name: row.get(1)?,
        admin_area: row.get(2)?,
        era_bucket: EraBucket::parse(&era),
        latitude: row.get(4)?,
        longitude: row.get(5)?,
        source: row.get(6)?,
        alternate_names: Vec::new(),
        metadata: metadata.and_then(|text| serde_json::from_str(&text).ok()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_in_memory;

    fn entry(name: &str, admin: Option<&str>, era: EraBucket, lat: f64, lng: f64) -> GazetteerEntry {
        GazetteerEntry {
            id: 0,
            name: name.into(),
            admin_area: admin.map(str::to_string),
            era_bucket: era,
            latitude: lat,
            longitude: lng,
            source: "test".into(),
            alternate_names: Vec::new(),
            metadata: None,
        }
    }

    fn store() -> GazetteerStore {
        GazetteerStore::new(open_in_memory().unwrap())
    }

    #[test]
    fn era_overlap_follows_bucket_rules() {
        assert_eq!(era_overlap(Some(1860), EraBucket::From1800To1890), 1.0);
        assert_eq!(era_overlap(Some(1860), EraBucket::From1890To1950), 0.4);
        assert_eq!(era_overlap(Some(1860), EraBucket::Unknown), 0.5);
        assert_eq!(era_overlap(None, EraBucket::Unknown), 0.3);
        assert_eq!(era_overlap(None, EraBucket::Pre1800), 0.4);
    }

    #[test]
    fn proximity_uses_nearest_family_location() {
        let point = Coordinates::new(33.0, -90.0);
        assert_eq!(proximity(point, &[]), 0.0);
        assert_eq!(proximity(point, &[Coordinates::new(33.0, -90.0)]), 1.0);
        let near = proximity(
            point,
            &[Coordinates::new(60.0, 10.0), Coordinates::new(34.0, -91.0)],
        );
        assert!((near - (1.0 - 1.6 / 100.0)).abs() < 1e-9);
        assert_eq!(proximity(point, &[Coordinates::new(60.0, 10.0)]), 0.0);
    }

    #[test]
    fn weights_components() {
        let candidate = entry("ackerman", Some("choctaw, mississippi"), EraBucket::From1890To1950, 33.3, -89.2);
        let breakdown = score_entry(
            "ackerman",
            Some("choctaw, mississippi"),
            Some(1900),
            &[Coordinates::new(33.3, -89.2)],
            &candidate,
        );
        assert_eq!(breakdown.text_similarity, 1.0);
        assert_eq!(breakdown.admin_similarity, 1.0);
        assert_eq!(breakdown.era_overlap, 1.0);
        assert_eq!(breakdown.proximity, 1.0);
        assert!((breakdown.total - 1.0).abs() < 1e-9);

        let bare = score_entry("ackerman", None, None, &[], &candidate);
        assert!((bare.total - (0.5 + 0.2 * 0.4)).abs() < 1e-9);
    }

    #[test]
    fn picks_first_of_tied_candidates() {
        let scored = (0..3)
            .map(|i| ScoredCandidate {
                entry_id: i,
                name: "x".into(),
                admin_area: None,
                era_bucket: EraBucket::Unknown,
                coordinates: Coordinates::new(0.0, 0.0),
                breakdown: ScoreBreakdown {
                    text_similarity: 1.0,
                    admin_similarity: 0.0,
                    era_overlap: 0.3,
                    proximity: 0.0,
                    total: if i == 0 { 0.5 } else { 0.7 },
                },
            })
            .collect::<Vec<_>>();
        assert_eq!(pick_winner(&scored), Some(1));
        assert_eq!(pick_winner(&[]), None);
    }

    #[test]
    fn era_decides_between_same_named_entries() {
        let store = store();
        store
            .load_entries(vec![
                entry("greenville", Some("washington, mississippi"), EraBucket::From1800To1890, 33.41, -91.06),
                entry("greenville", Some("washington, mississippi"), EraBucket::From1890To1950, 33.40, -91.03),
            ])
            .unwrap();

        let query = GazetteerQuery {
            normalized_name: "greenville",
            admin_hint: Some("Washington, Mississippi"),
            event_year: Some(1870),
            family_coords: &[],
        };
        let resolution = store.resolve(&query).unwrap();
        assert_eq!(resolution.scored.len(), 2);
        let winner = resolution.winner().unwrap();
        assert_eq!(winner.era_bucket, EraBucket::From1800To1890);
        let total = winner.breakdown.total;
        let candidate = resolution.candidate.clone().unwrap();
        assert_eq!(candidate.source, source::GAZETTEER);
        assert!((candidate.confidence - total).abs() < 1e-12);
    }

    #[test]
    fn distant_eras_stay_candidates_but_score_lower() {
        let store = store();
        store
            .load_entries(vec![
                entry("tutwiler", None, EraBucket::From1950To2000, 34.01, -90.43),
                entry("fort smith", None, EraBucket::Pre1800, 35.38, -94.42),
                entry("fort smith", None, EraBucket::From2000To2025, 35.39, -94.40),
            ])
            .unwrap();
        assert_eq!(store.candidates("fort smith").unwrap().len(), 2);

        let lone = GazetteerQuery {
            normalized_name: "tutwiler",
            admin_hint: None,
            event_year: Some(1850),
            family_coords: &[],
        };
        let resolution = store.resolve(&lone).unwrap();
        let candidate = resolution.candidate.clone().unwrap();
        assert_eq!(candidate.coordinates, Coordinates::new(34.01, -90.43));
        assert!((resolution.scored[0].breakdown.era_overlap - 0.4).abs() < 1e-12);

        let modern = GazetteerQuery {
            normalized_name: "fort smith",
            admin_hint: None,
            event_year: Some(2010),
            family_coords: &[],
        };
        let resolution = store.resolve(&modern).unwrap();
        assert_eq!(resolution.winner().unwrap().era_bucket, EraBucket::From2000To2025);
    }

    #[test]
    fn falls_back_to_leading_segment_with_implicit_admin() {
        let store = store();
        store
            .load_entries(vec![
                entry("beat 2", Some("bolivar county, mississippi"), EraBucket::From1890To1950, 33.8, -90.8),
                entry("beat 2", Some("sunflower county, mississippi"), EraBucket::From1890To1950, 33.5, -90.5),
            ])
            .unwrap();
        let query = GazetteerQuery {
            normalized_name: "beat 2, sunflower county, mississippi",
            admin_hint: None,
            event_year: Some(1910),
            family_coords: &[],
        };
        let resolution = store.resolve(&query).unwrap();
        assert_eq!(resolution.lookup_name, "beat 2");
        assert_eq!(
            resolution.admin_hint.as_deref(),
            Some("sunflower county, mississippi")
        );
        let candidate = resolution.candidate.unwrap();
        assert_eq!(candidate.coordinates, Coordinates::new(33.5, -90.5));
        assert_eq!(candidate.admin.admin2.as_deref(), Some("sunflower county"));
    }

    #[test]
    fn matches_alternate_names_with_lower_text_score() {
        let store = store();
        let mut fort = entry("fort smith", Some("sebastian, arkansas"), EraBucket::Unknown, 35.38, -94.42);
        fort.alternate_names = vec!["Belle Point".into()];
        store.insert(&fort).unwrap();

        let resolution = store
            .resolve(&GazetteerQuery {
                normalized_name: "belle point",
                ..GazetteerQuery::default()
            })
            .unwrap();
        let winner = resolution.winner().unwrap();
        assert_eq!(winner.name, "fort smith");
        assert!(winner.breakdown.text_similarity < 1.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let store = store();
        store
            .load_entries(vec![
                entry("salem", Some("marion, oregon"), EraBucket::Unknown, 44.94, -123.03),
                entry("salem", Some("essex, massachusetts"), EraBucket::Unknown, 42.52, -70.89),
                entry("salem", None, EraBucket::Unknown, 37.29, -80.05),
            ])
            .unwrap();
        let family = [Coordinates::new(42.0, -71.0)];
        let query = GazetteerQuery {
            normalized_name: "salem",
            admin_hint: None,
            event_year: None,
            family_coords: &family,
        };
        let first = store.resolve(&query).unwrap().winner;
        for _ in 0..5 {
            assert_eq!(store.resolve(&query).unwrap().winner, first);
        }
        assert_eq!(first, Some(1));
    }

    #[test]
    fn rejects_invalid_entries() {
        let store = store();
        assert!(store.insert(&entry("  ", None, EraBucket::Unknown, 0.0, 0.0)).is_err());
        assert!(store.insert(&entry("nowhere", None, EraBucket::Unknown, 100.0, 0.0)).is_err());
        assert_eq!(store.count().unwrap(), 0);
    }
}
