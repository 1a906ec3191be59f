use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;

use serde::Deserialize;
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::models::Coordinates;
use crate::normalize::{normalize, split_segments};

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct OverrideEntry {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
}

impl OverrideEntry {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self {
            lat,
            lng,
            display_name: None,
            region: None,
        }
    }

    pub fn named(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn in_region(mut self, region: impl AsRef<str>) -> Self {
        self.region = Some(normalize(region.as_ref())).filter(|r| !r.is_empty());
        self
    }

    pub fn coordinates(&self) -> Coordinates {
        Coordinates::new(self.lat, self.lng)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverrideKind {
    Manual,
    Historical,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OverrideHit {
    pub kind: OverrideKind,
    pub matched_key: String,
    pub entry: OverrideEntry,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    One(OverrideEntry),
    Many(Vec<OverrideEntry>),
}

/// Operator-maintained corrections, immutable once loaded. Keys are
/// normalized on the way in so datasets may be written with raw names.
#[derive(Debug, Clone, Default)]
pub struct OverrideTables {
    manual: HashMap<String, OverrideEntry>,
    historical: HashMap<String, Vec<OverrideEntry>>,
}

impl OverrideTables {
    pub fn load(manual_path: &Path, historical_path: &Path, required: bool) -> AppResult<Self> {
        let mut tables = Self::default();
        if let Some(contents) = read_dataset(manual_path, required)? {
            let parsed: HashMap<String, OverrideEntry> = serde_json::from_str(&contents)
                .map_err(|err| {
                    AppError::Config(format!(
                        "invalid manual fixes dataset {}: {err}",
                        manual_path.display()
                    ))
                })?;
            for (raw, entry) in parsed {
                tables = tables.with_manual(&raw, entry);
            }
        }
        if let Some(contents) = read_dataset(historical_path, required)? {
            let parsed: HashMap<String, OneOrMany> = serde_json::from_str(&contents)
                .map_err(|err| {
                    AppError::Config(format!(
                        "invalid historical dataset {}: {err}",
                        historical_path.display()
                    ))
                })?;
            let mut keys = parsed.into_iter().collect::<Vec<_>>();
            keys.sort_by(|a, b| a.0.cmp(&b.0));
            for (raw, entries) in keys {
                let entries = match entries {
                    OneOrMany::One(entry) => vec![entry],
                    OneOrMany::Many(list) => list,
                };
                for entry in entries {
                    tables = tables.with_historical(&raw, entry);
                }
            }
        }
        info!(
            target: "overrides",
            manual = tables.manual.len(),
            historical = tables.historical.len(),
            "override tables loaded"
        );
        Ok(tables)
    }

    pub fn with_manual(mut self, raw_key: &str, entry: OverrideEntry) -> Self {
        let key = normalize(raw_key);
        if key.is_empty() || !entry.coordinates().is_valid() {
            warn!(target: "overrides", raw_key, "skipping invalid manual fix");
            return self;
        }
        self.manual.insert(key, entry);
        self
    }

    pub fn with_historical(mut self, raw_key: &str, entry: OverrideEntry) -> Self {
        let key = normalize(raw_key);
        if key.is_empty() || !entry.coordinates().is_valid() {
            warn!(target: "overrides", raw_key, "skipping invalid historical entry");
            return self;
        }
        let entry = match entry.region.clone() {
            Some(region) => entry.in_region(region),
            None => entry,
        };
        self.historical.entry(key).or_default().push(entry);
        self
    }

    pub fn manual_count(&self) -> usize {
        self.manual.len()
    }

    pub fn historical_count(&self) -> usize {
        self.historical.values().map(Vec::len).sum()
    }

    pub fn lookup_manual(&self, key: &str) -> Option<OverrideHit> {
        self.manual.get(key).map(|entry| OverrideHit {
            kind: OverrideKind::Manual,
            matched_key: key.to_string(),
            entry: entry.clone(),
        })
    }

    /// Exact key first, then the leading segment. Regional entries are
    /// scoped against the remaining segments of the key plus the segments
    /// of the caller's admin hint.
    pub fn lookup_historical(&self, key: &str, admin_hint: Option<&str>) -> Option<OverrideHit> {
        let segments = split_segments(key);
        let hint = admin_hint.map(normalize).unwrap_or_default();
        let mut context = segments.get(1..).unwrap_or_default().to_vec();
        context.extend(split_segments(&hint));
        let context = context.as_slice();

        if let Some(entry) = self
            .historical
            .get(key)
            .and_then(|entries| pick_regional(entries, context))
        {
            return Some(OverrideHit {
                kind: OverrideKind::Historical,
                matched_key: key.to_string(),
                entry: entry.clone(),
            });
        }

        let first = *segments.first()?;
        if first == key {
            return None;
        }
        let entry = self
            .historical
            .get(first)
            .and_then(|entries| pick_regional(entries, context))?;
        Some(OverrideHit {
            kind: OverrideKind::Historical,
            matched_key: first.to_string(),
            entry: entry.clone(),
        })
    }
}

fn pick_regional<'a>(entries: &'a [OverrideEntry], context: &[&str]) -> Option<&'a OverrideEntry> {
    entries
        .iter()
        .find(|entry| match entry.region.as_deref() {
            Some(region) => context.iter().any(|segment| region_matches(region, segment)),
            None => false,
        })
        .or_else(|| entries.iter().find(|entry| entry.region.is_none()))
}

fn region_matches(region: &str, segment: &str) -> bool {
    segment == region
        || segment
            .strip_prefix(region)
            .map(|rest| rest.starts_with(' '))
            .unwrap_or(false)
}

fn read_dataset(path: &Path, required: bool) -> AppResult<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == io::ErrorKind::NotFound && !required => {
            warn!(
                target: "overrides",
                path = %path.display(),
                "override dataset missing; continuing with empty table"
            );
            Ok(None)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Err(AppError::Path(format!(
            "required override dataset missing: {}",
            path.display()
        ))),
        Err(err) => Err(AppError::Io(err)),
    }
}
