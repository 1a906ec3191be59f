use serde::Serialize;
use tracing::debug;

use crate::errors::AppResult;
use crate::locations::{LocationStore, ResolvedLocation};
use crate::models::{source, Candidate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum KnownMatchKind {
    Exact,
    Fuzzy,
}

#[derive(Debug, Clone)]
pub struct KnownMatch {
    pub kind: KnownMatchKind,
    pub similarity: f64,
    pub location_id: i64,
    pub matched_key: String,
    pub candidate: Candidate,
}

/// Reuses coordinates of places resolved earlier. The fuzzy pass is a linear
/// scan over every located row, which is fine for the few thousand distinct
/// places of a family tree and grows linearly beyond that.
#[derive(Clone)]
pub struct KnownLocationMatcher {
    store: LocationStore,
    threshold: f64,
}

impl KnownLocationMatcher {
    pub fn new(store: LocationStore, threshold: f64) -> Self {
        Self {
            store,
            threshold: threshold.clamp(0.0, 1.0),
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn resolve(&self, raw: &str, normalized: &str) -> AppResult<Option<KnownMatch>> {
        if let Some(location) = self.store.find_located_by_raw_name(raw)? {
            return Ok(to_match(location, KnownMatchKind::Exact, 1.0, source::DB));
        }

        for location in self.store.located()? {
            let similarity = strsim::normalized_levenshtein(normalized, &location.normalized_key);
            if similarity >= self.threshold {
                debug!(
                    target: "known_locations",
                    query = normalized,
                    matched = %location.normalized_key,
                    similarity,
                    "fuzzy match against known location"
                );
                return Ok(to_match(
                    location,
                    KnownMatchKind::Fuzzy,
                    similarity,
                    source::DB_FUZZY,
                ));
            }
        }
        Ok(None)
    }
}

fn to_match(
    location: ResolvedLocation,
    kind: KnownMatchKind,
    similarity: f64,
    tag: &str,
) -> Option<KnownMatch> {
    let coordinates = location.coordinates()?;
    let confidence = match kind {
        KnownMatchKind::Exact => location.confidence,
        KnownMatchKind::Fuzzy => location.confidence * similarity,
    };
    Some(KnownMatch {
        kind,
        similarity,
        location_id: location.id,
        matched_key: location.normalized_key.clone(),
        candidate: Candidate::new(coordinates, confidence, tag)
            .with_display_name(location.display_name.clone())
            .with_admin(location.admin.clone()),
    })
}
