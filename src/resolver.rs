use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::attempts::{new_resolution_id, AttemptRecorder, GeocodeAttempt};
use crate::cache::{CacheRecord, ResultCache};
use crate::config::AppConfig;
use crate::db::{now_timestamp, SharedConnection};
use crate::era::{bucket, EraBucket};
use crate::gazetteer::{GazetteerQuery, GazetteerStore};
use crate::geocoder::ExternalGeocoder;
use crate::known::KnownLocationMatcher;
use crate::locations::{LocationStore, LocationUpsert};
use crate::models::{source, AdminMetadata, Candidate, Coordinates, ResolutionStatus};
use crate::normalize::{classify, is_vague, NormalizedPlace};
use crate::overrides::{OverrideHit, OverrideTables};

#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub raw_place: String,
    pub event_year: Option<i32>,
    pub admin_hint: Option<String>,
    pub family_coords: Vec<Coordinates>,
}

impl ResolveRequest {
    pub fn new(raw_place: impl Into<String>) -> Self {
        Self {
            raw_place: raw_place.into(),
            ..Self::default()
        }
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.event_year = year;
        self
    }

    pub fn with_admin_hint(mut self, hint: impl Into<String>) -> Self {
        self.admin_hint = Some(hint.into());
        self
    }

    pub fn with_family_coords(mut self, coords: Vec<Coordinates>) -> Self {
        self.family_coords = coords;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocationResult {
    pub raw_name: String,
    pub normalized_name: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub display_name: Option<String>,
    pub confidence_score: f64,
    pub confidence_label: String,
    pub status: ResolutionStatus,
    pub source: String,
    pub timestamp: String,
}

impl LocationResult {
    pub fn coordinates(&self) -> Option<Coordinates> {
        match (self.latitude, self.longitude) {
            (Some(lat), Some(lng)) => Some(Coordinates::new(lat, lng)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ResolverOptions {
    pub failure_ttl: Duration,
    pub fuzzy_threshold: f64,
    pub historical_confidence: f64,
    pub vague_confidence: f64,
}

impl ResolverOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            failure_ttl: Duration::from_secs(config.failure_cache_ttl_secs),
            fuzzy_threshold: config.fuzzy_match_threshold,
            historical_confidence: config.historical_confidence,
            vague_confidence: config.vague_confidence,
        }
    }
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::with_data_dir("data"))
    }
}

struct Outcome {
    status: ResolutionStatus,
    coordinates: Option<Coordinates>,
    display_name: Option<String>,
    confidence: f64,
    source: String,
    label: String,
    admin: AdminMetadata,
    cacheable: bool,
}

impl Outcome {
    fn computed(candidate: Candidate) -> Self {
        Self {
            status: ResolutionStatus::Ok,
            coordinates: Some(candidate.coordinates),
            display_name: candidate.display_name,
            confidence: candidate.confidence,
            label: candidate.source.clone(),
            source: candidate.source,
            admin: candidate.admin,
            cacheable: true,
        }
    }

    fn unresolved() -> Self {
        Self {
            status: ResolutionStatus::Unresolved,
            coordinates: None,
            display_name: None,
            confidence: 0.0,
            source: source::NONE.to_string(),
            label: source::NONE.to_string(),
            admin: AdminMetadata::default(),
            cacheable: true,
        }
    }

    fn from_override(hit: OverrideHit, status: ResolutionStatus, confidence: f64, tag: &str) -> Self {
        Self {
            status,
            coordinates: Some(hit.entry.coordinates()),
            display_name: hit.entry.display_name,
            confidence,
            source: tag.to_string(),
            label: tag.to_string(),
            admin: AdminMetadata::default(),
            cacheable: false,
        }
    }

    fn from_cache(record: CacheRecord) -> Self {
        Self {
            status: record.status,
            coordinates: record.coordinates(),
            display_name: record.display_name,
            confidence: record.confidence,
            source: record.provider,
            label: source::CACHE.to_string(),
            admin: AdminMetadata::default(),
            cacheable: false,
        }
    }
}

struct Resolution<'a> {
    id: String,
    request: &'a ResolveRequest,
    key: String,
    era: EraBucket,
}

impl Resolution<'_> {
    fn attempt(&self, provider: &str) -> GeocodeAttempt {
        let mut attempt = GeocodeAttempt::new(&self.id, &self.request.raw_place, provider);
        attempt.normalized_name = Some(self.key.clone());
        attempt.admin_hint = self.request.admin_hint.clone();
        attempt.era_bucket = self.era;
        attempt
    }
}

/// The resolution pipeline. Stages run in a fixed order and the first hit
/// wins: vague check, manual fixes, historical entries, result cache, known
/// locations, gazetteer, external providers.
pub struct Resolver {
    options: ResolverOptions,
    overrides: RwLock<Arc<OverrideTables>>,
    cache: ResultCache,
    known: KnownLocationMatcher,
    gazetteer: GazetteerStore,
    locations: LocationStore,
    recorder: AttemptRecorder,
    external: ExternalGeocoder,
}

impl Resolver {
    pub fn new(
        db: SharedConnection,
        overrides: OverrideTables,
        external: ExternalGeocoder,
        options: ResolverOptions,
    ) -> Self {
        let locations = LocationStore::new(db.clone());
        Self {
            options,
            overrides: RwLock::new(Arc::new(overrides)),
            cache: ResultCache::new(db.clone(), options.failure_ttl),
            known: KnownLocationMatcher::new(locations.clone(), options.fuzzy_threshold),
            gazetteer: GazetteerStore::new(db.clone()),
            locations,
            recorder: AttemptRecorder::new(db),
            external,
        }
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn gazetteer(&self) -> &GazetteerStore {
        &self.gazetteer
    }

    pub fn locations(&self) -> &LocationStore {
        &self.locations
    }

    pub fn recorder(&self) -> &AttemptRecorder {
        &self.recorder
    }

    pub fn external(&self) -> &ExternalGeocoder {
        &self.external
    }

    pub fn options(&self) -> ResolverOptions {
        self.options
    }

    pub fn overrides(&self) -> Arc<OverrideTables> {
        self.overrides.read().clone()
    }

    /// Swaps in freshly loaded override tables; calls already running keep
    /// the tables they started with.
    pub fn reload_overrides(&self, tables: OverrideTables) {
        info!(
            target: "resolver",
            manual = tables.manual_count(),
            historical = tables.historical_count(),
            "override tables replaced"
        );
        *self.overrides.write() = Arc::new(tables);
    }

    pub async fn resolve(&self, request: &ResolveRequest) -> LocationResult {
        let key = match classify(&request.raw_place) {
            NormalizedPlace::Empty => {
                debug!(target: "resolver", "blank place string");
                return LocationResult {
                    raw_name: request.raw_place.clone(),
                    normalized_name: String::new(),
                    latitude: None,
                    longitude: None,
                    display_name: None,
                    confidence_score: 0.0,
                    confidence_label: source::EMPTY.to_string(),
                    status: ResolutionStatus::Empty,
                    source: source::EMPTY.to_string(),
                    timestamp: now_timestamp(),
                };
            }
            NormalizedPlace::Key(key) => key,
        };

        let resolution = Resolution {
            id: new_resolution_id(),
            request,
            key,
            era: bucket(request.event_year),
        };
        let mut attempts = Vec::new();
        let outcome = self.run_stages(&resolution, &mut attempts).await;
        self.finish(&resolution, outcome, attempts)
    }

    async fn run_stages(
        &self,
        resolution: &Resolution<'_>,
        attempts: &mut Vec<GeocodeAttempt>,
    ) -> Outcome {
        let key = resolution.key.as_str();
        let raw = resolution.request.raw_place.as_str();

        if is_vague(key) {
            debug!(target: "resolver", key, "vague place; skipping lookups");
            attempts.push(resolution.attempt(source::VAGUE).winner(true));
            return Outcome {
                status: ResolutionStatus::Vague,
                coordinates: None,
                display_name: None,
                confidence: self.options.vague_confidence,
                source: source::VAGUE.to_string(),
                label: source::VAGUE.to_string(),
                admin: AdminMetadata::default(),
                cacheable: false,
            };
        }

        let overrides = self.overrides();
        if let Some(hit) = overrides.lookup_manual(key) {
            debug!(target: "resolver", key, "manual fix hit");
            attempts.push(
                resolution
                    .attempt(source::MANUAL)
                    .with_candidate(Some(hit.entry.coordinates()), Some(1.0))
                    .winner(true),
            );
            return Outcome::from_override(hit, ResolutionStatus::ManualOverride, 1.0, source::MANUAL);
        }
        if let Some(hit) =
            overrides.lookup_historical(key, resolution.request.admin_hint.as_deref())
        {
            debug!(target: "resolver", key, matched = %hit.matched_key, "historical entry hit");
            let confidence = self.options.historical_confidence;
            let mut attempt = resolution
                .attempt(source::HISTORICAL)
                .with_candidate(Some(hit.entry.coordinates()), Some(confidence))
                .winner(true);
            attempt.request_payload = Some(json!({ "matched_key": hit.matched_key }));
            attempts.push(attempt);
            return Outcome::from_override(
                hit,
                ResolutionStatus::Historical,
                confidence,
                source::HISTORICAL,
            );
        }
        drop(overrides);

        match self.cache.get(key) {
            Ok(Some(record)) => {
                debug!(target: "resolver", key, provider = %record.provider, "result cache hit");
                let mut attempt = resolution
                    .attempt(source::CACHE)
                    .with_candidate(record.coordinates(), Some(record.confidence))
                    .winner(true);
                attempt.response_payload = serde_json::to_value(&record).ok();
                attempts.push(attempt);
                return Outcome::from_cache(record);
            }
            Ok(None) => {}
            Err(err) => warn!(target: "resolver", ?err, key, "result cache read failed"),
        }

        match self.known.resolve(raw, key) {
            Ok(Some(known)) => {
                debug!(target: "resolver", key, matched = %known.matched_key, kind = ?known.kind, "known location hit");
                let mut attempt = resolution
                    .attempt(&known.candidate.source)
                    .with_candidate(Some(known.candidate.coordinates), Some(known.candidate.confidence))
                    .winner(true);
                attempt.scoring_payload = Some(json!({
                    "matched_key": known.matched_key,
                    "location_id": known.location_id,
                    "similarity": known.similarity,
                    "threshold": self.known.threshold(),
                }));
                attempts.push(attempt);
                return Outcome::computed(known.candidate);
            }
            Ok(None) => {}
            Err(err) => warn!(target: "resolver", ?err, key, "known location lookup failed"),
        }

        let query = GazetteerQuery {
            normalized_name: key,
            admin_hint: resolution.request.admin_hint.as_deref(),
            event_year: resolution.request.event_year,
            family_coords: &resolution.request.family_coords,
        };
        match self.gazetteer.resolve(&query) {
            Ok(gazetteer) => {
                for (index, scored) in gazetteer.scored.iter().enumerate() {
                    let mut attempt = resolution
                        .attempt(source::GAZETTEER)
                        .with_candidate(Some(scored.coordinates), Some(scored.breakdown.total))
                        .winner(gazetteer.winner == Some(index));
                    attempt.request_payload = Some(json!({
                        "lookup_name": gazetteer.lookup_name,
                        "admin_hint": gazetteer.admin_hint,
                        "expected_era": gazetteer.expected_era,
                    }));
                    attempt.scoring_payload = serde_json::to_value(scored).ok();
                    attempts.push(attempt);
                }
                if let Some(candidate) = gazetteer.candidate {
                    debug!(target: "resolver", key, score = candidate.confidence, "gazetteer hit");
                    return Outcome::computed(candidate);
                }
            }
            Err(err) => warn!(target: "resolver", ?err, key, "gazetteer lookup failed"),
        }

        let external = self.external.geocode(key).await;
        for provider_attempt in &external.attempts {
            let candidate = provider_attempt.candidate.as_ref();
            let is_winner = candidate.is_some() && external.winner.as_ref() == candidate;
            let mut attempt = resolution
                .attempt(&provider_attempt.provider)
                .with_candidate(
                    candidate.map(|c| c.coordinates),
                    candidate.map(|c| c.confidence),
                )
                .winner(is_winner);
            attempt.request_payload = Some(json!({
                "query": provider_attempt.query,
                "tries": provider_attempt.tries,
            }));
            attempt.response_payload = Some(match (&provider_attempt.error, candidate) {
                (Some(error), _) => json!({ "error": error }),
                (None, Some(candidate)) => json!(candidate),
                (None, None) => json!({ "results": [] }),
            });
            attempts.push(attempt);
        }
        if let Some(candidate) = external.winner {
            debug!(target: "resolver", key, provider = %candidate.source, "external provider hit");
            return Outcome::computed(candidate);
        }

        debug!(target: "resolver", key, "no stage produced coordinates");
        attempts.push(resolution.attempt(source::NONE).winner(true));
        Outcome::unresolved()
    }

    /// Persistence here is best effort: failures are logged and the
    /// computed result is still returned.
    fn finish(
        &self,
        resolution: &Resolution<'_>,
        outcome: Outcome,
        attempts: Vec<GeocodeAttempt>,
    ) -> LocationResult {
        let key = resolution.key.as_str();
        let raw = resolution.request.raw_place.as_str();

        if outcome.cacheable {
            let record = match outcome.coordinates {
                Some(coordinates) => CacheRecord::located(
                    coordinates,
                    outcome.display_name.clone(),
                    outcome.confidence,
                    outcome.source.clone(),
                    outcome.status,
                ),
                None => CacheRecord::failed(outcome.source.clone()),
            };
            if let Err(err) = self.cache.set(key, &record) {
                warn!(target: "resolver", ?err, key, "result cache write failed");
            }
        }

        let upsert = LocationUpsert {
            raw_name: raw,
            normalized_key: key,
            coordinates: outcome.coordinates,
            display_name: outcome.display_name.as_deref(),
            confidence: outcome.confidence,
            source: &outcome.source,
            status: outcome.status,
            admin: &outcome.admin,
        };
        if let Err(err) = self.locations.upsert(&upsert) {
            warn!(target: "resolver", ?err, key, "failed to persist resolved location");
        }
        if let Err(err) = self.recorder.record_all(&attempts) {
            warn!(target: "attempts", ?err, key, "failed to write geocode attempts");
        }

        LocationResult {
            raw_name: raw.to_string(),
            normalized_name: key.to_string(),
            latitude: outcome.coordinates.map(|c| c.lat),
            longitude: outcome.coordinates.map(|c| c.lng),
            display_name: outcome.display_name,
            confidence_score: outcome.confidence,
            confidence_label: outcome.label,
            status: outcome.status,
            source: outcome.source,
            timestamp: now_timestamp(),
        }
    }
}
