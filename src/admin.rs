use std::io::Write;

use serde::Serialize;
use serde_json::json;
use tracing::{info, warn};

use crate::attempts::{new_resolution_id, GeocodeAttempt};
use crate::cache::CacheRecord;
use crate::errors::{AppError, AppResult};
use crate::locations::ResolvedLocation;
use crate::models::{source, Coordinates, ResolutionStatus};
use crate::resolver::{ResolveRequest, Resolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    Json,
}

impl ExportFormat {
    pub fn parse(value: &str) -> AppResult<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "csv" => Ok(ExportFormat::Csv),
            "json" => Ok(ExportFormat::Json),
            other => Err(AppError::Config(format!("unsupported export format: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryFailure {
    pub id: i64,
    pub raw_name: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrySummary {
    pub processed: usize,
    pub resolved: usize,
    pub still_unresolved: usize,
    pub failures: Vec<RetryFailure>,
}

pub fn list_unresolved(resolver: &Resolver) -> AppResult<Vec<ResolvedLocation>> {
    resolver.locations().with_status(ResolutionStatus::Unresolved)
}

/// Pins a stored location to operator supplied coordinates. The cache is
/// rewritten so later calls for the same key replay the fix.
pub fn apply_manual_fix(
    resolver: &Resolver,
    id: i64,
    lat: f64,
    lng: f64,
) -> AppResult<ResolvedLocation> {
    let coordinates = Coordinates::new(lat, lng);
    let location = resolver.locations().apply_manual_fix(id, coordinates)?;
    resolver.cache().set(
        &location.normalized_key,
        &CacheRecord::located(
            coordinates,
            location.display_name.clone(),
            1.0,
            source::MANUAL,
            ResolutionStatus::ManualOverride,
        ),
    )?;

    let mut attempt = GeocodeAttempt::new(&new_resolution_id(), &location.raw_name, source::MANUAL)
        .with_candidate(Some(coordinates), Some(1.0))
        .winner(true);
    attempt.normalized_name = Some(location.normalized_key.clone());
    attempt.request_payload = Some(json!({ "location_id": id, "operation": "apply_manual_fix" }));
    if let Err(err) = resolver.recorder().record(&attempt) {
        warn!(target: "attempts", ?err, id, "failed to audit manual fix");
    }

    info!(target: "resolver", id, key = %location.normalized_key, "manual fix applied");
    Ok(location)
}

/// Re-resolves every unresolved location. Each location is handled on its
/// own; a failure is reported in the summary and the batch continues.
pub async fn retry_all_unresolved(resolver: &Resolver) -> AppResult<RetrySummary> {
    let pending = list_unresolved(resolver)?;
    let mut summary = RetrySummary::default();

    for location in pending {
        summary.processed += 1;
        if let Err(err) = resolver.cache().invalidate(&location.normalized_key) {
            warn!(target: "resolver", ?err, id = location.id, "could not invalidate cache entry");
            summary.failures.push(RetryFailure {
                id: location.id,
                raw_name: location.raw_name.clone(),
                message: err.to_string(),
            });
            continue;
        }

        let result = resolver
            .resolve(&ResolveRequest::new(location.raw_name.clone()))
            .await;
        if result.status.has_coordinates() {
            summary.resolved += 1;
        } else {
            summary.still_unresolved += 1;
        }
    }

    info!(
        target: "resolver",
        processed = summary.processed,
        resolved = summary.resolved,
        still_unresolved = summary.still_unresolved,
        failures = summary.failures.len(),
        "unresolved retry finished"
    );
    Ok(summary)
}

#[derive(Serialize)]
struct ExportRow<'a> {
    id: i64,
    raw_name: &'a str,
    normalized_key: &'a str,
    latitude: Option<f64>,
    longitude: Option<f64>,
    display_name: Option<&'a str>,
    confidence: f64,
    source: &'a str,
    status: &'static str,
    country: Option<&'a str>,
    admin1: Option<&'a str>,
    admin2: Option<&'a str>,
    alternate_names: String,
    updated_at: &'a str,
}

impl<'a> From<&'a ResolvedLocation> for ExportRow<'a> {
    fn from(location: &'a ResolvedLocation) -> Self {
        Self {
            id: location.id,
            raw_name: &location.raw_name,
            normalized_key: &location.normalized_key,
            latitude: location.latitude,
            longitude: location.longitude,
            display_name: location.display_name.as_deref(),
            confidence: location.confidence,
            source: &location.source,
            status: location.status.as_str(),
            country: location.admin.country.as_deref(),
            admin1: location.admin.admin1.as_deref(),
            admin2: location.admin.admin2.as_deref(),
            alternate_names: location.alternate_names.join("; "),
            updated_at: &location.updated_at,
        }
    }
}

/// Writes every stored location and returns how many were written.
pub fn export_all<W: Write>(
    resolver: &Resolver,
    format: ExportFormat,
    mut writer: W,
) -> AppResult<usize> {
    let locations = resolver.locations().all()?;
    match format {
        ExportFormat::Csv => {
            let mut csv_writer = csv::Writer::from_writer(writer);
            for location in &locations {
                csv_writer.serialize(ExportRow::from(location))?;
            }
            csv_writer.flush()?;
        }
        ExportFormat::Json => {
            serde_json::to_writer_pretty(&mut writer, &locations)?;
            writer.flush()?;
        }
    }
    Ok(locations.len())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::db::open_in_memory;
    use crate::geocoder::ExternalGeocoder;
    use crate::overrides::OverrideTables;
    use crate::resolver::ResolverOptions;

    fn resolver() -> Resolver {
        let options = ResolverOptions {
            failure_ttl: Duration::from_secs(3600),
            ..ResolverOptions::default()
        };
        Resolver::new(
            open_in_memory().unwrap(),
            OverrideTables::default(),
            ExternalGeocoder::disabled(),
            options,
        )
    }

    #[test]
    fn parses_export_formats() {
        assert_eq!(ExportFormat::parse("CSV").unwrap(), ExportFormat::Csv);
        assert_eq!(ExportFormat::parse(" json ").unwrap(), ExportFormat::Json);
        assert!(ExportFormat::parse("xml").is_err());
    }

    #[tokio::test]
    async fn manual_fix_is_replayed_from_cache() {
        let resolver = resolver();
        let first = resolver.resolve(&ResolveRequest::new("Ackerman")).await;
        assert_eq!(first.status, ResolutionStatus::Unresolved);

        let unresolved = list_unresolved(&resolver).unwrap();
        assert_eq!(unresolved.len(), 1);
        let fixed = apply_manual_fix(&resolver, unresolved[0].id, 33.3037, -89.1723).unwrap();
        assert_eq!(fixed.status, ResolutionStatus::ManualOverride);

        let again = resolver.resolve(&ResolveRequest::new("Ackerman")).await;
        assert_eq!(again.status, ResolutionStatus::ManualOverride);
        assert_eq!(again.latitude, Some(33.3037));
        assert_eq!(again.confidence_score, 1.0);
        assert!(list_unresolved(&resolver).unwrap().is_empty());
    }

    #[test]
    fn manual_fix_rejects_unknown_ids_and_bad_coordinates() {
        let resolver = resolver();
        assert!(matches!(
            apply_manual_fix(&resolver, 99, 1.0, 1.0),
            Err(AppError::NotFound(99))
        ));
        assert!(matches!(
            apply_manual_fix(&resolver, 99, 120.0, 1.0),
            Err(AppError::Config(_))
        ));
    }

    #[tokio::test]
    async fn retry_reports_progress_for_every_location() {
        let resolver = resolver();
        resolver.resolve(&ResolveRequest::new("Atlantis")).await;
        resolver.resolve(&ResolveRequest::new("Lemuria")).await;

        let summary = retry_all_unresolved(&resolver).await.unwrap();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.resolved, 0);
        assert_eq!(summary.still_unresolved, 2);
        assert!(summary.failures.is_empty());
    }

    #[tokio::test]
    async fn exports_csv_and_json() {
        let resolver = resolver();
        resolver.resolve(&ResolveRequest::new("Atlantis")).await;
        resolver.resolve(&ResolveRequest::new("Ohio")).await;

        let mut csv_out = Vec::new();
        assert_eq!(export_all(&resolver, ExportFormat::Csv, &mut csv_out).unwrap(), 2);
        let text = String::from_utf8(csv_out).unwrap();
        let mut lines = text.lines();
        assert!(lines.next().unwrap().starts_with("id,raw_name,normalized_key"));
        assert!(text.contains("Atlantis"));
        assert!(text.contains("vague"));

        let mut json_out = Vec::new();
        export_all(&resolver, ExportFormat::Json, &mut json_out).unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&json_out).unwrap();
        assert_eq!(parsed.as_array().unwrap().len(), 2);
        assert_eq!(parsed[1]["status"], "vague");
    }
}
