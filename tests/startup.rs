use std::fs;
use std::path::Path;

use httptest::matchers::{all_of, contains, request, url_decoded};
use httptest::responders::json_encoded;
use httptest::{Expectation, Server};
use serde_json::json;
use tempfile::tempdir;

use place_resolver::{
    export_all, retry_all_unresolved, AppConfig, AppError, ExportFormat, LegacyImportReport,
    ResolutionStatus, ResolveRequest, ResolverState,
};

fn write_datasets(dir: &Path) {
    fs::write(
        dir.join("manual_fixes.json"),
        json!({
            "Ackerman, Choctaw, Mississippi, USA": {"lat": 33.3037, "lng": -89.1723, "display_name": "Ackerman, MS"}
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("historical_places.json"),
        json!({ "Beat 2": {"lat": 33.5, "lng": -90.5} }).to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("gazetteer.json"),
        json!([
            {"name": "Greenville", "admin_area": "Washington County, Mississippi",
             "era_bucket": "1800_1890", "latitude": 33.41, "longitude": -91.06, "source": "gnis"},
            {"name": "Doddsville", "admin_area": "Sunflower County, Mississippi",
             "latitude": 33.66, "longitude": -90.52, "source": "gnis",
             "alternate_names": ["Dodds Ville"]}
        ])
        .to_string(),
    )
    .unwrap();
}

fn offline_config(dir: &Path) -> AppConfig {
    let mut config = AppConfig::with_data_dir(dir);
    config.nominatim_endpoint = "http://127.0.0.1:9/search".to_string();
    config.geocoder_timeout_secs = 1;
    config.geocoder_max_retries = 1;
    config.geocoder_backoff_ms = 1;
    config
}

#[tokio::test]
async fn initialize_loads_datasets_and_reports_health() {
    let dir = tempdir().unwrap();
    write_datasets(dir.path());
    let legacy = dir.path().join("legacy_cache.json");
    fs::write(
        &legacy,
        json!({"Natchez": [31.56, -91.40, "Natchez, MS"], "Broken": "oops"}).to_string(),
    )
    .unwrap();

    let mut config = offline_config(dir.path());
    config.legacy_cache_path = Some(legacy);
    let state = ResolverState::initialize(config).unwrap();

    let health = state.health().unwrap();
    assert_eq!(health.manual_fixes, 1);
    assert_eq!(health.historical_entries, 1);
    assert_eq!(health.gazetteer_entries, 2);
    assert_eq!(health.cached_results, 1);
    assert_eq!(
        health.legacy_import,
        Some(LegacyImportReport {
            imported: 1,
            skipped: 1
        })
    );
    assert_eq!(health.providers, vec!["nominatim".to_string()]);
    assert!(!health.config.has_google_key);

    let resolver = state.resolver();
    let natchez = resolver.resolve(&ResolveRequest::new("Natchez")).await;
    assert_eq!(natchez.source, "legacy");
    assert_eq!(natchez.latitude, Some(31.56));

    let alternate = resolver.resolve(&ResolveRequest::new("Dodds Ville")).await;
    assert_eq!(alternate.source, "gazetteer");
    assert_eq!(alternate.latitude, Some(33.66));

    let ackerman = resolver
        .resolve(&ResolveRequest::new("Ackerman, Choctaw, Mississippi, USA"))
        .await;
    assert_eq!(ackerman.status, ResolutionStatus::ManualOverride);
    assert_eq!(ackerman.display_name.as_deref(), Some("Ackerman, MS"));
}

#[tokio::test]
async fn nominatim_answers_are_cached_end_to_end() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of!(
            request::method("GET"),
            request::path("/search"),
            request::query(url_decoded(contains(("q", "greenwood, leflore, mississippi"))))
        ))
        .times(1)
        .respond_with(json_encoded(json!([{
            "lat": "33.5162",
            "lon": "-90.1795",
            "display_name": "Greenwood, Leflore County, Mississippi, United States",
            "importance": 0.6
        }]))),
    );

    let dir = tempdir().unwrap();
    let mut config = offline_config(dir.path());
    config.nominatim_endpoint = server.url("/search").to_string();
    config.geocoder_rate_limit_qps = 10;
    let state = ResolverState::initialize(config).unwrap();
    let resolver = state.resolver();

    let request = ResolveRequest::new("Greenwood, Leflore, Mississippi, USA").with_year(Some(1905));
    let first = resolver.resolve(&request).await;
    assert_eq!(first.status, ResolutionStatus::Ok);
    assert_eq!(first.source, "nominatim");
    assert_eq!(first.latitude, Some(33.5162));

    let second = resolver.resolve(&request).await;
    assert_eq!(second.confidence_label, "cache");
    assert_eq!(second.latitude, first.latitude);

    let audit = resolver
        .recorder()
        .attempts_for("Greenwood, Leflore, Mississippi, USA")
        .unwrap();
    assert!(audit.iter().any(|a| a.provider == "nominatim" && a.is_winner));
    assert!(audit.iter().any(|a| a.provider == "cache"));
}

#[tokio::test]
async fn unreachable_providers_degrade_to_unresolved() {
    let dir = tempdir().unwrap();
    let state = ResolverState::initialize(offline_config(dir.path())).unwrap();
    let resolver = state.resolver();

    let result = resolver.resolve(&ResolveRequest::new("Atlantis")).await;
    assert_eq!(result.status, ResolutionStatus::Unresolved);
    assert!(result.latitude.is_none());

    let summary = retry_all_unresolved(&resolver).await.unwrap();
    assert_eq!(summary.processed, 1);
    assert_eq!(summary.still_unresolved, 1);

    let mut out = Vec::new();
    assert_eq!(export_all(&resolver, ExportFormat::Json, &mut out).unwrap(), 1);
}

#[test]
fn missing_required_overrides_fail_startup() {
    let dir = tempdir().unwrap();
    let mut config = offline_config(dir.path());
    config.overrides_required = true;
    let err = ResolverState::initialize(config).err().unwrap();
    assert!(matches!(err, AppError::Path(_)));
}

#[tokio::test]
async fn reloaded_overrides_take_effect() {
    let dir = tempdir().unwrap();
    let state = ResolverState::initialize(offline_config(dir.path())).unwrap();
    assert_eq!(state.health().unwrap().manual_fixes, 0);

    write_datasets(dir.path());
    state.reload_overrides().unwrap();
    assert_eq!(state.health().unwrap().manual_fixes, 1);

    let result = state
        .resolver()
        .resolve(&ResolveRequest::new("Beat 2, Sunflower County, Mississippi"))
        .await;
    assert_eq!(result.status, ResolutionStatus::Historical);
    assert_eq!(result.latitude, Some(33.5));
}
