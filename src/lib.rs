mod admin;
mod attempts;
mod cache;
mod config;
mod db;
mod era;
mod errors;
mod gazetteer;
mod geocoder;
mod health;
mod known;
mod locations;
mod models;
mod normalize;
mod overrides;
mod resolver;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::OnceCell;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use admin::{
    apply_manual_fix, export_all, list_unresolved, retry_all_unresolved, ExportFormat,
    RetryFailure, RetrySummary,
};
pub use attempts::{new_resolution_id, AttemptRecorder, GeocodeAttempt};
pub use cache::{CacheRecord, LegacyImportReport, ResultCache, CACHE_SCHEMA_VERSION};
pub use config::{AppConfig, PublicAppConfig};
pub use db::{bootstrap, open_in_memory, DatabaseContext, SharedConnection};
pub use era::{bucket, parse_year, EraBucket};
pub use errors::{AppError, AppResult};
pub use gazetteer::{
    GazetteerEntry, GazetteerQuery, GazetteerResolution, GazetteerStore, ScoreBreakdown,
    ScoredCandidate,
};
pub use geocoder::{
    ExternalGeocoder, ExternalOutcome, GeocodeProvider, GoogleGeocoder, NominatimGeocoder,
    ProviderAttempt, RateLimiter, RetryPolicy,
};
pub use health::ResolverHealth;
pub use known::{KnownLocationMatcher, KnownMatch, KnownMatchKind};
pub use locations::{LocationStore, ResolvedLocation};
pub use models::{source, AdminMetadata, Candidate, Coordinates, ResolutionStatus};
pub use normalize::{classify, is_vague, normalize, NormalizedPlace};
pub use overrides::{OverrideEntry, OverrideTables};
pub use resolver::{LocationResult, ResolveRequest, Resolver, ResolverOptions};

/// Everything a host process needs to resolve places, built once at startup.
pub struct ResolverState {
    resolver: Arc<Resolver>,
    db_path: PathBuf,
    config: AppConfig,
    legacy_import: Option<LegacyImportReport>,
}

impl ResolverState {
    pub fn initialize(config: AppConfig) -> AppResult<Self> {
        init_tracing();
        let context = bootstrap(&config.data_dir, &config.database_file_name)?;
        let path = context.path.clone();
        let db = context.into_shared();

        let overrides = OverrideTables::load(
            &config.manual_fixes_path,
            &config.historical_lookup_path,
            config.overrides_required,
        )?;
        let external = ExternalGeocoder::from_config(&config)?;
        let resolver = Resolver::new(
            db,
            overrides,
            external,
            ResolverOptions::from_config(&config),
        );

        hydrate_gazetteer(&resolver, &config)?;
        let legacy_import = migrate_legacy_cache(&resolver, &config);
        match resolver.cache().purge_expired() {
            Ok(purged) => debug!(target: "result_cache", purged, "startup purge complete"),
            Err(err) => warn!(target: "result_cache", ?err, "startup purge failed"),
        }

        info!(
            target: "resolver",
            db = %path.display(),
            providers = ?resolver.external().provider_names(),
            "place resolver ready"
        );
        Ok(Self {
            resolver: Arc::new(resolver),
            db_path: path,
            config,
            legacy_import,
        })
    }

    pub fn resolver(&self) -> Arc<Resolver> {
        Arc::clone(&self.resolver)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Re-reads the override datasets from their configured paths.
    pub fn reload_overrides(&self) -> AppResult<()> {
        let tables = OverrideTables::load(
            &self.config.manual_fixes_path,
            &self.config.historical_lookup_path,
            self.config.overrides_required,
        )?;
        self.resolver.reload_overrides(tables);
        Ok(())
    }

    pub fn health(&self) -> AppResult<ResolverHealth> {
        let overrides = self.resolver.overrides();
        Ok(ResolverHealth {
            db_path: self.db_path.to_string_lossy().to_string(),
            manual_fixes: overrides.manual_count(),
            historical_entries: overrides.historical_count(),
            gazetteer_entries: self.resolver.gazetteer().count()?,
            cached_results: self.resolver.cache().len()?,
            recorded_attempts: self.resolver.recorder().count()?,
            providers: self
                .resolver
                .external()
                .provider_names()
                .into_iter()
                .map(str::to_string)
                .collect(),
            legacy_import: self.legacy_import,
            config: self.config.public_profile(),
        })
    }
}

fn hydrate_gazetteer(resolver: &Resolver, config: &AppConfig) -> AppResult<()> {
    if resolver.gazetteer().count()? > 0 {
        return Ok(());
    }
    match resolver.gazetteer().load_json_file(&config.gazetteer_path) {
        Ok(count) => {
            info!(target: "gazetteer", count, path = %config.gazetteer_path.display(), "gazetteer hydrated");
            Ok(())
        }
        Err(AppError::Io(err)) if err.kind() == io::ErrorKind::NotFound => {
            debug!(
                target: "gazetteer",
                path = %config.gazetteer_path.display(),
                "no gazetteer dataset; continuing with empty gazetteer"
            );
            Ok(())
        }
        Err(err) => Err(err),
    }
}

fn migrate_legacy_cache(resolver: &Resolver, config: &AppConfig) -> Option<LegacyImportReport> {
    let path = config.legacy_cache_path.as_ref()?;
    match resolver.cache().import_legacy_file(path) {
        Ok(report) => Some(report),
        Err(err) => {
            warn!(target: "result_cache", ?err, path = %path.display(), "legacy cache migration failed");
            None
        }
    }
}

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,place_resolver=debug"));
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
    });
}
