use std::path::PathBuf;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_FAILURE_TTL_SECS: u64 = 3600;
pub const DEFAULT_GOOGLE_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_NOMINATIM_ENDPOINT: &str = "https://nominatim.openstreetmap.org/search";
const DEFAULT_FUZZY_THRESHOLD: f64 = 0.90;
const DEFAULT_HISTORICAL_CONFIDENCE: f64 = 0.95;
const DEFAULT_VAGUE_CONFIDENCE: f64 = 0.1;
const MAX_TIMEOUT_SECS: u64 = 9;
const MAX_RETRIES: u32 = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub database_file_name: String,
    pub manual_fixes_path: PathBuf,
    pub historical_lookup_path: PathBuf,
    pub gazetteer_path: PathBuf,
    pub overrides_required: bool,
    pub legacy_cache_path: Option<PathBuf>,
    pub failure_cache_ttl_secs: u64,
    pub fuzzy_match_threshold: f64,
    pub historical_confidence: f64,
    pub vague_confidence: f64,
    pub google_api_key: Option<SecretString>,
    pub google_endpoint: String,
    pub nominatim_endpoint: String,
    pub user_agent: String,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_retries: u32,
    pub geocoder_backoff_ms: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub data_dir: String,
    pub database_file_name: String,
    pub manual_fixes_path: String,
    pub historical_lookup_path: String,
    pub gazetteer_path: String,
    pub failure_cache_ttl_secs: u64,
    pub fuzzy_match_threshold: f64,
    pub nominatim_endpoint: String,
    pub geocoder_rate_limit_qps: u32,
    pub geocoder_timeout_secs: u64,
    pub geocoder_max_retries: u32,
    pub has_google_key: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        let data_dir = env::var("DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("data"));
        let mut config = Self::with_data_dir(&data_dir);

        if let Ok(name) = env::var("DATABASE_FILE_NAME") {
            config.database_file_name = name;
        }
        if let Ok(path) = env::var("MANUAL_FIXES_PATH") {
            config.manual_fixes_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("HISTORICAL_LOOKUP_PATH") {
            config.historical_lookup_path = PathBuf::from(path);
        }
        if let Ok(path) = env::var("GAZETTEER_PATH") {
            config.gazetteer_path = PathBuf::from(path);
        }
        config.overrides_required = parse_bool("OVERRIDES_REQUIRED", false);
        config.legacy_cache_path = env::var("LEGACY_CACHE_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);
        config.failure_cache_ttl_secs =
            parse_u64("FAILURE_CACHE_TTL_SECS", DEFAULT_FAILURE_TTL_SECS);
        config.fuzzy_match_threshold =
            parse_f64("FUZZY_MATCH_THRESHOLD", DEFAULT_FUZZY_THRESHOLD).clamp(0.0, 1.0);
        config.historical_confidence =
            parse_f64("HISTORICAL_CONFIDENCE", DEFAULT_HISTORICAL_CONFIDENCE).clamp(0.0, 1.0);
        config.vague_confidence =
            parse_f64("VAGUE_CONFIDENCE", DEFAULT_VAGUE_CONFIDENCE).clamp(0.0, 1.0);
        config.google_api_key = env::var("GOOGLE_GEOCODING_API_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(SecretString::from);
        if let Ok(endpoint) = env::var("GOOGLE_GEOCODING_ENDPOINT") {
            config.google_endpoint = endpoint;
        }
        if let Ok(endpoint) = env::var("NOMINATIM_ENDPOINT") {
            config.nominatim_endpoint = endpoint;
        }
        if let Ok(agent) = env::var("GEOCODER_USER_AGENT") {
            config.user_agent = agent;
        }
        config.geocoder_rate_limit_qps = parse_u32("GEOCODER_RATE_LIMIT_QPS", 1).max(1);
        config.geocoder_timeout_secs =
            parse_u64("GEOCODER_TIMEOUT_SECS", 5).clamp(1, MAX_TIMEOUT_SECS);
        config.geocoder_max_retries = parse_u32("GEOCODER_MAX_RETRIES", 3).clamp(1, MAX_RETRIES);
        config.geocoder_backoff_ms = parse_u64("GEOCODER_BACKOFF_MS", 500);
        config
    }

    /// Defaults rooted at `data_dir`, without consulting the environment.
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            manual_fixes_path: data_dir.join("manual_fixes.json"),
            historical_lookup_path: data_dir.join("historical_places.json"),
            gazetteer_path: data_dir.join("gazetteer.json"),
            data_dir,
            database_file_name: "place-resolver.db".to_string(),
            overrides_required: false,
            legacy_cache_path: None,
            failure_cache_ttl_secs: DEFAULT_FAILURE_TTL_SECS,
            fuzzy_match_threshold: DEFAULT_FUZZY_THRESHOLD,
            historical_confidence: DEFAULT_HISTORICAL_CONFIDENCE,
            vague_confidence: DEFAULT_VAGUE_CONFIDENCE,
            google_api_key: None,
            google_endpoint: DEFAULT_GOOGLE_ENDPOINT.to_string(),
            nominatim_endpoint: DEFAULT_NOMINATIM_ENDPOINT.to_string(),
            user_agent: format!("gedcom-place-resolver/{}", env!("CARGO_PKG_VERSION")),
            geocoder_rate_limit_qps: 1,
            geocoder_timeout_secs: 5,
            geocoder_max_retries: 3,
            geocoder_backoff_ms: 500,
        }
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            data_dir: self.data_dir.to_string_lossy().to_string(),
            database_file_name: self.database_file_name.clone(),
            manual_fixes_path: self.manual_fixes_path.to_string_lossy().to_string(),
            historical_lookup_path: self.historical_lookup_path.to_string_lossy().to_string(),
            gazetteer_path: self.gazetteer_path.to_string_lossy().to_string(),
            failure_cache_ttl_secs: self.failure_cache_ttl_secs,
            fuzzy_match_threshold: self.fuzzy_match_threshold,
            nominatim_endpoint: self.nominatim_endpoint.clone(),
            geocoder_rate_limit_qps: self.geocoder_rate_limit_qps,
            geocoder_timeout_secs: self.geocoder_timeout_secs,
            geocoder_max_retries: self.geocoder_max_retries,
            has_google_key: self.google_api_key.is_some(),
        }
    }
}

fn load_dotenv_if_applicable() {
    if !should_load_dotenv() {
        debug!("skipping .env load outside dev mode");
        return;
    }

    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn should_load_dotenv() -> bool {
    cfg!(debug_assertions) || parse_bool("ALLOW_DOTENV", false)
}

fn parse_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(default)
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<f64>().ok())
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}
