use serde::Serialize;

use crate::cache::LegacyImportReport;
use crate::config::PublicAppConfig;

#[derive(Debug, Serialize)]
pub struct ResolverHealth {
    pub db_path: String,
    pub manual_fixes: usize,
    pub historical_entries: usize,
    pub gazetteer_entries: usize,
    pub cached_results: usize,
    pub recorded_attempts: usize,
    pub providers: Vec<String>,
    pub legacy_import: Option<LegacyImportReport>,
    pub config: PublicAppConfig,
}
