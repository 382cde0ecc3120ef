use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use serde::Serialize;
use tracing::debug;

pub const DEFAULT_GEOCODING_ENDPOINT: &str = "https://maps.googleapis.com/maps/api/geocode/json";
pub const DEFAULT_REGION_SUFFIX: &str = "New York, NY";
const DEFAULT_JOURNAL_MAX_BYTES: u64 = 5 * 1024 * 1024;
const DEFAULT_JOURNAL_MAX_FILES: usize = 5;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub geocoding_api_key: Option<SecretString>,
    pub geocoding_endpoint: String,
    pub region_suffix: String,
    pub max_count: usize,
    pub request_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub http_timeout_secs: u64,
    pub journal_enabled: bool,
    pub journal_dir: PathBuf,
    pub journal_batch_size: usize,
    pub journal_max_bytes: u64,
    pub journal_max_files: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct PublicAppConfig {
    pub database_path: String,
    pub has_geocoding_key: bool,
    pub geocoding_endpoint: String,
    pub region_suffix: String,
    pub max_count: usize,
    pub request_delay_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    pub http_timeout_secs: u64,
    pub journal_enabled: bool,
    pub journal_dir: String,
}

impl AppConfig {
    pub fn from_env() -> Self {
        load_dotenv_if_applicable();
        Self {
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("listing-geocoder.db")),
            geocoding_api_key: read_secret("GEOCODING_API_KEY").or_else(|| read_secret("GMAPS_KEY")),
            geocoding_endpoint: env::var("GEOCODING_ENDPOINT")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_GEOCODING_ENDPOINT.to_string()),
            region_suffix: env::var("GEOCODE_REGION_SUFFIX")
                .map(|v| v.trim().to_string())
                .unwrap_or_else(|_| DEFAULT_REGION_SUFFIX.to_string()),
            max_count: parse_usize("GEOCODE_MAX_COUNT", 50),
            request_delay_ms: parse_u64("GEOCODE_DELAY_MS", 100),
            max_attempts: parse_u32("GEOCODE_MAX_ATTEMPTS", 3).max(1),
            backoff_base_ms: parse_u64("GEOCODE_BACKOFF_MS", 250),
            http_timeout_secs: parse_u64("GEOCODE_TIMEOUT_SECS", 10).max(1),
            journal_enabled: parse_bool("JOURNAL_ENABLED", true),
            journal_dir: env::var("JOURNAL_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            journal_batch_size: parse_usize("JOURNAL_BATCH_SIZE", 25).max(1),
            journal_max_bytes: parse_u64("JOURNAL_MAX_BYTES", DEFAULT_JOURNAL_MAX_BYTES),
            journal_max_files: parse_usize("JOURNAL_MAX_FILES", DEFAULT_JOURNAL_MAX_FILES).max(1),
        }
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn public_profile(&self) -> PublicAppConfig {
        PublicAppConfig {
            database_path: self.database_path.to_string_lossy().to_string(),
            has_geocoding_key: self.geocoding_api_key.is_some(),
            geocoding_endpoint: self.geocoding_endpoint.clone(),
            region_suffix: self.region_suffix.clone(),
            max_count: self.max_count,
            request_delay_ms: self.request_delay_ms,
            max_attempts: self.max_attempts,
            backoff_base_ms: self.backoff_base_ms,
            http_timeout_secs: self.http_timeout_secs,
            journal_enabled: self.journal_enabled,
            journal_dir: self.journal_dir.to_string_lossy().to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("listing-geocoder.db"),
            geocoding_api_key: None,
            geocoding_endpoint: DEFAULT_GEOCODING_ENDPOINT.to_string(),
            region_suffix: DEFAULT_REGION_SUFFIX.to_string(),
            max_count: 50,
            request_delay_ms: 100,
            max_attempts: 3,
            backoff_base_ms: 250,
            http_timeout_secs: 10,
            journal_enabled: true,
            journal_dir: PathBuf::from("."),
            journal_batch_size: 25,
            journal_max_bytes: DEFAULT_JOURNAL_MAX_BYTES,
            journal_max_files: DEFAULT_JOURNAL_MAX_FILES,
        }
    }
}

fn read_secret(key: &str) -> Option<SecretString> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(SecretString::from)
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

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_u32(key: &str, default: u32) -> u32 {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<u32>().ok())
        .unwrap_or(default)
}
