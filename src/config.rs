use crate::error::{AdvisoryError, Result};
use crate::resolver::DEFAULT_FUZZY_MATCH_THRESHOLD;
use crate::sources::{friendsofphp, github};
use dotenvy::dotenv;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Source names accepted in `ADVISORIES__SOURCES`.
pub const KNOWN_SOURCES: &[&str] = &[github::SOURCE_NAME, friendsofphp::SOURCE_NAME];

const DEFAULT_LOCK_TTL_SECS: u64 = 1800;
const DEFAULT_RESCHEDULE_SECS: u64 = 300;

#[derive(Debug, Clone)]
pub struct Config {
    /// Enabled sources, by name.
    pub sources: Vec<String>,
    /// GitHub tokens, used round-robin. May be empty.
    pub github_tokens: Vec<String>,
    pub github_api_url: String,
    /// Composer repository the FriendsOfPHP package is resolved through.
    pub packagist_url: String,
    /// Redis/DragonflyDB URL. Without one, in-process backends are used.
    pub redis_url: Option<String>,
    pub lock_ttl: Duration,
    pub reschedule_delay: Duration,
    pub fuzzy_threshold: u32,
    pub log_to_file: bool,
    pub log_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: KNOWN_SOURCES.iter().map(|s| s.to_string()).collect(),
            github_tokens: Vec::new(),
            github_api_url: github::API_URL.to_string(),
            packagist_url: friendsofphp::PACKAGIST_REPO_URL.to_string(),
            redis_url: None,
            lock_ttl: Duration::from_secs(DEFAULT_LOCK_TTL_SECS),
            reschedule_delay: Duration::from_secs(DEFAULT_RESCHEDULE_SECS),
            fuzzy_threshold: DEFAULT_FUZZY_MATCH_THRESHOLD,
            log_to_file: false,
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Config {
    /// Load `.env` (if any), then read the process environment.
    pub fn from_env() -> Result<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys keep their
    /// defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(raw) = get("ADVISORIES__SOURCES") {
            let mut sources: Vec<String> = Vec::new();
            for name in split_list(&raw) {
                if !KNOWN_SOURCES.contains(&name.as_str()) {
                    return Err(AdvisoryError::config(format!(
                        "unknown source '{}' in ADVISORIES__SOURCES (known: {})",
                        name,
                        KNOWN_SOURCES.join(", ")
                    )));
                }
                if !sources.contains(&name) {
                    sources.push(name);
                }
            }
            config.sources = sources;
        }

        if let Some(raw) = get("ADVISORIES__GITHUB__TOKENS") {
            config.github_tokens = split_list(&raw);
        }
        if let Some(url) = get("ADVISORIES__GITHUB__API_URL") {
            config.github_api_url = url;
        }
        if let Some(url) = get("ADVISORIES__PACKAGIST__URL") {
            config.packagist_url = url;
        }
        config.redis_url = get("REDIS_URL");

        if let Some(raw) = get("ADVISORIES__WORKER__LOCK_TTL_SECS") {
            config.lock_ttl = Duration::from_secs(parse_number("ADVISORIES__WORKER__LOCK_TTL_SECS", &raw)?);
        }
        if let Some(raw) = get("ADVISORIES__WORKER__RESCHEDULE_SECS") {
            config.reschedule_delay =
                Duration::from_secs(parse_number("ADVISORIES__WORKER__RESCHEDULE_SECS", &raw)?);
        }
        if let Some(raw) = get("ADVISORIES__RESOLVER__THRESHOLD") {
            config.fuzzy_threshold = parse_number("ADVISORIES__RESOLVER__THRESHOLD", &raw)?;
        }

        if let Some(raw) = get("ADVISORIES__LOG_TO_FILE") {
            config.log_to_file = matches!(raw.to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(dir) = get("ADVISORIES__LOG_DIR") {
            config.log_dir = PathBuf::from(dir);
        }

        Ok(config)
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_number<T: FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.parse()
        .map_err(|_| AdvisoryError::config(format!("{} must be a non-negative integer, got '{}'", key, raw)))
}
