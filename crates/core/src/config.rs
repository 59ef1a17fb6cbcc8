//! Agent configuration: a file-per-key directory (ConfigMap volume layout)
//! with `KOLLECT_*` environment overrides.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// Default backend endpoints; overridable for self-hosted deployments.
pub const DEFAULT_API_ENDPOINT: &str = "https://api.kollect.io";
pub const DEFAULT_LOGIN_ENDPOINT: &str = "https://auth.kollect.io";

const DEFAULT_PAGE_SIZE: usize = 500; // KB units; the page budget is page_size * 1000 bytes
const DEFAULT_OBJECTS_CONCURRENCY: usize = 10;
const DEFAULT_HELM_CONCURRENCY: usize = 4;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_PAGE_TIMEOUT_SECS: u64 = 120;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0:?} (file or KOLLECT_{1} env var)")]
    MissingKey(&'static str, String),
    #[error("configuration key {0:?} has invalid value {1:?}")]
    InvalidValue(&'static str, String),
    #[error("reading configuration key {0:?}: {1}")]
    Io(&'static str, #[source] std::io::Error),
}

/// Tunables consumed by the session, the collectors and the upload
/// pipeline. Loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub access_key: String,
    pub secret_key: String,
    pub api_endpoint: String,
    pub login_endpoint: String,
    /// Page byte budget in KB; a page holds up to `page_size * 1000` bytes.
    pub page_size: usize,
    pub objects_concurrency: usize,
    pub helm_concurrency: usize,
    /// Retry ceiling per page request, on top of the initial attempt.
    pub max_retries: u32,
    pub page_timeout: Duration,
    /// Ask the backend to accept a cluster whose unique id is already
    /// registered under another configuration.
    pub override_unique_cluster_id: bool,
    /// Collect and print instead of authenticating and uploading.
    pub dry_run: bool,
    /// Optional extra redaction rules (TOML), merged with the builtin set.
    pub redaction_rules: Option<PathBuf>,
}

impl Config {
    /// Load from `dir`, one file per key, with `KOLLECT_<KEY>` env vars
    /// taking precedence. Access and secret keys are required unless
    /// `dry_run` is set.
    pub fn load(dir: &Path, dry_run: bool) -> Result<Config, ConfigError> {
        let access_key = read_key(dir, "access_key")?.unwrap_or_default();
        let secret_key = read_key(dir, "secret_key")?.unwrap_or_default();
        if !dry_run {
            if access_key.is_empty() {
                return Err(ConfigError::MissingKey("access_key", "ACCESS_KEY".into()));
            }
            if secret_key.is_empty() {
                return Err(ConfigError::MissingKey("secret_key", "SECRET_KEY".into()));
            }
        }

        let conf = Config {
            access_key,
            secret_key,
            api_endpoint: read_key(dir, "api_endpoint")?
                .unwrap_or_else(|| DEFAULT_API_ENDPOINT.to_string()),
            login_endpoint: read_key(dir, "login_endpoint")?
                .unwrap_or_else(|| DEFAULT_LOGIN_ENDPOINT.to_string()),
            page_size: parse_key(dir, "page_size", DEFAULT_PAGE_SIZE)?,
            objects_concurrency: parse_key(dir, "objects_concurrency", DEFAULT_OBJECTS_CONCURRENCY)?,
            helm_concurrency: parse_key(dir, "helm_concurrency", DEFAULT_HELM_CONCURRENCY)?,
            max_retries: parse_key(dir, "max_retries", DEFAULT_MAX_RETRIES)?,
            page_timeout: Duration::from_secs(parse_key(
                dir,
                "page_timeout_secs",
                DEFAULT_PAGE_TIMEOUT_SECS,
            )?),
            override_unique_cluster_id: parse_key(dir, "override_unique_cluster_id", false)?,
            dry_run,
            redaction_rules: read_key(dir, "redaction_rules")?.map(PathBuf::from),
        };

        if conf.page_size == 0 {
            return Err(ConfigError::InvalidValue("page_size", "0".into()));
        }
        if conf.objects_concurrency == 0 {
            return Err(ConfigError::InvalidValue("objects_concurrency", "0".into()));
        }
        if conf.helm_concurrency == 0 {
            return Err(ConfigError::InvalidValue("helm_concurrency", "0".into()));
        }

        debug!(
            api = %conf.api_endpoint,
            page_size = conf.page_size,
            objects_concurrency = conf.objects_concurrency,
            helm_concurrency = conf.helm_concurrency,
            dry_run = conf.dry_run,
            "configuration loaded"
        );
        Ok(conf)
    }

    /// Cumulative serialized-byte budget for one page.
    pub fn page_budget(&self) -> usize {
        self.page_size * 1000
    }
}

fn env_name(key: &str) -> String {
    format!("KOLLECT_{}", key.to_ascii_uppercase())
}

/// Env var first, then `<dir>/<key>`; `None` when neither is present.
fn read_key(dir: &Path, key: &'static str) -> Result<Option<String>, ConfigError> {
    if let Ok(v) = std::env::var(env_name(key)) {
        let v = v.trim().to_string();
        if !v.is_empty() {
            return Ok(Some(v));
        }
    }
    let path = dir.join(key);
    match std::fs::read_to_string(&path) {
        Ok(raw) => {
            let v = raw.trim().to_string();
            Ok(if v.is_empty() { None } else { Some(v) })
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ConfigError::Io(key, e)),
    }
}

fn parse_key<T: std::str::FromStr>(
    dir: &Path,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match read_key(dir, key)? {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidValue(key, raw)),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tmpdir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("kollect-config-{}-{}", name, std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn dry_run_needs_no_credentials() {
        let dir = tmpdir("dry");
        let conf = Config::load(&dir, true).unwrap();
        assert!(conf.access_key.is_empty());
        assert_eq!(conf.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(conf.page_budget(), DEFAULT_PAGE_SIZE * 1000);
    }

    #[test]
    fn missing_credentials_fail_outside_dry_run() {
        let dir = tmpdir("nocreds");
        assert!(matches!(Config::load(&dir, false), Err(ConfigError::MissingKey("access_key", _))));
    }

    #[test]
    fn file_per_key_values_are_read() {
        let dir = tmpdir("files");
        std::fs::write(dir.join("access_key"), "ak\n").unwrap();
        std::fs::write(dir.join("secret_key"), "sk\n").unwrap();
        std::fs::write(dir.join("page_size"), "250").unwrap();
        std::fs::write(dir.join("override_unique_cluster_id"), "true").unwrap();
        let conf = Config::load(&dir, false).unwrap();
        assert_eq!(conf.access_key, "ak");
        assert_eq!(conf.page_size, 250);
        assert!(conf.override_unique_cluster_id);
    }

    #[test]
    fn unparseable_numeric_is_rejected() {
        let dir = tmpdir("bad");
        std::fs::write(dir.join("max_retries"), "many").unwrap();
        assert!(matches!(Config::load(&dir, true), Err(ConfigError::InvalidValue("max_retries", _))));
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let dir = tmpdir("zero");
        std::fs::write(dir.join("objects_concurrency"), "0").unwrap();
        assert!(matches!(
            Config::load(&dir, true),
            Err(ConfigError::InvalidValue("objects_concurrency", _))
        ));
    }
}
