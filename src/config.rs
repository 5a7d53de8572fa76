//! Configuration loader and validator for the STAC ingestor.
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub auth: Auth,
    pub batch: Batch,
    #[serde(default)]
    pub validation: Validation,
    #[serde(default)]
    pub workflows: Workflows,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub listen_addr: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

/// Token issuance and the accounts allowed to request tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Auth {
    pub token_ttl_seconds: u64,
    pub users: Vec<User>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub username: String,
    /// Hex SHA-256 of the password (see the `hash_password` binary).
    ///
    /// The digest is unsalted, so it only stands up for service accounts
    /// with long random passwords. Do not put human-chosen passwords here.
    pub password_sha256: String,
}

/// Batch queue thresholds and retry policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Batch {
    pub max_items: usize,
    pub max_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub max_attempts: i32,
    pub max_backoff_seconds: u64,
}

/// Validator settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Validation {
    pub check_assets: bool,
    pub asset_timeout_ms: u64,
    /// Raster service exposing `/cog/validate?url=`; sample files fall back
    /// to a reachability check when unset.
    pub raster_url: Option<String>,
}

impl Default for Validation {
    fn default() -> Self {
        Self {
            check_assets: true,
            asset_timeout_ms: 10_000,
            raster_url: None,
        }
    }
}

/// External discovery orchestrator (Airflow REST API compatible).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Workflows {
    pub api_url: Option<String>,
    pub dag_id: String,
    pub token: Option<String>,
}

impl Default for Workflows {
    fn default() -> Self {
        Self {
            api_url: None,
            dag_id: "veda_discover".into(),
            token: None,
        }
    }
}

/// One year.
pub const MAX_TOKEN_TTL_SECONDS: u64 = 365 * 24 * 60 * 60;

fn default_request_timeout() -> u64 {
    30
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.resolved_data_dir())
    }

    /// `DATABASE_URL` wins over the file under `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| format!("sqlite://{}/ingestor.db", self.app.resolved_data_dir()))
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.app
            .listen_addr
            .parse()
            .map_err(|_| ConfigError::Invalid("app.listen_addr must be host:port"))
    }
}

impl App {
    /// `data_dir` with a leading `~/` expanded to `$HOME`.
    pub fn resolved_data_dir(&self) -> String {
        match self.data_dir.strip_prefix("~/") {
            Some(rest) => match std::env::var("HOME") {
                Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
                Err(_) => self.data_dir.clone(),
            },
            None => self.data_dir.clone(),
        }
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    cfg.listen_addr()?;
    if cfg.app.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_seconds must be > 0"));
    }

    if cfg.auth.token_ttl_seconds == 0 {
        return Err(ConfigError::Invalid("auth.token_ttl_seconds must be > 0"));
    }
    if cfg.auth.token_ttl_seconds > MAX_TOKEN_TTL_SECONDS {
        return Err(ConfigError::Invalid(
            "auth.token_ttl_seconds must be at most one year (31536000)",
        ));
    }
    if cfg.auth.users.is_empty() {
        return Err(ConfigError::Invalid("auth.users must list at least one user"));
    }
    for user in &cfg.auth.users {
        if user.username.trim().is_empty() {
            return Err(ConfigError::Invalid("auth.users[].username must be non-empty"));
        }
        let digest = &user.password_sha256;
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(ConfigError::Invalid(
                "auth.users[].password_sha256 must be 64 hex characters",
            ));
        }
    }

    if cfg.batch.max_items == 0 {
        return Err(ConfigError::Invalid("batch.max_items must be > 0"));
    }
    if cfg.batch.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("batch.poll_interval_ms must be > 0"));
    }
    if cfg.batch.max_attempts < 1 {
        return Err(ConfigError::Invalid("batch.max_attempts must be >= 1"));
    }
    // max_wait_ms of 0 flushes on every tick, which is allowed.

    if cfg.validation.asset_timeout_ms == 0 {
        return Err(ConfigError::Invalid("validation.asset_timeout_ms must be > 0"));
    }
    if let Some(url) = &cfg.validation.raster_url {
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid("validation.raster_url must be a valid URL"));
        }
    }

    if let Some(url) = &cfg.workflows.api_url {
        if reqwest::Url::parse(url).is_err() {
            return Err(ConfigError::Invalid("workflows.api_url must be a valid URL"));
        }
        if cfg.workflows.dag_id.trim().is_empty() {
            return Err(ConfigError::Invalid("workflows.dag_id must be non-empty"));
        }
    }

    Ok(())
}

/// Example configuration; the `ingestor` password is `secret`.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  listen_addr: "127.0.0.1:8000"
  request_timeout_seconds: 30

auth:
  token_ttl_seconds: 3600
  users:
    - username: "ingestor"
      password_sha256: "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"

batch:
  max_items: 100
  max_wait_ms: 5000
  poll_interval_ms: 500
  max_attempts: 5
  max_backoff_seconds: 60

validation:
  check_assets: true
  asset_timeout_ms: 10000
  raster_url: null

workflows:
  api_url: null
  dag_id: "veda_discover"
  token: null
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn example_cfg() -> Config {
        serde_yaml::from_str(example()).unwrap()
    }

    #[test]
    fn parse_example_ok() {
        let cfg = example_cfg();
        validate(&cfg).unwrap();
        assert_eq!(cfg.workflows.dag_id, "veda_discover");
        assert!(cfg.validation.raster_url.is_none());
    }

    #[test]
    fn optional_sections_default() {
        let trimmed = example().split("validation:").next().unwrap();
        let cfg: Config = serde_yaml::from_str(trimmed).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.validation, Validation::default());
        assert_eq!(cfg.workflows, Workflows::default());
    }

    #[test]
    fn invalid_listen_addr() {
        let mut cfg = example_cfg();
        cfg.app.listen_addr = "not an address".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("listen_addr")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_users() {
        let mut cfg = example_cfg();
        cfg.auth.users.clear();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.auth.users[0].password_sha256 = "secret".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("password_sha256")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.auth.users[0].username = " ".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn token_ttl_is_bounded() {
        let mut cfg = example_cfg();
        cfg.auth.token_ttl_seconds = MAX_TOKEN_TTL_SECONDS;
        validate(&cfg).unwrap();

        cfg.auth.token_ttl_seconds = u64::MAX;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("token_ttl_seconds")), _ => panic!("wrong error") }
    }

    #[test]
    fn invalid_batch_policy() {
        let mut cfg = example_cfg();
        cfg.batch.max_items = 0;
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("max_items")), _ => panic!("wrong error") }

        let mut cfg = example_cfg();
        cfg.batch.max_attempts = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.batch.poll_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_urls() {
        let mut cfg = example_cfg();
        cfg.validation.raster_url = Some("::nope".into());
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg = example_cfg();
        cfg.workflows.api_url = Some("http://airflow.local:8080".into());
        cfg.workflows.dag_id = "".into();
        let err = validate(&cfg).unwrap_err();
        match err { ConfigError::Invalid(msg) => assert!(msg.contains("dag_id")), _ => panic!("wrong error") }
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg = example_cfg();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.auth.users[0].username, "ingestor");
        assert_eq!(cfg.batch.max_items, 100);
    }
}
