//! TOML-based configuration system for AccuGit.
//!
//! The AccuRev password is stored as a `password_env` field that references
//! an environment variable name. The actual secret is resolved at runtime
//! via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// AccuRev server and depot settings.
    pub accurev: AccuRevConfig,

    /// Target Git repository settings.
    pub git: GitConfig,

    /// Conversion behaviour settings.
    #[serde(default)]
    pub conversion: ConversionConfig,

    /// Continuous-tracking settings.
    #[serde(default)]
    pub track: TrackConfig,

    /// Stream-to-branch mapping. Empty means every stream in the depot.
    #[serde(default)]
    pub streams: Vec<StreamMapEntry>,

    /// AccuRev-username-to-git-identity mapping.
    #[serde(default)]
    pub usermap: Vec<UserMapEntry>,
}

// ---------------------------------------------------------------------------
// AccuRev
// ---------------------------------------------------------------------------

/// AccuRev server connection and depot settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuRevConfig {
    /// Depot to convert.
    pub depot: String,

    /// AccuRev username for the session.
    pub username: String,

    /// Environment variable holding the AccuRev password.
    pub password_env: String,

    /// First transaction to convert (default 1).
    #[serde(default = "default_start_transaction")]
    pub start_transaction: u64,

    /// Last transaction to convert: a number, or `now` / `highest` for the
    /// server's latest at run time.
    #[serde(default = "default_end_transaction")]
    pub end_transaction: String,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_start_transaction() -> u64 {
    1
}
fn default_end_transaction() -> String {
    "highest".into()
}

impl AccuRevConfig {
    /// The configured end transaction as a number, or `None` for the
    /// `now` / `highest` keywords.
    pub fn end_transaction_number(&self) -> Option<u64> {
        match self.end_transaction.as_str() {
            "now" | "highest" => None,
            other => other.parse().ok(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Commit message style for produced branch commits.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStyle {
    /// Transaction comment plus an aligned source-information trailer.
    #[default]
    Normal,
    /// Transaction comment only.
    Clean,
    /// Transaction comment; the trailer goes into the raw notes namespace.
    Notes,
}

impl std::fmt::Display for MessageStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Clean => write!(f, "clean"),
            Self::Notes => write!(f, "notes"),
        }
    }
}

/// Target Git repository settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Path of the target repository. Created on first run if absent.
    pub repo_path: PathBuf,

    /// Commit message style.
    #[serde(default)]
    pub message_style: MessageStyle,
}

// ---------------------------------------------------------------------------
// Conversion behaviour
// ---------------------------------------------------------------------------

/// Change-detection policy used to find the next transaction that alters a
/// stream's content.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Method {
    /// Materialize at every transaction; the whole tree is cleared and
    /// re-populated each time. Slowest, most faithful.
    Pop,
    /// Skip transactions whose diff against the current position is empty.
    #[default]
    Diff,
    /// Like `diff`, but only candidate transactions from a pre-fetched
    /// deep history are considered.
    DeepHist,
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pop => write!(f, "pop"),
            Self::Diff => write!(f, "diff"),
            Self::DeepHist => write!(f, "deep-hist"),
        }
    }
}

/// Conversion behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Change-detection policy.
    #[serde(default)]
    pub method: Method,

    /// Attempts per external command before the failure is surfaced.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,

    /// Pause between attempts, in seconds.
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,

    /// Keep empty directories by writing a placeholder `.gitignore` into
    /// each.
    #[serde(default = "default_true")]
    pub preserve_empty_dirs: bool,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional log file; tracing output is appended there as well.
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

fn default_retry_attempts() -> u32 {
    3
}
fn default_retry_delay() -> u64 {
    3
}
fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".into()
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            method: Method::default(),
            retry_attempts: default_retry_attempts(),
            retry_delay_secs: default_retry_delay(),
            preserve_empty_dirs: true,
            log_level: default_log_level(),
            log_file: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Continuous tracking
// ---------------------------------------------------------------------------

/// Continuous-tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackConfig {
    /// Seconds between tracking cycles (default 300).
    #[serde(default = "default_track_interval")]
    pub interval_secs: u64,
}

fn default_track_interval() -> u64 {
    300
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_track_interval(),
        }
    }
}

// ---------------------------------------------------------------------------
// Stream map
// ---------------------------------------------------------------------------

/// One stream-to-branch mapping entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamMapEntry {
    /// Stream name in the depot.
    pub stream: String,

    /// Branch name in the target repository. Defaults to the stream name
    /// with spaces replaced by underscores.
    #[serde(default)]
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// User map
// ---------------------------------------------------------------------------

/// One AccuRev-username-to-git-identity mapping entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMapEntry {
    /// AccuRev principal name.
    pub accurev_username: String,

    /// Git author/committer name.
    pub git_name: String,

    /// Git author/committer email.
    pub git_email: String,

    /// Fixed UTC offset for this user's timestamps, `+HHMM` or `-HHMM`.
    /// Timestamps render in UTC when absent.
    #[serde(default)]
    pub timezone: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables and populate
    /// the corresponding resolved fields.
    ///
    /// A missing variable logs a warning but does **not** fail -- the
    /// password is only required when the session needs a fresh login.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        self.accurev.password =
            resolve_optional_env(&self.accurev.password_env, "accurev.password_env");

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accurev.depot.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "accurev.depot".into(),
                detail: "depot must not be empty".into(),
            });
        }
        if self.accurev.username.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "accurev.username".into(),
                detail: "username must not be empty".into(),
            });
        }
        if self.accurev.start_transaction == 0 {
            return Err(ConfigError::InvalidValue {
                field: "accurev.start_transaction".into(),
                detail: "transactions are numbered from 1".into(),
            });
        }
        match self.accurev.end_transaction.as_str() {
            "now" | "highest" => {}
            other => match other.parse::<u64>() {
                Ok(n) if n >= self.accurev.start_transaction => {}
                Ok(_) => {
                    return Err(ConfigError::InvalidValue {
                        field: "accurev.end_transaction".into(),
                        detail: "end transaction is before start_transaction".into(),
                    });
                }
                Err(_) => {
                    return Err(ConfigError::InvalidValue {
                        field: "accurev.end_transaction".into(),
                        detail: "expected a transaction number, 'now' or 'highest'".into(),
                    });
                }
            },
        }
        if self.git.repo_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.repo_path".into(),
                detail: "repository path must not be empty".into(),
            });
        }
        if self.conversion.retry_attempts == 0 {
            return Err(ConfigError::InvalidValue {
                field: "conversion.retry_attempts".into(),
                detail: "at least one attempt is required".into(),
            });
        }
        if self.track.interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "track.interval_secs".into(),
                detail: "interval must be > 0".into(),
            });
        }

        let offset_re = regex_lite::Regex::new(r"^[+-]\d{4}$").map_err(|e| {
            ConfigError::InvalidValue {
                field: "usermap.timezone".into(),
                detail: e.to_string(),
            }
        })?;
        for entry in &self.usermap {
            if entry.accurev_username.is_empty() || entry.git_email.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "usermap".into(),
                    detail: format!(
                        "mapping for '{}' needs accurev_username and git_email",
                        entry.accurev_username
                    ),
                });
            }
            if let Some(ref tz) = entry.timezone {
                if !offset_re.is_match(tz) {
                    return Err(ConfigError::InvalidValue {
                        field: "usermap.timezone".into(),
                        detail: format!(
                            "'{}' for user '{}' is not a +HHMM/-HHMM offset",
                            tz, entry.accurev_username
                        ),
                    });
                }
            }
        }

        for entry in &self.streams {
            if entry.stream.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "streams.stream".into(),
                    detail: "stream name must not be empty".into(),
                });
            }
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
[accurev]
depot = "Widgets"
username = "converter"
password_env = "ACCUREV_PASSWORD"
start_transaction = 1
end_transaction = "highest"

[git]
repo_path = "/srv/conversions/widgets"
message_style = "normal"

[conversion]
method = "deep-hist"
retry_attempts = 3
retry_delay_secs = 3
preserve_empty_dirs = true
log_level = "debug"

[track]
interval_secs = 120

[[streams]]
stream = "Widgets"
branch = "main"

[[streams]]
stream = "Widgets_dev"

[[usermap]]
accurev_username = "jdoe"
git_name = "Jane Doe"
git_email = "jane@example.com"
timezone = "+0100"
"#
    }

    #[test]
    fn test_parse_full_config() {
        let config: AppConfig = toml::from_str(sample_toml()).expect("failed to parse toml");
        assert_eq!(config.accurev.depot, "Widgets");
        assert_eq!(config.accurev.end_transaction_number(), None);
        assert_eq!(config.conversion.method, Method::DeepHist);
        assert_eq!(config.git.message_style, MessageStyle::Normal);
        assert_eq!(config.track.interval_secs, 120);
        assert_eq!(config.streams.len(), 2);
        assert_eq!(config.streams[1].branch, None);
        assert_eq!(config.usermap[0].timezone.as_deref(), Some("+0100"));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();

        let config = AppConfig::load_from_file(&path).expect("load_from_file failed");
        assert_eq!(config.conversion.log_level, "debug");
    }

    #[test]
    fn test_file_not_found() {
        let result = AppConfig::load_from_file("/nonexistent/config.toml");
        assert!(matches!(result, Err(ConfigError::FileNotFound(_))));
    }

    #[test]
    fn test_validate_rejects_empty_depot() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.accurev.depot = String::new();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "accurev.depot"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_end_transaction() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.accurev.end_transaction = "latest".into();
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "accurev.end_transaction"
        ));

        config.accurev.end_transaction = "10".into();
        config.accurev.start_transaction = 20;
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "accurev.end_transaction"
        ));
    }

    #[test]
    fn test_validate_rejects_bad_timezone() {
        let mut config: AppConfig = toml::from_str(sample_toml()).unwrap();
        config.usermap[0].timezone = Some("CET".into());
        let result = config.validate();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { ref field, .. }) if field == "usermap.timezone"
        ));
    }

    #[test]
    fn test_resolve_env_vars() {
        std::env::set_var("TEST_AC_PW", "s3cret");

        let toml_str = r#"
[accurev]
depot = "Widgets"
username = "converter"
password_env = "TEST_AC_PW"
[git]
repo_path = "/tmp/widgets"
"#;
        let mut config: AppConfig = toml::from_str(toml_str).unwrap();
        config.resolve_env_vars().unwrap();

        assert_eq!(config.accurev.password.as_deref(), Some("s3cret"));

        // Clean up
        std::env::remove_var("TEST_AC_PW");
    }

    #[test]
    fn test_defaults() {
        let minimal = r#"
[accurev]
depot = "Widgets"
username = "converter"
password_env = "ACCUREV_PASSWORD"
[git]
repo_path = "/tmp/widgets"
"#;
        let config: AppConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.accurev.start_transaction, 1);
        assert_eq!(config.accurev.end_transaction, "highest");
        assert_eq!(config.conversion.method, Method::Diff);
        assert_eq!(config.conversion.retry_attempts, 3);
        assert!(config.conversion.preserve_empty_dirs);
        assert_eq!(config.conversion.log_level, "info");
        assert_eq!(config.git.message_style, MessageStyle::Normal);
        assert_eq!(config.track.interval_secs, 300);
        assert!(config.streams.is_empty());
        assert!(config.usermap.is_empty());
    }
}
