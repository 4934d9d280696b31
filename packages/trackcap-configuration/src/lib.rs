//! Configuration for the Trackcap daemon.
//!
//! The configuration is loaded from a YAML file. String values support
//! `${VAR}` environment-variable substitution, which is applied before
//! parsing so that credentials can be kept out of the file itself.
//!
//! The trackers list is ordered: URL patterns are evaluated in declared
//! order and the first match wins. The last entry must be the catch-all
//! pattern (`.*`); loading fails otherwise.
//!
//! ```yaml
//! global:
//!   update_interval: 300
//!   allocation_strategy: soft
//!
//! qbittorrent:
//!   host: localhost
//!   port: 8080
//!   username: admin
//!   password: ${QBIT_PASSWORD}
//!
//! trackers:
//!   - id: private
//!     name: Private tracker
//!     pattern: ".*private\\.example\\.org.*"
//!     max_upload_speed: 4194304
//!     priority: 5
//!   - id: default
//!     name: Everything else
//!     pattern: ".*"
//!     max_upload_speed: -1
//!     priority: 1
//! ```
use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// The catch-all pattern every configuration must end with.
pub const CATCH_ALL_PATTERN: &str = ".*";

/// Errors raised while loading or validating the configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Unable to read configuration file: {source}")]
    UnreadableFile {
        #[from]
        source: std::io::Error,
    },

    #[error("Invalid YAML configuration: {source}")]
    InvalidYaml {
        #[from]
        source: serde_yaml::Error,
    },

    #[error("Invalid regex pattern for tracker {tracker_id}: {source}")]
    InvalidPattern {
        tracker_id: String,
        source: regex::Error,
    },

    #[error("Invalid configuration: {reason}")]
    Invalid { reason: String },
}

/// How the engine splits a tracker cap among its torrents.
#[derive(Serialize, Deserialize, PartialEq, Eq, Debug, derive_more::Display, Clone, Copy, Default)]
#[serde(rename_all = "lowercase")]
pub enum AllocationStrategy {
    /// Every managed torrent gets an equal share of the cap.
    #[default]
    #[display("equal")]
    Equal,
    /// Shares proportional to an activity score, with per-torrent bounds.
    #[display("weighted")]
    Weighted,
    /// Weighted distribution over caps that borrow headroom from idle
    /// trackers, smoothed with an EMA.
    #[display("soft")]
    Soft,
}

/// Global engine and HTTP surface settings.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct GlobalSettings {
    /// Seconds between allocation cycles.
    pub update_interval: u64,
    /// A torrent counts as active when uploading at least this many KiB/s.
    pub active_torrent_threshold_kb: u64,
    /// Hard cap on mutating API calls per cycle; excess writes are
    /// deferred to the next cycle.
    pub max_api_calls_per_cycle: usize,
    /// Minimum relative change before a new limit is written.
    pub differential_threshold: f64,
    /// Share of torrents (0-100) selected for management, keyed on hash.
    pub rollout_percentage: u8,
    /// Bind address for the HTTP surface.
    pub host: String,
    /// Bind port for the HTTP surface.
    pub port: u16,
    pub allocation_strategy: AllocationStrategy,
    /// Upper bound on the managed set size.
    pub max_managed_torrents: usize,
    /// Seconds before an unseen cache entry is evicted.
    pub cache_ttl_seconds: u64,
    /// Compute and persist proposals without applying them.
    pub dry_run: bool,
    /// Where the dry-run store keeps simulated limits.
    pub dry_run_store_path: String,
    /// Set torrents that leave the active set back to unlimited.
    pub auto_unlimit_on_inactive: bool,
    /// Usage ratio at which a tracker qualifies to borrow headroom.
    pub borrow_threshold_ratio: f64,
    /// Largest borrow, as a fraction of the borrower's base cap.
    pub max_borrow_fraction: f64,
    /// EMA coefficient applied to the effective cap.
    pub smoothing_alpha: f64,
    /// Minimum relative movement before a smoothed cap is committed.
    pub min_effective_delta: f64,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            update_interval: 300,
            active_torrent_threshold_kb: 10,
            max_api_calls_per_cycle: 500,
            differential_threshold: 0.2,
            rollout_percentage: 100,
            host: String::from("0.0.0.0"),
            port: 8089,
            allocation_strategy: AllocationStrategy::default(),
            max_managed_torrents: 1000,
            cache_ttl_seconds: 1800,
            dry_run: false,
            dry_run_store_path: String::from("./data/dry_run.json"),
            auto_unlimit_on_inactive: false,
            borrow_threshold_ratio: 0.9,
            max_borrow_fraction: 0.5,
            smoothing_alpha: 0.4,
            min_effective_delta: 0.1,
        }
    }
}

/// Connection settings for the qBittorrent Web API.
#[derive(Serialize, Deserialize, PartialEq, Clone)]
pub struct QBittorrentSettings {
    #[serde(default = "QBittorrentSettings::default_host")]
    pub host: String,
    #[serde(default = "QBittorrentSettings::default_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Per-request timeout in seconds.
    #[serde(default = "QBittorrentSettings::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl QBittorrentSettings {
    fn default_host() -> String {
        String::from("localhost")
    }

    fn default_port() -> u16 {
        8080
    }

    fn default_timeout_secs() -> u64 {
        30
    }
}

// The password must not leak through debug formatting.
impl fmt::Debug for QBittorrentSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QBittorrentSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"***")
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// One configured tracker. Order in the list is significant.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct TrackerSettings {
    /// Stable identifier used in statistics and rollback records.
    pub id: String,
    pub name: String,
    /// Regex matched against a torrent's representative announce URL.
    pub pattern: String,
    /// Aggregate upload cap in bytes/sec; `-1` means unlimited.
    pub max_upload_speed: i64,
    /// Higher priority trackers are favored when borrowing headroom.
    #[serde(default = "TrackerSettings::default_priority")]
    pub priority: u8,
}

impl TrackerSettings {
    fn default_priority() -> u8 {
        1
    }

    #[must_use]
    pub fn is_catch_all(&self) -> bool {
        self.pattern.trim() == CATCH_ALL_PATTERN
    }

    #[must_use]
    pub fn is_unlimited(&self) -> bool {
        self.max_upload_speed < 0
    }
}

/// Cross-seed forwarding settings.
#[derive(Serialize, Deserialize, PartialEq, Clone)]
#[serde(default)]
pub struct CrossSeedSettings {
    pub enabled: bool,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for CrossSeedSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            timeout_secs: 15,
        }
    }
}

impl fmt::Debug for CrossSeedSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrossSeedSettings")
            .field("enabled", &self.enabled)
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "***"))
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

/// Rollback journal settings.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct RollbackSettings {
    pub database_path: String,
    /// When disabled, limit changes are applied without being journaled.
    pub track_all_changes: bool,
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            database_path: String::from("./data/rollback.db"),
            track_all_changes: true,
        }
    }
}

/// Logging settings.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log threshold: trace, debug, info, warn or error.
    pub level: String,
    /// Optional log file; console only when absent.
    pub file: Option<String>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            file: None,
        }
    }
}

/// The root configuration.
#[derive(Serialize, Deserialize, PartialEq, Debug, Clone)]
pub struct Configuration {
    #[serde(rename = "global", default)]
    pub global: GlobalSettings,
    pub qbittorrent: QBittorrentSettings,
    pub trackers: Vec<TrackerSettings>,
    #[serde(default)]
    pub cross_seed: CrossSeedSettings,
    #[serde(default)]
    pub rollback: RollbackSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Configuration {
    /// Loads and validates the configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the file cannot be read, the YAML
    /// does not parse, or validation fails (see [`Configuration::validate`]).
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::load_from_str(&raw)
    }

    /// Parses and validates configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the YAML does not parse or
    /// validation fails.
    pub fn load_from_str(raw: &str) -> Result<Self, ConfigError> {
        let substituted = substitute_env_vars(raw);
        let config: Self = serde_yaml::from_str(&substituted)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the invariants the rest of the system relies on.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] when the trackers list is empty, contains
    /// duplicate ids or uncompilable patterns, lacks the trailing
    /// catch-all, or when a numeric setting is out of range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.trackers.is_empty() {
            return Err(ConfigError::Invalid {
                reason: String::from("at least one tracker must be configured"),
            });
        }

        let mut seen_ids = std::collections::HashSet::new();
        for tracker in &self.trackers {
            if !seen_ids.insert(tracker.id.as_str()) {
                return Err(ConfigError::Invalid {
                    reason: format!("duplicate tracker id: {}", tracker.id),
                });
            }

            regex::Regex::new(&tracker.pattern).map_err(|source| ConfigError::InvalidPattern {
                tracker_id: tracker.id.clone(),
                source,
            })?;
        }

        for (position, tracker) in self.trackers.iter().enumerate() {
            if tracker.is_catch_all() && position != self.trackers.len() - 1 {
                return Err(ConfigError::Invalid {
                    reason: format!(
                        "catch-all pattern ({CATCH_ALL_PATTERN}) must be the last tracker, found at position {position}"
                    ),
                });
            }
        }

        let last_is_catch_all = self.trackers.last().is_some_and(TrackerSettings::is_catch_all);
        if !last_is_catch_all {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "a catch-all tracker with pattern '{CATCH_ALL_PATTERN}' must be configured as the last tracker"
                ),
            });
        }

        if self.global.rollout_percentage > 100 {
            return Err(ConfigError::Invalid {
                reason: format!(
                    "rollout_percentage must be between 0 and 100, got {}",
                    self.global.rollout_percentage
                ),
            });
        }

        for (name, value) in [
            ("differential_threshold", self.global.differential_threshold),
            ("borrow_threshold_ratio", self.global.borrow_threshold_ratio),
            ("max_borrow_fraction", self.global.max_borrow_fraction),
            ("smoothing_alpha", self.global.smoothing_alpha),
            ("min_effective_delta", self.global.min_effective_delta),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid {
                    reason: format!("{name} must be within [0.0, 1.0], got {value}"),
                });
            }
        }

        Ok(())
    }

    /// The tracker settings for an id, if configured.
    #[must_use]
    pub fn tracker(&self, tracker_id: &str) -> Option<&TrackerSettings> {
        self.trackers.iter().find(|tracker| tracker.id == tracker_id)
    }
}

/// Replaces `${VAR}` references with environment variable values.
///
/// Unset variables are left untouched so that validation reports them in
/// context instead of producing an empty credential.
#[must_use]
fn substitute_env_vars(raw: &str) -> String {
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern compiles");

    pattern
        .replace_all(raw, |captures: &regex::Captures<'_>| {
            std::env::var(&captures[1]).unwrap_or_else(|_| captures[0].to_string())
        })
        .into_owned()
}

#[cfg(test)]
mod tests {

    use crate::{AllocationStrategy, Configuration};

    fn minimal_yaml() -> String {
        String::from(
            r#"
qbittorrent:
  username: admin
  password: adminadmin
trackers:
  - id: private
    name: Private tracker
    pattern: ".*private\\.example\\.org.*"
    max_upload_speed: 4194304
    priority: 5
  - id: default
    name: Everything else
    pattern: ".*"
    max_upload_speed: -1
"#,
        )
    }

    mod loading {
        use std::io::Write;

        use crate::tests::minimal_yaml;
        use crate::Configuration;

        #[test]
        fn it_should_load_a_minimal_configuration_with_defaults() {
            let config = Configuration::load_from_str(&minimal_yaml()).unwrap();

            assert_eq!(config.global.update_interval, 300);
            assert_eq!(config.global.port, 8089);
            assert_eq!(config.global.rollout_percentage, 100);
            assert_eq!(config.global.max_managed_torrents, 1000);
            assert_eq!(config.global.cache_ttl_seconds, 1800);
            assert_eq!(config.trackers.len(), 2);
            assert_eq!(config.qbittorrent.port, 8080);
            assert!(config.rollback.track_all_changes);
        }

        #[test]
        fn it_should_load_the_configuration_from_a_file() {
            let mut file = tempfile::NamedTempFile::new().unwrap();
            file.write_all(minimal_yaml().as_bytes()).unwrap();

            let config = Configuration::load(file.path()).unwrap();

            assert_eq!(config.trackers[0].id, "private");
        }

        #[test]
        fn it_should_substitute_environment_variables() {
            // Unset variables stay as-is instead of becoming empty strings.
            let yaml = minimal_yaml().replace("adminadmin", "${TRACKCAP_TEST_UNSET_VAR}");

            let config = Configuration::load_from_str(&yaml).unwrap();

            assert_eq!(config.qbittorrent.password, "${TRACKCAP_TEST_UNSET_VAR}");
        }

        #[test]
        fn it_should_parse_the_allocation_strategy() {
            let yaml = format!("global:\n  allocation_strategy: soft\n{}", minimal_yaml());

            let config = Configuration::load_from_str(&yaml).unwrap();

            assert_eq!(config.global.allocation_strategy, crate::AllocationStrategy::Soft);
        }
    }

    mod validation {
        use crate::tests::minimal_yaml;
        use crate::{ConfigError, Configuration};

        #[test]
        fn it_should_reject_a_configuration_without_a_catch_all_tracker() {
            let yaml = r#"
qbittorrent:
  username: admin
  password: adminadmin
trackers:
  - id: private
    name: Private tracker
    pattern: ".*private\\.example\\.org.*"
    max_upload_speed: 4194304
"#;

            let err = Configuration::load_from_str(yaml).unwrap_err();

            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn it_should_reject_a_catch_all_tracker_that_is_not_last() {
            let yaml = r#"
qbittorrent:
  username: admin
  password: adminadmin
trackers:
  - id: default
    name: Everything else
    pattern: ".*"
    max_upload_speed: -1
  - id: private
    name: Private tracker
    pattern: ".*private\\.example\\.org.*"
    max_upload_speed: 4194304
"#;

            let err = Configuration::load_from_str(yaml).unwrap_err();

            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn it_should_reject_duplicate_tracker_ids() {
            let yaml = minimal_yaml().replace("id: private", "id: default");

            let err = Configuration::load_from_str(&yaml).unwrap_err();

            assert!(matches!(err, ConfigError::Invalid { .. }));
        }

        #[test]
        fn it_should_reject_an_invalid_tracker_pattern() {
            let yaml = minimal_yaml().replace(r".*private\\.example\\.org.*", "([unclosed");

            let err = Configuration::load_from_str(&yaml).unwrap_err();

            assert!(matches!(err, ConfigError::InvalidPattern { .. }));
        }

        #[test]
        fn it_should_reject_an_out_of_range_rollout_percentage() {
            let yaml = format!("global:\n  rollout_percentage: 101\n{}", minimal_yaml());

            let err = Configuration::load_from_str(&yaml).unwrap_err();

            assert!(matches!(err, ConfigError::Invalid { .. }));
        }
    }

    mod secret_handling {
        use crate::tests::minimal_yaml;
        use crate::Configuration;

        #[test]
        fn it_should_not_expose_the_password_through_debug_formatting() {
            let config = Configuration::load_from_str(&minimal_yaml()).unwrap();

            let formatted = format!("{:?}", config.qbittorrent);

            assert!(!formatted.contains("adminadmin"));
            assert!(formatted.contains("***"));
        }
    }

    #[test]
    fn it_should_display_allocation_strategies_in_their_config_spelling() {
        assert_eq!(AllocationStrategy::Equal.to_string(), "equal");
        assert_eq!(AllocationStrategy::Weighted.to_string(), "weighted");
        assert_eq!(AllocationStrategy::Soft.to_string(), "soft");
    }

    #[test]
    fn it_should_find_a_tracker_by_id() {
        let config = Configuration::load_from_str(&minimal_yaml()).unwrap();

        assert!(config.tracker("private").is_some());
        assert!(config.tracker("missing").is_none());
    }
}
