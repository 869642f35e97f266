//! TOML configuration loading and fail-fast validation.
//!
//! The whole file is validated before any network call: duplicate scan names,
//! uncompilable patterns and missing notification targets all abort the run
//! up front.

use crate::core::error::SkywatchError;
use crate::core::matcher::PatternMatcher;
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;

pub const DEFAULT_CONFIG_PATH: &str = "config.toml";
pub const DEFAULT_DATABASE: &str = "skywatch.db";
pub const DEFAULT_SHELL: &str = "/bin/sh";

#[derive(Debug, Deserialize)]
pub struct Config {
    pub bluesky: BlueskyConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default, rename = "scan")]
    pub scans: Vec<ScanConfig>,
}

#[derive(Debug, Deserialize)]
pub struct BlueskyConfig {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_service")]
    pub service: String,
}

fn default_service() -> String {
    "https://bsky.social".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            database: DEFAULT_DATABASE.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Advance the boundary even when notification delivery failed.
    ///
    /// The default (`true`) prefers "no duplicate side effects": failed
    /// deliveries are reported as warnings and the matched posts are never
    /// re-notified. Set to `false` to leave the boundary untouched on
    /// delivery failure so the next run retries the whole window, at the
    /// cost of duplicate shell executions for matches that did go out.
    pub commit_on_notify_failure: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            commit_on_notify_failure: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    pub name: String,
    pub handle: String,
    pub pattern: String,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub shell: Option<String>,
    #[serde(default = "default_shell")]
    pub shell_executable: String,
}

fn default_shell() -> String {
    DEFAULT_SHELL.to_string()
}

pub fn load(path: &Path) -> Result<Config, SkywatchError> {
    if !path.is_file() {
        return Err(SkywatchError::Config(format!(
            "config file not found: {}",
            path.display()
        )));
    }
    let raw = fs::read_to_string(path)?;
    let config: Config = toml::from_str(&raw)
        .map_err(|e| SkywatchError::Config(format!("failed to parse {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}

impl Config {
    pub fn validate(&self) -> Result<(), SkywatchError> {
        if self.bluesky.username.is_empty() || self.bluesky.password.is_empty() {
            return Err(SkywatchError::Config(
                "Bluesky credentials missing ([bluesky] username/password)".to_string(),
            ));
        }
        if self.scans.is_empty() {
            return Err(SkywatchError::Config(
                "no [[scan]] entries configured".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for scan in &self.scans {
            if scan.name.is_empty() {
                return Err(SkywatchError::Config(
                    "scan entry with empty name".to_string(),
                ));
            }
            if !seen.insert(scan.name.as_str()) {
                return Err(SkywatchError::Config(format!(
                    "duplicate scan name '{}'",
                    scan.name
                )));
            }
            if scan.handle.is_empty() {
                return Err(SkywatchError::Config(format!(
                    "scan '{}' has no handle",
                    scan.name
                )));
            }
            if scan.webhook_url.is_none() && scan.shell.is_none() {
                return Err(SkywatchError::Config(format!(
                    "scan '{}' must set webhook_url and/or shell",
                    scan.name
                )));
            }
            if let Err(e) = PatternMatcher::compile(&scan.pattern) {
                let reason = match e {
                    SkywatchError::Config(msg) => msg,
                    other => other.to_string(),
                };
                return Err(SkywatchError::Config(format!(
                    "scan '{}': {}",
                    scan.name, reason
                )));
            }
        }
        Ok(())
    }

    /// All scans, or just the named one. An unknown name is a hard error so a
    /// typo in a cron line does not silently scan nothing.
    pub fn select_scans(&self, name: Option<&str>) -> Result<Vec<&ScanConfig>, SkywatchError> {
        match name {
            None => Ok(self.scans.iter().collect()),
            Some(n) => {
                let selected: Vec<&ScanConfig> =
                    self.scans.iter().filter(|s| s.name == n).collect();
                if selected.is_empty() {
                    return Err(SkywatchError::NotFound(format!(
                        "scan '{}' not found in config",
                        n
                    )));
                }
                Ok(selected)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config(scans: &str) -> String {
        format!(
            r#"
[bluesky]
username = "watcher.example.com"
password = "app-password"

{}
"#,
            scans
        )
    }

    fn parse(raw: &str) -> Result<Config, SkywatchError> {
        let config: Config = toml::from_str(raw).map_err(|e| SkywatchError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_with_defaults() {
        let raw = base_config(
            r#"
[[scan]]
name = "crypto_watch"
handle = "alice.example.com"
pattern = "bitcoin|crypto"
webhook_url = "https://hooks.example.com/notify"
"#,
        );
        let config = parse(&raw).unwrap();
        assert_eq!(config.storage.database, DEFAULT_DATABASE);
        assert!(config.engine.commit_on_notify_failure);
        assert_eq!(config.scans.len(), 1);
        assert_eq!(config.scans[0].shell_executable, DEFAULT_SHELL);
        assert_eq!(config.bluesky.service, "https://bsky.social");
    }

    #[test]
    fn test_missing_credentials_rejected() {
        let raw = r#"
[bluesky]
username = ""
password = ""

[[scan]]
name = "a"
handle = "h"
pattern = "x"
shell = "true"
"#;
        let err = parse(raw).unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }

    #[test]
    fn test_no_scans_rejected() {
        let raw = base_config("");
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("no [[scan]]"));
    }

    #[test]
    fn test_duplicate_scan_name_rejected() {
        let raw = base_config(
            r#"
[[scan]]
name = "dup"
handle = "h"
pattern = "x"
shell = "true"

[[scan]]
name = "dup"
handle = "h"
pattern = "y"
shell = "true"
"#,
        );
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("duplicate scan name"));
    }

    #[test]
    fn test_scan_without_target_rejected() {
        let raw = base_config(
            r#"
[[scan]]
name = "silent"
handle = "h"
pattern = "x"
"#,
        );
        let err = parse(&raw).unwrap_err();
        assert!(err.to_string().contains("webhook_url and/or shell"));
    }

    #[test]
    fn test_bad_pattern_rejected_before_running() {
        let raw = base_config(
            r#"
[[scan]]
name = "broken"
handle = "h"
pattern = "foo("
shell = "true"
"#,
        );
        let err = parse(&raw).unwrap_err();
        assert!(matches!(err, SkywatchError::Config(_)));
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn test_select_scans_by_name() {
        let raw = base_config(
            r#"
[[scan]]
name = "one"
handle = "h"
pattern = "x"
shell = "true"

[[scan]]
name = "two"
handle = "h"
pattern = "y"
shell = "true"
"#,
        );
        let config = parse(&raw).unwrap();
        assert_eq!(config.select_scans(None).unwrap().len(), 2);
        let one = config.select_scans(Some("one")).unwrap();
        assert_eq!(one.len(), 1);
        assert_eq!(one[0].name, "one");
        assert!(matches!(
            config.select_scans(Some("missing")),
            Err(SkywatchError::NotFound(_))
        ));
    }
}
