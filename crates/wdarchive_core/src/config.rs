use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::model::PageFormat;

pub const DEFAULT_CONFIG_FILENAME: &str = "wdarchive.toml";
pub const DEFAULT_USER_AGENT: &str = "wdarchive/0.1";
pub const DEFAULT_DELAY_MS: u64 = 200;
pub const DEFAULT_MAX_RETRIES: usize = 5;
pub const DEFAULT_RETRY_UNIT_MS: u64 = 1000;
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DEPTH: usize = 10_000;
pub const DEFAULT_MAX_PAGE_COUNT: usize = 10_000;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct ArchiveConfig {
    #[serde(default)]
    pub site: SiteSection,
    #[serde(default)]
    pub dump: DumpSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct SiteSection {
    pub url: Option<String>,
    pub user_agent: Option<String>,
    pub delay_ms: Option<u64>,
    pub max_retries: Option<usize>,
    pub retry_unit_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DumpSection {
    pub depth: Option<usize>,
    pub max_page_count: Option<usize>,
    pub ignored_pages: Option<Vec<String>>,
    pub format: Option<String>,
    pub store_rev_ids: Option<bool>,
}

/// Resolved HTTP client settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub site_url: String,
    pub user_agent: String,
    pub delay_ms: u64,
    pub max_retries: usize,
    pub retry_unit_ms: u64,
    pub timeout_ms: u64,
}

impl ArchiveConfig {
    /// Resolve the site URL: env WDARCHIVE_SITE > config > None.
    pub fn site_url(&self) -> Option<String> {
        env_string("WDARCHIVE_SITE").or_else(|| self.site.url.clone())
    }

    /// Resolve client settings with env > config > defaults precedence.
    pub fn client_settings(&self, site_url: &str) -> ClientSettings {
        ClientSettings {
            site_url: site_url.trim().trim_end_matches('/').to_string(),
            user_agent: env_string("WDARCHIVE_USER_AGENT")
                .or_else(|| self.site.user_agent.clone())
                .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            delay_ms: env_parsed("WDARCHIVE_DELAY_MS")
                .or(self.site.delay_ms)
                .unwrap_or(DEFAULT_DELAY_MS),
            max_retries: env_parsed("WDARCHIVE_HTTP_RETRIES")
                .or(self.site.max_retries)
                .unwrap_or(DEFAULT_MAX_RETRIES)
                .max(1),
            retry_unit_ms: env_parsed("WDARCHIVE_RETRY_UNIT_MS")
                .or(self.site.retry_unit_ms)
                .unwrap_or(DEFAULT_RETRY_UNIT_MS),
            timeout_ms: env_parsed("WDARCHIVE_HTTP_TIMEOUT_MS")
                .or(self.site.timeout_ms)
                .unwrap_or(DEFAULT_TIMEOUT_MS),
        }
    }

    pub fn depth(&self) -> usize {
        self.dump.depth.unwrap_or(DEFAULT_DEPTH)
    }

    pub fn max_page_count(&self) -> usize {
        self.dump.max_page_count.unwrap_or(DEFAULT_MAX_PAGE_COUNT)
    }

    pub fn ignored_pages(&self) -> Vec<String> {
        self.dump
            .ignored_pages
            .clone()
            .unwrap_or_else(|| vec!["sandbox".to_string()])
    }

    pub fn format(&self) -> Result<Option<PageFormat>> {
        self.dump
            .format
            .as_deref()
            .map(PageFormat::parse)
            .transpose()
    }

    pub fn store_rev_ids(&self) -> bool {
        self.dump.store_rev_ids.unwrap_or(false)
    }
}

/// Config path: explicit > env WDARCHIVE_CONFIG > `wdarchive.toml` in `cwd`.
pub fn resolve_config_path(explicit: Option<&Path>, cwd: &Path) -> PathBuf {
    if let Some(path) = explicit {
        return path.to_path_buf();
    }
    if let Some(value) = env_string("WDARCHIVE_CONFIG") {
        return PathBuf::from(value);
    }
    cwd.join(DEFAULT_CONFIG_FILENAME)
}

/// Load and parse an ArchiveConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<ArchiveConfig> {
    if !config_path.exists() {
        return Ok(ArchiveConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: ArchiveConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn env_parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
    env_string(key).and_then(|value| value.parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn load_config_returns_default_for_missing_file() {
        let config = load_config(Path::new("/nonexistent/wdarchive.toml")).expect("load config");
        assert_eq!(config, ArchiveConfig::default());
        assert_eq!(config.depth(), DEFAULT_DEPTH);
        assert_eq!(config.ignored_pages(), vec!["sandbox".to_string()]);
        assert!(!config.store_rev_ids());
    }

    #[test]
    fn load_config_parses_both_sections() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wdarchive.toml");
        fs::write(
            &config_path,
            r#"
[site]
url = "http://example.wikidot.com"
delay_ms = 50
retry_unit_ms = 10

[dump]
depth = 3
max_page_count = 20
ignored_pages = []
format = "legacy"
store_rev_ids = true
"#,
        )
        .expect("write config");

        let config = load_config(&config_path).expect("load config");
        assert_eq!(config.site.url.as_deref(), Some("http://example.wikidot.com"));
        assert_eq!(config.depth(), 3);
        assert_eq!(config.max_page_count(), 20);
        assert!(config.ignored_pages().is_empty());
        assert_eq!(config.format().expect("format"), Some(PageFormat::Legacy));
        assert!(config.store_rev_ids());
    }

    #[test]
    fn client_settings_fall_back_to_defaults_and_trim_trailing_slash() {
        let config = ArchiveConfig {
            site: SiteSection {
                delay_ms: Some(75),
                max_retries: Some(0),
                ..SiteSection::default()
            },
            ..ArchiveConfig::default()
        };
        let settings = config.client_settings("http://example.wikidot.com/");
        assert_eq!(settings.site_url, "http://example.wikidot.com");
        assert_eq!(settings.max_retries, 1);
        assert_eq!(settings.timeout_ms, DEFAULT_TIMEOUT_MS);
    }

    #[test]
    fn load_config_returns_error_for_invalid_toml() {
        let temp = tempdir().expect("tempdir");
        let config_path = temp.path().join("wdarchive.toml");
        fs::write(&config_path, "[site\nurl = \"oops\"").expect("write config");
        let error = load_config(&config_path).expect_err("must fail");
        assert!(error.to_string().contains("failed to parse"));
    }

    #[test]
    fn invalid_format_value_is_reported() {
        let config = ArchiveConfig {
            dump: DumpSection {
                format: Some("markdown".to_string()),
                ..DumpSection::default()
            },
            ..ArchiveConfig::default()
        };
        assert!(config.format().is_err());
    }
}
