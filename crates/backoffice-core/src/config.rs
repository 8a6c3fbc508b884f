//! Configuration management for backoffice.
//!
//! Loads configuration from ${BACKOFFICE_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use toml_edit::{DocumentMut, Item, value};
use url::Url;

use crate::atomic::{Access, replace_file};
use crate::lifecycle::CommitPolicy;

/// Environment variable that overrides `api.base_url`.
pub const BASE_URL_ENV: &str = "BACKOFFICE_BASE_URL";

/// Commented template written by `config init`.
const TEMPLATE: &str = include_str!("../default_config.toml");

/// Sections the template defines, in file order.
const SECTIONS: [&str; 3] = ["api", "session", "requests"];

fn template_document() -> Result<DocumentMut> {
    TEMPLATE
        .parse()
        .context("Failed to parse default config template")
}

/// Lays the user's values over the template.
///
/// Known sections keep the template's comments and key order, with every key
/// the user set taking the user's value. Anything else in the user's file is
/// carried over untouched.
fn overlay_on_template(user_config: &str) -> Result<DocumentMut> {
    let mut doc = template_document()?;
    let user: DocumentMut = user_config.parse().context("Failed to parse user config")?;

    for (name, item) in user.iter() {
        if SECTIONS.contains(&name)
            && let (Some(values), Some(section)) = (
                item.as_table(),
                doc.get_mut(name).and_then(Item::as_table_mut),
            )
        {
            for (key, user_value) in values.iter() {
                section[key] = user_value.clone();
            }
            continue;
        }
        doc[name] = item.clone();
    }

    Ok(doc)
}

pub mod paths {
    //! Path resolution for backoffice configuration and session data.
    //!
    //! BACKOFFICE_HOME resolution order:
    //! 1. BACKOFFICE_HOME environment variable (if set)
    //! 2. ~/.config/backoffice (default)

    use std::path::PathBuf;

    /// Returns the backoffice home directory.
    ///
    /// Falls back to `./.backoffice` when no home directory can be determined.
    pub fn backoffice_home() -> PathBuf {
        if let Ok(home) = std::env::var("BACKOFFICE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir().map_or_else(
            || PathBuf::from(".backoffice"),
            |h| h.join(".config").join("backoffice"),
        )
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        backoffice_home().join("config.toml")
    }

    /// Returns the path to the persisted session document.
    pub fn session_path() -> PathBuf {
        backoffice_home().join("session.json")
    }
}

/// API endpoint configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL every relative request path is joined onto
    pub base_url: String,
    /// Request timeout in seconds (0 disables)
    pub timeout_secs: u32,
    /// Credentials exchange endpoint
    pub login_path: String,
    /// Current-user endpoint used by `fetch_user`
    pub user_path: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000/api".to_string(),
            timeout_secs: 30,
            login_path: "/auth/login".to_string(),
            user_path: "/auth/me".to_string(),
        }
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(u64::from(self.timeout_secs)))
        }
    }

    /// Resolves the base URL with precedence: env > config.
    ///
    /// # Errors
    /// Returns an error if the resolved value is not an absolute URL.
    pub fn effective_base_url(&self) -> Result<Url> {
        if let Ok(env_url) = std::env::var(BASE_URL_ENV) {
            let trimmed = env_url.trim();
            if !trimmed.is_empty() {
                return parse_base_url(trimmed)
                    .with_context(|| format!("Invalid {BASE_URL_ENV}: {trimmed}"));
            }
        }

        parse_base_url(self.base_url.trim())
            .with_context(|| format!("Invalid api.base_url: {}", self.base_url))
    }
}

/// Parses a base URL, forcing a trailing slash so relative joins keep the
/// full path prefix (`/api` + `users` -> `/api/users`).
pub fn parse_base_url(raw: &str) -> Result<Url> {
    let mut url = Url::parse(raw)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

/// Session persistence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub token_key: String,
    pub user_key: String,
    /// Maximum age of stored session entries in seconds (0 = until logout)
    pub max_age_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            token_key: "auth_token".to_string(),
            user_key: "auth_user".to_string(),
            max_age_secs: 0,
        }
    }
}

impl SessionConfig {
    pub fn max_age(&self) -> Option<Duration> {
        (self.max_age_secs > 0).then(|| Duration::from_secs(self.max_age_secs))
    }
}

/// Request lifecycle configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestsConfig {
    pub commit_policy: CommitPolicy,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub session: SessionConfig,
    pub requests: RequestsConfig,
}

impl Config {
    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Creates a default config file at the given path.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        replace_file(path, TEMPLATE.as_bytes(), Access::Default)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }

    /// Saves only `api.base_url` to the default config file.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the file cannot be written.
    pub fn save_base_url(url: &str) -> Result<()> {
        Self::save_base_url_to(&paths::config_path(), url)
    }

    /// Saves only `api.base_url` to a specific config file path.
    ///
    /// Creates the file from the template if it doesn't exist; otherwise
    /// merges the user's values into the latest template, keeping comments.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the file cannot be written.
    pub fn save_base_url_to(path: &Path, url: &str) -> Result<()> {
        parse_base_url(url).with_context(|| format!("Invalid base URL: {url}"))?;

        let mut doc = if path.exists() {
            let user_config = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            overlay_on_template(&user_config)
                .with_context(|| format!("Failed to update config at {}", path.display()))?
        } else {
            template_document()?
        };

        doc["api"]["base_url"] = value(url);

        replace_file(path, doc.to_string().as_bytes(), Access::Default)
            .with_context(|| format!("Failed to write config to {}", path.display()))
    }
}
