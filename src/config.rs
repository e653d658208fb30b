use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use color_eyre::Result;
use color_eyre::eyre::Context;
use serde::Deserialize;

use crate::api_client::ApiClientConfig;
use crate::catalog::Service;
use crate::credentials::OAuthClientConfig;

#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiSection,
    #[serde(default)]
    pub sync: SyncSection,
    #[serde(default)]
    pub services: ServicesSection,
}

#[derive(Debug, Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_secs")]
    pub backoff_secs: u64,
    #[serde(default = "default_pace_ms")]
    pub pace_ms: u64,
}

#[derive(Debug, Deserialize)]
pub struct SyncSection {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_match_threshold")]
    pub match_threshold: u8,
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Default, Deserialize)]
pub struct ServicesSection {
    #[serde(default)]
    pub spotify: Option<OAuthClientConfig>,
    #[serde(default)]
    pub youtube: Option<OAuthClientConfig>,
    #[serde(default)]
    pub soundcloud: Option<OAuthClientConfig>,
}

fn default_max_concurrent() -> usize {
    5
}
fn default_timeout_secs() -> u64 {
    10
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_secs() -> u64 {
    1
}
fn default_pace_ms() -> u64 {
    200
}
fn default_workers() -> usize {
    5
}
fn default_match_threshold() -> u8 {
    crate::matching::DEFAULT_MATCH_THRESHOLD
}
fn default_visibility_timeout_secs() -> u64 {
    60
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_secs: default_backoff_secs(),
            pace_ms: default_pace_ms(),
        }
    }
}

impl Default for SyncSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            match_threshold: default_match_threshold(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
        }
    }
}

impl Config {
    /// Load config from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .wrap_err_with(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Get the config file path
    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|path| path.join("playlist-sync").join("config.toml"))
    }

    /// Load from the default location; a missing file yields defaults so the
    /// service can run entirely from environment variables.
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) if path.exists() => Self::from_file(&path),
            _ => Ok(Self::default()),
        }
    }

    pub fn api_client_config(&self) -> ApiClientConfig {
        ApiClientConfig {
            max_concurrent: self.api.max_concurrent,
            timeout: Duration::from_secs(self.api.timeout_secs),
            max_retries: self.api.max_retries,
            base_backoff: Duration::from_secs(self.api.backoff_secs),
            pace: Duration::from_millis(self.api.pace_ms),
        }
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.visibility_timeout_secs)
    }

    /// OAuth client per service, with environment variables as fallback for
    /// anything the file leaves out.
    pub fn oauth_clients(&self) -> HashMap<Service, OAuthClientConfig> {
        let mut clients = HashMap::new();
        let sections = [
            (Service::Spotify, &self.services.spotify, "SPOTIFY"),
            (Service::Youtube, &self.services.youtube, "YOUTUBE"),
            (Service::Soundcloud, &self.services.soundcloud, "SOUNDCLOUD"),
        ];
        for (service, section, prefix) in sections {
            let client = section.clone().or_else(|| oauth_from_env(prefix));
            if let Some(client) = client {
                clients.insert(service, client);
            }
        }
        clients
    }
}

fn oauth_from_env(prefix: &str) -> Option<OAuthClientConfig> {
    let client_id = std::env::var(format!("{prefix}_CLIENT_ID")).ok()?;
    let client_secret = std::env::var(format!("{prefix}_CLIENT_SECRET")).ok()?;
    let redirect_uri = std::env::var(format!("{prefix}_REDIRECT_URI")).ok()?;
    Some(OAuthClientConfig {
        client_id,
        client_secret,
        redirect_uri,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_falls_back_to_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.api.max_concurrent, 5);
        assert_eq!(config.api.pace_ms, 200);
        assert_eq!(config.sync.workers, 5);
        assert_eq!(config.sync.match_threshold, 80);
        assert!(config.services.spotify.is_none());
    }

    #[test]
    fn partial_sections_keep_defaults_for_the_rest() {
        let config: Config = toml::from_str(
            r#"
            [api]
            max_concurrent = 10

            [services.spotify]
            client_id = "id"
            client_secret = "secret"
            redirect_uri = "http://localhost/callback"
            "#,
        )
        .unwrap();
        assert_eq!(config.api.max_concurrent, 10);
        assert_eq!(config.api.timeout_secs, 10);
        assert_eq!(
            config.services.spotify.as_ref().unwrap().client_id,
            "id"
        );
        assert!(config.services.youtube.is_none());
    }

    #[test]
    fn api_client_config_conversion() {
        let config = Config::default();
        let api = config.api_client_config();
        assert_eq!(api.pace, Duration::from_millis(200));
        assert_eq!(api.base_backoff, Duration::from_secs(1));
    }
}
