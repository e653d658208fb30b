//! Catalog adapters: one capability set, three services.
//!
//! Each adapter hides its service's pagination and wire protocol behind
//! [`CatalogAdapter`]; the orchestrator only ever sees [`Track`] values and
//! picks adapters out of a flat [`AdapterRegistry`].

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::api_client::ApiError;
use crate::credentials::Credential;
use crate::store::{KvStore, playlist_cache_key};

pub mod soundcloud;
pub mod spotify;
pub mod youtube;

pub use soundcloud::SoundcloudAdapter;
pub use spotify::SpotifyAdapter;
pub use youtube::YoutubeAdapter;

pub(crate) const PLAYLIST_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Service {
    Spotify,
    Youtube,
    Soundcloud,
}

impl Service {
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Spotify => "spotify",
            Service::Youtube => "youtube",
            Service::Soundcloud => "soundcloud",
        }
    }

    /// Detects the owning service from a share URL.
    pub fn from_share_url(url: &str) -> Option<Service> {
        if url.contains("spotify.com") {
            Some(Service::Spotify)
        } else if url.contains("youtube.com") || url.contains("youtu.be") {
            Some(Service::Youtube)
        } else if url.contains("soundcloud.com") {
            Some(Service::Soundcloud)
        } else {
            None
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "spotify" => Ok(Service::Spotify),
            "youtube" => Ok(Service::Youtube),
            "soundcloud" => Ok(Service::Soundcloud),
            other => Err(format!("unknown service: {other}")),
        }
    }
}

/// A track as one catalog describes it. Immutable once built by an adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Service-native handle (Spotify URI, YouTube video id, SoundCloud
    /// track id) used when writing the track back to its catalog.
    pub external_ref: String,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub duration_secs: u32,
    pub release_year: String,
    /// International Standard Recording Code, when the catalog exposes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isrc: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Api(#[from] ApiError),
    #[error("{service} API error {status}: {message}")]
    Upstream {
        service: Service,
        status: StatusCode,
        message: String,
    },
    #[error("failed to parse {service} response: {source}")]
    Response {
        service: Service,
        #[source]
        source: serde_json::Error,
    },
    #[error("playlist reference {reference:?} not understood")]
    InvalidReference { reference: String },
}

pub(crate) fn upstream_error(service: Service, status: StatusCode, body: &[u8]) -> AdapterError {
    AdapterError::Upstream {
        service,
        status,
        message: String::from_utf8_lossy(body).into_owned(),
    }
}

/// Capability set every catalog must provide.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CatalogAdapter: Send + Sync {
    fn service(&self) -> Service;

    /// All tracks of the referenced playlist, pagination handled internally.
    async fn fetch_tracks(
        &self,
        credential: &Credential,
        playlist_ref: &str,
    ) -> Result<Vec<Track>, AdapterError>;

    /// Service-native best-match lookup. Fuzzy equivalence is the matcher's
    /// job, not the adapter's.
    async fn search_track(
        &self,
        credential: &Credential,
        track: &Track,
    ) -> Result<Option<Track>, AdapterError>;

    /// Creates a playlist and returns its service-native id.
    async fn create_playlist(
        &self,
        credential: &Credential,
        name: &str,
    ) -> Result<String, AdapterError>;

    /// Adds tracks, batching at the service's ceiling.
    async fn add_tracks(
        &self,
        credential: &Credential,
        playlist_id: &str,
        tracks: &[Track],
    ) -> Result<(), AdapterError>;
}

/// Flat service-to-adapter map; tagged dispatch instead of an inheritance
/// hierarchy.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Service, Arc<dyn CatalogAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn CatalogAdapter>) {
        self.adapters.insert(adapter.service(), adapter);
    }

    pub fn get(&self, service: Service) -> Option<Arc<dyn CatalogAdapter>> {
        self.adapters.get(&service).cloned()
    }
}

/// Read-through cache lookup for fetched playlists. Cache trouble is never
/// allowed to fail the fetch.
pub(crate) async fn read_cached_tracks(
    kv: &dyn KvStore,
    service: Service,
    resolved_id: &str,
) -> Option<Vec<Track>> {
    match kv.get(&playlist_cache_key(service, resolved_id)).await {
        Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
        Ok(None) => None,
        Err(e) => {
            tracing::debug!(%service, resolved_id, "playlist cache read failed: {e}");
            None
        }
    }
}

pub(crate) async fn write_cached_tracks(
    kv: &dyn KvStore,
    service: Service,
    resolved_id: &str,
    tracks: &[Track],
) {
    let Ok(raw) = serde_json::to_string(tracks) else {
        return;
    };
    if let Err(e) = kv
        .set(&playlist_cache_key(service, resolved_id), &raw, PLAYLIST_CACHE_TTL)
        .await
    {
        tracing::debug!(%service, resolved_id, "playlist cache write failed: {e}");
    }
}

/// First four characters of a release date, e.g. "2021-03-05" -> "2021".
pub(crate) fn extract_year(date: &str) -> String {
    date.get(..4).unwrap_or("").to_string()
}
