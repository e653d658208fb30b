//! Spotify Web API adapter.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::api_client::RateLimitedClient;
use crate::catalog::{
    AdapterError, CatalogAdapter, Service, Track, extract_year, read_cached_tracks,
    upstream_error, write_cached_tracks,
};
use crate::credentials::Credential;
use crate::store::KvStore;

const DEFAULT_BASE_URL: &str = "https://api.spotify.com/v1";
const PAGE_SIZE: u32 = 100;
const ADD_BATCH_SIZE: usize = 100;

pub struct SpotifyAdapter {
    api: Arc<RateLimitedClient>,
    kv: Arc<dyn KvStore>,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiArtist {
    name: String,
}

#[derive(Deserialize)]
struct ApiAlbum {
    #[serde(default)]
    name: String,
    #[serde(default)]
    release_date: String,
}

#[derive(Deserialize)]
struct ExternalIds {
    #[serde(default)]
    isrc: Option<String>,
}

#[derive(Deserialize)]
struct ApiTrack {
    uri: String,
    name: String,
    #[serde(default)]
    duration_ms: u64,
    album: Option<ApiAlbum>,
    #[serde(default)]
    artists: Vec<ApiArtist>,
    #[serde(default)]
    external_ids: Option<ExternalIds>,
}

impl ApiTrack {
    fn into_track(self) -> Track {
        let (album, release_year) = match self.album {
            Some(album) => (album.name, extract_year(&album.release_date)),
            None => (String::new(), String::new()),
        };
        Track {
            external_ref: self.uri,
            title: self.name,
            artists: self.artists.into_iter().map(|a| a.name).collect(),
            album,
            duration_secs: (self.duration_ms / 1000) as u32,
            release_year,
            isrc: self.external_ids.and_then(|ids| ids.isrc),
        }
    }
}

#[derive(Deserialize)]
struct TracksPage {
    items: Vec<PageItem>,
    #[serde(default)]
    total: u32,
}

#[derive(Deserialize)]
struct PageItem {
    // Local/removed tracks come back as null.
    track: Option<ApiTrack>,
}

/// Extracts the playlist id from a share URL, a `spotify:playlist:` URI or a
/// bare id.
pub(crate) fn parse_playlist_ref(reference: &str) -> Result<String, AdapterError> {
    let invalid = || AdapterError::InvalidReference {
        reference: reference.to_string(),
    };

    if let Some(id) = reference.strip_prefix("spotify:playlist:") {
        return if id.is_empty() { Err(invalid()) } else { Ok(id.to_string()) };
    }
    if reference.contains("spotify.com") {
        let id = reference
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .split(['?', '#'])
            .next()
            .unwrap_or_default();
        return if id.is_empty() { Err(invalid()) } else { Ok(id.to_string()) };
    }
    if !reference.is_empty() && reference.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Ok(reference.to_string());
    }
    Err(invalid())
}

impl SpotifyAdapter {
    pub fn new(api: Arc<RateLimitedClient>, kv: Arc<dyn KvStore>) -> Self {
        Self {
            api,
            kv,
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    #[cfg(test)]
    pub(crate) fn with_base_url(api: Arc<RateLimitedClient>, kv: Arc<dyn KvStore>, base_url: String) -> Self {
        Self { api, kv, base_url }
    }

    async fn fetch_page(
        &self,
        credential: &Credential,
        playlist_id: &str,
        offset: u32,
    ) -> Result<TracksPage, AdapterError> {
        let url = format!(
            "{}/playlists/{}/tracks?limit={}&offset={}",
            self.base_url, playlist_id, PAGE_SIZE, offset
        );
        let (status, body) = self
            .api
            .execute(self.api.http().get(&url).bearer_auth(&credential.access_token))
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Spotify, status, &body));
        }
        serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
            service: Service::Spotify,
            source,
        })
    }
}

#[async_trait]
impl CatalogAdapter for SpotifyAdapter {
    fn service(&self) -> Service {
        Service::Spotify
    }

    async fn fetch_tracks(
        &self,
        credential: &Credential,
        playlist_ref: &str,
    ) -> Result<Vec<Track>, AdapterError> {
        let playlist_id = parse_playlist_ref(playlist_ref)?;

        if let Some(tracks) = read_cached_tracks(&*self.kv, Service::Spotify, &playlist_id).await {
            tracing::debug!(playlist_id, "spotify playlist served from cache");
            return Ok(tracks);
        }

        // First page tells us the total; remaining pages are fetched in
        // parallel, bounded by the shared client's slots and pacing.
        let first = self.fetch_page(credential, &playlist_id, 0).await?;
        let total = first.total;
        let mut pages = vec![first];

        let remaining: Vec<_> = (1..total.div_ceil(PAGE_SIZE))
            .map(|page| self.fetch_page(credential, &playlist_id, page * PAGE_SIZE))
            .collect();
        pages.extend(futures::future::try_join_all(remaining).await?);

        let tracks: Vec<Track> = pages
            .into_iter()
            .flat_map(|page| page.items)
            .filter_map(|item| item.track.map(ApiTrack::into_track))
            .collect();

        write_cached_tracks(&*self.kv, Service::Spotify, &playlist_id, &tracks).await;
        Ok(tracks)
    }

    async fn search_track(
        &self,
        credential: &Credential,
        track: &Track,
    ) -> Result<Option<Track>, AdapterError> {
        let artist = track.artists.first().map(String::as_str).unwrap_or("");
        let query = format!("track:{} artist:{}", track.title, artist);
        let url = format!(
            "{}/search?type=track&limit=5&q={}",
            self.base_url,
            urlencoding::encode(&query)
        );

        let (status, body) = self
            .api
            .execute(self.api.http().get(&url).bearer_auth(&credential.access_token))
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Spotify, status, &body));
        }

        #[derive(Deserialize)]
        struct SearchResponse {
            tracks: SearchTracks,
        }
        #[derive(Deserialize)]
        struct SearchTracks {
            items: Vec<ApiTrack>,
        }

        let response: SearchResponse =
            serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
                service: Service::Spotify,
                source,
            })?;
        Ok(response.tracks.items.into_iter().next().map(ApiTrack::into_track))
    }

    async fn create_playlist(
        &self,
        credential: &Credential,
        name: &str,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/me/playlists", self.base_url);
        let (status, body) = self
            .api
            .execute(
                self.api
                    .http()
                    .post(&url)
                    .bearer_auth(&credential.access_token)
                    .json(&serde_json::json!({ "name": name, "public": false })),
            )
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Spotify, status, &body));
        }

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created =
            serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
                service: Service::Spotify,
                source,
            })?;
        Ok(created.id)
    }

    async fn add_tracks(
        &self,
        credential: &Credential,
        playlist_id: &str,
        tracks: &[Track],
    ) -> Result<(), AdapterError> {
        let playlist_id = parse_playlist_ref(playlist_id)?;
        let url = format!("{}/playlists/{}/tracks", self.base_url, playlist_id);

        for batch in tracks.chunks(ADD_BATCH_SIZE) {
            let uris: Vec<&str> = batch.iter().map(|t| t.external_ref.as_str()).collect();
            let (status, body) = self
                .api
                .execute(
                    self.api
                        .http()
                        .post(&url)
                        .bearer_auth(&credential.access_token)
                        .json(&serde_json::json!({ "uris": uris })),
                )
                .await?;
            if !status.is_success() {
                return Err(upstream_error(Service::Spotify, status, &body));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::ApiClientConfig;
    use crate::store::MemoryStore;
    use axum::Router;
    use axum::extract::{Path, Query};
    use axum::routing::get;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_credential() -> Credential {
        Credential {
            service: Service::Spotify,
            user_id: 1,
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(1),
            token_type: "Bearer".to_string(),
        }
    }

    fn test_api() -> Arc<RateLimitedClient> {
        Arc::new(RateLimitedClient::new(ApiClientConfig {
            max_concurrent: 5,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            base_backoff: Duration::from_millis(1),
            pace: Duration::from_millis(1),
        }))
    }

    fn track_json(n: u32) -> serde_json::Value {
        serde_json::json!({
            "track": {
                "uri": format!("spotify:track:{n}"),
                "name": format!("Song {n}"),
                "duration_ms": 200_000,
                "album": { "name": "Album", "release_date": "2020-01-01" },
                "artists": [{ "name": "Artist" }],
                "external_ids": { "isrc": format!("ISRC{n}") }
            }
        })
    }

    async fn spawn_paginated_server(total: u32, hits: Arc<AtomicUsize>) -> String {
        let app = Router::new().route(
            "/playlists/{id}/tracks",
            get(move |Path(_id): Path<String>, Query(params): Query<HashMap<String, String>>| {
                let hits = hits.clone();
                async move {
                    hits.fetch_add(1, Ordering::SeqCst);
                    let offset: u32 = params
                        .get("offset")
                        .and_then(|v| v.parse().ok())
                        .unwrap_or(0);
                    let end = (offset + PAGE_SIZE).min(total);
                    let items: Vec<_> = (offset..end).map(track_json).collect();
                    axum::Json(serde_json::json!({ "items": items, "total": total }))
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[test]
    fn playlist_ref_parsing() {
        assert_eq!(
            parse_playlist_ref("https://open.spotify.com/playlist/37i9dQZF1?si=abc").unwrap(),
            "37i9dQZF1"
        );
        assert_eq!(
            parse_playlist_ref("spotify:playlist:37i9dQZF1").unwrap(),
            "37i9dQZF1"
        );
        assert_eq!(parse_playlist_ref("37i9dQZF1").unwrap(), "37i9dQZF1");
        assert!(parse_playlist_ref("not a playlist!").is_err());
    }

    #[tokio::test]
    async fn fetch_merges_pages() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_paginated_server(150, hits.clone()).await;
        let kv = Arc::new(MemoryStore::new());
        let adapter = SpotifyAdapter::with_base_url(test_api(), kv, base);

        let tracks = adapter
            .fetch_tracks(&test_credential(), "playlist1")
            .await
            .unwrap();

        assert_eq!(tracks.len(), 150);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(tracks[0].external_ref, "spotify:track:0");
        assert_eq!(tracks[0].duration_secs, 200);
        assert_eq!(tracks[0].release_year, "2020");
        assert_eq!(tracks[149].external_ref, "spotify:track:149");
    }

    #[tokio::test]
    async fn second_fetch_is_served_from_cache() {
        let hits = Arc::new(AtomicUsize::new(0));
        let base = spawn_paginated_server(3, hits.clone()).await;
        let kv = Arc::new(MemoryStore::new());
        let adapter = SpotifyAdapter::with_base_url(test_api(), kv, base);
        let credential = test_credential();

        let first = adapter.fetch_tracks(&credential, "playlist1").await.unwrap();
        let second = adapter.fetch_tracks(&credential, "playlist1").await.unwrap();

        assert_eq!(first, second);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn search_miss_is_none() {
        let app = Router::new().route(
            "/search",
            get(|| async {
                axum::Json(serde_json::json!({ "tracks": { "items": [] } }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let kv = Arc::new(MemoryStore::new());
        let adapter = SpotifyAdapter::with_base_url(test_api(), kv, format!("http://{addr}"));
        let track = Track {
            external_ref: "x".into(),
            title: "Ghost Song".into(),
            artists: vec!["Nobody".into()],
            album: String::new(),
            duration_secs: 100,
            release_year: String::new(),
            isrc: None,
        };

        let found = adapter.search_track(&test_credential(), &track).await.unwrap();
        assert!(found.is_none());
    }
}
