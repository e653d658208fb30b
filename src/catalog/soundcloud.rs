//! SoundCloud API adapter.
//!
//! SoundCloud resolves share URLs through a dedicated `/resolve` endpoint and
//! replaces a playlist's track list wholesale on update, so adding tracks
//! means reading the current list and PUTting the union back.

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

const DEFAULT_BASE_URL: &str = "https://api.soundcloud.com";
const PAGE_SIZE: u32 = 200;

pub struct SoundcloudAdapter {
    api: Arc<RateLimitedClient>,
    kv: Arc<dyn KvStore>,
    base_url: String,
}

#[derive(Deserialize)]
struct ScUser {
    #[serde(default)]
    username: String,
}

#[derive(Deserialize)]
struct ScTrack {
    id: u64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    user: Option<ScUser>,
    /// Milliseconds.
    #[serde(default)]
    duration: u64,
    #[serde(default)]
    created_at: String,
}

impl ScTrack {
    fn into_track(self) -> Track {
        let artist = self.user.map(|u| u.username).unwrap_or_default();
        Track {
            external_ref: self.id.to_string(),
            title: self.title,
            artists: vec![artist],
            album: String::new(),
            duration_secs: (self.duration / 1000) as u32,
            release_year: extract_year(&self.created_at),
            isrc: None,
        }
    }
}

impl SoundcloudAdapter {
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

    fn auth_header(credential: &Credential) -> String {
        format!("OAuth {}", credential.access_token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
    ) -> Result<T, AdapterError> {
        let (status, body) = self
            .api
            .execute(
                self.api
                    .http()
                    .get(url)
                    .header("Authorization", Self::auth_header(credential)),
            )
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Soundcloud, status, &body));
        }
        serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
            service: Service::Soundcloud,
            source,
        })
    }

    /// Resolves a share URL to a numeric playlist id. Bare numeric ids pass
    /// through untouched.
    async fn resolve_playlist_id(
        &self,
        credential: &Credential,
        reference: &str,
    ) -> Result<u64, AdapterError> {
        if !reference.is_empty() && reference.chars().all(|c| c.is_ascii_digit()) {
            return reference
                .parse()
                .map_err(|_| AdapterError::InvalidReference {
                    reference: reference.to_string(),
                });
        }
        if !reference.contains("soundcloud.com") {
            return Err(AdapterError::InvalidReference {
                reference: reference.to_string(),
            });
        }

        #[derive(Deserialize)]
        struct Resolved {
            id: u64,
        }
        let url = format!(
            "{}/resolve?url={}",
            self.base_url,
            urlencoding::encode(reference)
        );
        let resolved: Resolved = self.get_json(credential, &url).await?;
        Ok(resolved.id)
    }

    async fn fetch_track_list(
        &self,
        credential: &Credential,
        playlist_id: u64,
    ) -> Result<Vec<ScTrack>, AdapterError> {
        let mut all = Vec::new();
        let mut offset: u32 = 0;
        loop {
            let url = format!(
                "{}/playlists/{}/tracks?limit={}&offset={}&linked_partitioning=false",
                self.base_url, playlist_id, PAGE_SIZE, offset
            );
            let page: Vec<ScTrack> = self.get_json(credential, &url).await?;
            let page_len = page.len() as u32;
            all.extend(page);
            if page_len < PAGE_SIZE {
                break;
            }
            offset += PAGE_SIZE;
        }
        Ok(all)
    }
}

#[async_trait]
impl CatalogAdapter for SoundcloudAdapter {
    fn service(&self) -> Service {
        Service::Soundcloud
    }

    async fn fetch_tracks(
        &self,
        credential: &Credential,
        playlist_ref: &str,
    ) -> Result<Vec<Track>, AdapterError> {
        let playlist_id = self.resolve_playlist_id(credential, playlist_ref).await?;
        let cache_id = playlist_id.to_string();

        if let Some(tracks) = read_cached_tracks(&*self.kv, Service::Soundcloud, &cache_id).await {
            tracing::debug!(playlist_id, "soundcloud playlist served from cache");
            return Ok(tracks);
        }

        let tracks: Vec<Track> = self
            .fetch_track_list(credential, playlist_id)
            .await?
            .into_iter()
            .map(ScTrack::into_track)
            .collect();

        write_cached_tracks(&*self.kv, Service::Soundcloud, &cache_id, &tracks).await;
        Ok(tracks)
    }

    async fn search_track(
        &self,
        credential: &Credential,
        track: &Track,
    ) -> Result<Option<Track>, AdapterError> {
        let artist = track.artists.first().map(String::as_str).unwrap_or("");
        let query = format!("{} {}", track.title, artist);
        let url = format!(
            "{}/tracks?q={}&limit=5",
            self.base_url,
            urlencoding::encode(query.trim())
        );
        let results: Vec<ScTrack> = self.get_json(credential, &url).await?;
        Ok(results.into_iter().next().map(ScTrack::into_track))
    }

    async fn create_playlist(
        &self,
        credential: &Credential,
        name: &str,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/playlists", self.base_url);
        let payload = serde_json::json!({
            "playlist": { "title": name, "sharing": "private" }
        });
        let (status, body) = self
            .api
            .execute(
                self.api
                    .http()
                    .post(&url)
                    .header("Authorization", Self::auth_header(credential))
                    .json(&payload),
            )
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Soundcloud, status, &body));
        }

        #[derive(Deserialize)]
        struct Created {
            id: u64,
        }
        let created: Created =
            serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
                service: Service::Soundcloud,
                source,
            })?;
        Ok(created.id.to_string())
    }

    async fn add_tracks(
        &self,
        credential: &Credential,
        playlist_id: &str,
        tracks: &[Track],
    ) -> Result<(), AdapterError> {
        let playlist_id = self.resolve_playlist_id(credential, playlist_id).await?;

        // The update endpoint replaces the whole track list, so the current
        // list has to come along.
        let mut track_ids: Vec<u64> = self
            .fetch_track_list(credential, playlist_id)
            .await?
            .into_iter()
            .map(|t| t.id)
            .collect();
        for track in tracks {
            let id: u64 =
                track
                    .external_ref
                    .parse()
                    .map_err(|_| AdapterError::InvalidReference {
                        reference: track.external_ref.clone(),
                    })?;
            if !track_ids.contains(&id) {
                track_ids.push(id);
            }
        }

        let entries: Vec<_> = track_ids
            .iter()
            .map(|id| serde_json::json!({ "id": id }))
            .collect();
        let payload = serde_json::json!({ "playlist": { "tracks": entries } });

        let url = format!("{}/playlists/{}", self.base_url, playlist_id);
        let (status, body) = self
            .api
            .execute(
                self.api
                    .http()
                    .put(&url)
                    .header("Authorization", Self::auth_header(credential))
                    .json(&payload),
            )
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Soundcloud, status, &body));
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
    use axum::extract::Query;
    use axum::routing::get;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;

    fn test_credential() -> Credential {
        Credential {
            service: Service::Soundcloud,
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

    #[tokio::test]
    async fn resolves_share_url_then_fetches_tracks() {
        let app = Router::new()
            .route(
                "/resolve",
                get(|Query(params): Query<std::collections::HashMap<String, String>>| async move {
                    assert!(params["url"].contains("soundcloud.com"));
                    axum::Json(serde_json::json!({ "id": 4242, "kind": "playlist" }))
                }),
            )
            .route(
                "/playlists/4242/tracks",
                get(|| async {
                    axum::Json(serde_json::json!([
                        {
                            "id": 11,
                            "title": "Song A",
                            "user": { "username": "Artist X" },
                            "duration": 200_000,
                            "created_at": "2018-04-02T10:00:00Z"
                        },
                        {
                            "id": 12,
                            "title": "Song B",
                            "user": { "username": "Artist Y" },
                            "duration": 185_500,
                            "created_at": "2021-09-12T10:00:00Z"
                        }
                    ]))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let kv = Arc::new(MemoryStore::new());
        let adapter = SoundcloudAdapter::with_base_url(test_api(), kv, format!("http://{addr}"));

        let tracks = adapter
            .fetch_tracks(&test_credential(), "https://soundcloud.com/user/sets/mix")
            .await
            .unwrap();

        assert_eq!(tracks.len(), 2);
        assert_eq!(tracks[0].external_ref, "11");
        assert_eq!(tracks[0].artists, vec!["Artist X".to_string()]);
        assert_eq!(tracks[0].duration_secs, 200);
        assert_eq!(tracks[1].release_year, "2021");
    }

    #[tokio::test]
    async fn numeric_reference_skips_resolution() {
        let app = Router::new().route(
            "/playlists/99/tracks",
            get(|| async { axum::Json(serde_json::json!([])) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let kv = Arc::new(MemoryStore::new());
        let adapter = SoundcloudAdapter::with_base_url(test_api(), kv, format!("http://{addr}"));

        let tracks = adapter.fetch_tracks(&test_credential(), "99").await.unwrap();
        assert!(tracks.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_reference_is_rejected() {
        let kv = Arc::new(MemoryStore::new());
        let adapter =
            SoundcloudAdapter::with_base_url(test_api(), kv, "http://127.0.0.1:1".to_string());

        let err = adapter
            .fetch_tracks(&test_credential(), "https://example.com/whatever")
            .await
            .expect_err("should reject");
        assert!(matches!(err, AdapterError::InvalidReference { .. }));
    }
}
