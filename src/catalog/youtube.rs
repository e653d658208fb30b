//! YouTube Data API v3 adapter.
//!
//! Playlist items carry no duration, so fetches backfill durations (and the
//! music category check for searches) through batched `videos.list` calls.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::api_client::RateLimitedClient;
use crate::catalog::{
    AdapterError, CatalogAdapter, Service, Track, extract_year, read_cached_tracks,
    upstream_error, write_cached_tracks,
};
use crate::credentials::Credential;
use crate::store::KvStore;

const DEFAULT_BASE_URL: &str = "https://www.googleapis.com/youtube/v3";
const PAGE_SIZE: u32 = 50;
/// videos.list accepts at most 50 comma-separated ids.
const DETAILS_BATCH_SIZE: usize = 50;
const MUSIC_CATEGORY_ID: &str = "10";

pub struct YoutubeAdapter {
    api: Arc<RateLimitedClient>,
    kv: Arc<dyn KvStore>,
    base_url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Snippet {
    #[serde(default)]
    title: String,
    #[serde(default)]
    channel_title: String,
    #[serde(default)]
    published_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ItemContentDetails {
    #[serde(default)]
    video_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItem {
    snippet: Snippet,
    content_details: ItemContentDetails,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaylistItemsPage {
    #[serde(default)]
    items: Vec<PlaylistItem>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoDetails {
    #[serde(default)]
    duration: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoItem {
    id: String,
    content_details: VideoDetails,
}

#[derive(Deserialize)]
struct VideosPage {
    #[serde(default)]
    items: Vec<VideoItem>,
}

/// Parses an ISO 8601 duration such as "PT1H3M15S" into seconds.
pub(crate) fn parse_iso8601_duration(value: &str) -> Option<u32> {
    let rest = value
        .strip_prefix("PT")
        .or_else(|| value.strip_prefix('P'))?;
    let mut total: u32 = 0;
    let mut digits = String::new();
    for c in rest.chars() {
        if c.is_ascii_digit() {
            digits.push(c);
        } else {
            let n: u32 = digits.parse().ok()?;
            digits.clear();
            total += match c {
                'D' => n * 86_400,
                'H' => n * 3_600,
                'M' => n * 60,
                'S' => n,
                _ => return None,
            };
        }
    }
    if !digits.is_empty() {
        return None;
    }
    Some(total)
}

/// Extracts the playlist id from a watch/playlist URL (`list=` parameter) or
/// accepts a bare id.
pub(crate) fn parse_playlist_ref(reference: &str) -> Result<String, AdapterError> {
    let invalid = || AdapterError::InvalidReference {
        reference: reference.to_string(),
    };

    if reference.contains("youtube.com") || reference.contains("youtu.be") {
        let url = Url::parse(reference).map_err(|_| invalid())?;
        return url
            .query_pairs()
            .find(|(k, _)| k == "list")
            .map(|(_, v)| v.into_owned())
            .ok_or_else(invalid);
    }
    if !reference.is_empty()
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Ok(reference.to_string());
    }
    Err(invalid())
}

impl YoutubeAdapter {
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

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        credential: &Credential,
        url: &str,
    ) -> Result<T, AdapterError> {
        let (status, body) = self
            .api
            .execute(self.api.http().get(url).bearer_auth(&credential.access_token))
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Youtube, status, &body));
        }
        serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
            service: Service::Youtube,
            source,
        })
    }

    /// Durations for a set of video ids, via batched videos.list calls.
    async fn fetch_durations(
        &self,
        credential: &Credential,
        video_ids: &[String],
    ) -> Result<HashMap<String, u32>, AdapterError> {
        let batches: Vec<_> = video_ids
            .chunks(DETAILS_BATCH_SIZE)
            .map(|chunk| {
                let url = format!(
                    "{}/videos?part=contentDetails&id={}",
                    self.base_url,
                    chunk.join(",")
                );
                async move { self.get_json::<VideosPage>(credential, &url).await }
            })
            .collect();

        let mut durations = HashMap::new();
        for page in futures::future::try_join_all(batches).await? {
            for item in page.items {
                let secs = parse_iso8601_duration(&item.content_details.duration).unwrap_or(0);
                durations.insert(item.id, secs);
            }
        }
        Ok(durations)
    }
}

#[async_trait]
impl CatalogAdapter for YoutubeAdapter {
    fn service(&self) -> Service {
        Service::Youtube
    }

    async fn fetch_tracks(
        &self,
        credential: &Credential,
        playlist_ref: &str,
    ) -> Result<Vec<Track>, AdapterError> {
        let playlist_id = parse_playlist_ref(playlist_ref)?;

        if let Some(tracks) = read_cached_tracks(&*self.kv, Service::Youtube, &playlist_id).await {
            tracing::debug!(playlist_id, "youtube playlist served from cache");
            return Ok(tracks);
        }

        // Token-chained pagination is inherently serial.
        let mut items = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut url = format!(
                "{}/playlistItems?part=snippet,contentDetails&maxResults={}&playlistId={}",
                self.base_url, PAGE_SIZE, playlist_id
            );
            if let Some(token) = &page_token {
                url.push_str(&format!("&pageToken={token}"));
            }
            let page: PlaylistItemsPage = self.get_json(credential, &url).await?;
            items.extend(page.items);
            page_token = page.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        let video_ids: Vec<String> = items
            .iter()
            .map(|item| item.content_details.video_id.clone())
            .collect();
        let durations = self.fetch_durations(credential, &video_ids).await?;

        let tracks: Vec<Track> = items
            .into_iter()
            .map(|item| {
                let video_id = item.content_details.video_id;
                let duration_secs = durations.get(&video_id).copied().unwrap_or(0);
                Track {
                    external_ref: video_id,
                    title: item.snippet.title,
                    artists: vec![item.snippet.channel_title],
                    album: String::new(),
                    duration_secs,
                    release_year: extract_year(&item.snippet.published_at),
                    isrc: None,
                }
            })
            .collect();

        write_cached_tracks(&*self.kv, Service::Youtube, &playlist_id, &tracks).await;
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
            "{}/search?part=snippet&type=video&videoCategoryId={}&maxResults=1&q={}",
            self.base_url,
            MUSIC_CATEGORY_ID,
            urlencoding::encode(query.trim())
        );

        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct SearchId {
            #[serde(default)]
            video_id: String,
        }
        #[derive(Deserialize)]
        struct SearchItem {
            id: SearchId,
            snippet: Snippet,
        }
        #[derive(Deserialize)]
        struct SearchPage {
            #[serde(default)]
            items: Vec<SearchItem>,
        }

        let page: SearchPage = self.get_json(credential, &url).await?;
        let Some(item) = page.items.into_iter().next() else {
            return Ok(None);
        };
        if item.id.video_id.is_empty() {
            return Ok(None);
        }

        let durations = self
            .fetch_durations(credential, std::slice::from_ref(&item.id.video_id))
            .await?;
        let duration_secs = durations.get(&item.id.video_id).copied().unwrap_or(0);

        Ok(Some(Track {
            external_ref: item.id.video_id,
            title: item.snippet.title,
            artists: vec![item.snippet.channel_title],
            album: String::new(),
            duration_secs,
            release_year: extract_year(&item.snippet.published_at),
            isrc: None,
        }))
    }

    async fn create_playlist(
        &self,
        credential: &Credential,
        name: &str,
    ) -> Result<String, AdapterError> {
        let url = format!("{}/playlists?part=snippet", self.base_url);
        let (status, body) = self
            .api
            .execute(
                self.api
                    .http()
                    .post(&url)
                    .bearer_auth(&credential.access_token)
                    .json(&serde_json::json!({ "snippet": { "title": name } })),
            )
            .await?;
        if !status.is_success() {
            return Err(upstream_error(Service::Youtube, status, &body));
        }

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created =
            serde_json::from_slice(&body).map_err(|source| AdapterError::Response {
                service: Service::Youtube,
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
        let url = format!("{}/playlistItems?part=snippet", self.base_url);

        // The playlistItems endpoint only accepts one video per call.
        for track in tracks {
            let payload = serde_json::json!({
                "snippet": {
                    "playlistId": playlist_id,
                    "resourceId": {
                        "kind": "youtube#video",
                        "videoId": track.external_ref,
                    }
                }
            });
            let (status, body) = self
                .api
                .execute(
                    self.api
                        .http()
                        .post(&url)
                        .bearer_auth(&credential.access_token)
                        .json(&payload),
                )
                .await?;
            if !status.is_success() {
                return Err(upstream_error(Service::Youtube, status, &body));
            }
        }
        Ok(())
    }
}
