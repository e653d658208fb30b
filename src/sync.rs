//! Playlist reconciliation engine.
//!
//! A sync run fetches both sides, finds source tracks missing from the
//! target, re-finds each one through the target's own search, and adds the
//! confident matches. Per-track trouble is recorded and skipped; the run
//! keeps going.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{AdapterError, AdapterRegistry, CatalogAdapter, Service, Track};
use crate::credentials::{Credential, CredentialError, CredentialStore};
use crate::dispatcher::{ActionKind, SyncTask};
use crate::matching::{Matcher, TrackMetadata};
use crate::store::{KvStore, StoreError, report_key};

const REPORT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Accumulated outcome of every sync run for one chat, kept for a day.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncReport {
    pub added: u32,
    pub unresolved: Vec<String>,
    pub errors: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn new() -> Self {
        Self {
            updated_at: Utc::now(),
            ..Self::default()
        }
    }
}

/// What one run produced, before folding into the stored report.
#[derive(Debug, Default)]
pub struct SyncOutcome {
    pub added: u32,
    pub unresolved: Vec<String>,
    pub errors: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Credentials(#[from] CredentialError),
    #[error("no adapter registered for {0}")]
    UnknownService(Service),
    #[error("malformed sync task: {0}")]
    InvalidTask(String),
    #[error("failed to fetch {service} playlist: {source}")]
    Fetch {
        service: Service,
        #[source]
        source: AdapterError,
    },
    #[error("failed to update {service} playlist: {source}")]
    Apply {
        service: Service,
        #[source]
        source: AdapterError,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("failed to encode report: {0}")]
    Encode(#[from] serde_json::Error),
}

impl SyncError {
    /// Infrastructure failures are worth redelivering; everything else would
    /// fail the same way again.
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, SyncError::Store(_))
    }
}

pub struct SyncEngine {
    adapters: AdapterRegistry,
    credentials: Arc<CredentialStore>,
    matcher: Matcher,
    kv: Arc<dyn KvStore>,
}

impl SyncEngine {
    pub fn new(
        adapters: AdapterRegistry,
        credentials: Arc<CredentialStore>,
        matcher: Matcher,
        kv: Arc<dyn KvStore>,
    ) -> Self {
        Self {
            adapters,
            credentials,
            matcher,
            kv,
        }
    }

    fn adapter(&self, service: Service) -> Result<Arc<dyn CatalogAdapter>, SyncError> {
        self.adapters
            .get(service)
            .ok_or(SyncError::UnknownService(service))
    }

    /// Runs one task to completion and folds the outcome into the chat's
    /// stored report.
    pub async fn run(&self, task: &SyncTask) -> Result<SyncOutcome, SyncError> {
        let source = self.adapter(task.source)?;
        let target = self.adapter(task.target)?;
        let source_cred = self.credentials.get(task.source, task.user_id, false).await?;
        let target_cred = self.credentials.get(task.target, task.user_id, false).await?;

        tracing::info!(
            user_id = task.user_id,
            source = %task.source,
            target = %task.target,
            action = ?task.action,
            "starting sync"
        );

        let mut outcome = SyncOutcome::default();

        match &task.target_playlist_ref {
            Some(target_ref) => {
                let (source_tracks, target_tracks) = tokio::try_join!(
                    fetch(&*source, &source_cred, &task.playlist_ref),
                    fetch(&*target, &target_cred, target_ref),
                )?;

                self.sync_direction(
                    &*target,
                    &target_cred,
                    target_ref,
                    &source_tracks,
                    &target_tracks,
                    &mut outcome,
                )
                .await?;

                if task.action == ActionKind::BidirectionalSync {
                    self.sync_direction(
                        &*source,
                        &source_cred,
                        &task.playlist_ref,
                        &target_tracks,
                        &source_tracks,
                        &mut outcome,
                    )
                    .await?;
                }
            }
            None => {
                if task.action == ActionKind::BidirectionalSync {
                    return Err(SyncError::InvalidTask(
                        "bidirectional sync requires an existing target playlist".to_string(),
                    ));
                }
                let source_tracks = fetch(&*source, &source_cred, &task.playlist_ref).await?;
                let name = format!("Imported from {}", task.source);
                let target_ref = target
                    .create_playlist(&target_cred, &name)
                    .await
                    .map_err(|source| SyncError::Apply {
                        service: task.target,
                        source,
                    })?;
                tracing::info!(target = %task.target, playlist_id = %target_ref, "created target playlist");

                self.sync_direction(&*target, &target_cred, &target_ref, &source_tracks, &[], &mut outcome)
                    .await?;
            }
        }

        self.update_report(task.chat_id, &outcome).await?;
        tracing::info!(
            user_id = task.user_id,
            added = outcome.added,
            unresolved = outcome.unresolved.len(),
            errors = outcome.errors.len(),
            "sync finished"
        );
        Ok(outcome)
    }

    /// Pushes tracks present in `from` but missing in `to` onto the playlist
    /// `to_ref` owned by `to_adapter`.
    async fn sync_direction(
        &self,
        to_adapter: &dyn CatalogAdapter,
        to_cred: &Credential,
        to_ref: &str,
        from: &[Track],
        to: &[Track],
        outcome: &mut SyncOutcome,
    ) -> Result<(), SyncError> {
        let missing = self.matcher.missing_from(from, to);
        if missing.is_empty() {
            return Ok(());
        }
        tracing::debug!(target = %to_adapter.service(), missing = missing.len(), "tracks to reconcile");

        let mut to_add: Vec<Track> = Vec::new();
        for track in missing {
            match to_adapter.search_track(to_cred, track).await {
                Ok(Some(found)) => {
                    let wanted = TrackMetadata::from(track);
                    let candidate = TrackMetadata::from(&found);
                    if self.matcher.is_match(&wanted, &candidate) {
                        to_add.push(found);
                    } else {
                        outcome.unresolved.push(describe(track));
                    }
                }
                Ok(None) => outcome.unresolved.push(describe(track)),
                Err(e) => {
                    tracing::warn!(track = %describe(track), error = %e, "search failed, skipping track");
                    outcome.errors.push(format!("{}: {e}", describe(track)));
                }
            }
        }

        if !to_add.is_empty() {
            to_adapter
                .add_tracks(to_cred, to_ref, &to_add)
                .await
                .map_err(|source| SyncError::Apply {
                    service: to_adapter.service(),
                    source,
                })?;
            outcome.added += to_add.len() as u32;
        }
        Ok(())
    }

    /// Folds an outcome into the chat's report with a fresh TTL. Persisted
    /// with compare-and-set so workers finishing concurrently for the same
    /// chat never drop each other's entries.
    async fn update_report(&self, chat_id: i64, outcome: &SyncOutcome) -> Result<(), SyncError> {
        let key = report_key(chat_id);
        loop {
            let current = self.kv.get(&key).await?;
            let mut report = match &current {
                Some(raw) => serde_json::from_str(raw).unwrap_or_else(|_| SyncReport::new()),
                None => SyncReport::new(),
            };
            report.added += outcome.added;
            report.unresolved.extend(outcome.unresolved.iter().cloned());
            report.errors.extend(outcome.errors.iter().cloned());
            report.updated_at = Utc::now();

            let raw = serde_json::to_string(&report)?;
            if self
                .kv
                .compare_and_set(&key, current.as_deref(), &raw, REPORT_TTL)
                .await?
            {
                return Ok(());
            }
            tracing::debug!(chat_id, "report changed underneath us, refolding");
        }
    }

    /// Records a run that failed outright so the report shows it.
    pub async fn record_failure(&self, chat_id: i64, message: String) {
        let outcome = SyncOutcome {
            errors: vec![message],
            ..SyncOutcome::default()
        };
        if let Err(e) = self.update_report(chat_id, &outcome).await {
            tracing::error!(chat_id, error = %e, "failed to record sync failure");
        }
    }

    /// The stored report for a chat, if one exists and has not expired.
    pub async fn report(&self, chat_id: i64) -> Result<Option<SyncReport>, SyncError> {
        let Some(raw) = self.kv.get(&report_key(chat_id)).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_str(&raw).ok())
    }
}

async fn fetch(
    adapter: &dyn CatalogAdapter,
    credential: &Credential,
    playlist_ref: &str,
) -> Result<Vec<Track>, SyncError> {
    adapter
        .fetch_tracks(credential, playlist_ref)
        .await
        .map_err(|source| SyncError::Fetch {
            service: adapter.service(),
            source,
        })
}

/// Human-readable track label for reports.
fn describe(track: &Track) -> String {
    let artist = track.artists.first().map(String::as_str).unwrap_or("?");
    format!("{} - {}", artist, track.title)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api_client::{ApiClientConfig, RateLimitedClient};
    use crate::catalog::MockCatalogAdapter;
    use crate::store::MemoryStore;
    use chrono::Duration as ChronoDuration;
    use mockall::predicate::eq;
    use std::collections::HashMap;

    fn track(title: &str, artist: &str, duration_secs: u32) -> Track {
        Track {
            external_ref: format!("ref:{title}"),
            title: title.to_string(),
            artists: vec![artist.to_string()],
            album: "Album".to_string(),
            duration_secs,
            release_year: "2020".to_string(),
            isrc: None,
        }
    }

    fn far_future_credential(service: Service) -> Credential {
        Credential {
            service,
            user_id: 7,
            access_token: "token".to_string(),
            refresh_token: "refresh".to_string(),
            expires_at: Utc::now() + ChronoDuration::hours(12),
            token_type: "Bearer".to_string(),
        }
    }

    async fn engine_with(
        source: MockCatalogAdapter,
        target: MockCatalogAdapter,
        kv: Arc<MemoryStore>,
    ) -> SyncEngine {
        let api = Arc::new(RateLimitedClient::new(ApiClientConfig {
            max_concurrent: 5,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            base_backoff: Duration::from_millis(1),
            pace: Duration::from_millis(1),
        }));
        let credentials = Arc::new(CredentialStore::new(kv.clone(), api, HashMap::new()));
        credentials
            .store(&far_future_credential(Service::Spotify))
            .await
            .unwrap();
        credentials
            .store(&far_future_credential(Service::Youtube))
            .await
            .unwrap();

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(source));
        adapters.register(Arc::new(target));
        SyncEngine::new(adapters, credentials, Matcher::default(), kv)
    }

    fn task() -> SyncTask {
        SyncTask {
            user_id: 7,
            chat_id: 42,
            source: Service::Spotify,
            target: Service::Youtube,
            playlist_ref: "src-playlist".to_string(),
            target_playlist_ref: Some("dst-playlist".to_string()),
            action: ActionKind::Sync,
        }
    }

    #[tokio::test]
    async fn missing_tracks_are_searched_and_added() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        source.expect_fetch_tracks().returning(|_, _| {
            Ok(vec![
                track("Song A", "Artist X", 200),
                track("Song B", "Artist Y", 180),
            ])
        });

        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);
        target
            .expect_fetch_tracks()
            .returning(|_, _| Ok(Vec::new()));
        target.expect_search_track().returning(|_, wanted| {
            Ok(Some(track(&wanted.title, &wanted.artists[0], wanted.duration_secs)))
        });
        target
            .expect_add_tracks()
            .with(mockall::predicate::always(), eq("dst-playlist"), mockall::predicate::function(|t: &[Track]| t.len() == 2))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let outcome = engine.run(&task()).await.unwrap();
        assert_eq!(outcome.added, 2);
        assert!(outcome.unresolved.is_empty());
        assert!(outcome.errors.is_empty());

        let report = engine.report(42).await.unwrap().unwrap();
        assert_eq!(report.added, 2);
    }

    #[tokio::test]
    async fn unfindable_track_is_reported_and_skipped() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        source.expect_fetch_tracks().returning(|_, _| {
            Ok(vec![
                track("Song A", "Artist X", 200),
                track("Obscure B-Side", "Nobody", 180),
            ])
        });

        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);
        target
            .expect_fetch_tracks()
            .returning(|_, _| Ok(Vec::new()));
        target.expect_search_track().returning(|_, wanted| {
            if wanted.title == "Song A" {
                Ok(Some(track("Song A", "Artist X", 200)))
            } else {
                Ok(None)
            }
        });
        target
            .expect_add_tracks()
            .times(1)
            .returning(|_, _, tracks| {
                assert_eq!(tracks.len(), 1);
                Ok(())
            });

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let outcome = engine.run(&task()).await.unwrap();
        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.unresolved, vec!["Nobody - Obscure B-Side".to_string()]);
    }

    #[tokio::test]
    async fn low_confidence_search_hit_is_unresolved() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        source
            .expect_fetch_tracks()
            .returning(|_, _| Ok(vec![track("Song A", "Artist X", 200)]));

        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);
        target
            .expect_fetch_tracks()
            .returning(|_, _| Ok(Vec::new()));
        // The search returns something, but it is a different recording.
        target
            .expect_search_track()
            .returning(|_, _| Ok(Some(track("Totally Other Song", "Cover Band", 90))));
        target.expect_add_tracks().times(0);

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let outcome = engine.run(&task()).await.unwrap();
        assert_eq!(outcome.added, 0);
        assert_eq!(outcome.unresolved, vec!["Artist X - Song A".to_string()]);
    }

    #[tokio::test]
    async fn missing_target_playlist_is_created() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        source
            .expect_fetch_tracks()
            .returning(|_, _| Ok(vec![track("Song A", "Artist X", 200)]));

        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);
        target
            .expect_create_playlist()
            .with(mockall::predicate::always(), eq("Imported from spotify"))
            .times(1)
            .returning(|_, _| Ok("new-playlist".to_string()));
        target
            .expect_search_track()
            .returning(|_, wanted| Ok(Some(track(&wanted.title, &wanted.artists[0], 200))));
        target
            .expect_add_tracks()
            .with(mockall::predicate::always(), eq("new-playlist"), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let mut task = task();
        task.target_playlist_ref = None;
        let outcome = engine.run(&task).await.unwrap();
        assert_eq!(outcome.added, 1);
    }

    #[tokio::test]
    async fn bidirectional_sync_pushes_both_ways() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        source
            .expect_fetch_tracks()
            .returning(|_, _| Ok(vec![track("Only On Source", "Artist X", 200)]));
        source
            .expect_search_track()
            .returning(|_, wanted| Ok(Some(track(&wanted.title, &wanted.artists[0], wanted.duration_secs))));
        source
            .expect_add_tracks()
            .with(mockall::predicate::always(), eq("src-playlist"), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);
        target
            .expect_fetch_tracks()
            .returning(|_, _| Ok(vec![track("Only On Target", "Artist Y", 180)]));
        target
            .expect_search_track()
            .returning(|_, wanted| Ok(Some(track(&wanted.title, &wanted.artists[0], wanted.duration_secs))));
        target
            .expect_add_tracks()
            .with(mockall::predicate::always(), eq("dst-playlist"), mockall::predicate::always())
            .times(1)
            .returning(|_, _, _| Ok(()));

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let mut task = task();
        task.action = ActionKind::BidirectionalSync;
        let outcome = engine.run(&task).await.unwrap();
        assert_eq!(outcome.added, 2);
    }

    #[tokio::test]
    async fn bidirectional_without_target_playlist_is_invalid() {
        let mut source = MockCatalogAdapter::new();
        source.expect_service().return_const(Service::Spotify);
        let mut target = MockCatalogAdapter::new();
        target.expect_service().return_const(Service::Youtube);

        let kv = Arc::new(MemoryStore::new());
        let engine = engine_with(source, target, kv).await;

        let mut task = task();
        task.action = ActionKind::BidirectionalSync;
        task.target_playlist_ref = None;
        let err = engine.run(&task).await.expect_err("invalid combination");
        assert!(matches!(err, SyncError::InvalidTask(_)));
        assert!(!err.is_infrastructure());
    }

    #[tokio::test]
    async fn reports_accumulate_across_runs() {
        let kv = Arc::new(MemoryStore::new());

        let make_mocks = || {
            let mut source = MockCatalogAdapter::new();
            source.expect_service().return_const(Service::Spotify);
            source
                .expect_fetch_tracks()
                .returning(|_, _| Ok(vec![track("Song A", "Artist X", 200)]));
            let mut target = MockCatalogAdapter::new();
            target.expect_service().return_const(Service::Youtube);
            target
                .expect_fetch_tracks()
                .returning(|_, _| Ok(Vec::new()));
            target
                .expect_search_track()
                .returning(|_, wanted| Ok(Some(track(&wanted.title, &wanted.artists[0], 200))));
            target.expect_add_tracks().returning(|_, _, _| Ok(()));
            (source, target)
        };

        let (s1, t1) = make_mocks();
        let engine = engine_with(s1, t1, kv.clone()).await;
        engine.run(&task()).await.unwrap();
        engine.run(&task()).await.unwrap();

        let report = engine.report(42).await.unwrap().unwrap();
        assert_eq!(report.added, 2);
    }

    #[tokio::test]
    async fn concurrent_report_updates_keep_every_entry() {
        let kv = Arc::new(MemoryStore::new());
        let api = Arc::new(RateLimitedClient::new(ApiClientConfig {
            max_concurrent: 5,
            timeout: Duration::from_secs(5),
            max_retries: 0,
            base_backoff: Duration::from_millis(1),
            pace: Duration::from_millis(1),
        }));
        let credentials = Arc::new(CredentialStore::new(kv.clone(), api, HashMap::new()));
        let engine = SyncEngine::new(
            AdapterRegistry::new(),
            credentials,
            Matcher::default(),
            kv,
        );

        let updates = (0..10).map(|i| engine.record_failure(42, format!("failure {i}")));
        futures::future::join_all(updates).await;

        let report = engine.report(42).await.unwrap().unwrap();
        assert_eq!(report.errors.len(), 10);
    }
}
