//! Wires the whole service together: one shared HTTP client, the credential
//! store, the three catalog adapters, the sync engine, and the dispatcher.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::api_client::RateLimitedClient;
use crate::catalog::{
    AdapterRegistry, Service, SoundcloudAdapter, SpotifyAdapter, YoutubeAdapter,
};
use crate::config::Config;
use crate::credentials::{Credential, CredentialError, CredentialStore};
use crate::dispatcher::{BrokerError, Dispatcher, SyncTask, TaskBroker};
use crate::matching::Matcher;
use crate::store::KvStore;
use crate::sync::{SyncEngine, SyncError, SyncReport};

/// Result of asking for a user's credential: either usable now, or the user
/// has to (re)authorize first.
pub enum AuthLookup {
    Authorized(Credential),
    NeedsAuthorization { authorize_url: String },
}

pub struct AppContext {
    pub credentials: Arc<CredentialStore>,
    pub engine: Arc<SyncEngine>,
    dispatcher: Dispatcher,
}

impl AppContext {
    pub fn new(config: &Config, kv: Arc<dyn KvStore>, broker: Arc<dyn TaskBroker>) -> Self {
        let api = Arc::new(RateLimitedClient::new(config.api_client_config()));
        let credentials = Arc::new(CredentialStore::new(
            kv.clone(),
            api.clone(),
            config.oauth_clients(),
        ));

        let mut adapters = AdapterRegistry::new();
        adapters.register(Arc::new(SpotifyAdapter::new(api.clone(), kv.clone())));
        adapters.register(Arc::new(YoutubeAdapter::new(api.clone(), kv.clone())));
        adapters.register(Arc::new(SoundcloudAdapter::new(api.clone(), kv.clone())));

        let matcher = Matcher::new(config.sync.match_threshold);
        let engine = Arc::new(SyncEngine::new(adapters, credentials.clone(), matcher, kv));
        let dispatcher = Dispatcher::new(broker, config.sync.workers);

        Self {
            credentials,
            engine,
            dispatcher,
        }
    }

    pub fn start_workers(&self) -> Vec<JoinHandle<()>> {
        self.dispatcher.spawn_workers(self.engine.clone())
    }

    pub async fn publish(&self, task: &SyncTask) -> Result<(), BrokerError> {
        self.dispatcher.publish(task).await
    }

    /// The user's credential for a service, or the URL they need to visit to
    /// grant access.
    pub async fn credential_or_auth_url(
        &self,
        service: Service,
        user_id: i64,
    ) -> Result<AuthLookup, CredentialError> {
        match self.credentials.get(service, user_id, false).await {
            Ok(credential) => Ok(AuthLookup::Authorized(credential)),
            Err(CredentialError::NotFound { .. } | CredentialError::AuthExpired { .. }) => {
                Ok(AuthLookup::NeedsAuthorization {
                    authorize_url: self.credentials.authorize_url(service)?,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn report(&self, chat_id: i64) -> Result<Option<SyncReport>, SyncError> {
        self.engine.report(chat_id).await
    }
}
