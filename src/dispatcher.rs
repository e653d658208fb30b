//! Task dispatch: queue port, in-memory broker, and the worker pool.
//!
//! Delivery is at-least-once. A received task stays invisible until acked or
//! nacked; a worker that dies mid-task lets the visibility timeout put the
//! task back on the queue. Malformed payloads are acked and dropped, since
//! redelivery cannot fix them.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;

use crate::catalog::Service;
use crate::sync::{SyncEngine, SyncError, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    Sync,
    BidirectionalSync,
}

/// One unit of reconciliation work, as published to the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncTask {
    pub user_id: i64,
    pub chat_id: i64,
    pub source: Service,
    pub target: Service,
    pub playlist_ref: String,
    /// Existing playlist on the target side; absent means create one.
    #[serde(default)]
    pub target_playlist_ref: Option<String>,
    pub action: ActionKind,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("task broker unavailable: {0}")]
    Unavailable(String),
    #[error("task broker is shut down")]
    Closed,
}

/// A task handed to a worker, with the receipt needed to settle it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub payload: Vec<u8>,
}

/// Queue port with explicit settlement.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskBroker: Send + Sync {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError>;
    /// Blocks until a task is available, then leases it.
    async fn receive(&self) -> Result<Delivery, BrokerError>;
    async fn ack(&self, delivery_id: u64) -> Result<(), BrokerError>;
    /// Returns the task to the queue for redelivery.
    async fn nack(&self, delivery_id: u64) -> Result<(), BrokerError>;
}

struct InFlight {
    payload: Vec<u8>,
    redeliver_at: Instant,
}

struct BrokerState {
    next_id: u64,
    ready: VecDeque<Vec<u8>>,
    in_flight: HashMap<u64, InFlight>,
}

/// In-process [`TaskBroker`] with visibility-timeout redelivery.
pub struct MemoryBroker {
    state: Mutex<BrokerState>,
    available: Notify,
    visibility_timeout: Duration,
}

impl MemoryBroker {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BrokerState {
                next_id: 0,
                ready: VecDeque::new(),
                in_flight: HashMap::new(),
            }),
            available: Notify::new(),
            visibility_timeout,
        }
    }

    /// Moves expired leases back to the ready queue. Returns how long until
    /// the next lease expires, if any are outstanding.
    fn requeue_expired(state: &mut BrokerState) -> Option<Duration> {
        let now = Instant::now();
        let expired: Vec<u64> = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.redeliver_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(lease) = state.in_flight.remove(&id) {
                tracing::warn!(delivery_id = id, "lease expired, requeueing task");
                state.ready.push_back(lease.payload);
            }
        }
        state
            .in_flight
            .values()
            .map(|lease| lease.redeliver_at.saturating_duration_since(now))
            .min()
    }
}

#[async_trait]
impl TaskBroker for MemoryBroker {
    async fn publish(&self, payload: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        state.ready.push_back(payload);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    async fn receive(&self) -> Result<Delivery, BrokerError> {
        loop {
            let next_expiry = {
                let mut state = self.state.lock().await;
                let next_expiry = Self::requeue_expired(&mut state);
                if let Some(payload) = state.ready.pop_front() {
                    state.next_id += 1;
                    let id = state.next_id;
                    state.in_flight.insert(
                        id,
                        InFlight {
                            payload: payload.clone(),
                            redeliver_at: Instant::now() + self.visibility_timeout,
                        },
                    );
                    return Ok(Delivery { id, payload });
                }
                next_expiry
            };

            match next_expiry {
                Some(wait) => {
                    tokio::select! {
                        _ = self.available.notified() => {}
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
                None => self.available.notified().await,
            }
        }
    }

    async fn ack(&self, delivery_id: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        // Acking an already-expired lease is harmless.
        state.in_flight.remove(&delivery_id);
        Ok(())
    }

    async fn nack(&self, delivery_id: u64) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(lease) = state.in_flight.remove(&delivery_id) {
            state.ready.push_back(lease.payload);
            drop(state);
            self.available.notify_one();
        }
        Ok(())
    }
}

/// What a worker does with a decoded task. Split from [`SyncEngine`] so the
/// dispatch path is testable without catalogs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: SyncTask) -> Result<SyncOutcome, SyncError>;
    async fn record_failure(&self, chat_id: i64, message: String);
}

#[async_trait]
impl TaskHandler for SyncEngine {
    async fn handle(&self, task: SyncTask) -> Result<SyncOutcome, SyncError> {
        self.run(&task).await
    }

    async fn record_failure(&self, chat_id: i64, message: String) {
        SyncEngine::record_failure(self, chat_id, message).await;
    }
}

pub struct Dispatcher {
    broker: Arc<dyn TaskBroker>,
    workers: usize,
}

impl Dispatcher {
    pub fn new(broker: Arc<dyn TaskBroker>, workers: usize) -> Self {
        Self {
            broker,
            workers: workers.max(1),
        }
    }

    pub async fn publish(&self, task: &SyncTask) -> Result<(), BrokerError> {
        let payload = serde_json::to_vec(task)
            .map_err(|e| BrokerError::Unavailable(format!("failed to encode task: {e}")))?;
        self.broker.publish(payload).await
    }

    /// Spawns the worker pool. Handles are returned so the caller can abort
    /// on shutdown.
    pub fn spawn_workers(&self, handler: Arc<dyn TaskHandler>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let broker = self.broker.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    tracing::debug!(worker_id, "worker started");
                    worker_loop(broker, handler).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(broker: Arc<dyn TaskBroker>, handler: Arc<dyn TaskHandler>) {
    loop {
        let delivery = match broker.receive().await {
            Ok(delivery) => delivery,
            Err(BrokerError::Closed) => return,
            Err(e) => {
                tracing::error!(error = %e, "failed to receive task, backing off");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        if let Err(e) = process_delivery(&*broker, &*handler, delivery).await {
            tracing::error!(error = %e, "failed to settle delivery");
        }
    }
}

/// Decodes and runs one delivery, then settles it: ack on success and on
/// terminal failures, nack only when redelivery could help.
async fn process_delivery(
    broker: &dyn TaskBroker,
    handler: &dyn TaskHandler,
    delivery: Delivery,
) -> Result<(), BrokerError> {
    let task: SyncTask = match serde_json::from_slice(&delivery.payload) {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(delivery_id = delivery.id, error = %e, "dropping malformed task");
            return broker.ack(delivery.id).await;
        }
    };

    let chat_id = task.chat_id;
    match handler.handle(task).await {
        Ok(outcome) => {
            tracing::debug!(delivery_id = delivery.id, added = outcome.added, "task done");
            broker.ack(delivery.id).await
        }
        Err(e) if e.is_infrastructure() => {
            tracing::warn!(delivery_id = delivery.id, error = %e, "transient failure, requeueing");
            broker.nack(delivery.id).await
        }
        Err(e) => {
            tracing::error!(delivery_id = delivery.id, error = %e, "task failed permanently");
            handler.record_failure(chat_id, e.to_string()).await;
            broker.ack(delivery.id).await
        }
    }
}
