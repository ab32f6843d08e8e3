#![deny(clippy::unwrap_used, clippy::panic)]

//! Relays transactions from a service-owned signer on behalf of callers and
//! durably tracks each submitted transaction until it reaches a configured
//! confirmation depth.

use std::sync::Arc;

use ethers::types::H256;
use eyre::Result;
use tracing::error;

pub use backoff::{backoff_delay, capped_delay};
pub use chain::AdaptsChain;
pub use chain::EthereumAdapter;
pub use db::{DbError, EventDb, DB};
pub use dispatcher::{Dispatcher, RelayRequest};
pub use error::{CourierError, IsRetryable};
pub use event::{EventStatus, EventUuid, PendingTransaction, TrackedEvent};
pub use metrics::CourierMetrics;
pub use nonce::NonceManager;
pub use settings::CourierSettings;
pub use sync::EventSyncWorker;
pub use tracker::{ConfirmationStatus, ConfirmationTracker};

mod backoff;
mod chain;
mod db;
mod dispatcher;
mod error;
mod event;
mod metrics;
mod nonce;
mod settings;
mod sync;
mod tracker;


/// Result of relaying a payload: the broadcast transaction hash and the
/// identifier of the durable record tracking it to finality.
#[derive(Debug, Clone)]
pub struct RelayOutcome {
    pub tx_hash: H256,
    pub event_uuid: EventUuid,
}

/// Wires the dispatcher, the tracker and the sync worker over a shared
/// chain adapter and event store.
pub struct Courier {
    dispatcher: Dispatcher,
    sync_worker: Arc<EventSyncWorker>,
}

impl Courier {
    /// Builds the full relay pipeline from settings, opening the event
    /// store and connecting to the configured endpoint. Configuration
    /// problems (missing signer key, bad endpoint) fail here, never per
    /// request.
    pub fn from_settings(settings: CourierSettings, metrics: CourierMetrics) -> Result<Self> {
        settings.validate()?;
        let adapter = Arc::new(EthereumAdapter::from_settings(&settings)?) as Arc<dyn AdaptsChain>;
        let db = Arc::new(DB::from_path(&settings.db_path)?) as Arc<dyn EventDb>;
        Ok(Self::new(adapter, db, settings, metrics))
    }

    /// Same wiring with an injected adapter and store.
    pub fn new(
        adapter: Arc<dyn AdaptsChain>,
        db: Arc<dyn EventDb>,
        settings: CourierSettings,
        metrics: CourierMetrics,
    ) -> Self {
        let nonce_manager = Arc::new(NonceManager::new(adapter.clone()));
        let dispatcher = Dispatcher::new(
            adapter.clone(),
            nonce_manager,
            metrics.clone(),
            &settings,
        );
        let tracker = Arc::new(ConfirmationTracker::new(adapter, &settings));
        let sync_worker = Arc::new(EventSyncWorker::new(db, tracker, metrics, &settings));
        Self {
            dispatcher,
            sync_worker,
        }
    }

    /// Submits the request and enqueues the resulting transaction hash for
    /// durable tracking. Returns as soon as the transaction is accepted by
    /// the node; tracking proceeds in the background.
    pub async fn relay(&self, request: &RelayRequest) -> Result<RelayOutcome, CourierError> {
        let pending = self.dispatcher.submit(request).await?;
        let event_uuid = self
            .sync_worker
            .enqueue(pending.tx_hash, pending.correlation_id)
            .await
            .map_err(|err| {
                // the transaction is on chain either way; keep its hash
                // recoverable for a manual enqueue
                // Debug keeps the full hash; Display would abbreviate it
                error!(
                    ?err,
                    tx_hash = ?pending.tx_hash,
                    "Transaction broadcast but tracking enqueue failed"
                );
                err
            })?;
        Ok(RelayOutcome {
            tx_hash: pending.tx_hash,
            event_uuid,
        })
    }

    /// Enqueues an externally submitted transaction hash for tracking.
    pub async fn enqueue_tracking(
        &self,
        tx_hash: H256,
        correlation_id: String,
    ) -> Result<EventUuid, CourierError> {
        self.sync_worker.enqueue(tx_hash, correlation_id).await
    }

    /// The durable scheduler driving tracked events to finality.
    pub fn sync_worker(&self) -> Arc<EventSyncWorker> {
        self.sync_worker.clone()
    }
}
