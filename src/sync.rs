use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ethers::types::H256;
use futures_util::future::join_all;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::backoff::backoff_delay;
use crate::db::EventDb;
use crate::error::CourierError;
use crate::event::{EventStatus, EventUuid, TrackedEvent};
use crate::metrics::CourierMetrics;
use crate::settings::CourierSettings;
use crate::tracker::{ConfirmationStatus, ConfirmationTracker};

/// Durable scheduler for tracked events. All scheduling state lives in
/// the event records, so a process restart picks up exactly where the
/// previous one stopped. Every event mutation re-reads the stored record
/// under `store_lock` before writing it back, so a pass holding a stale
/// snapshot can never overwrite a concurrent registration.
pub struct EventSyncWorker {
    db: Arc<dyn EventDb>,
    tracker: Arc<ConfirmationTracker>,
    metrics: CourierMetrics,
    chain: String,
    poll_interval: Duration,
    batch_size: usize,
    target_confirmations: u64,
    ack_threshold: u32,
    max_tracking_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
    // taken with try_lock so an overlapping pass is skipped, not queued
    pass_guard: Mutex<()>,
    // serializes read-modify-write of event records; never held across an
    // RPC call
    store_lock: Mutex<()>,
}

impl EventSyncWorker {
    pub fn new(
        db: Arc<dyn EventDb>,
        tracker: Arc<ConfirmationTracker>,
        metrics: CourierMetrics,
        settings: &CourierSettings,
    ) -> Self {
        Self {
            db,
            tracker,
            metrics,
            chain: settings.chain_id.to_string(),
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size,
            target_confirmations: settings.target_confirmations,
            ack_threshold: settings.ack_threshold,
            max_tracking_attempts: settings.max_tracking_attempts,
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
            pass_guard: Mutex::new(()),
            store_lock: Mutex::new(()),
        }
    }

    /// Creates a Pending record for the hash, eligible for the next pass.
    /// Redelivery of a hash that is already tracked mints no second
    /// record: it bumps the existing record's acknowledgement counter and
    /// returns the original uuid.
    pub async fn enqueue(
        &self,
        tx_hash: H256,
        correlation_id: String,
    ) -> Result<EventUuid, CourierError> {
        let _guard = self.store_lock.lock().await;
        if let Some(uuid) = self.db.retrieve_event_uuid_by_tx_hash(tx_hash).await? {
            if let Some(mut event) = self.db.retrieve_event_by_uuid(&uuid).await? {
                if self.bump_acknowledgement(&mut event) {
                    event.updated_at = Utc::now();
                    self.db.store_event_by_uuid(&event).await?;
                }
                debug!(?event, "Duplicate delivery for tracked transaction");
                return Ok(uuid);
            }
        }
        let event = TrackedEvent::new(tx_hash, correlation_id);
        self.db.store_event_by_uuid(&event).await?;
        info!(?event, "Enqueued event for confirmation tracking");
        Ok(event.uuid)
    }

    /// Idempotent re-registration for at-least-once upstream delivery.
    /// A duplicate report bumps the acknowledgement counter and may
    /// promote Pending to Confirmed once enough independent reports have
    /// arrived; it never finalizes an event by itself. Re-registering a
    /// terminal event changes nothing, not even its timestamps.
    pub async fn register_acknowledgement(
        &self,
        uuid: &EventUuid,
    ) -> Result<EventStatus, CourierError> {
        let event = self
            .update_event(uuid, |event| self.bump_acknowledgement(event))
            .await?;
        debug!(?event, "Recorded duplicate event registration");
        Ok(event.status)
    }

    fn bump_acknowledgement(&self, event: &mut TrackedEvent) -> bool {
        if event.status.is_terminal() {
            return false;
        }
        event.acknowledgements += 1;
        if event.acknowledgements >= self.ack_threshold {
            event.status.promote(EventStatus::Confirmed);
        }
        true
    }

    /// Re-reads the stored record under `store_lock`, applies `apply` to
    /// the fresh copy and writes it back. `apply` returning false leaves
    /// the record byte-for-byte untouched.
    async fn update_event<F>(
        &self,
        uuid: &EventUuid,
        apply: F,
    ) -> Result<TrackedEvent, CourierError>
    where
        F: FnOnce(&mut TrackedEvent) -> bool,
    {
        let _guard = self.store_lock.lock().await;
        let Some(mut event) = self.db.retrieve_event_by_uuid(uuid).await? else {
            return Err(CourierError::EventNotFound(uuid.clone()));
        };
        if apply(&mut event) {
            event.updated_at = Utc::now();
            self.db.store_event_by_uuid(&event).await?;
        }
        Ok(event)
    }

    /// Drives processing passes on the configured interval until the
    /// process exits.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(
            async move {
                loop {
                    if let Err(err) = self.process_pass().await {
                        error!(?err, "Event sync pass failed");
                    }
                    sleep(self.poll_interval).await;
                }
            }
            .instrument(info_span!("EventSyncWorker")),
        )
    }

    /// One batched pass over the due events. Safe to invoke while a
    /// previous pass is still running: the second invocation is skipped.
    /// A failure on one event never blocks the rest of the batch.
    #[instrument(skip_all, fields(chain = %self.chain))]
    pub async fn process_pass(&self) -> Result<usize, CourierError> {
        let Ok(_guard) = self.pass_guard.try_lock() else {
            debug!("Previous pass still running, skipping");
            return Ok(0);
        };

        let due = self
            .db
            .due_events(Utc::now(), self.batch_size, self.max_tracking_attempts)
            .await?;
        let processed = due.len();
        debug!(batch = processed, "Processing due events");
        join_all(due.iter().map(|event| async move {
            if let Err(err) = self.process_event(event).await {
                warn!(?err, ?event, "Error processing event, leaving it scheduled");
            }
        }))
        .await;
        Ok(processed)
    }

    /// The chain query runs against the snapshot; the resulting state
    /// change is applied to a fresh read of the record, so registrations
    /// that arrived during the query survive.
    async fn process_event(&self, event: &TrackedEvent) -> Result<(), CourierError> {
        let observation = self.tracker.observe(event.tx_hash).await;
        self.update_event(&event.uuid, |fresh| {
            if fresh.status.is_terminal() {
                return false;
            }
            match &observation {
                Ok(ConfirmationStatus::Seen { depth }) => {
                    fresh.record_confirmations(*depth);
                    if fresh.confirmations >= self.target_confirmations {
                        fresh.status.promote(EventStatus::Finalized);
                        fresh.next_attempt_after = None;
                        self.metrics.finalized_events(&self.chain).inc();
                        info!(event = ?fresh, "Event finalized");
                    } else {
                        self.schedule_retry(fresh);
                    }
                }
                Ok(ConfirmationStatus::Reverted) => {
                    fresh.status.promote(EventStatus::Failed);
                    fresh.next_attempt_after = None;
                    self.metrics.failed_events(&self.chain).inc();
                    error!(event = ?fresh, "Transaction reverted, event failed");
                }
                Ok(ConfirmationStatus::NotSeen) => {
                    // usually propagation delay, not an error
                    debug!(event = ?fresh, "Transaction not yet visible");
                    self.schedule_retry(fresh);
                }
                Err(err) => {
                    // an RPC failure must neither promote nor demote status
                    warn!(?err, event = ?fresh, "Error querying confirmations, backing off");
                    self.schedule_retry(fresh);
                }
            }
            true
        })
        .await?;
        Ok(())
    }

    fn schedule_retry(&self, event: &mut TrackedEvent) {
        event.attempts += 1;
        if event.attempts >= self.max_tracking_attempts {
            // the due-event filter stops selecting it from here on
            event.next_attempt_after = None;
            self.metrics.tracking_exhausted(&self.chain).inc();
            error!(
                ?event,
                attempts = event.attempts,
                "Tracking attempt budget exhausted; manual follow-up required"
            );
            return;
        }
        let delay = backoff_delay(event.attempts, self.backoff_base, self.backoff_max);
        event.next_attempt_after = Utc::now().checked_add_signed(
            chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero()),
        );
    }
}
