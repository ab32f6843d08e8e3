use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ethers::types::H256;
use tracing::debug;

use crate::event::{EventUuid, TrackedEvent};

use super::{DbResult, DB};

// these keys MUST not be given multiple uses in case other stores share
// the same database.
const EVENT_BY_UUID: &str = "event_by_uuid_";
const EVENT_INDEX_BY_UUID: &str = "event_index_by_uuid_";
const EVENT_UUID_BY_INDEX: &str = "event_uuid_by_index_";
const EVENT_UUID_BY_TX_HASH: &str = "event_uuid_by_tx_hash_";
const HIGHEST_EVENT_INDEX: &str = "highest_event_index_";
const LOWEST_LIVE_EVENT_INDEX: &str = "lowest_live_event_index_";

/// Persistence capability for tracked events. The uuid is the primary
/// key; a monotone index enables iterating all events in insertion order
/// when selecting the next due batch.
#[async_trait]
pub trait EventDb: Send + Sync {
    /// Retrieve an event by its unique id
    async fn retrieve_event_by_uuid(&self, uuid: &EventUuid) -> DbResult<Option<TrackedEvent>>;

    /// Store an event by its unique id, assigning it the next index on
    /// first store
    async fn store_event_by_uuid(&self, event: &TrackedEvent) -> DbResult<()>;

    /// Retrieve an event's index by its unique id
    async fn retrieve_event_index_by_uuid(&self, uuid: &EventUuid) -> DbResult<Option<u32>>;

    /// Retrieve an event's unique id by its index
    async fn retrieve_event_uuid_by_index(&self, index: u32) -> DbResult<Option<EventUuid>>;

    /// Retrieve the unique id of the event tracking a transaction hash
    async fn retrieve_event_uuid_by_tx_hash(&self, tx_hash: H256) -> DbResult<Option<EventUuid>>;

    /// Retrieve the highest assigned event index (0 when empty)
    async fn retrieve_highest_index(&self) -> DbResult<u32>;

    /// Retrieve the lowest index that may still hold a live event (1 when
    /// nothing has been skipped yet)
    async fn retrieve_lowest_live_index(&self) -> DbResult<u32>;

    /// Persist the lowest index that may still hold a live event
    async fn store_lowest_live_index(&self, index: u32) -> DbResult<()>;

    /// Retrieve an event by its index
    async fn retrieve_event_by_index(&self, index: u32) -> DbResult<Option<TrackedEvent>> {
        let uuid = self.retrieve_event_uuid_by_index(index).await?;
        if let Some(uuid) = uuid {
            self.retrieve_event_by_uuid(&uuid).await
        } else {
            Ok(None)
        }
    }

    /// Select events that are eligible for a processing pass right now,
    /// bounded by `batch_size`. Terminal events at the front of the index
    /// range advance the lowest-live watermark so pass cost stays
    /// proportional to the live set, not the full history.
    async fn due_events(
        &self,
        now: DateTime<Utc>,
        batch_size: usize,
        max_attempts: u32,
    ) -> DbResult<Vec<TrackedEvent>> {
        let highest = self.retrieve_highest_index().await?;
        let lowest = self.retrieve_lowest_live_index().await?;
        let mut new_lowest = lowest;
        let mut advancing = true;
        let mut due = Vec::new();
        for index in lowest..=highest {
            match self.retrieve_event_by_index(index).await? {
                Some(event) if event.status.is_terminal() => {
                    if advancing {
                        new_lowest = index + 1;
                    }
                }
                Some(event) => {
                    advancing = false;
                    if event.is_due(now, max_attempts) {
                        due.push(event);
                        if due.len() >= batch_size {
                            break;
                        }
                    }
                }
                None => {
                    if advancing {
                        new_lowest = index + 1;
                    }
                }
            }
        }
        if new_lowest != lowest {
            self.store_lowest_live_index(new_lowest).await?;
        }
        Ok(due)
    }
}

#[async_trait]
impl EventDb for DB {
    async fn retrieve_event_by_uuid(&self, uuid: &EventUuid) -> DbResult<Option<TrackedEvent>> {
        self.retrieve_value_by_key(EVENT_BY_UUID, uuid.as_ref().as_bytes())
    }

    async fn store_event_by_uuid(&self, event: &TrackedEvent) -> DbResult<()> {
        // held across the check so concurrent first stores cannot mint
        // the same index
        let _minting = self.index_lock().lock().await;
        if self
            .retrieve_event_index_by_uuid(&event.uuid)
            .await?
            .is_none()
        {
            let highest = self.retrieve_highest_index().await?;
            let index = highest + 1;
            self.store_value_by_key(HIGHEST_EVENT_INDEX, b"", &index)?;
            self.store_value_by_key(
                EVENT_INDEX_BY_UUID,
                event.uuid.as_ref().as_bytes(),
                &index,
            )?;
            self.store_value_by_key(EVENT_UUID_BY_INDEX, index.to_be_bytes(), &event.uuid)?;
            self.store_value_by_key(EVENT_UUID_BY_TX_HASH, event.tx_hash.as_bytes(), &event.uuid)?;
            debug!(?event, index, "Assigned index to new tracked event");
        }
        self.store_value_by_key(EVENT_BY_UUID, event.uuid.as_ref().as_bytes(), event)
    }

    async fn retrieve_event_index_by_uuid(&self, uuid: &EventUuid) -> DbResult<Option<u32>> {
        self.retrieve_value_by_key(EVENT_INDEX_BY_UUID, uuid.as_ref().as_bytes())
    }

    async fn retrieve_event_uuid_by_index(&self, index: u32) -> DbResult<Option<EventUuid>> {
        self.retrieve_value_by_key(EVENT_UUID_BY_INDEX, index.to_be_bytes())
    }

    async fn retrieve_event_uuid_by_tx_hash(&self, tx_hash: H256) -> DbResult<Option<EventUuid>> {
        self.retrieve_value_by_key(EVENT_UUID_BY_TX_HASH, tx_hash.as_bytes())
    }

    async fn retrieve_highest_index(&self) -> DbResult<u32> {
        // default (0) when nothing has been stored yet
        self.retrieve_value_by_key(HIGHEST_EVENT_INDEX, b"")
            .map(|index: Option<u32>| index.unwrap_or_default())
    }

    async fn retrieve_lowest_live_index(&self) -> DbResult<u32> {
        self.retrieve_value_by_key(LOWEST_LIVE_EVENT_INDEX, b"")
            .map(|index: Option<u32>| index.unwrap_or(1))
    }

    async fn store_lowest_live_index(&self, index: u32) -> DbResult<()> {
        self.store_value_by_key(LOWEST_LIVE_EVENT_INDEX, b"", &index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use crate::event::EventStatus;

    use super::*;

    fn tmp_db() -> (tempfile::TempDir, Arc<dyn EventDb>) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = DB::from_path(temp_dir.path()).unwrap();
        (temp_dir, Arc::new(db))
    }

    #[tokio::test]
    async fn index_is_assigned_once_per_event() {
        let (_guard, db) = tmp_db();

        for i in 0..5u32 {
            let mut event = TrackedEvent::random();
            db.store_event_by_uuid(&event).await.unwrap();
            let expected_index = i + 1;

            let retrieved = db
                .retrieve_event_by_index(expected_index)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(retrieved, event);
            assert_eq!(db.retrieve_highest_index().await.unwrap(), expected_index);

            // storing the same event again must not mint a new index
            event.attempts += 1;
            db.store_event_by_uuid(&event).await.unwrap();
            let retrieved = db
                .retrieve_event_by_index(expected_index)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(retrieved, event);
            assert_eq!(db.retrieve_highest_index().await.unwrap(), expected_index);
        }
    }

    #[tokio::test]
    async fn due_selection_skips_terminal_scheduled_and_exhausted_events() {
        let (_guard, db) = tmp_db();
        let now = Utc::now();

        let eligible = TrackedEvent::random();
        db.store_event_by_uuid(&eligible).await.unwrap();

        let mut finalized = TrackedEvent::random();
        finalized.status = EventStatus::Finalized;
        db.store_event_by_uuid(&finalized).await.unwrap();

        let mut scheduled = TrackedEvent::random();
        scheduled.next_attempt_after = Some(now + Duration::seconds(60));
        db.store_event_by_uuid(&scheduled).await.unwrap();

        let mut exhausted = TrackedEvent::random();
        exhausted.attempts = 10;
        db.store_event_by_uuid(&exhausted).await.unwrap();

        let due = db.due_events(now, 16, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid, eligible.uuid);
    }

    #[tokio::test]
    async fn due_selection_respects_the_batch_size() {
        let (_guard, db) = tmp_db();
        for _ in 0..8 {
            db.store_event_by_uuid(&TrackedEvent::random())
                .await
                .unwrap();
        }
        let due = db.due_events(Utc::now(), 3, 10).await.unwrap();
        assert_eq!(due.len(), 3);
    }

    #[tokio::test]
    async fn terminal_prefix_advances_the_lowest_live_watermark() {
        let (_guard, db) = tmp_db();

        for _ in 0..3 {
            let mut event = TrackedEvent::random();
            event.status = EventStatus::Finalized;
            db.store_event_by_uuid(&event).await.unwrap();
        }
        let live = TrackedEvent::random();
        db.store_event_by_uuid(&live).await.unwrap();
        let mut trailing_terminal = TrackedEvent::random();
        trailing_terminal.status = EventStatus::Failed;
        db.store_event_by_uuid(&trailing_terminal).await.unwrap();

        assert_eq!(db.retrieve_lowest_live_index().await.unwrap(), 1);
        let due = db.due_events(Utc::now(), 16, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid, live.uuid);

        // the three leading terminal events are skipped permanently; the
        // watermark stops at the live record even with a terminal one
        // behind it
        assert_eq!(db.retrieve_lowest_live_index().await.unwrap(), 4);
        let due = db.due_events(Utc::now(), 16, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].uuid, live.uuid);
        assert_eq!(db.retrieve_lowest_live_index().await.unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_stores_mint_distinct_indexes() {
        let (_guard, db) = tmp_db();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let db = db.clone();
                tokio::spawn(async move {
                    let event = TrackedEvent::random();
                    db.store_event_by_uuid(&event).await.unwrap();
                    db.retrieve_event_index_by_uuid(&event.uuid)
                        .await
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();
        let mut indexes = Vec::new();
        for handle in handles {
            indexes.push(handle.await.unwrap());
        }
        indexes.sort_unstable();
        assert_eq!(indexes, (1..=8).collect::<Vec<_>>());
        assert_eq!(db.retrieve_highest_index().await.unwrap(), 8);
    }
}
