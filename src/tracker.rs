use std::sync::Arc;
use std::time::Duration;

use ethers::types::H256;
use tokio::time::sleep;
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::backoff::backoff_delay;
use crate::chain::AdaptsChain;
use crate::error::{CourierError, IsRetryable};
use crate::event::PendingTransaction;
use crate::settings::CourierSettings;

/// What the chain currently reports about a submitted transaction hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationStatus {
    /// no receipt yet; the transaction is not in any block
    NotSeen,
    /// included and executed successfully, at the given depth
    Seen { depth: u64 },
    /// included but the execution reverted
    Reverted,
}

/// Polls chain state for a submitted transaction hash until it reaches a
/// target confirmation depth or the attempt budget runs out. Wall time is
/// bounded by the backoff schedule, not by a clock.
pub struct ConfirmationTracker {
    adapter: Arc<dyn AdaptsChain>,
    target_confirmations: u64,
    max_attempts: u32,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl ConfirmationTracker {
    pub fn new(adapter: Arc<dyn AdaptsChain>, settings: &CourierSettings) -> Self {
        Self {
            adapter,
            target_confirmations: settings.target_confirmations,
            max_attempts: settings.max_tracking_attempts,
            backoff_base: settings.backoff_base,
            backoff_max: settings.backoff_max,
        }
    }

    /// One receipt + height round trip. A receipt in the latest block has
    /// depth 1. A receipt without a block number is treated the same as a
    /// missing one; both normally mean propagation delay.
    pub async fn observe(&self, tx_hash: H256) -> Result<ConfirmationStatus, CourierError> {
        let Some(receipt) = self.adapter.get_transaction_receipt(tx_hash).await? else {
            return Ok(ConfirmationStatus::NotSeen);
        };
        if matches!(receipt.status, Some(status) if status.is_zero()) {
            return Ok(ConfirmationStatus::Reverted);
        }
        let Some(block_number) = receipt.block_number else {
            return Ok(ConfirmationStatus::NotSeen);
        };
        let height = self.adapter.get_block_height().await?;
        let depth = height.saturating_sub(block_number.as_u64()).saturating_add(1);
        Ok(ConfirmationStatus::Seen { depth })
    }

    /// Blocks until the hash reaches the target depth, backing off with
    /// jitter between polls. Exhausting the budget is a terminal error for
    /// external follow-up, never a silent drop.
    #[instrument(skip(self), fields(target = self.target_confirmations))]
    pub async fn await_confirmations(
        &self,
        tx_hash: H256,
        target_confirmations: u64,
    ) -> Result<u64, CourierError> {
        for attempt in 1..=self.max_attempts {
            // an included transaction gains depth one block at a time, so
            // poll it on block cadence rather than the backoff schedule
            let mut included = false;
            match self.observe(tx_hash).await {
                Ok(ConfirmationStatus::Seen { depth }) if depth >= target_confirmations => {
                    info!(%tx_hash, depth, "Transaction reached target confirmation depth");
                    return Ok(depth);
                }
                Ok(ConfirmationStatus::Seen { depth }) => {
                    debug!(%tx_hash, depth, "Transaction not yet deep enough");
                    included = true;
                }
                Ok(ConfirmationStatus::NotSeen) => {
                    debug!(%tx_hash, attempt, "Transaction not yet visible");
                }
                Ok(ConfirmationStatus::Reverted) => {
                    warn!(%tx_hash, "Transaction reverted on chain");
                    return Err(CourierError::TxReverted);
                }
                Err(err) if err.is_retryable() => {
                    warn!(?err, %tx_hash, attempt, "Error polling confirmations");
                }
                Err(err) => return Err(err),
            }
            if attempt < self.max_attempts {
                let wait = if included {
                    self.adapter.estimated_block_time()
                } else {
                    backoff_delay(attempt, self.backoff_base, self.backoff_max)
                };
                sleep(wait).await;
            }
        }

        error!(
            %tx_hash,
            attempts = self.max_attempts,
            "Confirmation polling budget exhausted; manual follow-up required"
        );
        Err(CourierError::TrackingAttemptsExhausted {
            tx_hash,
            attempts: self.max_attempts,
        })
    }

    /// Runs `await_confirmations` for a freshly submitted transaction on a
    /// background task. The task keeps running even if the caller drops
    /// interest; durable bookkeeping stays with the sync worker.
    pub fn spawn_await(
        self: Arc<Self>,
        pending: PendingTransaction,
    ) -> tokio::task::JoinHandle<Result<u64, CourierError>> {
        tokio::spawn(
            async move {
                self.await_confirmations(pending.tx_hash, pending.target_confirmations)
                    .await
            }
            .instrument(info_span!(
                "track_pending",
                correlation_id = %pending.correlation_id,
                nonce = pending.nonce,
            )),
        )
    }
}

#[cfg(test)]
mod tests {
    use ethers::types::{TransactionReceipt, U64};

    use crate::chain::MockAdaptsChain;

    use super::*;

    fn receipt_in_block(block: u64) -> TransactionReceipt {
        TransactionReceipt {
            block_number: Some(U64::from(block)),
            status: Some(U64::from(1)),
            ..Default::default()
        }
    }

    fn tracker(adapter: MockAdaptsChain, max_attempts: u32) -> ConfirmationTracker {
        let mut settings = CourierSettings::for_tests();
        settings.max_tracking_attempts = max_attempts;
        settings.backoff_base = Duration::from_millis(1);
        settings.backoff_max = Duration::from_millis(2);
        ConfirmationTracker::new(Arc::new(adapter), &settings)
    }

    #[tokio::test]
    async fn depth_counts_the_inclusion_block() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt_in_block(100))));
        adapter.expect_get_block_height().returning(|| Ok(101));
        let tracker = tracker(adapter, 3);

        let status = tracker.observe(H256::random()).await.unwrap();
        assert_eq!(status, ConfirmationStatus::Seen { depth: 2 });
    }

    #[tokio::test]
    async fn depth_is_one_in_the_latest_block() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt_in_block(100))));
        adapter.expect_get_block_height().returning(|| Ok(100));
        let tracker = tracker(adapter, 3);

        let status = tracker.observe(H256::random()).await.unwrap();
        assert_eq!(status, ConfirmationStatus::Seen { depth: 1 });
    }

    #[tokio::test]
    async fn missing_receipt_is_not_seen() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .returning(|_| Ok(None));
        adapter.expect_get_block_height().times(0);
        let tracker = tracker(adapter, 3);

        let status = tracker.observe(H256::random()).await.unwrap();
        assert_eq!(status, ConfirmationStatus::NotSeen);
    }

    #[tokio::test]
    async fn reverted_receipt_is_terminal() {
        let mut adapter = MockAdaptsChain::new();
        adapter.expect_get_transaction_receipt().returning(|_| {
            Ok(Some(TransactionReceipt {
                block_number: Some(U64::from(100)),
                status: Some(U64::zero()),
                ..Default::default()
            }))
        });
        let tracker = tracker(adapter, 3);

        let result = tracker.await_confirmations(H256::random(), 2).await;
        assert!(matches!(result, Err(CourierError::TxReverted)));
    }

    #[tokio::test]
    async fn waits_until_the_target_depth_is_reached() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt_in_block(100))));
        let mut height = 99u64;
        adapter.expect_get_block_height().returning(move || {
            height += 1;
            Ok(height)
        });
        adapter
            .expect_estimated_block_time()
            .return_const(Duration::from_millis(1));
        let tracker = tracker(adapter, 5);

        let depth = tracker.await_confirmations(H256::random(), 2).await.unwrap();
        assert_eq!(depth, 2);
    }

    #[tokio::test]
    async fn never_seen_transaction_exhausts_the_budget() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .times(4)
            .returning(|_| Ok(None));
        let tracker = tracker(adapter, 4);

        let result = tracker.await_confirmations(H256::random(), 2).await;
        assert!(matches!(
            result,
            Err(CourierError::TrackingAttemptsExhausted { attempts: 4, .. })
        ));
    }

    #[tokio::test]
    async fn spawned_tracking_uses_the_submission_target() {
        let mut adapter = MockAdaptsChain::new();
        adapter
            .expect_get_transaction_receipt()
            .returning(|_| Ok(Some(receipt_in_block(100))));
        adapter.expect_get_block_height().returning(|| Ok(102));
        let tracker = Arc::new(tracker(adapter, 3));

        let pending = PendingTransaction {
            tx_hash: H256::random(),
            target_confirmations: 3,
            attempts: 1,
            correlation_id: "withdrawal-1".to_string(),
            nonce: 0,
        };
        let depth = tracker.spawn_await(pending).await.unwrap().unwrap();
        assert_eq!(depth, 3);
    }
}
