use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use ethers::types::{Address, H256};
use tokio::time::sleep;
use tracing::{info, instrument, warn};

use crate::chain::AdaptsChain;
use crate::error::{CourierError, IsRetryable};
use crate::event::PendingTransaction;
use crate::metrics::CourierMetrics;
use crate::nonce::NonceManager;
use crate::settings::CourierSettings;

/// A caller-supplied relay request. The deadline is an absolute expiry
/// instant; it is checked once at submission time.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub to: Address,
    pub data: Vec<u8>,
    pub chain_id: u64,
    pub deadline: DateTime<Utc>,
    /// opaque value carried through logs, e.g. a nullifier hash
    pub correlation_id: String,
}

/// Submits caller payloads through the relayer signer with a bounded
/// retry budget. Confirmation tracking is not its concern; on success the
/// transaction hash is handed off and the caller returns immediately.
pub struct Dispatcher {
    adapter: Arc<dyn AdaptsChain>,
    nonce_manager: Arc<NonceManager>,
    metrics: CourierMetrics,
    chain: String,
    target_confirmations: u64,
    max_submit_attempts: u32,
    submit_retry_delay: Duration,
}

impl Dispatcher {
    pub fn new(
        adapter: Arc<dyn AdaptsChain>,
        nonce_manager: Arc<NonceManager>,
        metrics: CourierMetrics,
        settings: &CourierSettings,
    ) -> Self {
        Self {
            adapter,
            nonce_manager,
            metrics,
            chain: settings.chain_id.to_string(),
            target_confirmations: settings.target_confirmations,
            max_submit_attempts: settings.max_submit_attempts,
            submit_retry_delay: settings.submit_retry_delay,
        }
    }

    /// Broadcasts the request, retrying transient failures up to the
    /// configured attempt budget. Every attempt allocates a fresh nonce;
    /// a nonce obtained by a failed attempt is abandoned rather than
    /// reused, since the chain may have advanced underneath it.
    #[instrument(skip_all, fields(correlation_id = %request.correlation_id, to = %request.to))]
    pub async fn submit(&self, request: &RelayRequest) -> Result<PendingTransaction, CourierError> {
        if request.deadline <= Utc::now() {
            return Err(CourierError::DeadlineExpired);
        }

        let mut last_error = String::new();
        for attempt in 1..=self.max_submit_attempts {
            match self.try_submit(request).await {
                Ok((tx_hash, nonce)) => {
                    self.metrics.transaction_submissions(&self.chain).inc();
                    info!(%tx_hash, nonce, attempt, "Transaction submitted");
                    return Ok(PendingTransaction {
                        tx_hash,
                        target_confirmations: self.target_confirmations,
                        attempts: attempt,
                        correlation_id: request.correlation_id.clone(),
                        nonce,
                    });
                }
                Err(err) if err.is_retryable() => {
                    warn!(?err, attempt, "Submission attempt failed, retrying");
                    self.metrics
                        .call_retries(&err.to_metrics_label(), "submit", &self.chain)
                        .inc();
                    last_error = err.to_string();
                    if attempt < self.max_submit_attempts {
                        sleep(self.submit_retry_delay).await;
                    }
                }
                Err(err) => return Err(err),
            }
        }

        Err(CourierError::SubmitAttemptsExhausted {
            attempts: self.max_submit_attempts,
            last_error,
        })
    }

    async fn try_submit(&self, request: &RelayRequest) -> Result<(H256, u64), CourierError> {
        let nonce = self.nonce_manager.allocate().await?;
        let tx_hash = self
            .adapter
            .send_transaction(request.to, request.data.clone(), nonce, request.chain_id)
            .await?;
        Ok((tx_hash, nonce))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use chrono::Duration as ChronoDuration;
    use mockall::predicate::eq;

    use crate::chain::MockAdaptsChain;

    use super::*;

    fn request(deadline: DateTime<Utc>) -> RelayRequest {
        RelayRequest {
            to: Address::random(),
            data: vec![0xde, 0xad],
            chain_id: 5,
            deadline,
            correlation_id: "nullifier-1".to_string(),
        }
    }

    fn dispatcher(adapter: MockAdaptsChain) -> Dispatcher {
        let adapter = Arc::new(adapter) as Arc<dyn AdaptsChain>;
        let nonce_manager = Arc::new(NonceManager::new(adapter.clone()));
        let mut settings = CourierSettings::for_tests();
        settings.submit_retry_delay = Duration::from_millis(1);
        Dispatcher::new(
            adapter,
            nonce_manager,
            CourierMetrics::dummy_instance(),
            &settings,
        )
    }

    #[tokio::test]
    async fn expired_deadline_is_rejected_before_any_chain_call() {
        let mut adapter = MockAdaptsChain::new();
        adapter.expect_relayer_address().return_const(Address::zero());
        adapter.expect_get_pending_nonce().times(0);
        adapter.expect_send_transaction().times(0);
        let dispatcher = dispatcher(adapter);

        let result = dispatcher
            .submit(&request(Utc::now() - ChronoDuration::seconds(1)))
            .await;
        assert!(matches!(result, Err(CourierError::DeadlineExpired)));
    }

    #[tokio::test]
    async fn submits_with_an_allocated_nonce() {
        let mut adapter = MockAdaptsChain::new();
        adapter.expect_relayer_address().return_const(Address::zero());
        adapter.expect_get_pending_nonce().returning(|_| Ok(7));
        let tx_hash = H256::random();
        adapter
            .expect_send_transaction()
            .with(
                mockall::predicate::always(),
                mockall::predicate::always(),
                eq(7u64),
                eq(5u64),
            )
            .times(1)
            .returning(move |_, _, _, _| Ok(tx_hash));
        let dispatcher = dispatcher(adapter);

        let pending = dispatcher
            .submit(&request(Utc::now() + ChronoDuration::seconds(60)))
            .await
            .unwrap();
        assert_eq!(pending.tx_hash, tx_hash);
        assert_eq!(pending.nonce, 7);
        assert_eq!(pending.attempts, 1);
    }

    #[tokio::test]
    async fn failed_attempt_never_reuses_its_nonce() {
        let mut adapter = MockAdaptsChain::new();
        adapter.expect_relayer_address().return_const(Address::zero());
        adapter.expect_get_pending_nonce().returning(|_| Ok(0));
        let seen_nonces = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = seen_nonces.clone();
        let calls = AtomicU64::new(0);
        adapter
            .expect_send_transaction()
            .times(2)
            .returning(move |_, _, nonce, _| {
                seen.lock().unwrap().push(nonce);
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(CourierError::TxSubmissionError("nonce too low".to_string()))
                } else {
                    Ok(H256::random())
                }
            });
        let dispatcher = dispatcher(adapter);

        dispatcher
            .submit(&request(Utc::now() + ChronoDuration::seconds(60)))
            .await
            .unwrap();
        let nonces = seen_nonces.lock().unwrap().clone();
        assert_eq!(nonces, vec![0, 1]);
    }

    #[tokio::test]
    async fn exhausting_all_attempts_reports_the_last_error() {
        let mut adapter = MockAdaptsChain::new();
        adapter.expect_relayer_address().return_const(Address::zero());
        adapter.expect_get_pending_nonce().returning(|_| Ok(0));
        adapter
            .expect_send_transaction()
            .times(3)
            .returning(|_, _, _, _| Err(CourierError::NetworkError("rpc down".to_string())));
        let dispatcher = dispatcher(adapter);

        let result = dispatcher
            .submit(&request(Utc::now() + ChronoDuration::seconds(60)))
            .await;
        match result {
            Err(CourierError::SubmitAttemptsExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("rpc down"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
