use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use url::Url;

/// Runtime configuration for one courier instance. Misconfiguration is
/// fatal at startup via `validate`; nothing here is re-read at runtime.
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CourierSettings {
    /// HTTP JSON-RPC endpoint of the chain node.
    pub rpc_url: Url,
    /// Hex-encoded private key of the relayer account that pays for gas.
    pub signer_key: String,
    pub chain_id: u64,
    /// Directory holding the rocksdb event store.
    pub db_path: PathBuf,
    /// Inclusion depth at which a tracked event is considered final.
    pub target_confirmations: u64,
    /// Duplicate registrations needed before an event is marked confirmed.
    pub ack_threshold: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Interval between event sync passes.
    pub poll_interval: Duration,
    pub max_submit_attempts: u32,
    pub submit_retry_delay: Duration,
    pub max_tracking_attempts: u32,
    /// Maximum number of events handled in one sync pass.
    pub batch_size: usize,
    pub estimated_block_time: Duration,
}

impl Default for CourierSettings {
    fn default() -> Self {
        Self {
            rpc_url: Url::parse("http://localhost:8545").expect("static url"),
            signer_key: String::new(),
            chain_id: 1,
            db_path: PathBuf::from("./courier_db"),
            target_confirmations: 2,
            ack_threshold: 2,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            max_submit_attempts: 3,
            submit_retry_delay: Duration::from_secs(1),
            max_tracking_attempts: 10,
            batch_size: 25,
            estimated_block_time: Duration::from_secs(12),
        }
    }
}

impl CourierSettings {
    pub fn validate(&self) -> eyre::Result<()> {
        if self.signer_key.is_empty() {
            eyre::bail!("signer key must be set");
        }
        if self.chain_id == 0 {
            eyre::bail!("chain id must be nonzero");
        }
        if self.target_confirmations == 0 {
            eyre::bail!("target confirmations must be nonzero");
        }
        if self.ack_threshold == 0 {
            eyre::bail!("acknowledgement threshold must be nonzero");
        }
        if self.max_submit_attempts == 0 {
            eyre::bail!("max submit attempts must be nonzero");
        }
        if self.max_tracking_attempts == 0 {
            eyre::bail!("max tracking attempts must be nonzero");
        }
        if self.batch_size == 0 {
            eyre::bail!("batch size must be nonzero");
        }
        if self.backoff_base > self.backoff_max {
            eyre::bail!("backoff base exceeds backoff cap");
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            signer_key: "0123456789012345678901234567890123456789012345678901234567891234"
                .to_string(),
            chain_id: 31337,
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            poll_interval: Duration::from_millis(10),
            submit_retry_delay: Duration::from_millis(1),
            ..Self::default()
        }
    }
}

// signer_key stays out of logs
impl fmt::Debug for CourierSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CourierSettings")
            .field("rpc_url", &self.rpc_url.as_str())
            .field("chain_id", &self.chain_id)
            .field("db_path", &self.db_path)
            .field("target_confirmations", &self.target_confirmations)
            .field("ack_threshold", &self.ack_threshold)
            .field("backoff_base", &self.backoff_base)
            .field("backoff_max", &self.backoff_max)
            .field("poll_interval", &self.poll_interval)
            .field("max_submit_attempts", &self.max_submit_attempts)
            .field("submit_retry_delay", &self.submit_retry_delay)
            .field("max_tracking_attempts", &self.max_tracking_attempts)
            .field("batch_size", &self.batch_size)
            .field("estimated_block_time", &self.estimated_block_time)
            .finish()
    }
}
