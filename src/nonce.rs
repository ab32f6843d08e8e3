use std::sync::Arc;

use ethers::types::Address;
use tokio::sync::Mutex;
use tracing::debug;

use crate::chain::AdaptsChain;
use crate::error::CourierError;

/// Sole owner of the relayer address's outgoing transaction ordering.
///
/// The cached next nonce covers the window where transactions have been
/// dispatched faster than the chain reflects them; the chain's pending
/// nonce covers a stale or restarted cache. Allocation takes the larger
/// of the two. The cache is intentionally not durable: a restart falls
/// back to the chain's own pending-nonce view.
pub struct NonceManager {
    address: Address,
    adapter: Arc<dyn AdaptsChain>,
    next_nonce: Mutex<Option<u64>>,
}

impl NonceManager {
    pub fn new(adapter: Arc<dyn AdaptsChain>) -> Self {
        Self {
            address: adapter.relayer_address(),
            adapter,
            next_nonce: Mutex::new(None),
        }
    }

    /// Hands out the next nonce for the relayer address. The lock is held
    /// across the chain read so concurrent callers can never observe the
    /// same nonce. A failed chain read leaves the cache untouched.
    pub async fn allocate(&self) -> Result<u64, CourierError> {
        let mut cached = self.next_nonce.lock().await;
        let chain_nonce = self.adapter.get_pending_nonce(self.address).await?;
        let nonce = match *cached {
            Some(next) => next.max(chain_nonce),
            None => chain_nonce,
        };
        *cached = Some(nonce + 1);
        debug!(nonce, chain_nonce, address = %self.address, "Allocated nonce");
        Ok(nonce)
    }
}
