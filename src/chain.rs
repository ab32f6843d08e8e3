use std::time::Duration;

use async_trait::async_trait;
use ethers::types::{Address, TransactionReceipt, H256};

use crate::error::CourierError;

pub use ethereum::EthereumAdapter;

mod ethereum;

/// Chain capability needed by the relay pipeline: nonce and receipt reads
/// plus signed-transaction submission. The node connection behind it may
/// be shared across all tasks; implementations must be `Send + Sync`.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdaptsChain: Send + Sync {
    /// The relayer address submissions are signed with.
    fn relayer_address(&self) -> Address;

    /// Pending-inclusive transaction count for the address, reflecting
    /// transactions already broadcast but not yet mined.
    async fn get_pending_nonce(&self, address: Address) -> Result<u64, CourierError>;

    /// Receipt for a transaction hash; None while the chain has not
    /// included the transaction in any block.
    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, CourierError>;

    /// Current chain head height.
    async fn get_block_height(&self) -> Result<u64, CourierError>;

    /// Signs and broadcasts a transaction, returning its hash.
    async fn send_transaction(
        &self,
        to: Address,
        data: Vec<u8>,
        nonce: u64,
        chain_id: u64,
    ) -> Result<H256, CourierError>;

    fn estimated_block_time(&self) -> Duration;
}
