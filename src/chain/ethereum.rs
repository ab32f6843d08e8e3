use std::time::Duration;

use async_trait::async_trait;
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use ethers::types::{Address, BlockNumber, Eip1559TransactionRequest, TransactionReceipt, H256};
use tracing::{debug, info};

use crate::error::CourierError;
use crate::settings::CourierSettings;

use super::AdaptsChain;

/// EVM implementation of the chain capability over an HTTP JSON-RPC
/// endpoint. Gas limit and fee fields are left for the signer middleware
/// to fill in at send time.
pub struct EthereumAdapter {
    client: SignerMiddleware<Provider<Http>, LocalWallet>,
    address: Address,
    estimated_block_time: Duration,
}

impl EthereumAdapter {
    pub fn from_settings(settings: &CourierSettings) -> eyre::Result<Self> {
        let provider = Provider::<Http>::try_from(settings.rpc_url.as_str())?;
        let wallet: LocalWallet = settings.signer_key.parse()?;
        let wallet = wallet.with_chain_id(settings.chain_id);
        let address = wallet.address();
        let client = SignerMiddleware::new(provider, wallet);
        info!(%address, rpc = %settings.rpc_url, "Connected relayer signer");
        Ok(Self {
            client,
            address,
            estimated_block_time: settings.estimated_block_time,
        })
    }
}

#[async_trait]
impl AdaptsChain for EthereumAdapter {
    fn relayer_address(&self) -> Address {
        self.address
    }

    async fn get_pending_nonce(&self, address: Address) -> Result<u64, CourierError> {
        let count = self
            .client
            .get_transaction_count(address, Some(BlockNumber::Pending.into()))
            .await
            .map_err(|err| CourierError::NetworkError(err.to_string()))?;
        Ok(count.as_u64())
    }

    async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> Result<Option<TransactionReceipt>, CourierError> {
        self.client
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|err| CourierError::NetworkError(err.to_string()))
    }

    async fn get_block_height(&self) -> Result<u64, CourierError> {
        let height = self
            .client
            .get_block_number()
            .await
            .map_err(|err| CourierError::NetworkError(err.to_string()))?;
        Ok(height.as_u64())
    }

    async fn send_transaction(
        &self,
        to: Address,
        data: Vec<u8>,
        nonce: u64,
        chain_id: u64,
    ) -> Result<H256, CourierError> {
        let request = Eip1559TransactionRequest::new()
            .from(self.address)
            .to(to)
            .data(data)
            .nonce(nonce)
            .chain_id(chain_id);
        let tx: TypedTransaction = request.into();
        debug!(?tx, "Broadcasting transaction");
        let pending = self
            .client
            .send_transaction(tx, None)
            .await
            .map_err(|err| CourierError::TxSubmissionError(err.to_string()))?;
        Ok(*pending)
    }

    fn estimated_block_time(&self) -> Duration {
        self.estimated_block_time
    }
}
