use crate::db::DbError;
use crate::event::EventUuid;

/// Splits errors into those worth retrying within a component's attempt
/// budget and those that must surface immediately.
pub trait IsRetryable {
    fn is_retryable(&self) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Network error: {0}")]
    NetworkError(String),
    #[error("Transaction error: {0}")]
    TxSubmissionError(String),
    #[error("The transaction reverted")]
    TxReverted,
    #[error("Deadline has already passed")]
    DeadlineExpired,
    #[error("Gave up submitting after {attempts} attempts: {last_error}")]
    SubmitAttemptsExhausted { attempts: u32, last_error: String },
    #[error("Gave up polling for confirmations of {tx_hash} after {attempts} attempts")]
    TrackingAttemptsExhausted {
        tx_hash: ethers::types::H256,
        attempts: u32,
    },
    #[error("Event not found: {0}")]
    EventNotFound(EventUuid),
    #[error("DB error {0}")]
    DbError(#[from] DbError),
    #[error("{0}")]
    EyreError(#[from] eyre::Report),
}

impl IsRetryable for CourierError {
    fn is_retryable(&self) -> bool {
        match self {
            CourierError::NetworkError(_) | CourierError::TxSubmissionError(_) => true,
            CourierError::TxReverted
            | CourierError::DeadlineExpired
            | CourierError::SubmitAttemptsExhausted { .. }
            | CourierError::TrackingAttemptsExhausted { .. }
            | CourierError::EventNotFound(_)
            | CourierError::DbError(_)
            | CourierError::EyreError(_) => false,
        }
    }
}

impl CourierError {
    pub fn to_metrics_label(&self) -> String {
        match self {
            CourierError::NetworkError(_) => "NetworkError".to_string(),
            CourierError::TxSubmissionError(_) => "TxSubmissionError".to_string(),
            CourierError::TxReverted => "TxReverted".to_string(),
            CourierError::DeadlineExpired => "DeadlineExpired".to_string(),
            CourierError::SubmitAttemptsExhausted { .. } => "SubmitAttemptsExhausted".to_string(),
            CourierError::TrackingAttemptsExhausted { .. } => {
                "TrackingAttemptsExhausted".to_string()
            }
            CourierError::EventNotFound(_) => "EventNotFound".to_string(),
            CourierError::DbError(_) => "DbError".to_string(),
            CourierError::EyreError(_) => "EyreError".to_string(),
        }
    }
}
