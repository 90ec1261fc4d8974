use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IpcError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid endpoint name: {0:?}")]
    InvalidEndpointName(String),

    #[error("Frame of {size} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("Failed to deliver message to '{to}': {reason}")]
    DeliveryFailed { to: String, reason: String },

    #[error("No response for correlation id {correlation_id} within {timeout:?}")]
    Timeout {
        correlation_id: Uuid,
        timeout: Duration,
    },

    #[error("A response is already awaited for correlation id {0}")]
    DuplicateCorrelation(Uuid),

    #[error("Endpoint '{0}' is already open")]
    EndpointInUse(String),

    #[error("Endpoint '{0}' is not open in this process")]
    EndpointNotOpen(String),

    #[error("Peer '{0}' is not connected")]
    PeerNotConnected(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid address '{0}'")]
    InvalidAddress(String),
}

pub type IpcResult<T> = Result<T, IpcError>;
