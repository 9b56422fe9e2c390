use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("not connected to the broker")]
    NotConnected,

    #[error("publish failed: {0}")]
    Publish(#[from] rumqttc::ClientError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;
