use thiserror::Error;

/// Errors raised by hops, the coordinator and the payload protocol.
#[derive(Error, Debug)]
pub enum CommError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    #[error("decryption failed")]
    DecryptionFailure,

    #[error("forwarding to {address} failed: {reason}")]
    ForwardingFailure { address: String, reason: String },

    #[error("rendezvous provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("rendezvous publication timed out after {0:?}")]
    ProviderPublishTimeout(std::time::Duration),

    #[error("chain underflow: {published} of {requested} nodes published")]
    ChainUnderflow { requested: usize, published: usize },

    #[error("client key rejected: {0}")]
    KeyWrapFailure(String),

    #[error("invalid topology: {0}")]
    InvalidTopology(String),

    #[error("cannot bind {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CommError>;

impl CommError {
    pub fn forwarding(address: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        CommError::ForwardingFailure {
            address: address.into(),
            reason: reason.to_string(),
        }
    }
}
