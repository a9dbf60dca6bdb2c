use relay_core::ConnectionId;
use relay_store::StoreError;
use relay_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum FanoutError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("session store: {0}")]
    Store(#[from] StoreError),

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("unknown connection: {0}")]
    UnknownConnection(ConnectionId),
}

pub type Result<T> = std::result::Result<T, FanoutError>;
