use std::io;

pub type Result<T> = std::result::Result<T, TransportError>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("timed out waiting for {0}")]
    Timeout(&'static str),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("unexpected acknowledgment frame ({0} bytes)")]
    UnexpectedAck(usize),

    #[error("connection closed by peer")]
    Closed,

    #[error("unknown channel: {0}")]
    UnknownChannel(String),
}

impl TransportError {
    /// Transport-level failures are retried by the publisher; encoding failures are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::Io(_) | Self::Timeout(_) | Self::UnexpectedAck(_) | Self::Closed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_errors_are_not_retried() {
        let err = serde_json::from_str::<u32>("x").unwrap_err();
        assert!(!TransportError::from(err).is_retryable());
        assert!(TransportError::Closed.is_retryable());
        assert!(TransportError::Timeout("ack").is_retryable());
    }
}
