use std::time::Duration;

use relay_transport::TransportError;

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Every worker queue refused the event. Fatal: events are never dropped silently.
    #[error("all {workers} worker queues are full")]
    AllQueuesFull { workers: usize },

    #[error("shutdown grace {grace:?} exceeded; stuck workers: {stuck:?}")]
    GraceExceeded { grace: Duration, stuck: Vec<usize> },

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl DispatchError {
    /// Short stable label for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            Self::AllQueuesFull { .. } => "all_queues_full",
            Self::GraceExceeded { .. } => "grace_exceeded",
            Self::Transport(_) => "transport",
        }
    }
}
