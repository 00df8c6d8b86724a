use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::events::model::ReceivedEvent;

#[derive(Debug, Error)]
pub enum StreamError {
    /// The stream itself cannot be reached; ends the consumer.
    #[error("event stream unavailable at {path}: {reason}")]
    Unavailable { path: PathBuf, reason: String },
    #[error("failed to read partition `{partition}`: {source}")]
    Partition {
        partition: String,
        #[source]
        source: io::Error,
    },
}

impl StreamError {
    /// Connection-level errors are fatal; partition read failures are not.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StreamError::Unavailable { .. })
    }
}

/// Ordered, partitioned log of inbound events with at-least-once delivery.
#[async_trait::async_trait]
pub trait EventSource: Send + Sync {
    async fn partitions(&self) -> Result<Vec<String>, StreamError>;

    /// Up to `max_batch` events of `partition` at or after `from_offset`, in offset order.
    async fn receive(
        &self,
        partition: &str,
        from_offset: u64,
        max_batch: usize,
    ) -> Result<Vec<ReceivedEvent>, StreamError>;
}
