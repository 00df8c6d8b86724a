pub mod checkpoint;
pub mod model;
pub mod source;
pub mod spool;

pub use checkpoint::{CheckpointError, CheckpointState, CheckpointStore, LmdbCheckpointStore};
pub use model::{DocumentEvent, EventBody, EventDecodeError, ReceivedEvent};
pub use source::{EventSource, StreamError};
pub use spool::{SpoolError, SpoolEventSource, SpoolWriter};
