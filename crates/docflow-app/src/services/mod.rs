//! IO-bound collaborators of the consumer pipeline.
//!
//! Pure transforms live in `normalize`; everything else talks to an external
//! system and is reachable through a trait so the consumer can be tested with
//! in-memory doubles.

pub mod consumer;
pub mod extraction;
pub mod normalize;
pub mod notifier;
pub mod object_store;
pub mod records;
pub mod retry;

pub use consumer::{BatchConsumer, BatchReport, ConsumeSummary, ConsumerError, EventOutcome};
pub use extraction::{DocumentKind, ExtractionClient, ExtractionError, HttpExtractionClient};
pub use notifier::{
    DocStatus, HttpNotifier, NotificationPayload, Notifier, NotifyError, NotifyOutcome,
};
#[cfg(feature = "s3")]
pub use object_store::S3ObjectStore;
pub use object_store::{
    FetchedObject, FsObjectStore, ObjectFetcher, ObjectStoreError, build_fetcher,
    resolve_storage_key,
};
pub use records::{
    LmdbRecordStore, ProcessingRecord, RecordStatus, RecordStore, RecordStoreError, RecordUpdate,
    WriteAck,
};
pub use retry::{RetryPolicy, Transient};
