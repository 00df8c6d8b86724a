//! Batch event consumer.
//!
//! Every event runs `fetch -> extract -> record -> notify` in its own task.
//! A partition's checkpoint only moves past an event once that event's
//! terminal record write was acknowledged; anything withheld is redelivered.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{Instrument, debug, error, info, info_span, warn};

use crate::events::{
    CheckpointError, CheckpointStore, DocumentEvent, EventSource, ReceivedEvent, StreamError,
};
use crate::services::extraction::{DocumentKind, ExtractionClient, ExtractionError};
use crate::services::notifier::{DocStatus, NotificationPayload, Notifier};
use crate::services::object_store::{
    FetchedObject, ObjectFetcher, ObjectStoreError, resolve_storage_key,
};
use crate::services::records::{RecordStatus, RecordStore, RecordStoreError, RecordUpdate, WriteAck};
use crate::services::retry::RetryPolicy;

pub const FILE_NOT_FOUND_MESSAGE: &str = "File Not Found";
const COMPLETED_MESSAGE: &str = "Extraction completed";
const FAILED_MESSAGE: &str = "No structured result could be extracted";

#[derive(Debug, Error)]
pub enum ConsumerError {
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

/// Failures inside one event's pipeline; recorded as `error` with this message.
#[derive(Debug, Error)]
enum EventError {
    #[error("cannot resolve an object key from file reference `{0}`")]
    UnresolvableReference(String),
    #[error(transparent)]
    Fetch(#[from] ObjectStoreError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Records(#[from] RecordStoreError),
}

/// Terminal result of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Completed,
    Failed,
    FileNotFound,
    Errored,
    /// Body could not be decoded; nothing to record.
    Skipped,
    /// The recording write was not acknowledged; the event must be redelivered.
    Withheld,
}

impl EventOutcome {
    pub fn releases_checkpoint(self) -> bool {
        !matches!(self, EventOutcome::Withheld)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub outcomes: Vec<(u64, EventOutcome)>,
    /// Offset the checkpoint was advanced to, if any.
    pub checkpoint: Option<u64>,
    /// Where the partition cursor continues from.
    pub next_offset: Option<u64>,
    pub withheld: bool,
}

/// Totals of a `run_until_idle` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsumeSummary {
    pub partitions: usize,
    pub batches: usize,
    pub events: usize,
    pub completed: usize,
    pub failed: usize,
    pub file_not_found: usize,
    pub errored: usize,
    pub skipped: usize,
    pub withheld: usize,
}

impl ConsumeSummary {
    fn absorb(&mut self, report: &BatchReport) {
        self.batches += 1;
        for (_, outcome) in &report.outcomes {
            self.events += 1;
            match outcome {
                EventOutcome::Completed => self.completed += 1,
                EventOutcome::Failed => self.failed += 1,
                EventOutcome::FileNotFound => self.file_not_found += 1,
                EventOutcome::Errored => self.errored += 1,
                EventOutcome::Skipped => self.skipped += 1,
                EventOutcome::Withheld => self.withheld += 1,
            }
        }
    }
}

#[derive(Clone, bon::Builder)]
pub struct BatchConsumer {
    source: Arc<dyn EventSource>,
    checkpoints: Arc<dyn CheckpointStore>,
    fetcher: Arc<dyn ObjectFetcher>,
    extractor: Arc<dyn ExtractionClient>,
    records: Arc<dyn RecordStore>,
    notifier: Arc<dyn Notifier>,
    retry: RetryPolicy,
    #[builder(into)]
    bucket: String,
    #[builder(default = 10)]
    max_batch_size: usize,
    #[builder(default = Duration::from_secs(1))]
    poll_interval: Duration,
}

impl BatchConsumer {
    /// Process one batch of a partition and advance its checkpoint over the
    /// acknowledged prefix. An empty batch touches nothing.
    pub async fn handle_batch(
        &self,
        partition: &str,
        mut events: Vec<ReceivedEvent>,
    ) -> Result<BatchReport, ConsumerError> {
        if events.is_empty() {
            return Ok(BatchReport::default());
        }
        events.sort_by_key(|event| event.offset);
        debug_assert!(events.iter().all(|e| e.partition == partition));

        let mut handles = Vec::with_capacity(events.len());
        for event in events {
            let consumer = self.clone();
            let delivered = event.clone();
            let handle = tokio::spawn(async move { consumer.process_event(delivered).await });
            handles.push((event, handle));
        }

        let mut report = BatchReport::default();
        for (event, handle) in handles {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(join_err) => {
                    error!(partition, offset = event.offset, error = %join_err, "event handler aborted");
                    match DocumentEvent::decode(&event) {
                        Ok(decoded) => {
                            self.record_error(
                                &decoded,
                                format!("event handler aborted: {join_err}"),
                            )
                            .await
                        }
                        Err(_) => EventOutcome::Skipped,
                    }
                }
            };
            report.outcomes.push((event.offset, outcome));
        }

        let mut released = None;
        for (offset, outcome) in &report.outcomes {
            if !outcome.releases_checkpoint() {
                report.withheld = true;
                report.next_offset = Some(*offset);
                break;
            }
            released = Some(*offset);
        }
        if !report.withheld {
            report.next_offset = released.map(|offset| offset + 1);
        }

        if let Some(offset) = released {
            self.checkpoints.advance(partition, offset).await?;
            report.checkpoint = Some(offset);
        }
        if report.withheld {
            warn!(
                partition,
                checkpoint = ?report.checkpoint,
                redeliver_from = ?report.next_offset,
                "checkpoint withheld; unacknowledged events will be redelivered"
            );
        }
        Ok(report)
    }

    /// Stream-level error callback: log and force the checkpoint past the last
    /// received event so the partition cannot stall. Events in between may be lost.
    pub async fn on_stream_error(
        &self,
        partition: &str,
        last_received: Option<u64>,
        err: &(dyn std::error::Error + Send + Sync),
    ) {
        error!(partition, error = %err, "event stream error");
        let Some(offset) = last_received else {
            return;
        };
        match self.checkpoints.advance(partition, offset).await {
            Ok(moved) => warn!(partition, offset, moved, "checkpoint force-advanced after error"),
            Err(cp_err) => error!(partition, offset, error = %cp_err, "failed to force checkpoint"),
        }
    }

    async fn process_event(&self, received: ReceivedEvent) -> EventOutcome {
        let event = match DocumentEvent::decode(&received) {
            Ok(event) => event,
            Err(err) => {
                warn!(
                    partition = %received.partition,
                    offset = received.offset,
                    error = %err,
                    "skipping undecodable event"
                );
                return EventOutcome::Skipped;
            }
        };

        let span = info_span!(
            "event",
            partition = %event.partition,
            offset = event.offset,
            doc_id = %event.document_id
        );
        async {
            match self.run_pipeline(&event).await {
                Ok(outcome) => {
                    info!(?outcome, "event processed");
                    outcome
                }
                Err(err) => {
                    error!(error = %err, "event processing failed");
                    self.record_error(&event, err.to_string()).await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn run_pipeline(&self, event: &DocumentEvent) -> Result<EventOutcome, EventError> {
        let key = resolve_storage_key(&event.file_reference)
            .ok_or_else(|| EventError::UnresolvableReference(event.file_reference.clone()))?;

        let fetched = self
            .retry
            .run("fetch", || self.fetcher.fetch(&self.bucket, &key))
            .await?;
        let data = match fetched {
            FetchedObject::Found(data) => data,
            FetchedObject::NotFound => {
                warn!(bucket = %self.bucket, key = %key, "document not found in object store");
                let mut update = event_update(event, RecordStatus::Error);
                update.message = Some(FILE_NOT_FOUND_MESSAGE.to_string());
                return Ok(match self.records.upsert(&event.document_id, update).await? {
                    WriteAck::Acknowledged => EventOutcome::FileNotFound,
                    WriteAck::Unacknowledged => EventOutcome::Withheld,
                });
            }
        };

        let file_name = event.file_name();
        if DocumentKind::from_file_name(file_name).is_none() {
            return Err(ExtractionError::InvalidInput {
                file_name: file_name.to_string(),
            }
            .into());
        }
        let result = self.extract(file_name, data).await?;
        let doc_status = DocStatus::from_result(result.as_ref());

        let mut update = match doc_status {
            DocStatus::Completed => event_update(event, RecordStatus::Completed),
            DocStatus::Failed => event_update(event, RecordStatus::Failed),
        };
        update.extracted_payload = Some(result.clone().unwrap_or(Value::Null));
        update.message = Some(
            match doc_status {
                DocStatus::Completed => COMPLETED_MESSAGE,
                DocStatus::Failed => FAILED_MESSAGE,
            }
            .to_string(),
        );
        if !self.records.upsert(&event.document_id, update).await?.is_acknowledged() {
            warn!("extraction result not acknowledged; skipping notification");
            return Ok(EventOutcome::Withheld);
        }

        self.notify(event, doc_status, result).await;
        Ok(match doc_status {
            DocStatus::Completed => EventOutcome::Completed,
            DocStatus::Failed => EventOutcome::Failed,
        })
    }

    async fn extract(&self, file_name: &str, data: Bytes) -> Result<Option<Value>, ExtractionError> {
        self.retry
            .run("extract", || self.extractor.extract(file_name, data.clone()))
            .await
    }

    /// Deliver the result downstream; failures only add response fields to the record.
    async fn notify(&self, event: &DocumentEvent, doc_status: DocStatus, result: Option<Value>) {
        let payload = NotificationPayload {
            uid: event.correlation_id.clone(),
            doc_id: event.document_id.clone(),
            file_name: event.file_reference.clone(),
            doc_status,
            extracted_details: result,
        };
        let update = match self
            .retry
            .run("notify", || self.notifier.notify(&payload))
            .await
        {
            Ok(outcome) => RecordUpdate::builder()
                .downstream_response_code(outcome.status)
                .build(),
            Err(err) => {
                warn!(error = %err, "downstream notification failed");
                RecordUpdate::builder()
                    .maybe_downstream_response_code(err.status_code())
                    .downstream_message(err.to_string())
                    .build()
            }
        };
        match self.records.upsert(&event.document_id, update).await {
            Ok(WriteAck::Acknowledged) => {}
            Ok(WriteAck::Unacknowledged) => warn!("notification outcome not acknowledged"),
            Err(err) => warn!(error = %err, "failed to record notification outcome"),
        }
    }

    async fn record_error(&self, event: &DocumentEvent, message: String) -> EventOutcome {
        let mut update = event_update(event, RecordStatus::Error);
        update.message = Some(message);
        match self.records.upsert(&event.document_id, update).await {
            Ok(WriteAck::Acknowledged) => EventOutcome::Errored,
            Ok(WriteAck::Unacknowledged) => {
                warn!(doc_id = %event.document_id, "error record not acknowledged");
                EventOutcome::Withheld
            }
            Err(err) => {
                error!(doc_id = %event.document_id, error = %err, "failed to record error");
                EventOutcome::Withheld
            }
        }
    }

    async fn start_offset(&self, partition: &str) -> Result<u64, ConsumerError> {
        Ok(self
            .checkpoints
            .load(partition)
            .await?
            .map(|state| state.next_offset())
            .unwrap_or(0))
    }

    /// Drain every partition once from its checkpoint and stop when no events
    /// remain or a batch was withheld.
    pub async fn run_until_idle(&self) -> Result<ConsumeSummary, ConsumerError> {
        let partitions = self.source.partitions().await?;
        let mut summary = ConsumeSummary {
            partitions: partitions.len(),
            ..ConsumeSummary::default()
        };
        for partition in partitions {
            let mut cursor = self.start_offset(&partition).await?;
            loop {
                let batch = match self.source.receive(&partition, cursor, self.max_batch_size).await {
                    Ok(batch) => batch,
                    Err(err) if err.is_fatal() => return Err(err.into()),
                    Err(err) => {
                        self.on_stream_error(&partition, cursor.checked_sub(1), &err).await;
                        break;
                    }
                };
                let Some(last) = batch.last().map(|e| e.offset) else {
                    break;
                };
                let report = match self.handle_batch(&partition, batch).await {
                    Ok(report) => report,
                    Err(err) => {
                        self.on_stream_error(&partition, Some(last), &err).await;
                        break;
                    }
                };
                summary.absorb(&report);
                if report.withheld {
                    break;
                }
                cursor = report.next_offset.unwrap_or(last + 1);
            }
        }
        Ok(summary)
    }

    /// Consume all partitions until `shutdown` flips or the stream fails fatally.
    /// New partitions are picked up on every poll.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), ConsumerError> {
        let mut tasks: JoinSet<Result<(), ConsumerError>> = JoinSet::new();
        let mut started = HashSet::new();
        info!(bucket = %self.bucket, batch = self.max_batch_size, "consumer started");

        while !*shutdown.borrow() {
            for partition in self.source.partitions().await? {
                if started.insert(partition.clone()) {
                    debug!(partition = %partition, "starting partition loop");
                    let consumer = self.clone();
                    let rx = shutdown.clone();
                    tasks.spawn(async move { consumer.partition_loop(partition, rx).await });
                }
            }
            tokio::select! {
                Some(joined) = tasks.join_next() => match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(join_err) => error!(error = %join_err, "partition loop aborted"),
                },
                _ = tokio::time::sleep(self.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Err(err)) => return Err(err),
                Err(join_err) => error!(error = %join_err, "partition loop aborted"),
                Ok(Ok(())) => {}
            }
        }
        info!("consumer stopped");
        Ok(())
    }

    async fn partition_loop(
        self,
        partition: String,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ConsumerError> {
        let mut cursor = self.start_offset(&partition).await?;
        let mut last_received: Option<u64> = cursor.checked_sub(1);

        while !*shutdown.borrow() {
            let idle = match self.source.receive(&partition, cursor, self.max_batch_size).await {
                Ok(batch) if batch.is_empty() => true,
                Ok(batch) => {
                    let last = batch.last().map(|e| e.offset).unwrap_or(cursor);
                    last_received = Some(last_received.map_or(last, |prev| prev.max(last)));
                    match self.handle_batch(&partition, batch).await {
                        Ok(report) => {
                            cursor = report.next_offset.unwrap_or(last + 1);
                            report.withheld
                        }
                        Err(err) => {
                            self.on_stream_error(&partition, last_received, &err).await;
                            cursor = last + 1;
                            true
                        }
                    }
                }
                Err(err) if err.is_fatal() => {
                    error!(partition = %partition, error = %err, "fatal event stream error");
                    return Err(err.into());
                }
                Err(err) => {
                    self.on_stream_error(&partition, last_received, &err).await;
                    if let Some(last) = last_received {
                        cursor = cursor.max(last + 1);
                    }
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn event_update(event: &DocumentEvent, status: RecordStatus) -> RecordUpdate {
    RecordUpdate {
        status: Some(status),
        event_id: event.event_id.clone(),
        correlation_id: event.correlation_id.clone(),
        file_name: Some(event.file_reference.clone()),
        ..RecordUpdate::default()
    }
}
