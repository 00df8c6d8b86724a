use heed::types::{Bytes, Str};
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum::{AsRefStr, EnumString};
use thiserror::Error;

use crate::storage::{current_timestamp_ms, open_or_create_db};

/// Lifecycle state of a processing record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, AsRefStr, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum RecordStatus {
    Pending,
    Completed,
    Failed,
    Error,
}

/// Durable status for one document; exactly one exists per `document_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub document_id: String,
    pub status: RecordStatus,
    #[serde(default)]
    pub extracted_payload: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub downstream_response_code: Option<u16>,
    #[serde(default)]
    pub downstream_message: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ProcessingRecord {
    fn pending(document_id: &str, now_ms: i64) -> Self {
        Self {
            document_id: document_id.to_string(),
            status: RecordStatus::Pending,
            extracted_payload: None,
            message: None,
            downstream_response_code: None,
            downstream_message: None,
            event_id: None,
            correlation_id: None,
            file_name: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
        }
    }

    /// Overwrite every field the update carries; leave the rest untouched.
    pub fn apply(&mut self, update: &RecordUpdate, now_ms: i64) {
        if let Some(status) = update.status {
            self.status = status;
        }
        if let Some(payload) = &update.extracted_payload {
            self.extracted_payload = match payload {
                Value::Null => None,
                other => Some(other.clone()),
            };
        }
        if let Some(message) = &update.message {
            self.message = Some(message.clone());
        }
        if let Some(code) = update.downstream_response_code {
            self.downstream_response_code = Some(code);
        }
        if let Some(message) = &update.downstream_message {
            self.downstream_message = Some(message.clone());
        }
        if let Some(event_id) = &update.event_id {
            self.event_id = Some(event_id.clone());
        }
        if let Some(correlation_id) = &update.correlation_id {
            self.correlation_id = Some(correlation_id.clone());
        }
        if let Some(file_name) = &update.file_name {
            self.file_name = Some(file_name.clone());
        }
        self.updated_at_ms = now_ms;
    }
}

/// Partial field set for an upsert. `extracted_payload: Some(Value::Null)` clears the payload.
#[derive(Debug, Clone, Default, PartialEq, bon::Builder)]
pub struct RecordUpdate {
    pub status: Option<RecordStatus>,
    pub extracted_payload: Option<Value>,
    #[builder(into)]
    pub message: Option<String>,
    pub downstream_response_code: Option<u16>,
    #[builder(into)]
    pub downstream_message: Option<String>,
    #[builder(into)]
    pub event_id: Option<String>,
    #[builder(into)]
    pub correlation_id: Option<String>,
    #[builder(into)]
    pub file_name: Option<String>,
}

/// Outcome of an upsert. Only `Acknowledged` writes may release a checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteAck {
    Acknowledged,
    Unacknowledged,
}

impl WriteAck {
    pub fn is_acknowledged(self) -> bool {
        matches!(self, WriteAck::Acknowledged)
    }
}

#[derive(Debug, Error)]
pub enum RecordStoreError {
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("record store task failed: {0}")]
    Join(String),
}

/// Durable document status store keyed by `document_id`.
#[async_trait::async_trait]
pub trait RecordStore: Send + Sync {
    async fn upsert(
        &self,
        document_id: &str,
        update: RecordUpdate,
    ) -> Result<WriteAck, RecordStoreError>;

    async fn get(&self, document_id: &str) -> Result<Option<ProcessingRecord>, RecordStoreError>;

    async fn list_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, RecordStoreError>;
}

/// LMDB-backed record store; one named database per collection.
///
/// Each upsert is a single write transaction, so LMDB serialises writers and a
/// read-modify-write for one id is atomic.
#[derive(Clone)]
pub struct LmdbRecordStore {
    env: Env,
    records: Database<Str, Bytes>,
}

impl LmdbRecordStore {
    pub fn open(env: &Env, collection: &str) -> Result<Self, RecordStoreError> {
        let records = open_or_create_db(env, collection)?;
        Ok(Self {
            env: env.clone(),
            records,
        })
    }

    fn upsert_blocking(
        &self,
        document_id: &str,
        update: &RecordUpdate,
    ) -> Result<ProcessingRecord, RecordStoreError> {
        debug_assert!(!document_id.is_empty());
        let now_ms = current_timestamp_ms();
        let mut wtxn = self.env.write_txn()?;
        let mut record = match self.records.get(&wtxn, document_id)? {
            Some(raw) => serde_json::from_slice::<ProcessingRecord>(raw)?,
            None => ProcessingRecord::pending(document_id, now_ms),
        };
        record.apply(update, now_ms);
        let encoded = serde_json::to_vec(&record)?;
        self.records.put(&mut wtxn, document_id, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(record)
    }

    fn get_blocking(&self, document_id: &str) -> Result<Option<ProcessingRecord>, RecordStoreError> {
        let rtxn = self.env.read_txn()?;
        match self.records.get(&rtxn, document_id)? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    fn list_blocking(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, RecordStoreError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.records.iter(&rtxn)? {
            let (_, raw) = entry?;
            let record: ProcessingRecord = serde_json::from_slice(raw)?;
            if record.status != status {
                continue;
            }
            out.push(record);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl RecordStore for LmdbRecordStore {
    async fn upsert(
        &self,
        document_id: &str,
        update: RecordUpdate,
    ) -> Result<WriteAck, RecordStoreError> {
        let store = self.clone();
        let id = document_id.to_string();
        tokio::task::spawn_blocking(move || store.upsert_blocking(&id, &update))
            .await
            .map_err(|err| RecordStoreError::Join(err.to_string()))??;
        Ok(WriteAck::Acknowledged)
    }

    async fn get(&self, document_id: &str) -> Result<Option<ProcessingRecord>, RecordStoreError> {
        let store = self.clone();
        let id = document_id.to_string();
        tokio::task::spawn_blocking(move || store.get_blocking(&id))
            .await
            .map_err(|err| RecordStoreError::Join(err.to_string()))?
    }

    async fn list_by_status(
        &self,
        status: RecordStatus,
        limit: usize,
    ) -> Result<Vec<ProcessingRecord>, RecordStoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking(status, limit))
            .await
            .map_err(|err| RecordStoreError::Join(err.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::open_env;
    use serde_json::json;
    use std::str::FromStr;
    use tempfile::TempDir;

    fn store() -> (TempDir, LmdbRecordStore) {
        let temp = TempDir::new().expect("temp dir");
        let env = open_env(&temp.path().join("lmdb")).expect("env");
        let store = LmdbRecordStore::open(&env, "documents").expect("store");
        (temp, store)
    }

    #[tokio::test]
    async fn upsert_creates_then_overwrites_single_record() {
        let (_temp, store) = store();

        let ack = store
            .upsert(
                "A1",
                RecordUpdate::builder()
                    .status(RecordStatus::Error)
                    .message("File Not Found")
                    .build(),
            )
            .await
            .expect("first upsert");
        assert!(ack.is_acknowledged());
        let first = store.get("A1").await.expect("get").expect("record");

        store
            .upsert(
                "A1",
                RecordUpdate::builder()
                    .status(RecordStatus::Completed)
                    .extracted_payload(json!({"Invoice Total": "$10"}))
                    .build(),
            )
            .await
            .expect("second upsert");
        let second = store.get("A1").await.expect("get").expect("record");

        assert_eq!(second.status, RecordStatus::Completed);
        assert_eq!(second.extracted_payload, Some(json!({"Invoice Total": "$10"})));
        assert_eq!(second.message.as_deref(), Some("File Not Found"));
        assert_eq!(second.created_at_ms, first.created_at_ms);
        assert!(second.updated_at_ms >= first.updated_at_ms);

        let completed = store
            .list_by_status(RecordStatus::Completed, 10)
            .await
            .expect("list");
        assert_eq!(completed.len(), 1);
    }

    #[tokio::test]
    async fn list_by_status_filters_and_limits() {
        let (_temp, store) = store();
        for (id, status) in [
            ("a", RecordStatus::Failed),
            ("b", RecordStatus::Completed),
            ("c", RecordStatus::Failed),
            ("d", RecordStatus::Failed),
        ] {
            store
                .upsert(id, RecordUpdate::builder().status(status).build())
                .await
                .expect("upsert");
        }

        let failed = store
            .list_by_status(RecordStatus::Failed, 2)
            .await
            .expect("list");
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|r| r.status == RecordStatus::Failed));
        assert!(
            store
                .list_by_status(RecordStatus::Pending, 5)
                .await
                .expect("list")
                .is_empty()
        );
    }

    #[test]
    fn null_payload_clears_previous_result() {
        let mut record = ProcessingRecord::pending("x", 1);
        record.apply(
            &RecordUpdate::builder().extracted_payload(json!({"k": 1})).build(),
            2,
        );
        record.apply(
            &RecordUpdate::builder()
                .status(RecordStatus::Failed)
                .extracted_payload(Value::Null)
                .build(),
            3,
        );
        assert_eq!(record.extracted_payload, None);
        assert_eq!(record.status, RecordStatus::Failed);
        assert_eq!(record.created_at_ms, 1);
        assert_eq!(record.updated_at_ms, 3);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(RecordStatus::Completed).expect("json"),
            json!("completed")
        );
        assert_eq!(RecordStatus::from_str("ERROR").ok(), Some(RecordStatus::Error));
        assert_eq!(RecordStatus::Failed.as_ref(), "failed");
    }
}
