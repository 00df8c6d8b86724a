use heed::types::{Bytes, Str};
use heed::{Database, Env};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::{current_timestamp_ms, open_or_create_db};

/// Last durably processed offset of one partition (inclusive).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub partition: String,
    pub offset: u64,
    pub updated_at_ms: i64,
}

impl CheckpointState {
    /// First offset still to be delivered.
    pub fn next_offset(&self) -> u64 {
        self.offset.saturating_add(1)
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(transparent)]
    Heed(#[from] heed::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error("checkpoint store task failed: {0}")]
    Join(String),
}

/// Per-partition cursors owned by the consumer.
#[async_trait::async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, partition: &str) -> Result<Option<CheckpointState>, CheckpointError>;

    /// Move the cursor forward to `offset`. Returns `false` (and changes nothing)
    /// when the stored offset is already at or past it.
    async fn advance(&self, partition: &str, offset: u64) -> Result<bool, CheckpointError>;

    async fn list(&self) -> Result<Vec<CheckpointState>, CheckpointError>;
}

/// LMDB-backed checkpoints keyed by `<stream>/<consumer_group>/<partition>`.
#[derive(Clone)]
pub struct LmdbCheckpointStore {
    env: Env,
    checkpoints: Database<Str, Bytes>,
    prefix: String,
}

impl LmdbCheckpointStore {
    pub fn open(
        env: &Env,
        container: &str,
        stream: &str,
        consumer_group: &str,
    ) -> Result<Self, CheckpointError> {
        let checkpoints = open_or_create_db(env, container)?;
        Ok(Self {
            env: env.clone(),
            checkpoints,
            prefix: format!("{stream}/{consumer_group}/"),
        })
    }

    fn key(&self, partition: &str) -> String {
        format!("{}{partition}", self.prefix)
    }

    fn load_blocking(&self, partition: &str) -> Result<Option<CheckpointState>, CheckpointError> {
        let rtxn = self.env.read_txn()?;
        match self.checkpoints.get(&rtxn, &self.key(partition))? {
            Some(raw) => Ok(Some(serde_json::from_slice(raw)?)),
            None => Ok(None),
        }
    }

    fn advance_blocking(&self, partition: &str, offset: u64) -> Result<bool, CheckpointError> {
        let key = self.key(partition);
        let mut wtxn = self.env.write_txn()?;
        let current = match self.checkpoints.get(&wtxn, &key)? {
            Some(raw) => Some(serde_json::from_slice::<CheckpointState>(raw)?),
            None => None,
        };
        if current.is_some_and(|state| state.offset >= offset) {
            return Ok(false);
        }
        let state = CheckpointState {
            partition: partition.to_string(),
            offset,
            updated_at_ms: current_timestamp_ms(),
        };
        let encoded = serde_json::to_vec(&state)?;
        self.checkpoints.put(&mut wtxn, &key, encoded.as_slice())?;
        wtxn.commit()?;
        Ok(true)
    }

    fn list_blocking(&self) -> Result<Vec<CheckpointState>, CheckpointError> {
        let rtxn = self.env.read_txn()?;
        let mut out = Vec::new();
        for entry in self.checkpoints.iter(&rtxn)? {
            let (key, raw) = entry?;
            if !key.starts_with(&self.prefix) {
                continue;
            }
            out.push(serde_json::from_slice(raw)?);
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl CheckpointStore for LmdbCheckpointStore {
    async fn load(&self, partition: &str) -> Result<Option<CheckpointState>, CheckpointError> {
        let store = self.clone();
        let partition = partition.to_string();
        tokio::task::spawn_blocking(move || store.load_blocking(&partition))
            .await
            .map_err(|err| CheckpointError::Join(err.to_string()))?
    }

    async fn advance(&self, partition: &str, offset: u64) -> Result<bool, CheckpointError> {
        let store = self.clone();
        let partition = partition.to_string();
        tokio::task::spawn_blocking(move || store.advance_blocking(&partition, offset))
            .await
            .map_err(|err| CheckpointError::Join(err.to_string()))?
    }

    async fn list(&self) -> Result<Vec<CheckpointState>, CheckpointError> {
        let store = self.clone();
        tokio::task::spawn_blocking(move || store.list_blocking())
            .await
            .map_err(|err| CheckpointError::Join(err.to_string()))?
    }
}
