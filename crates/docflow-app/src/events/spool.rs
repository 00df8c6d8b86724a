//! Directory-backed event stream.
//!
//! Each partition is `<dir>/<partition>.ndjson`; an event's offset is its
//! zero-based line number. Blank lines keep their offset but carry no event.

use std::io;
use std::path::PathBuf;

use bytes::Bytes;
use thiserror::Error;
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::events::model::{EventBody, ReceivedEvent};
use crate::events::source::{EventSource, StreamError};

const PARTITION_EXTENSION: &str = "ndjson";

/// Reads events from a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolEventSource {
    dir: PathBuf,
}

impl SpoolEventSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn partition_path(&self, partition: &str) -> PathBuf {
        self.dir.join(format!("{partition}.{PARTITION_EXTENSION}"))
    }

    async fn ensure_reachable(&self) -> Result<(), StreamError> {
        match fs::metadata(&self.dir).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StreamError::Unavailable {
                path: self.dir.clone(),
                reason: "not a directory".into(),
            }),
            Err(err) => Err(StreamError::Unavailable {
                path: self.dir.clone(),
                reason: err.to_string(),
            }),
        }
    }
}

#[async_trait::async_trait]
impl EventSource for SpoolEventSource {
    async fn partitions(&self) -> Result<Vec<String>, StreamError> {
        self.ensure_reachable().await?;
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|err| StreamError::Unavailable {
                path: self.dir.clone(),
                reason: err.to_string(),
            })?;
        let mut out = Vec::new();
        loop {
            let entry = entries
                .next_entry()
                .await
                .map_err(|err| StreamError::Unavailable {
                    path: self.dir.clone(),
                    reason: err.to_string(),
                })?;
            let Some(entry) = entry else { break };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(PARTITION_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                out.push(stem.to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn receive(
        &self,
        partition: &str,
        from_offset: u64,
        max_batch: usize,
    ) -> Result<Vec<ReceivedEvent>, StreamError> {
        self.ensure_reachable().await?;
        if max_batch == 0 {
            return Ok(Vec::new());
        }
        let path = self.partition_path(partition);
        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(StreamError::Partition {
                    partition: partition.to_string(),
                    source,
                });
            }
        };

        let events = complete_lines(&contents)
            .enumerate()
            .skip(from_offset as usize)
            .filter(|(_, line)| !line.trim_ascii().is_empty())
            .take(max_batch)
            .map(|(idx, line)| ReceivedEvent {
                partition: partition.to_string(),
                offset: idx as u64,
                body: Bytes::copy_from_slice(line),
            })
            .collect();
        Ok(events)
    }
}

/// Newline-terminated lines only; a trailing line still being written is left
/// for the next read. Bytes are passed through undecoded.
fn complete_lines(contents: &[u8]) -> impl Iterator<Item = &[u8]> {
    let end = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |last| last + 1);
    contents[..end].split_inclusive(|b| *b == b'\n').map(|line| {
        let line = line.strip_suffix(b"\n").unwrap_or(line);
        line.strip_suffix(b"\r").unwrap_or(line)
    })
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error("invalid partition name `{0}`")]
    InvalidPartition(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("json serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Append-only producer for a spool directory.
#[derive(Debug, Clone)]
pub struct SpoolWriter {
    dir: PathBuf,
}

impl SpoolWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Append one event and return its offset.
    pub async fn append(&self, partition: &str, body: &EventBody) -> Result<u64, SpoolError> {
        validate_partition(partition)?;
        fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!("{partition}.{PARTITION_EXTENSION}"));

        let offset = match fs::read(&path).await {
            Ok(existing) => complete_lines(&existing).count() as u64,
            Err(err) if err.kind() == io::ErrorKind::NotFound => 0,
            Err(err) => return Err(err.into()),
        };

        let mut json = serde_json::to_string(body)?;
        json.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(json.as_bytes()).await?;
        file.flush().await?;
        Ok(offset)
    }
}

fn validate_partition(partition: &str) -> Result<(), SpoolError> {
    let valid = !partition.is_empty()
        && partition
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'));
    if valid {
        Ok(())
    } else {
        Err(SpoolError::InvalidPartition(partition.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn writer_reports_sequential_offsets() {
        let temp = TempDir::new().expect("temp dir");
        let writer = SpoolWriter::new(temp.path().join("spool"));
        let body = EventBody {
            event_id: None,
            doc_id: "A1".into(),
            file_name: "a.pdf".into(),
            uid: None,
        };

        assert_eq!(writer.append("0", &body).await.expect("append"), 0);
        assert_eq!(writer.append("0", &body).await.expect("append"), 1);
        assert_eq!(writer.append("1", &body).await.expect("append"), 0);
        assert!(matches!(
            writer.append("../x", &body).await,
            Err(SpoolError::InvalidPartition(_))
        ));
    }

    #[test]
    fn complete_lines_drop_unterminated_tail() {
        let lines: Vec<&[u8]> = complete_lines(b"a\r\n\nb\nc").collect();
        assert_eq!(lines, vec![&b"a"[..], &b""[..], &b"b"[..]]);
        assert_eq!(complete_lines(b"").count(), 0);
        assert_eq!(complete_lines(b"partial").count(), 0);
    }
}
