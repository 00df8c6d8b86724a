use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raw event as delivered by a stream partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedEvent {
    pub partition: String,
    pub offset: u64,
    pub body: Bytes,
}

/// JSON body of an inbound event: `{"_id", "doc_id", "file_name", "uid"}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBody {
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub doc_id: String,
    #[serde(alias = "filename", alias = "file_reference")]
    pub file_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("event body is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("event is missing `{0}`")]
    MissingField(&'static str),
}

/// One unit of work for the consumer. Read-only once decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEvent {
    pub document_id: String,
    pub file_reference: String,
    pub correlation_id: Option<String>,
    pub event_id: Option<String>,
    pub partition: String,
    pub offset: u64,
}

impl DocumentEvent {
    pub fn decode(received: &ReceivedEvent) -> Result<Self, EventDecodeError> {
        let body: EventBody = serde_json::from_slice(&received.body)?;
        if body.doc_id.trim().is_empty() {
            return Err(EventDecodeError::MissingField("doc_id"));
        }
        if body.file_name.trim().is_empty() {
            return Err(EventDecodeError::MissingField("file_name"));
        }
        Ok(Self {
            document_id: body.doc_id,
            file_reference: body.file_name,
            correlation_id: body.uid,
            event_id: body.event_id,
            partition: received.partition.clone(),
            offset: received.offset,
        })
    }

    /// Last path segment of the file reference; selects the extraction path.
    pub fn file_name(&self) -> &str {
        self.file_reference
            .rsplit('/')
            .next()
            .unwrap_or(self.file_reference.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn received(body: &str) -> ReceivedEvent {
        ReceivedEvent {
            partition: "0".into(),
            offset: 7,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[test]
    fn decodes_full_event_body() {
        let event = DocumentEvent::decode(&received(
            r#"{"_id":"e-1","doc_id":"A1","file_name":"bucket.com/x/sample.pdf","uid":"u-9"}"#,
        ))
        .expect("decode");

        assert_eq!(event.document_id, "A1");
        assert_eq!(event.file_reference, "bucket.com/x/sample.pdf");
        assert_eq!(event.file_name(), "sample.pdf");
        assert_eq!(event.correlation_id.as_deref(), Some("u-9"));
        assert_eq!(event.event_id.as_deref(), Some("e-1"));
        assert_eq!(event.offset, 7);
    }

    #[test]
    fn accepts_filename_alias_and_rejects_missing_doc_id() {
        let event = DocumentEvent::decode(&received(r#"{"doc_id":"B2","filename":"b.png"}"#))
            .expect("decode");
        assert_eq!(event.file_reference, "b.png");
        assert_eq!(event.correlation_id, None);

        let err = DocumentEvent::decode(&received(r#"{"doc_id":"","file_name":"b.png"}"#))
            .expect_err("empty doc id");
        assert!(matches!(err, EventDecodeError::MissingField("doc_id")));

        assert!(DocumentEvent::decode(&received("not json")).is_err());
    }
}
