use std::fs;
use std::io::Write;

use tempfile::TempDir;

use docflow_app::events::{DocumentEvent, EventSource, SpoolEventSource, StreamError};

fn line(doc_id: &str) -> String {
    format!("{{\"_id\":\"e-{doc_id}\",\"doc_id\":\"{doc_id}\",\"file_name\":\"x/{doc_id}.pdf\"}}")
}

#[tokio::test]
async fn partitions_are_sorted_ndjson_stems() {
    let temp = TempDir::new().expect("temp dir");
    fs::write(temp.path().join("1.ndjson"), "").expect("write 1");
    fs::write(temp.path().join("0.ndjson"), "").expect("write 0");
    fs::write(temp.path().join("notes.txt"), "ignored").expect("write txt");

    let source = SpoolEventSource::new(temp.path());
    let partitions = source.partitions().await.expect("partitions");
    assert_eq!(partitions, vec!["0".to_string(), "1".to_string()]);
}

#[tokio::test]
async fn receive_honours_offset_batch_size_and_blank_lines() {
    let temp = TempDir::new().expect("temp dir");
    let mut contents = [line("a"), line("b"), String::new(), line("c"), line("d")].join("\n");
    contents.push('\n');
    fs::write(temp.path().join("0.ndjson"), contents).expect("write partition");
    let source = SpoolEventSource::new(temp.path());

    let first = source.receive("0", 0, 2).await.expect("first batch");
    assert_eq!(
        first.iter().map(|e| e.offset).collect::<Vec<_>>(),
        vec![0, 1]
    );

    let second = source.receive("0", 2, 2).await.expect("second batch");
    assert_eq!(
        second.iter().map(|e| e.offset).collect::<Vec<_>>(),
        vec![3, 4]
    );
    let decoded = DocumentEvent::decode(&second[0]).expect("decode");
    assert_eq!(decoded.document_id, "c");
    assert_eq!(decoded.event_id.as_deref(), Some("e-c"));
    assert_eq!(decoded.partition, "0");
    assert_eq!(decoded.file_name(), "c.pdf");

    assert!(source.receive("0", 5, 10).await.expect("past end").is_empty());
    assert!(source.receive("7", 0, 10).await.expect("unknown partition").is_empty());
}

#[tokio::test]
async fn missing_directory_is_fatal() {
    let temp = TempDir::new().expect("temp dir");
    let source = SpoolEventSource::new(temp.path().join("gone"));

    let err = source.partitions().await.expect_err("missing dir");
    assert!(matches!(err, StreamError::Unavailable { .. }));
    assert!(err.is_fatal());
    assert!(source.receive("0", 0, 1).await.expect_err("missing dir").is_fatal());
}

#[tokio::test]
async fn unterminated_tail_is_left_for_the_next_read() {
    let temp = TempDir::new().expect("temp dir");
    let path = temp.path().join("0.ndjson");
    let full = line("b");
    let (head, tail) = full.split_at(10);
    fs::write(&path, format!("{}\n{head}", line("a"))).expect("write partition");
    let source = SpoolEventSource::new(temp.path());

    let before = source.receive("0", 0, 10).await.expect("first read");
    assert_eq!(before.iter().map(|e| e.offset).collect::<Vec<_>>(), vec![0]);
    assert!(source.receive("0", 1, 10).await.expect("tail only").is_empty());

    let mut file = fs::OpenOptions::new()
        .append(true)
        .open(&path)
        .expect("open partition");
    file.write_all(format!("{tail}\n").as_bytes())
        .expect("finish line");

    let after = source.receive("0", 1, 10).await.expect("second read");
    assert_eq!(after.len(), 1);
    assert_eq!(after[0].offset, 1);
    let decoded = DocumentEvent::decode(&after[0]).expect("decode completed line");
    assert_eq!(decoded.document_id, "b");
}

#[tokio::test]
async fn invalid_utf8_lines_are_delivered_as_raw_bytes() {
    let temp = TempDir::new().expect("temp dir");
    let mut contents = format!("{}\n", line("a")).into_bytes();
    contents.extend_from_slice(b"\xff\xfe\xfd\r\n");
    contents.extend_from_slice(format!("{}\n", line("c")).as_bytes());
    fs::write(temp.path().join("0.ndjson"), contents).expect("write partition");
    let source = SpoolEventSource::new(temp.path());

    let events = source.receive("0", 0, 10).await.expect("read");
    assert_eq!(
        events.iter().map(|e| e.offset).collect::<Vec<_>>(),
        vec![0, 1, 2]
    );
    assert_eq!(&events[1].body[..], b"\xff\xfe\xfd");
    assert!(DocumentEvent::decode(&events[1]).is_err());
    assert_eq!(
        DocumentEvent::decode(&events[2]).expect("decode").document_id,
        "c"
    );
}
