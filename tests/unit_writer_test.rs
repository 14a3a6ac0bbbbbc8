use bytes::Bytes;
use olivinedb::connection::{CoalescingWriter, WriterConfig};
use olivinedb::core::protocol::ServerMessage;
use olivinedb::core::protocol::codec::{decode_batch_envelope, decode_server_message};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::mpsc;

fn writer_with_sink(
    config: WriterConfig,
) -> (Arc<CoalescingWriter>, mpsc::UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (CoalescingWriter::new(tx, config), rx)
}

#[tokio::test]
async fn test_urgent_bypasses_the_queue() {
    let (writer, mut rx) = writer_with_sink(WriterConfig::balanced());
    writer.write(&ServerMessage::Pong { timestamp: 1 }, false);
    writer.write(&ServerMessage::AuthRequired, true);
    // The urgent frame arrives first even though it was written second.
    let first = rx.recv().await.unwrap();
    assert_eq!(
        decode_server_message(&first).unwrap(),
        ServerMessage::AuthRequired
    );
}

#[tokio::test]
async fn test_size_trigger_wraps_messages_in_an_envelope() {
    let config = WriterConfig {
        max_batch_size: 3,
        max_delay: Duration::from_secs(60),
        max_batch_bytes: 1024 * 1024,
    };
    let (writer, mut rx) = writer_with_sink(config);
    for i in 0..3 {
        writer.write(&ServerMessage::Pong { timestamp: i }, false);
    }
    let payload = rx.recv().await.unwrap();
    let ServerMessage::Batch { count, data } = decode_server_message(&payload).unwrap() else {
        panic!("expected a BATCH envelope");
    };
    assert_eq!(count, 3);
    let inner = decode_batch_envelope(&data).unwrap();
    assert_eq!(inner.len(), 3);
    for (i, frame) in inner.iter().enumerate() {
        assert_eq!(
            decode_server_message(frame).unwrap(),
            ServerMessage::Pong { timestamp: i as i64 }
        );
    }
    assert_eq!(writer.metrics.immediate_flushes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_byte_trigger_forces_a_flush() {
    let config = WriterConfig {
        max_batch_size: 1000,
        max_delay: Duration::from_secs(60),
        max_batch_bytes: 16,
    };
    let (writer, mut rx) = writer_with_sink(config);
    writer.write(&ServerMessage::Pong { timestamp: 1 }, false);
    writer.write(&ServerMessage::Pong { timestamp: 2 }, false);
    let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("byte trigger flushed")
        .unwrap();
    assert!(matches!(
        decode_server_message(&payload).unwrap(),
        ServerMessage::Batch { count: 2, .. }
    ));
}

#[tokio::test]
async fn test_single_message_flush_is_sent_raw() {
    let (writer, mut rx) = writer_with_sink(WriterConfig::balanced());
    writer.write(&ServerMessage::Pong { timestamp: 9 }, false);
    writer.flush();
    let payload = rx.recv().await.unwrap();
    assert_eq!(
        decode_server_message(&payload).unwrap(),
        ServerMessage::Pong { timestamp: 9 }
    );
}

#[tokio::test]
async fn test_delay_trigger_flushes_without_further_writes() {
    let config = WriterConfig {
        max_batch_size: 1000,
        max_delay: Duration::from_millis(5),
        max_batch_bytes: 1024 * 1024,
    };
    let (writer, mut rx) = writer_with_sink(config);
    writer.write(&ServerMessage::Pong { timestamp: 1 }, false);
    let payload = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed flush fired")
        .unwrap();
    assert_eq!(
        decode_server_message(&payload).unwrap(),
        ServerMessage::Pong { timestamp: 1 }
    );
    assert_eq!(writer.metrics.timed_flushes.load(Ordering::Relaxed), 1);
}

#[tokio::test]
async fn test_writes_after_close_are_discarded_silently() {
    let (writer, mut rx) = writer_with_sink(WriterConfig::balanced());
    writer.close();
    writer.write(&ServerMessage::Pong { timestamp: 1 }, false);
    writer.flush();
    drop(writer);
    assert!(rx.recv().await.is_none());
}

#[tokio::test]
async fn test_batch_utilization_reflects_fill() {
    let config = WriterConfig {
        max_batch_size: 4,
        max_delay: Duration::from_secs(60),
        max_batch_bytes: 1024 * 1024,
    };
    let (writer, mut rx) = writer_with_sink(config);
    for i in 0..4 {
        writer.write(&ServerMessage::Pong { timestamp: i }, false);
    }
    let _ = rx.recv().await.unwrap();
    assert!((writer.metrics.batch_utilization(&config) - 1.0).abs() < f64::EPSILON);
}
