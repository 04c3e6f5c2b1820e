mod common;

use collector_service::{BatchBuffer, FlushPolicy, SinkError};
use common::{payloads, record, Behavior, RecordingSink};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

const WINDOW: Duration = Duration::from_secs(300);

fn buffer_with(sink: &Arc<RecordingSink>, max_batch_size: usize) -> Arc<BatchBuffer> {
    Arc::new(BatchBuffer::new(
        sink.clone(),
        FlushPolicy::new(max_batch_size, WINDOW),
    ))
}

#[tokio::test]
async fn test_scenario_a_flush_on_size() {
    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let buffer = buffer_with(&sink, 2);

    assert_ok!(buffer.append(record("a")).await);
    assert_ok!(buffer.append(record("b")).await);

    assert_eq!(sink.delivered(), vec![vec!["a", "b"]]);
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test]
async fn test_scenario_b_failure_keeps_records() {
    let sink = Arc::new(RecordingSink::new(Behavior::Fail));
    let buffer = buffer_with(&sink, 2);

    assert_ok!(buffer.append(record("a")).await);
    let err = assert_err!(buffer.append(record("b")).await);
    assert!(matches!(err, SinkError::Request(_)));
    assert_eq!(sink.calls(), 1);

    let pending: HashSet<String> = payloads(&buffer.pending_records()).into_iter().collect();
    assert_eq!(pending, HashSet::from(["a".to_string(), "b".to_string()]));

    // "c" crosses the threshold again and the retry carries all three
    sink.set_behavior(Behavior::Succeed);
    buffer.append(record("c")).await.unwrap();

    let mut delivered = sink.delivered_records();
    delivered.sort();
    assert_eq!(delivered, vec!["a", "b", "c"]);
    assert_eq!(sink.calls(), 2);
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scenario_c_flush_on_time_window() {
    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let buffer = buffer_with(&sink, 100);

    buffer.append(record("x")).await.unwrap();
    tokio::time::advance(WINDOW + Duration::from_secs(1)).await;

    // Nothing flushes on its own while the endpoint is quiet
    assert_eq!(sink.calls(), 0);

    buffer.append(record("y")).await.unwrap();
    assert_eq!(sink.delivered(), vec![vec!["x", "y"]]);
}

#[tokio::test]
async fn test_no_loss_when_every_flush_fails() {
    let sink = Arc::new(RecordingSink::new(Behavior::Fail));
    let buffer = buffer_with(&sink, 5);

    for i in 0..50 {
        let _ = buffer.append(record(format!("event-{i}"))).await;
    }

    assert_eq!(buffer.pending(), 50);
    assert!(sink.delivered().is_empty());
    assert!(sink.failures() > 0);

    let pending: HashSet<String> = payloads(&buffer.pending_records()).into_iter().collect();
    assert_eq!(pending.len(), 50);
}

#[tokio::test]
async fn test_exact_batch_size_makes_one_call() {
    let sink = Arc::new(RecordingSink::new(Behavior::Succeed));
    let buffer = buffer_with(&sink, 10);

    for i in 0..10 {
        buffer.append(record(format!("event-{i}"))).await.unwrap();
    }

    assert_eq!(sink.calls(), 1);
    assert_eq!(sink.delivered()[0].len(), 10);
    assert_eq!(buffer.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_records_appended_during_failed_flush_are_kept() {
    let sink = Arc::new(RecordingSink::new(Behavior::Fail).with_delay(Duration::from_millis(50)));
    let buffer = buffer_with(&sink, 2);

    buffer.append(record("a")).await.unwrap();
    let flushing = {
        let buffer = buffer.clone();
        tokio::spawn(async move { buffer.append(record("b")).await })
    };

    // The batch is in flight; the buffer already accepts new records
    tokio::time::sleep(Duration::from_millis(10)).await;
    buffer.append(record("c")).await.unwrap();
    assert_eq!(payloads(&buffer.pending_records()), vec!["c"]);

    assert!(flushing.await.unwrap().is_err());

    let pending: HashSet<String> = payloads(&buffer.pending_records()).into_iter().collect();
    assert_eq!(
        pending,
        HashSet::from(["a".to_string(), "b".to_string(), "c".to_string()])
    );

    sink.set_behavior(Behavior::Succeed);
    buffer.append(record("d")).await.unwrap();

    let mut delivered = sink.delivered_records();
    delivered.sort();
    assert_eq!(delivered, vec!["a", "b", "c", "d"]);
    assert_eq!(buffer.pending(), 0);
}

async fn append_storm(buffer: Arc<BatchBuffer>, workers: usize, per_worker: usize) -> HashSet<String> {
    let handles: Vec<_> = (0..workers)
        .map(|worker| {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                for i in 0..per_worker {
                    let _ = buffer.append(record(format!("w{worker}-{i}"))).await;
                }
            })
        })
        .collect();

    for handle in futures::future::join_all(handles).await {
        handle.unwrap();
    }

    (0..workers)
        .flat_map(|worker| (0..per_worker).map(move |i| format!("w{worker}-{i}")))
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_flush_each_record_once() {
    let sink = Arc::new(RecordingSink::new(Behavior::Succeed).with_delay(Duration::from_millis(1)));
    let buffer = buffer_with(&sink, 5);

    let appended = append_storm(buffer.clone(), 8, 250).await;

    // The threshold check and the swap share one lock, so every batch is exact
    let batches = sink.delivered();
    assert!(batches.iter().all(|batch| batch.len() == 5));

    let delivered = sink.delivered_records();
    let unique: HashSet<String> = delivered.iter().cloned().collect();
    assert_eq!(unique.len(), delivered.len(), "record delivered twice");
    assert_eq!(delivered.len() + buffer.pending(), appended.len());
    assert_eq!(unique, appended);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_appends_with_failures_lose_nothing() {
    let sink = Arc::new(RecordingSink::new(Behavior::Alternate).with_delay(Duration::from_millis(1)));
    let buffer = buffer_with(&sink, 7);

    let appended = append_storm(buffer.clone(), 8, 250).await;
    assert!(sink.failures() > 0);

    let delivered = sink.delivered_records();
    let pending = payloads(&buffer.pending_records());

    let mut seen = HashSet::new();
    for payload in delivered.iter().chain(pending.iter()) {
        assert!(seen.insert(payload.clone()), "duplicate record {payload}");
    }
    assert_eq!(seen, appended);

    // Once the sink recovers, a forced flush delivers the remainder exactly once
    sink.set_behavior(Behavior::Succeed);
    buffer.flush().await.unwrap();

    let delivered = sink.delivered_records();
    let unique: HashSet<String> = delivered.iter().cloned().collect();
    assert_eq!(delivered.len(), appended.len());
    assert_eq!(unique, appended);
    assert_eq!(buffer.pending(), 0);
}
