mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use pulse::telemetry::context::NetworkType;
use pulse::telemetry::event::SessionEnvelope;
use pulse::telemetry::storage::{FileStore, KeyValueStore, MemoryStore};
use pulse::telemetry::transport::StaticAuth;
use pulse::telemetry::{Collaborators, EventRecorder, FlushOutcome, Priority, RecordOutcome};
use pulse::TelemetryConfig;
use serde_json::json;

use common::{harness_with_store, sensors, Harness, RecordingTransport, TOKEN};

async fn log_persisted(h: &Harness, n: usize) {
    let RecordOutcome::Queued { persisted, .. } = h.recorder.record("tap", Some("u1"), json!({ "n": n }), Priority::Normal)
    else {
        panic!("event should have been queued");
    };
    persisted.await.unwrap();
}

#[tokio::test]
async fn test_orphaned_session_is_delivered_before_new_events() {
    let store = Arc::new(MemoryStore::new());

    // 1. First run queues events and dies without flushing
    let first = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    for n in 0..3 {
        log_persisted(&first, n).await;
    }
    let orphan_session = first.recorder.session_id();

    // 2. Relaunch on the same store
    let second = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    assert_ne!(second.recorder.session_id(), orphan_session, "relaunch must begin a fresh session");
    assert_eq!(second.recorder.backlog_len(), 1);
    assert!(second.recorder.pending_events().is_empty());

    // 3. New-session events arrive before the recovery request runs
    for n in 10..12 {
        second.recorder.log_event("tap", Some("u1"), json!({ "n": n }), Priority::Normal);
    }

    let outcome = second.recorder.recovery_finished().await.expect("recovery flush was scheduled");
    assert_eq!(outcome, FlushOutcome::Delivered { events: 5, summaries: 0 });

    // 4. Orphaned and new events never share a request
    let batches = second.transport.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0].len(), 3);
    assert!(batches[0].iter().all(|e| e.session_id == orphan_session));
    assert_eq!(batches[1].len(), 2);
    assert!(batches[1].iter().all(|e| e.session_id == second.recorder.session_id()));

    assert_eq!(second.recorder.backlog_len(), 0);
    assert!(second.recorder.pending_events().is_empty());
}

#[tokio::test]
async fn test_clean_start_schedules_no_recovery() {
    let store = Arc::new(MemoryStore::new());
    let h = harness_with_store(TelemetryConfig::default(), NetworkType::Wifi, store).await;

    assert_eq!(h.recorder.backlog_len(), 0);
    assert!(h.recorder.recovery_finished().await.is_none());
    assert!(h.transport.calls().is_empty());
}

#[tokio::test]
async fn test_failed_recovery_is_retried_later() {
    let store = Arc::new(MemoryStore::new());

    let first = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    log_persisted(&first, 0).await;
    log_persisted(&first, 1).await;

    let second = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    second.transport.set_failing(true);

    let outcome = second.recorder.recovery_finished().await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Failed { .. }), "got {:?}", outcome);
    assert_eq!(second.recorder.backlog_len(), 1, "unacknowledged session must stay queued");

    second.transport.set_failing(false);
    let outcome = second.recorder.flush().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 2, summaries: 0 });
    assert_eq!(second.recorder.backlog_len(), 0);

    // Failed attempt plus the retry carried the same events
    let batches = second.transport.batches();
    assert_eq!(batches.len(), 2);
    assert_eq!(batches[0], batches[1]);
}

#[tokio::test]
async fn test_backlog_survives_repeated_restarts() {
    let store = Arc::new(MemoryStore::new());

    // 1. Run one leaves two events behind
    let first = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    log_persisted(&first, 0).await;
    log_persisted(&first, 1).await;
    let first_session = first.recorder.session_id();

    // 2. Run two cannot deliver and leaves one more event behind
    let second = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    second.transport.set_failing(true);
    let outcome = second.recorder.recovery_finished().await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Failed { .. }));
    log_persisted(&second, 2).await;
    let second_session = second.recorder.session_id();

    // 3. Run three delivers both sessions, oldest first
    let third = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, store.clone()).await;
    assert_eq!(third.recorder.backlog_len(), 2);

    let outcome = third.recorder.recovery_finished().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 3, summaries: 0 });

    let batches = third.transport.batches();
    assert_eq!(batches.len(), 2);
    assert!(batches[0].iter().all(|e| e.session_id == first_session));
    assert!(batches[1].iter().all(|e| e.session_id == second_session));
}

#[tokio::test]
async fn test_backlog_is_bounded() {
    let store = Arc::new(MemoryStore::new());
    let config = TelemetryConfig { max_backlog: 2, ..TelemetryConfig::default() };

    let h = harness_with_store(config, NetworkType::Cellular, store).await;
    h.transport.set_failing(true);

    // Three retired sessions, none delivered
    for n in 0..3 {
        log_persisted(&h, n).await;
        let outcome = h.recorder.close_session().await.unwrap();
        assert!(matches!(outcome, FlushOutcome::Failed { .. }));
    }

    assert_eq!(h.recorder.backlog_len(), 2, "oldest session dropped past the bound");

    h.transport.set_failing(false);
    let outcome = h.recorder.flush().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 2, summaries: 0 });

    let delivered: Vec<u64> = h
        .transport
        .batches()
        .iter()
        .skip(3)
        .flat_map(|b| b.iter().map(|e| e.payload["n"].as_u64().unwrap()))
        .collect();
    assert_eq!(delivered, vec![1, 2]);
}

#[tokio::test]
async fn test_corrupt_envelope_is_discarded() {
    let store = Arc::new(MemoryStore::new());
    let config = TelemetryConfig::default();
    store.set(&config.envelope_key(), "{ not json".to_string()).await.unwrap();

    let h = harness_with_store(config.clone(), NetworkType::Cellular, store.clone()).await;

    assert_eq!(h.recorder.backlog_len(), 0);
    assert!(h.recorder.recovery_finished().await.is_none());

    // The key now holds the fresh session
    let raw = store.get(&config.envelope_key()).await.unwrap().expect("new envelope stored");
    assert!(raw.contains(h.recorder.session_id().as_str()));
}

#[tokio::test]
async fn test_file_store_recovery_across_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = TelemetryConfig::default();

    let start = |transport: Arc<RecordingTransport>| {
        let config = config.clone();
        let root = dir.path().to_path_buf();
        async move {
            let store = FileStore::open(root).await.unwrap();
            let collaborators = Collaborators::new(
                Arc::new(store),
                transport,
                Arc::new(StaticAuth::new(Some(TOKEN.to_string()))),
            )
            .with_sensors(Arc::new(sensors(NetworkType::Cellular)));
            EventRecorder::start(config, collaborators).await.unwrap()
        }
    };

    // 1. First process
    let first = start(RecordingTransport::new()).await;
    for n in 0..4 {
        let RecordOutcome::Queued { persisted, .. } =
            first.record("lesson_view_start", Some("u1"), json!({ "n": n }), Priority::Normal)
        else {
            panic!("event should have been queued");
        };
        persisted.await.unwrap();
    }
    let orphan = first.session_id();
    drop(first);

    assert!(dir.path().join("pulse.session.json").exists());

    // 2. Second process reads the files back
    let transport = RecordingTransport::new();
    let second = start(transport.clone()).await;
    let outcome = second.recovery_finished().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 4, summaries: 0 });

    let batches = transport.batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].iter().all(|e| e.session_id == orphan));
}

async fn recorder_on(store: Arc<common::BacklogGate>) -> (EventRecorder, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    // No token: flushes leave every key alone
    let collaborators = Collaborators::new(store, transport.clone(), Arc::new(StaticAuth::new(None)))
        .with_sensors(Arc::new(sensors(NetworkType::Cellular)));
    let recorder = EventRecorder::start(TelemetryConfig::default(), collaborators).await.unwrap();
    (recorder, transport)
}

async fn record_persisted(recorder: &EventRecorder, n: usize) {
    let RecordOutcome::Queued { persisted, .. } = recorder.record("tap", Some("u1"), json!({ "n": n }), Priority::Normal)
    else {
        panic!("event should have been queued");
    };
    persisted.await.unwrap();
}

async fn stored_envelope(store: &MemoryStore) -> SessionEnvelope {
    let raw = store
        .get(&TelemetryConfig::default().envelope_key())
        .await
        .unwrap()
        .expect("envelope should be stored");
    serde_json::from_str(&raw).unwrap()
}

#[tokio::test]
async fn test_retired_session_stays_on_disk_until_backlog_lands() {
    let gate = Arc::new(common::BacklogGate::default());
    let (recorder, _) = recorder_on(gate.clone()).await;

    // 1. Three events on disk in the first session
    for n in 0..3 {
        record_persisted(&recorder, n).await;
    }
    let retired = recorder.session_id();

    // 2. Rotate while the backlog write is stuck
    gate.hold.store(true, Ordering::SeqCst);
    assert_eq!(recorder.close_session().await.unwrap(), FlushOutcome::NoAuth);

    let RecordOutcome::Queued { persisted, .. } = recorder.record("tap", Some("u1"), json!({ "n": 99 }), Priority::Normal)
    else {
        panic!("event should have been queued");
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!persisted.is_finished(), "new envelope must wait for the backlog");

    // 3. What a crash right now leaves behind still holds the retired events
    let on_disk = stored_envelope(&gate.inner).await;
    assert_eq!(on_disk.session_id, retired);
    assert_eq!(on_disk.events.len(), 3);
    assert!(gate.inner.get(&TelemetryConfig::default().backlog_key()).await.unwrap().is_none());

    let restarted = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, gate.inner.clone()).await;
    let outcome = restarted.recorder.recovery_finished().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 3, summaries: 0 });
    assert!(restarted.transport.batches()[0].iter().all(|e| e.session_id == retired));
}

#[tokio::test]
async fn test_failed_backlog_write_keeps_previous_envelope() {
    let gate = Arc::new(common::BacklogGate::default());
    let (recorder, _) = recorder_on(gate.clone()).await;

    record_persisted(&recorder, 0).await;
    record_persisted(&recorder, 1).await;
    let retired = recorder.session_id();

    // 1. Backlog write fails during rotation: the envelope is not overwritten
    gate.fail.store(true, Ordering::SeqCst);
    recorder.close_session().await.unwrap();
    record_persisted(&recorder, 99).await;

    let on_disk = stored_envelope(&gate.inner).await;
    assert_eq!(on_disk.session_id, retired);
    assert_eq!(on_disk.events.len(), 2);

    // 2. Once the backlog lands, the envelope follows with the full new queue
    gate.fail.store(false, Ordering::SeqCst);
    record_persisted(&recorder, 100).await;

    let on_disk = stored_envelope(&gate.inner).await;
    assert_eq!(on_disk.session_id, recorder.session_id());
    let ns: Vec<u64> = on_disk.events.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
    assert_eq!(ns, vec![99, 100]);

    // 3. A restart recovers both sessions, oldest first
    let restarted = harness_with_store(TelemetryConfig::default(), NetworkType::Cellular, gate.inner.clone()).await;
    assert_eq!(restarted.recorder.backlog_len(), 2);
    let outcome = restarted.recorder.recovery_finished().await.unwrap();
    assert_eq!(outcome, FlushOutcome::Delivered { events: 4, summaries: 0 });
    assert!(restarted.transport.batches()[0].iter().all(|e| e.session_id == retired));
}
