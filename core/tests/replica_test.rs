mod common;

use std::sync::Arc;
use std::time::Duration;

use consume_core::checkpoint::CheckpointOutcome;
use consume_core::checkpoint::store::{FileMetadataStore, InMemoryMetadataStore};
use consume_core::config::SessionConfig;
use consume_core::offset::LongOffset;
use consume_core::session::{ConsumptionSession, SessionState};
use consume_core::sink::memory::MemorySegmentBuilder;
use consume_core::source::memory::MemoryPartitionConsumer;

use common::*;

#[tokio::test(start_paused = true)]
async fn test_lagging_replica_adopts_newer_checkpoint() {
    let stream = stream_with(40);
    let builder = MemorySegmentBuilder::new();
    let store = Arc::new(InMemoryMetadataStore::new());
    let config = SessionConfig {
        checkpoint_threshold_rows: Some(20),
        ..session_config()
    };
    let session = memory_session(&stream, &builder, &store, config, 20);
    let running = tokio::spawn(session.run());

    tokio::time::sleep(Duration::from_secs(1)).await;
    let other = coordinator(&store, "replica-b");
    assert_eq!(
        other.propose("orders-0", &LongOffset(80)).await.unwrap(),
        CheckpointOutcome::Accepted(LongOffset(80))
    );
    stream.append_all((40..100).map(|i| format!("message-{:02}", i).into_bytes()));
    stream.seal();

    let report = running.await.unwrap();
    assert_eq!(report.state, SessionState::Stopped);
    assert_eq!(report.metrics.checkpoints_superseded, 1);
    assert_eq!(report.metrics.checkpoints_accepted, 3);
    assert_eq!(report.metrics.segments_discarded, 1);
    assert_eq!(report.current_offset, LongOffset(100));

    let segments = builder.segments();
    let bounds: Vec<_> = segments
        .iter()
        .map(|s| (*s.start_offset().unwrap(), s.end_offset))
        .collect();
    assert_eq!(
        bounds,
        vec![
            (LongOffset(0), LongOffset(20)),
            (LongOffset(20), LongOffset(40)),
            (LongOffset(80), LongOffset(100)),
        ]
    );
    // (40, 60) was staged but its checkpoint lost to the other replica's 80
    assert_eq!(builder.discarded_count(), 1);
    assert_eq!(builder.staged_count(), 0);

    let record = coordinator(&store, "reader")
        .read_record("orders-0")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.offset, "100");
    assert_eq!(record.committer, "replica-a");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_replicas_converge_to_furthest_offset() {
    let stream = stream_with(100);
    stream.seal();
    let store = Arc::new(InMemoryMetadataStore::new());
    let config = SessionConfig {
        checkpoint_threshold_rows: Some(30),
        ..session_config()
    };

    let sessions = [("replica-a", 7), ("replica-b", 13)].map(|(replica, batch)| {
        let builder = MemorySegmentBuilder::new();
        let session = ConsumptionSession::new(
            "orders-0",
            MemoryPartitionConsumer::new(stream.clone(), batch),
            builder.clone(),
            coordinator(&store, replica),
            config.clone(),
            LongOffset(0),
        );
        (builder, tokio::spawn(session.run()))
    });

    for (builder, running) in sessions {
        let report = running.await.unwrap();
        assert_eq!(report.state, SessionState::Stopped);
        assert_eq!(report.current_offset, LongOffset(100));
        assert_eq!(report.last_checkpointed_offset, Some(LongOffset(100)));
        assert!(builder.message_count() <= 100);
    }

    assert_eq!(
        coordinator(&store, "reader")
            .load::<LongOffset>("orders-0")
            .await
            .unwrap(),
        Some(LongOffset(100))
    );
}

#[tokio::test]
async fn test_file_store_keeps_similar_group_names_apart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = Arc::new(FileMetadataStore::open(dir.path()).await.unwrap());
    let a = coordinator(&store, "replica-a");

    assert_eq!(
        a.propose("orders/0", &LongOffset(100)).await.unwrap(),
        CheckpointOutcome::Accepted(LongOffset(100))
    );
    assert_eq!(
        a.propose("orders_0", &LongOffset(10)).await.unwrap(),
        CheckpointOutcome::Accepted(LongOffset(10))
    );
    assert_eq!(a.load::<LongOffset>("orders/0").await.unwrap(), Some(LongOffset(100)));
    assert_eq!(a.load::<LongOffset>("orders_0").await.unwrap(), Some(LongOffset(10)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_replicas_on_separate_file_stores_converge() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut handles = Vec::new();
    for replica in 0..4i64 {
        let store = Arc::new(FileMetadataStore::open(dir.path()).await.unwrap());
        let coordinator = coordinator(&store, &format!("replica-{}", replica));
        handles.push(tokio::spawn(async move {
            for step in 0..10 {
                coordinator
                    .propose("orders-0", &LongOffset(step * 10 + replica))
                    .await
                    .expect("proposal failed");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("replica panicked");
    }

    let store = Arc::new(FileMetadataStore::open(dir.path()).await.unwrap());
    assert_eq!(
        coordinator(&store, "reader").load::<LongOffset>("orders-0").await.unwrap(),
        Some(LongOffset(93))
    );
}
