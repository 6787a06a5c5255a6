//! End-to-end engine scenarios over in-memory SQLite and a scripted
//! downloader port: full lifecycle, back-off timelines, blocklisting,
//! breaker behaviour, restart safety, and batch semantics.

mod support;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use soulspot_core::{
    BatchAction, BreakerState, DownloadStatus, ErrorCode, OrchestratorError, TransferState,
    TransferUpdate,
};
use support::{ScriptedError, TestEngine, flac_hit, update};

#[allow(clippy::unwrap_used)]
fn collect_event_ids(
    rx: &mut tokio::sync::broadcast::Receiver<soulspot_core::DownloadChanged>,
) -> Vec<soulspot_core::DownloadChanged> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ==================== S1: happy path ====================

#[tokio::test]
async fn test_happy_path_full_lifecycle() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist1", "Song1");
    engine
        .port
        .script_search(Ok(vec![flac_hit("alice", "Song1.flac", 900)]));
    engine.port.script_enqueue(Ok("alice::X1".to_string()));
    engine
        .port
        .script_status("alice::X1", Ok(update(TransferState::Transferring, 1000, 30_000_000)));
    engine
        .port
        .script_status("alice::X1", Ok(update(TransferState::Transferring, 1000, 30_000_000)));
    engine.port.script_status(
        "alice::X1",
        Ok(TransferUpdate {
            state: TransferState::Completed,
            bytes_done: 30_000_000,
            bytes_total: Some(30_000_000),
            local_path: Some("/m/alice/Song1.flac".to_string()),
            error: None,
        }),
    );

    let mut rx = engine.ctx.events.subscribe();
    let config = engine.config().await;

    let row = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    assert_eq!(row.status(), DownloadStatus::Waiting);

    let now = Utc::now();
    engine.dispatcher.tick(&config, now).await.unwrap();
    let pending = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(pending.status(), DownloadStatus::Pending);
    assert_eq!(pending.candidate().unwrap().peer, "alice");

    engine.enqueuer.tick(&config, now).await.unwrap();
    let queued = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(queued.status(), DownloadStatus::Queued);
    assert_eq!(queued.external_ref.as_deref(), Some("alice::X1"));
    assert!(queued.queued_at.is_some());

    engine.status_sync.tick(&config, now).await.unwrap();
    let downloading = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(downloading.status(), DownloadStatus::Downloading);
    assert_eq!(downloading.bytes_done, 1000);

    // Second poll observes identical progress: no event, no change.
    engine.status_sync.tick(&config, now).await.unwrap();

    engine.status_sync.tick(&config, now).await.unwrap();
    let completed = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(completed.status(), DownloadStatus::Completed);
    assert_eq!(completed.target_path.as_deref(), Some("/m/alice/Song1.flac"));
    assert_eq!(completed.retry_count, 0);
    assert!(completed.completed_at.is_some());

    let events = collect_event_ids(&mut rx);
    assert_eq!(
        events.len(),
        5,
        "created, pending, queued, downloading, completed"
    );
    assert_eq!(events.last().unwrap().status, DownloadStatus::Completed);
}

// ==================== S2: back-off timeline ====================

#[tokio::test]
async fn test_no_results_backoff_timeline() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T2", "Artist2", "Song2");
    engine.port.script_search(Ok(Vec::new()));

    let config = engine.config().await;
    let row = engine.orchestrator.enqueue("T2", 0, None).await.unwrap();
    let t0 = Utc::now();

    // First search fails: retry #1 scheduled 60 s out.
    engine.dispatcher.tick(&config, t0).await.unwrap();
    let after1 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after1.status(), DownloadStatus::Failed);
    assert_eq!(after1.retry_count, 1);
    assert_eq!(after1.error_code(), Some(ErrorCode::NoResults));
    assert_eq!(after1.next_retry_at, Some(t0 + Duration::seconds(60)));

    // Not due yet.
    engine
        .retry
        .tick(&config, t0 + Duration::seconds(59))
        .await
        .unwrap();
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Failed
    );

    // Second failure at t0+60: retry #2 adds 300 s.
    let t1 = t0 + Duration::seconds(60);
    engine.retry.tick(&config, t1).await.unwrap();
    engine.dispatcher.tick(&config, t1).await.unwrap();
    let after2 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after2.retry_count, 2);
    assert_eq!(after2.next_retry_at, Some(t1 + Duration::seconds(300)));

    // Third failure at t0+360: retry #3 adds 900 s.
    let t2 = t0 + Duration::seconds(360);
    engine.retry.tick(&config, t2).await.unwrap();
    engine.dispatcher.tick(&config, t2).await.unwrap();
    let after3 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after3.retry_count, 3);
    assert_eq!(after3.next_retry_at, Some(t2 + Duration::seconds(900)));

    // Final failure at t0+1260: budget spent, terminal.
    let t3 = t0 + Duration::seconds(1260);
    engine.retry.tick(&config, t3).await.unwrap();
    engine.dispatcher.tick(&config, t3).await.unwrap();
    let terminal = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(terminal.status(), DownloadStatus::Failed);
    assert_eq!(terminal.retry_count, 3);
    assert_eq!(terminal.error_code(), Some(ErrorCode::NoResults));
    assert!(terminal.next_retry_at.is_none(), "no further retry scheduled");

    // And it stays failed forever after.
    engine
        .retry
        .tick(&config, t3 + Duration::days(30))
        .await
        .unwrap();
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Failed
    );
}

// ==================== S3: blocklist ====================

#[tokio::test]
async fn test_rejected_candidates_are_blocklisted_per_file() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T3", "Artist3", "Song3");
    // Same two hits on every search; f1 scores higher.
    engine.port.script_search(Ok(vec![
        flac_hit("bob", "f1.flac", 900),
        flac_hit("bob", "f2.flac", 700),
    ]));
    engine
        .port
        .script_enqueue(Err(ScriptedError::Rejected("queue refused".to_string())));
    engine
        .port
        .script_enqueue(Err(ScriptedError::Rejected("queue refused".to_string())));

    let config = engine.config().await;
    let row = engine.orchestrator.enqueue("T3", 0, None).await.unwrap();
    let now = Utc::now();

    // First pass picks f1; the downloader rejects it.
    engine.dispatcher.tick(&config, now).await.unwrap();
    assert_eq!(
        engine
            .ctx
            .store
            .get(row.id)
            .await
            .unwrap()
            .unwrap()
            .candidate()
            .unwrap()
            .filename,
        "f1.flac"
    );
    engine.enqueuer.tick(&config, now).await.unwrap();
    let after1 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after1.status(), DownloadStatus::Waiting);
    assert_eq!(after1.retry_count, 1);
    assert!(engine.ctx.blocklist.is_blocked("bob", "f1.flac", now).await.unwrap());

    // Second pass: f1 blocked, f2 chosen, rejected too.
    engine.dispatcher.tick(&config, now).await.unwrap();
    assert_eq!(
        engine
            .ctx
            .store
            .get(row.id)
            .await
            .unwrap()
            .unwrap()
            .candidate()
            .unwrap()
            .filename,
        "f2.flac"
    );
    engine.enqueuer.tick(&config, now).await.unwrap();
    let after2 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after2.status(), DownloadStatus::Waiting);
    assert_eq!(after2.retry_count, 2);
    assert!(engine.ctx.blocklist.is_blocked("bob", "f2.flac", now).await.unwrap());

    // Third pass: nothing acceptable survives the blocklist.
    engine.dispatcher.tick(&config, now).await.unwrap();
    let after3 = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(after3.status(), DownloadStatus::Failed);
    assert_eq!(after3.retry_count, 3);
    assert!(after3.next_retry_at.is_some(), "one back-off retry left");

    // The scheduled retry (third back-off step, 900 s) plays out the same
    // way and exhausts the budget.
    let later = now + Duration::seconds(901);
    engine.retry.tick(&config, later).await.unwrap();
    engine.dispatcher.tick(&config, later).await.unwrap();
    let terminal = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(terminal.status(), DownloadStatus::Failed);
    assert!(terminal.next_retry_at.is_none());

    // Only the exact files are blocked, not the whole peer.
    assert!(!engine.ctx.blocklist.is_blocked("bob", "f3.flac", now).await.unwrap());
}

// ==================== S4: circuit breaker ====================

#[tokio::test]
async fn test_breaker_opens_on_timeouts_and_recovers_via_probe() {
    let engine = TestEngine::new().await;
    engine.settings.set("download.breaker_failure_threshold", "3");
    engine.settings.set("download.breaker_recovery_ms", "200");
    for (track, artist) in [("T1", "A1"), ("T2", "A2"), ("T3", "A3")] {
        engine.tracks.add_track(track, artist, "Song");
    }
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));
    engine.port.script_search(Ok(vec![flac_hit("bob", "b.flac", 900)]));
    engine.port.script_search(Ok(vec![flac_hit("carol", "c.flac", 900)]));
    engine.port.script_enqueue(Ok("alice::R1".to_string()));
    engine.port.script_enqueue(Ok("bob::R2".to_string()));
    engine.port.script_enqueue(Ok("carol::R3".to_string()));
    for external_ref in ["alice::R1", "bob::R2", "carol::R3"] {
        engine.port.script_status(external_ref, Err(ScriptedError::Timeout));
    }

    let config = engine.config().await;
    for track in ["T1", "T2", "T3"] {
        engine.orchestrator.enqueue(track, 0, None).await.unwrap();
    }
    let now = Utc::now();
    for _ in 0..3 {
        engine.dispatcher.tick(&config, now).await.unwrap();
    }
    for _ in 0..3 {
        engine.enqueuer.tick(&config, now).await.unwrap();
    }

    // Three consecutive timeouts trip the breaker.
    engine.status_sync.tick(&config, Utc::now()).await.unwrap();
    assert_eq!(engine.ctx.breaker.snapshot().state, BreakerState::Open);
    let calls_when_open = engine.port.status_calls.load(std::sync::atomic::Ordering::SeqCst);
    assert_eq!(calls_when_open, 3);

    // While open, no downloader I/O happens at all.
    engine.status_sync.tick(&config, Utc::now()).await.unwrap();
    assert_eq!(
        engine.port.status_calls.load(std::sync::atomic::Ordering::SeqCst),
        calls_when_open
    );

    // After the recovery window one probe is admitted; success closes.
    tokio::time::sleep(StdDuration::from_millis(250)).await;
    for external_ref in ["alice::R1", "bob::R2", "carol::R3"] {
        engine.port.clear_status(external_ref);
        engine
            .port
            .script_status(external_ref, Ok(update(TransferState::Transferring, 10, 100)));
    }
    engine.status_sync.tick(&config, Utc::now()).await.unwrap();
    assert_eq!(engine.ctx.breaker.snapshot().state, BreakerState::Closed);
    assert_eq!(engine.ctx.breaker.snapshot().failure_count, 0);
}

// ==================== S5: restart safety ====================

#[tokio::test]
async fn test_stale_claims_recovered_after_restart() {
    let engine = TestEngine::new().await;
    engine.settings.set("download.max_concurrent", "10");
    let peers = ["p1", "p2", "p3", "p4", "p5"];
    for (i, peer) in peers.iter().enumerate() {
        let track = format!("T{i}");
        engine.tracks.add_track(&track, "Artist", "Song");
        engine
            .port
            .script_search(Ok(vec![flac_hit(peer, &format!("s{i}.flac"), 900)]));
        engine.port.script_enqueue(Ok(format!("{peer}::R{i}")));
    }

    let config = engine.config().await;
    let t0 = Utc::now();
    for i in 0..5 {
        engine.orchestrator.enqueue(&format!("T{i}"), 0, None).await.unwrap();
    }
    for _ in 0..5 {
        engine.dispatcher.tick(&config, t0).await.unwrap();
    }

    // Simulate a crash mid-tick: a dead worker holds claims on all five
    // pending rows.
    for _ in 0..5 {
        engine
            .ctx
            .store
            .claim_next("w-1", &[DownloadStatus::Pending], t0, config.lock_timeout)
            .await
            .unwrap()
            .unwrap();
    }

    // Within the lock timeout nothing is claimable.
    let early = engine
        .ctx
        .store
        .claim_next("enqueue", &[DownloadStatus::Pending], t0, config.lock_timeout)
        .await
        .unwrap();
    assert!(early.is_none());

    // Six minutes later the locks are stale; enqueue resumes normally.
    let restart = t0 + Duration::minutes(6);
    for _ in 0..5 {
        engine.enqueuer.tick(&config, restart).await.unwrap();
    }

    let (rows, total) = engine
        .orchestrator
        .list(&soulspot_core::store::ListQuery::default())
        .await
        .unwrap();
    assert_eq!(total, 5, "no rows were duplicated");
    let mut refs: Vec<String> = rows
        .iter()
        .filter_map(|r| r.external_ref.clone())
        .collect();
    refs.sort();
    refs.dedup();
    assert_eq!(refs.len(), 5, "every row owns a distinct external ref");
    assert!(
        rows.iter().all(|r| r.status() == DownloadStatus::Queued),
        "all rows progressed to queued"
    );
}

// ==================== S6: batch cancel ====================

#[tokio::test]
async fn test_batch_cancel_mixed_states() {
    let engine = TestEngine::new().await;
    for (track, _) in [("TA", "a"), ("TB", "b"), ("TC", "c")] {
        engine.tracks.add_track(track, "Artist", "Song");
    }
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));
    engine.port.script_search(Ok(vec![flac_hit("bob", "b.flac", 900)]));
    engine.port.script_search(Ok(Vec::new()));
    engine.port.script_enqueue(Ok("alice::R1".to_string()));
    engine.port.script_enqueue(Ok("bob::R2".to_string()));
    engine
        .port
        .script_status("alice::R1", Ok(update(TransferState::Queued, 0, 100)));
    engine
        .port
        .script_status("bob::R2", Ok(update(TransferState::Transferring, 10, 100)));

    let config = engine.config().await;
    let a = engine.orchestrator.enqueue("TA", 0, None).await.unwrap();
    let b = engine.orchestrator.enqueue("TB", 0, None).await.unwrap();
    let c = engine.orchestrator.enqueue("TC", 0, None).await.unwrap();
    let now = Utc::now();

    for _ in 0..3 {
        engine.dispatcher.tick(&config, now).await.unwrap();
    }
    for _ in 0..2 {
        engine.enqueuer.tick(&config, now).await.unwrap();
    }
    engine.status_sync.tick(&config, now).await.unwrap();

    assert_eq!(
        engine.ctx.store.get(a.id).await.unwrap().unwrap().status(),
        DownloadStatus::Queued
    );
    assert_eq!(
        engine.ctx.store.get(b.id).await.unwrap().unwrap().status(),
        DownloadStatus::Downloading
    );
    assert_eq!(
        engine.ctx.store.get(c.id).await.unwrap().unwrap().status(),
        DownloadStatus::Failed
    );

    let outcome = engine
        .orchestrator
        .batch(BatchAction::Cancel, &[a.id, b.id, c.id], None)
        .await
        .unwrap();
    assert_eq!(outcome.success_count, 3);
    assert_eq!(outcome.failed_count, 0);

    assert_eq!(
        engine.ctx.store.get(a.id).await.unwrap().unwrap().status(),
        DownloadStatus::Cancelled
    );
    assert_eq!(
        engine.ctx.store.get(b.id).await.unwrap().unwrap().status(),
        DownloadStatus::Cancelled
    );
    assert_eq!(
        engine.ctx.store.get(c.id).await.unwrap().unwrap().status(),
        DownloadStatus::Failed,
        "cancel on a failed row is a no-op"
    );

    // Best-effort downstream cancels were attempted for both live refs.
    tokio::time::sleep(StdDuration::from_millis(100)).await;
    let cancels = engine.port.cancel_calls.lock().unwrap().clone();
    assert!(cancels.contains(&"alice::R1".to_string()));
    assert!(cancels.contains(&"bob::R2".to_string()));
}

// ==================== invariant: concurrent claims ====================

#[tokio::test]
async fn test_concurrent_claimers_never_share_a_row() {
    let engine = TestEngine::new().await;
    for i in 0..6 {
        let track = format!("T{i}");
        engine.tracks.add_track(&track, "Artist", "Song");
        engine.orchestrator.enqueue(&track, 0, None).await.unwrap();
    }

    let config = engine.config().await;
    let store = Arc::new(engine.ctx.store.clone());
    let mut handles = Vec::new();
    for worker in 0..4 {
        let store = Arc::clone(&store);
        let lock_timeout = config.lock_timeout;
        handles.push(tokio::spawn(async move {
            let worker_id = format!("w-{worker}");
            let mut claimed = Vec::new();
            loop {
                match store
                    .claim_next(&worker_id, &[DownloadStatus::Waiting], Utc::now(), lock_timeout)
                    .await
                    .unwrap()
                {
                    Some(row) => claimed.push(row.id),
                    None => break,
                }
            }
            claimed
        }));
    }

    let mut all_claimed = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.await.unwrap());
    }
    all_claimed.sort_unstable();
    let before_dedup = all_claimed.len();
    all_claimed.dedup();
    assert_eq!(before_dedup, all_claimed.len(), "a row was claimed twice");
    assert_eq!(all_claimed.len(), 6, "every row claimed exactly once");
}

// ==================== idempotence laws ====================

#[tokio::test]
async fn test_enqueue_twice_returns_same_row() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");

    let first = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let second = engine.orchestrator.enqueue("T1", 5, None).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.priority, 0, "existing row returned unchanged");

    let (_, total) = engine
        .orchestrator
        .list(&soulspot_core::store::ListQuery::default())
        .await
        .unwrap();
    assert_eq!(total, 1);
}

#[tokio::test]
async fn test_cancelled_track_can_be_enqueued_again() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");

    let first = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    engine.orchestrator.cancel(first.id).await.unwrap();

    let second = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    assert_ne!(first.id, second.id);
}

#[tokio::test]
async fn test_cancel_twice_is_stable() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");
    let row = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();

    let first = engine.orchestrator.cancel(row.id).await.unwrap();
    let second = engine.orchestrator.cancel(row.id).await.unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.status(), DownloadStatus::Cancelled);
}

#[tokio::test]
async fn test_reorder_with_current_order_is_noop() {
    let engine = TestEngine::new().await;
    for i in 0..3 {
        let track = format!("T{i}");
        engine.tracks.add_track(&track, "Artist", "Song");
        engine.orchestrator.enqueue(&track, 0, None).await.unwrap();
    }

    let (before, _) = engine
        .orchestrator
        .list(&soulspot_core::store::ListQuery::default())
        .await
        .unwrap();
    let ids: Vec<i64> = before.iter().map(|r| r.id).collect();

    let updated = engine.orchestrator.reorder(&ids).await.unwrap();
    assert_eq!(updated, 3);

    let (after, _) = engine
        .orchestrator
        .list(&soulspot_core::store::ListQuery::default())
        .await
        .unwrap();
    assert_eq!(after.iter().map(|r| r.id).collect::<Vec<_>>(), ids);
}

#[tokio::test]
async fn test_batch_retry_on_waiting_rows_is_ok_noop() {
    let engine = TestEngine::new().await;
    let mut ids = Vec::new();
    for i in 0..3 {
        let track = format!("T{i}");
        engine.tracks.add_track(&track, "Artist", "Song");
        ids.push(engine.orchestrator.enqueue(&track, 0, None).await.unwrap().id);
    }

    let outcome = engine
        .orchestrator
        .batch(BatchAction::Retry, &ids, None)
        .await
        .unwrap();
    assert_eq!(outcome.success_count, 3);
    assert_eq!(outcome.failed_count, 0);
}

// ==================== caps and queue limits ====================

#[tokio::test]
async fn test_queue_full_rejects_enqueue() {
    let engine = TestEngine::new().await;
    engine.settings.set("download.max_queue_size", "2");
    for i in 0..3 {
        engine.tracks.add_track(&format!("T{i}"), "Artist", "Song");
    }

    engine.orchestrator.enqueue("T0", 0, None).await.unwrap();
    engine.orchestrator.enqueue("T1", 0, None).await.unwrap();

    let err = engine.orchestrator.enqueue("T2", 0, None).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::QueueFull { limit: 2 }));
}

#[tokio::test]
async fn test_global_concurrency_cap_defers_dispatch() {
    let engine = TestEngine::new().await;
    engine.settings.set("download.max_concurrent", "1");
    engine.tracks.add_track("T1", "A1", "S1");
    engine.tracks.add_track("T2", "A2", "S2");
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));

    let config = engine.config().await;
    let first = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let second = engine.orchestrator.enqueue("T2", 0, None).await.unwrap();
    let now = Utc::now();

    engine.dispatcher.tick(&config, now).await.unwrap();
    assert_eq!(
        engine.ctx.store.get(first.id).await.unwrap().unwrap().status(),
        DownloadStatus::Pending
    );

    // The active set is full; the second row stays waiting.
    engine.dispatcher.tick(&config, now).await.unwrap();
    assert_eq!(
        engine.ctx.store.get(second.id).await.unwrap().unwrap().status(),
        DownloadStatus::Waiting
    );
    assert_eq!(
        engine
            .port
            .search_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        1,
        "no search is spent on a row that cannot be promoted"
    );
}

#[tokio::test]
async fn test_per_peer_cap_defers_second_promotion() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "A1", "S1");
    engine.tracks.add_track("T2", "A2", "S2");
    // Both tracks resolve to the same peer.
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));
    engine.port.script_search(Ok(vec![flac_hit("alice", "b.flac", 900)]));

    let config = engine.config().await;
    let first = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let second = engine.orchestrator.enqueue("T2", 0, None).await.unwrap();
    let now = Utc::now();

    engine.dispatcher.tick(&config, now).await.unwrap();
    engine.dispatcher.tick(&config, now).await.unwrap();

    assert_eq!(
        engine.ctx.store.get(first.id).await.unwrap().unwrap().status(),
        DownloadStatus::Pending
    );
    // Default per-peer cap is 1: the second row waits its turn.
    assert_eq!(
        engine.ctx.store.get(second.id).await.unwrap().unwrap().status(),
        DownloadStatus::Waiting
    );
}

// ==================== scheduled and paused rows ====================

#[tokio::test]
async fn test_scheduled_row_released_when_due() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");

    let start = Utc::now() + Duration::hours(1);
    let row = engine
        .orchestrator
        .enqueue("T1", 0, Some(start))
        .await
        .unwrap();
    assert_eq!(row.status(), DownloadStatus::Scheduled);

    let config = engine.config().await;
    engine.retry.tick(&config, Utc::now()).await.unwrap();
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Scheduled
    );

    engine
        .retry
        .tick(&config, start + Duration::seconds(1))
        .await
        .unwrap();
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Waiting
    );
}

#[tokio::test]
async fn test_pause_resume_via_batch() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");
    let row = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let config = engine.config().await;

    let paused = engine
        .orchestrator
        .batch(BatchAction::Pause, &[row.id], None)
        .await
        .unwrap();
    assert_eq!(paused.success_count, 1);
    let current = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(current.status(), DownloadStatus::Scheduled);
    assert!(current.is_paused());

    // The pause sentinel never comes due, even far in the future.
    engine
        .retry
        .tick(&config, Utc::now() + Duration::days(365 * 10))
        .await
        .unwrap();
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Scheduled
    );

    let resumed = engine
        .orchestrator
        .batch(BatchAction::Resume, &[row.id], None)
        .await
        .unwrap();
    assert_eq!(resumed.success_count, 1);
    assert_eq!(
        engine.ctx.store.get(row.id).await.unwrap().unwrap().status(),
        DownloadStatus::Waiting
    );
}

#[tokio::test]
async fn test_pause_in_transfer_reports_invalid_transition() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));
    engine.port.script_enqueue(Ok("alice::R1".to_string()));

    let config = engine.config().await;
    let row = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let now = Utc::now();
    engine.dispatcher.tick(&config, now).await.unwrap();
    engine.enqueuer.tick(&config, now).await.unwrap();

    let outcome = engine
        .orchestrator
        .batch(BatchAction::Pause, &[row.id], None)
        .await
        .unwrap();
    assert_eq!(outcome.failed_count, 1);
    assert_eq!(outcome.errors[0].reason, "InvalidTransition");
}

// ==================== transfer failure paths ====================

#[tokio::test]
async fn test_lost_transfer_is_retryable() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song");
    engine.port.script_search(Ok(vec![flac_hit("alice", "a.flac", 900)]));
    engine.port.script_enqueue(Ok("alice::R1".to_string()));
    // No status script for the ref: the stub answers NotFound, exactly
    // like a downloader that lost the transfer.

    let config = engine.config().await;
    let row = engine.orchestrator.enqueue("T1", 0, None).await.unwrap();
    let now = Utc::now();
    engine.dispatcher.tick(&config, now).await.unwrap();
    engine.enqueuer.tick(&config, now).await.unwrap();
    engine.status_sync.tick(&config, now).await.unwrap();

    let failed = engine.ctx.store.get(row.id).await.unwrap().unwrap();
    assert_eq!(failed.status(), DownloadStatus::Failed);
    assert_eq!(failed.error_code(), Some(ErrorCode::LostByDownloader));
    assert_eq!(failed.retry_count, 1);
    assert!(failed.next_retry_at.is_some());
}

#[tokio::test]
async fn test_album_enqueue_creates_rows_for_all_tracks() {
    let engine = TestEngine::new().await;
    engine.tracks.add_track("T1", "Artist", "Song1");
    engine.tracks.add_track("T2", "Artist", "Song2");
    engine.tracks.add_album("A1", &["T1", "T2"]);

    let rows = engine
        .orchestrator
        .enqueue_album("A1", "spotify", 0)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    // Re-running returns the same rows instead of duplicating.
    let again = engine
        .orchestrator
        .enqueue_album("A1", "spotify", 0)
        .await
        .unwrap();
    assert_eq!(
        rows.iter().map(|r| r.id).collect::<Vec<_>>(),
        again.iter().map(|r| r.id).collect::<Vec<_>>()
    );
}
