//! Smart mode: neighbour pooling, instant adoption and pool hygiene.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{millis, secs, station, stations, url, FakeFactory, Harness};
use deepradio_daemon::core::DaemonEvent;
use deepradio_daemon::prebuffer::PrebufferManager;
use deepradio_proto::config::PrebufferConfig;
use deepradio_proto::protocol::{Command, PlaybackMode, PlaybackStatus, Station};
use tokio::sync::mpsc;

fn five() -> Vec<Station> {
    stations(&["A", "B", "C", "D", "E"])
}

async fn smart_harness(factory: FakeFactory) -> Harness {
    let mut h = Harness::new(five(), factory).await;
    h.command(Command::SetMode {
        mode: PlaybackMode::Smart,
    })
    .await;
    h
}

fn sorted(mut urls: Vec<String>) -> Vec<String> {
    urls.sort();
    urls
}

#[tokio::test(start_paused = true)]
async fn neighbours_are_pooled_after_trigger_delay() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    assert!(h.snapshot().await.is_playing);

    h.settle(millis(2900)).await;
    assert_eq!(h.factory.created(), 1);
    assert!(h.snapshot().await.prebuffered.is_empty());

    h.settle(millis(200)).await;
    assert_eq!(h.factory.created(), 3);
    assert_eq!(
        h.snapshot().await.prebuffered,
        sorted(vec![url("A"), url("C")])
    );

    // Pooled outputs stay silent
    for name in ["A", "C"] {
        let id = h.factory.last_for(&url(name)).unwrap();
        assert_eq!(h.factory.count(id, "start"), 0);
        assert!(!h.factory.is_released(id));
    }
}

#[tokio::test(start_paused = true)]
async fn adopting_a_pooled_neighbour_is_instant() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;

    let pooled = h.factory.last_for(&url("C")).unwrap();
    let created = h.factory.created();

    h.command(Command::Next).await;

    // Playing after a single command, without a fresh preparation
    let state = h.snapshot().await;
    assert_eq!(state.current_station, Some(2));
    assert_eq!(state.status, PlaybackStatus::Playing);
    assert!(!state.is_buffering);
    assert_eq!(h.factory.created(), created);
    assert_eq!(h.factory.count(pooled, "start"), 1);
    assert!(!state.prebuffered.contains(&url("C")));
    assert!(state.prebuffered.contains(&url("A")));
}

#[tokio::test(start_paused = true)]
async fn pooled_entry_is_handed_out_once() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;
    let pooled = h.factory.last_for(&url("C")).unwrap();

    h.command(Command::Next).await;
    h.command(Command::Prev).await;
    h.command(Command::Next).await;

    // The second visit to C had to prepare a new output
    assert!(h.factory.is_released(pooled));
    assert_eq!(h.factory.ids_for(&url("C")).len(), 2);
    assert_eq!(h.snapshot().await.status, PlaybackStatus::Preparing);
}

#[tokio::test(start_paused = true)]
async fn pool_never_exceeds_capacity() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;

    for _ in 0..4 {
        h.command(Command::Next).await;
        h.settle(Duration::ZERO).await;
        assert!(h.snapshot().await.prebuffered.len() <= 3);
        h.settle(millis(3100)).await;
        let state = h.snapshot().await;
        assert!(state.prebuffered.len() <= 3, "{:?}", state.prebuffered);
        assert!(state.is_playing);
        // The pool never holds the active station
        let current = state.current().unwrap().url.clone();
        assert!(!state.prebuffered.contains(&current));
    }

    // One active output plus at most three pooled ones
    assert!(h.factory.live() <= 4);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_are_swept() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;
    let a = h.factory.last_for(&url("A")).unwrap();
    let c = h.factory.last_for(&url("C")).unwrap();

    h.settle(secs(150)).await;

    assert!(h.snapshot().await.prebuffered.is_empty());
    assert!(h.factory.is_released(a));
    assert!(h.factory.is_released(c));
    assert!(h.snapshot().await.is_playing);
}

#[tokio::test(start_paused = true)]
async fn expired_entry_is_not_adopted() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;
    let pooled = h.factory.last_for(&url("C")).unwrap();

    // Past the TTL, before the next sweep
    h.settle(secs(121)).await;
    assert!(h.snapshot().await.prebuffered.contains(&url("C")));

    h.command(Command::Next).await;

    assert!(h.factory.is_released(pooled));
    assert_eq!(h.factory.count(pooled, "start"), 0);
    assert_eq!(h.snapshot().await.status, PlaybackStatus::Preparing);
}

#[tokio::test(start_paused = true)]
async fn leaving_smart_mode_releases_the_pool() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;
    let a = h.factory.last_for(&url("A")).unwrap();

    h.command(Command::SetMode {
        mode: PlaybackMode::Instant,
    })
    .await;

    assert!(h.snapshot().await.prebuffered.is_empty());
    assert!(h.factory.is_released(a));
    assert_eq!(h.factory.live(), 1);

    // Switching back while playing re-arms the cycle
    h.command(Command::SetMode {
        mode: PlaybackMode::Smart,
    })
    .await;
    h.settle(millis(3100)).await;
    assert_eq!(
        h.snapshot().await.prebuffered,
        sorted(vec![url("A"), url("C")])
    );
}

#[tokio::test(start_paused = true)]
async fn stop_releases_the_pool() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;

    h.command(Command::Stop).await;

    assert!(h.snapshot().await.prebuffered.is_empty());
    assert_eq!(h.factory.live(), 0);
}

#[tokio::test(start_paused = true)]
async fn pause_in_smart_mode_keeps_the_pool() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;

    h.command(Command::Pause).await;

    assert_eq!(h.snapshot().await.prebuffered.len(), 2);
    assert_eq!(h.factory.live(), 3);
}

#[tokio::test(start_paused = true)]
async fn stop_before_trigger_cancels_cycle() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;

    h.settle(secs(1)).await;
    h.command(Command::Stop).await;
    h.settle(secs(5)).await;

    assert_eq!(h.factory.created(), 1);
    assert!(h.snapshot().await.prebuffered.is_empty());
}

#[tokio::test(start_paused = true)]
async fn slow_neighbour_times_out_and_is_released() {
    let mut h = smart_harness(FakeFactory::manual()).await;
    h.command(Command::Play { station_idx: 1 }).await;
    let active = h.factory.last_for(&url("B")).unwrap();
    assert!(h.factory.ready(active));
    h.settle(Duration::ZERO).await;
    assert!(h.snapshot().await.is_playing);

    h.settle(millis(3100)).await;
    let a = h.factory.last_for(&url("A")).unwrap();
    let c = h.factory.last_for(&url("C")).unwrap();
    assert!(h.factory.ready(a));
    h.settle(Duration::ZERO).await;
    assert_eq!(h.snapshot().await.prebuffered, vec![url("A")]);

    h.settle(secs(16)).await;
    assert!(h.factory.is_released(c));
    assert!(!h.factory.is_released(a));
    assert_eq!(h.snapshot().await.prebuffered, vec![url("A")]);
}

#[tokio::test(start_paused = true)]
async fn failed_neighbour_is_not_pooled() {
    let factory = FakeFactory::auto_ready();
    factory.fail_url(&url("C"));
    let mut h = smart_harness(factory).await;
    h.play_and_settle(1).await;

    h.settle(millis(3100)).await;

    assert_eq!(h.snapshot().await.prebuffered, vec![url("A")]);
    let c = h.factory.last_for(&url("C")).unwrap();
    assert!(h.factory.is_released(c));
    assert!(h.snapshot().await.last_error.is_none());
}

#[tokio::test(start_paused = true)]
async fn faulted_pool_entry_is_evicted() {
    let mut h = smart_harness(FakeFactory::auto_ready()).await;
    h.play_and_settle(1).await;
    h.settle(millis(3100)).await;
    let a = h.factory.last_for(&url("A")).unwrap();

    h.factory.fault(a, "connection reset");
    h.settle(Duration::ZERO).await;

    let state = h.snapshot().await;
    assert_eq!(state.prebuffered, vec![url("C")]);
    assert!(h.factory.is_released(a));
    // The active station is unaffected
    assert!(state.is_playing);
    assert!(state.last_error.is_none());
}

// ── manager on its own ────────────────────────────────────────────────────────

fn manager(
    factory: &FakeFactory,
    capacity: usize,
) -> (PrebufferManager, mpsc::Receiver<DaemonEvent>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let (faults_tx, _faults_rx) = mpsc::unbounded_channel();
    let config = PrebufferConfig {
        capacity,
        ..Default::default()
    };
    let manager =
        PrebufferManager::new(config, Arc::new(factory.clone()), faults_tx, events_tx);
    (manager, events_rx)
}

#[tokio::test(start_paused = true)]
async fn capacity_limits_the_candidates() {
    let factory = FakeFactory::auto_ready();
    let (mut pool, _events) = manager(&factory, 1);

    pool.schedule(vec![station("X"), station("Y")]);
    tokio::time::sleep(millis(3100)).await;

    assert_eq!(factory.created(), 1);
    assert_eq!(pool.urls().await, vec![url("X")]);

    let entry = pool.take(&url("X")).await.expect("pooled");
    assert!(entry.ready);
    assert_eq!(entry.station_url, url("X"));
    assert!(pool.take(&url("X")).await.is_none());
    assert!(pool.is_empty().await);
}

#[tokio::test(start_paused = true)]
async fn rescheduling_abandons_the_running_cycle() {
    let factory = FakeFactory::manual();
    let (mut pool, _events) = manager(&factory, 3);

    pool.schedule(vec![station("X")]);
    tokio::time::sleep(millis(3100)).await;
    let x = factory.last_for(&url("X")).unwrap();

    pool.schedule(vec![station("Y")]);
    tokio::time::sleep(millis(100)).await;
    assert!(factory.is_released(x));

    tokio::time::sleep(secs(3)).await;
    let y = factory.last_for(&url("Y")).unwrap();
    assert!(factory.ready(y));
    tokio::time::sleep(millis(10)).await;
    assert_eq!(pool.urls().await, vec![url("Y")]);

    pool.shutdown().await;
    assert!(factory.is_released(y));
    assert!(pool.is_empty().await);
}
