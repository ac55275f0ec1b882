//! Integration tests for the session bridge: a real server on a temporary
//! Unix socket, driven through `trove-client`.

use std::path::{Path, PathBuf};
use std::time::{Duration, UNIX_EPOCH};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use trove_client::{ClientError, Session};
use trove_kernel::{IndexConfig, IndexHandle};
use trove_server::TroveServer;
use trove_types::{
    FaultKind, MonitorEvent, MonitorState, MountKind, Mountpoint, Predicate, Query, ServerStats,
};

// ============================================================================
// Shared test setup
// ============================================================================

struct Harness {
    dir: tempfile::TempDir,
    socket: PathBuf,
    index: IndexHandle,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<anyhow::Result<()>>>,
}

impl Harness {
    async fn start() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let socket = dir.path().join("run").join("trove.sock");
        let config = IndexConfig {
            db_path: PathBuf::from(":memory:"),
            socket_path: socket.clone(),
            deletion_grace_ms: 0,
            ..IndexConfig::default()
        };
        let index = trove_kernel::start(config).await.unwrap();
        let server = TroveServer::with_index(index.clone(), &socket, 256).await.unwrap();

        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.run_until(async {
            let _ = stopped.await;
        }));
        Self {
            dir,
            socket,
            index,
            stop: Some(stop),
            task: Some(task),
        }
    }

    fn media(&self) -> PathBuf {
        let media = self.dir.path().join("media");
        std::fs::create_dir_all(&media).unwrap();
        media
    }

    async fn connect(&self) -> Session {
        trove_client::connect(&self.socket).await.unwrap()
    }

    async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.unwrap().unwrap();
        }
    }
}

fn write(path: &Path, secs: u64) {
    std::fs::write(path, b"data").unwrap();
    set_mtime(path, secs);
}

fn set_mtime(path: &Path, secs: u64) {
    std::fs::File::options()
        .write(true)
        .open(path)
        .unwrap()
        .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .unwrap();
}

fn local(path: &Path) -> Mountpoint {
    Mountpoint::new(MountKind::Local, "", path, None)
}

/// Poll stats until `done` holds.
async fn wait_for_stats(session: &Session, done: impl Fn(&ServerStats) -> bool) -> ServerStats {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = session.stats().await.unwrap();
        if done(&stats) {
            return stats;
        }
        assert!(tokio::time::Instant::now() < deadline, "stats never settled: {stats:?}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn monitor_events_cross_the_socket_in_order() {
    let harness = Harness::start().await;
    let media = harness.media();
    write(&media.join("A.mp3"), 1_600_000_000);
    write(&media.join("B.mp3"), 1_600_000_000);

    let session = harness.connect().await;
    session.add_mountpoint(local(&media)).await.unwrap();

    let results = session.query(Query::dirname(&media)).await.unwrap();
    assert_eq!(results.objects.len(), 2);
    let b = results.objects[1].key.clone();

    let mut monitor = session.monitor(&results).await.unwrap();
    let first = monitor.wait_up_to_date().await.unwrap();
    let last_progress = first.iter().rposition(MonitorEvent::is_progress).unwrap();
    let changed = first.iter().position(|e| e.name() == "changed").unwrap();
    assert!(last_progress < changed);
    assert_eq!(first.last(), Some(&MonitorEvent::UpToDate));
    assert_eq!(monitor.state(), MonitorState::Idle);

    set_mtime(&media.join("B.mp3"), 1_600_000_600);
    harness.index.rescan(&media).await.unwrap();
    let second = monitor.wait_up_to_date().await.unwrap();
    assert_eq!(
        second,
        vec![
            MonitorEvent::Progress { done: 1, total: 1 },
            MonitorEvent::Changed {
                added: vec![],
                removed: vec![],
                updated: vec![b],
            },
            MonitorEvent::UpToDate,
        ]
    );

    session.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn invalid_predicates_fail_at_query_time() {
    let harness = Harness::start().await;
    let session = harness.connect().await;

    let empty = session
        .query(Query::new([Predicate::eq("type", "audio"), Predicate::eq("artist", "Foo")]))
        .await
        .unwrap();
    assert!(empty.objects.is_empty());

    let err = session
        .query(Query::new([Predicate::eq("type", "audio"), Predicate::eq("bitrate", 320i64)]))
        .await
        .unwrap_err();
    match err {
        ClientError::Remote(e) => assert_eq!(e.kind, FaultKind::InvalidPredicate),
        other => panic!("expected a remote fault, got {other:?}"),
    }

    harness.shutdown().await;
}

#[tokio::test]
async fn same_query_shares_one_monitor() {
    let harness = Harness::start().await;
    let media = harness.media();
    write(&media.join("a.flac"), 1_600_000_000);
    let session = harness.connect().await;
    session.add_mountpoint(local(&media)).await.unwrap();

    let query = Query::new([Predicate::eq("type", "audio")]);
    let first = session.query(query.clone()).await.unwrap();
    let second = session.query(query).await.unwrap();
    assert_ne!(first.handle, second.handle);

    let mut one = session.monitor(&first).await.unwrap();
    let two = session.monitor(&second).await.unwrap();
    assert_eq!(one.subscription(), two.subscription());
    assert_eq!(session.stats().await.unwrap().monitors, 1);

    one.wait_up_to_date().await.unwrap();
    one.stop().await.unwrap();
    one.stop().await.unwrap();
    session.stop(two.subscription()).await.unwrap();
    assert_eq!(session.stats().await.unwrap().monitors, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn clients_cannot_stop_each_others_monitors() {
    let harness = Harness::start().await;
    let media = harness.media();
    write(&media.join("a.mp3"), 1_600_000_000);

    let owner = harness.connect().await;
    owner.add_mountpoint(local(&media)).await.unwrap();
    let results = owner.query(Query::dirname(&media)).await.unwrap();
    let mut monitor = owner.monitor(&results).await.unwrap();
    monitor.wait_up_to_date().await.unwrap();
    let sub = monitor.subscription();

    let other = harness.connect().await;
    let err = other.stop(sub).await.unwrap_err();
    assert_eq!(err.fault_kind(), FaultKind::NotFound);
    assert!(harness.index.monitor_state(sub).await.unwrap().is_some());

    // The owner still hears about changes.
    write(&media.join("b.mp3"), 1_600_000_000);
    harness.index.rescan(&media).await.unwrap();
    let settled = tokio::time::timeout(Duration::from_secs(10), async {
        while monitor.objects().len() < 2 {
            monitor.wait_up_to_date().await.unwrap();
        }
    })
    .await;
    assert!(settled.is_ok(), "owner never saw b.mp3");

    other.close().await;
    owner.close().await;
    harness.shutdown().await;
}

#[tokio::test]
async fn disconnect_releases_everything_the_client_held() {
    let harness = Harness::start().await;
    let media = harness.media();
    write(&media.join("a.mp3"), 1_600_000_000);

    let observer = harness.connect().await;
    observer.add_mountpoint(local(&media)).await.unwrap();
    let baseline = observer.stats().await.unwrap();
    assert_eq!(baseline.clients, 1);

    let client = harness.connect().await;
    let results = client.query(Query::dirname(&media)).await.unwrap();
    let _monitor = client.monitor(&results).await.unwrap();
    let busy = observer.stats().await.unwrap();
    assert_eq!(busy.clients, 2);
    assert_eq!(busy.monitors, 1);
    assert_eq!(busy.result_sets, 1);
    assert!(busy.watched_dirs > baseline.watched_dirs);

    client.close().await;
    let settled = wait_for_stats(&observer, |s| s.clients == 1).await;
    assert_eq!(settled.monitors, 0);
    assert_eq!(settled.result_sets, 0);
    assert_eq!(settled.watched_dirs, baseline.watched_dirs);
    assert_eq!(settled.checker_tasks, 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn mounts_round_trip_and_removal_is_idempotent() {
    let harness = Harness::start().await;
    let media = harness.media();
    let session = harness.connect().await;

    let usb = Mountpoint::new(MountKind::Removable, "/dev/sdz1", &media, Some("usb1".into()));
    let root = session.add_mountpoint(usb.clone()).await.unwrap();
    assert_eq!(root.path, media);
    assert_eq!(session.list_mounts().await.unwrap(), vec![usb]);

    session.remove_mountpoint(&media).await.unwrap();
    session.remove_mountpoint(&media).await.unwrap();
    assert!(session.list_mounts().await.unwrap().is_empty());

    harness.shutdown().await;
}

#[tokio::test]
async fn unknown_handle_is_not_found() {
    let harness = Harness::start().await;
    let session = harness.connect().await;
    let results = session.query(Query::new([Predicate::eq("type", "audio")])).await.unwrap();
    session.release(&results).await.unwrap();

    let err = session.monitor(&results).await.unwrap_err();
    assert_eq!(err.fault_kind(), FaultKind::NotFound);

    harness.shutdown().await;
}

#[tokio::test]
async fn connect_fails_once_the_server_is_gone() {
    let harness = Harness::start().await;
    let socket = harness.socket.clone();
    harness.shutdown().await;

    assert!(!socket.exists());
    let err = trove_client::connect(&socket).await.unwrap_err();
    assert_eq!(err.fault_kind(), FaultKind::Connection);
}
