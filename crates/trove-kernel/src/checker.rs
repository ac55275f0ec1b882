//! Staleness checker.
//!
//! A [`CheckerTask`] takes a batch of candidate objects, stats each one, and
//! re-parses those whose recorded mtime differs from the filesystem's (or was
//! never recorded). Stat and parse run on blocking worker threads; at most
//! `workers` parses are in flight at once.
//!
//! Results flow back to the dispatcher as [`CheckerEvent`]s on an mpsc
//! channel, in this order per task:
//!
//! ```text
//! (Parsed, Progress)*  Completed
//! ```
//!
//! `Completed` is always sent, including when nothing was stale. The task
//! checks its cancellation token between items; an item already being parsed
//! finishes, but its result is discarded.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::UNIX_EPOCH;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trove_types::{Attributes, ObjectKey};

use crate::parser::MetadataParser;

/// Identifies one checker batch.
pub type TaskId = u64;

/// Filesystem mtime in Unix milliseconds.
pub fn file_mtime(meta: &std::fs::Metadata) -> Option<i64> {
    let modified = meta.modified().ok()?;
    let since = modified.duration_since(UNIX_EPOCH).ok()?;
    Some(since.as_millis() as i64)
}

/// One candidate for staleness checking.
#[derive(Debug, Clone)]
pub struct CheckItem {
    pub key: ObjectKey,
    pub path: PathBuf,
    pub recorded_mtime: Option<i64>,
}

/// Result of re-parsing one stale object.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Parsed {
        mtime: Option<i64>,
        attributes: Attributes,
    },
    /// Parse failed. The mtime is still recorded so the object is not
    /// retried until it changes again.
    Failed { mtime: Option<i64>, reason: String },
}

/// Event sent from a checker task to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub enum CheckerEvent {
    Parsed {
        task: TaskId,
        key: ObjectKey,
        outcome: ParseOutcome,
    },
    Progress {
        task: TaskId,
        done: u64,
        total: u64,
    },
    Completed {
        task: TaskId,
        reparsed: u64,
        cancelled: bool,
    },
}

impl CheckerEvent {
    pub fn task(&self) -> TaskId {
        match self {
            Self::Parsed { task, .. } | Self::Progress { task, .. } | Self::Completed { task, .. } => *task,
        }
    }
}

/// Handle to a running batch: completion arrives as `CheckerEvent::Completed`,
/// cancellation goes through [`CheckerTask::cancel`].
#[derive(Debug)]
pub struct CheckerTask {
    id: TaskId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl CheckerTask {
    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Request cooperative cancellation. Safe to call repeatedly.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Spawns checker tasks against one parser.
pub struct StalenessChecker {
    parser: Arc<dyn MetadataParser>,
    workers: usize,
    next_id: AtomicU64,
}

impl StalenessChecker {
    pub fn new(parser: Arc<dyn MetadataParser>, workers: usize) -> Self {
        Self {
            parser,
            workers: workers.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Start checking `items`. Events go to `events`.
    pub fn spawn(&self, items: Vec<CheckItem>, events: mpsc::UnboundedSender<CheckerEvent>) -> CheckerTask {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_task(
            id,
            Arc::clone(&self.parser),
            self.workers,
            items,
            cancel.clone(),
            events,
        ));
        CheckerTask { id, cancel, handle }
    }
}

/// Stat every candidate; keep those whose mtime moved. Vanished paths are
/// skipped: directory reconciliation owns deletions.
fn select_stale(items: Vec<CheckItem>) -> Vec<(CheckItem, Option<i64>)> {
    items
        .into_iter()
        .filter_map(|item| {
            let meta = std::fs::metadata(&item.path).ok()?;
            let current = file_mtime(&meta);
            (item.recorded_mtime.is_none() || item.recorded_mtime != current).then_some((item, current))
        })
        .collect()
}

async fn run_task(
    task: TaskId,
    parser: Arc<dyn MetadataParser>,
    workers: usize,
    items: Vec<CheckItem>,
    cancel: CancellationToken,
    events: mpsc::UnboundedSender<CheckerEvent>,
) {
    let candidates = items.len();
    let stale = match tokio::task::spawn_blocking(move || select_stale(items)).await {
        Ok(stale) => stale,
        Err(e) => {
            tracing::warn!(task, error = %e, "stat phase failed");
            Vec::new()
        }
    };
    let total = stale.len() as u64;
    tracing::debug!(task, candidates, stale = total, "checker batch started");

    let mut done = 0u64;
    if total > 0 && !cancel.is_cancelled() {
        let mut results = futures::stream::iter(stale)
            .map(|(item, mtime)| {
                let parser = Arc::clone(&parser);
                let cancel = cancel.clone();
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    let key = item.key.clone();
                    let object_type = key.object_type.clone();
                    let parsed =
                        tokio::task::spawn_blocking(move || parser.parse(&item.path, &object_type)).await;
                    let outcome = match parsed {
                        Ok(Ok(attributes)) => ParseOutcome::Parsed { mtime, attributes },
                        Ok(Err(failure)) => ParseOutcome::Failed {
                            mtime,
                            reason: failure.to_string(),
                        },
                        Err(e) => ParseOutcome::Failed {
                            mtime,
                            reason: format!("parser panicked: {e}"),
                        },
                    };
                    Some((key, outcome))
                }
            })
            .buffered(workers);

        while let Some(result) = results.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let Some((key, outcome)) = result else {
                break;
            };
            if let ParseOutcome::Failed { reason, .. } = &outcome {
                tracing::warn!(task, key = %key, %reason, "parse failed, object flagged unparseable");
            }
            done += 1;
            if events.send(CheckerEvent::Parsed { task, key, outcome }).is_err()
                || events.send(CheckerEvent::Progress { task, done, total }).is_err()
            {
                return;
            }
        }
    }

    let cancelled = cancel.is_cancelled();
    tracing::debug!(task, reparsed = done, total, cancelled, "checker batch completed");
    let _ = events.send(CheckerEvent::Completed {
        task,
        reparsed: done,
        cancelled,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{FsMetadataParser, ParseFailure};
    use std::path::Path;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use trove_types::AttrValue;

    fn set_mtime(path: &Path, secs: u64) {
        std::fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            .unwrap();
    }

    fn mtime_of(path: &Path) -> Option<i64> {
        file_mtime(&std::fs::metadata(path).unwrap())
    }

    struct CountingParser {
        calls: AtomicUsize,
        fail_on: Option<&'static str>,
    }

    impl CountingParser {
        fn new(fail_on: Option<&'static str>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail_on,
            })
        }
    }

    impl MetadataParser for CountingParser {
        fn parse(&self, path: &Path, object_type: &str) -> Result<Attributes, ParseFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on.is_some_and(|name| path.ends_with(name)) {
                return Err(ParseFailure::new(path, "corrupt header"));
            }
            FsMetadataParser.parse(path, object_type)
        }
    }

    async fn collect(mut rx: mpsc::UnboundedReceiver<CheckerEvent>) -> Vec<CheckerEvent> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            let done = matches!(ev, CheckerEvent::Completed { .. });
            out.push(ev);
            if done {
                break;
            }
        }
        out
    }

    fn fixture(names: &[&str]) -> (tempfile::TempDir, Vec<CheckItem>) {
        let dir = tempfile::tempdir().unwrap();
        let items = names
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let path = dir.path().join(name);
                std::fs::write(&path, name.as_bytes()).unwrap();
                set_mtime(&path, 1_000_000);
                CheckItem {
                    key: ObjectKey::new("audio", i as i64 + 1),
                    path,
                    recorded_mtime: None,
                }
            })
            .collect();
        (dir, items)
    }

    #[tokio::test]
    async fn never_scanned_items_are_parsed_with_progress() {
        let (_dir, items) = fixture(&["a.mp3", "b.mp3"]);
        let parser = CountingParser::new(None);
        let checker = StalenessChecker::new(parser.clone(), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = checker.spawn(items, tx);

        let events = collect(rx).await;
        let progress: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                CheckerEvent::Progress { done, total, .. } => Some((*done, *total)),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![(1, 2), (2, 2)]);
        assert_eq!(
            events.last(),
            Some(&CheckerEvent::Completed {
                task: task.id(),
                reparsed: 2,
                cancelled: false
            })
        );
        assert_eq!(parser.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn fresh_items_complete_without_reparse() {
        let (_dir, mut items) = fixture(&["a.mp3", "b.mp3"]);
        for item in &mut items {
            item.recorded_mtime = mtime_of(&item.path);
        }
        let parser = CountingParser::new(None);
        let checker = StalenessChecker::new(parser.clone(), 2);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = checker.spawn(items, tx);

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![CheckerEvent::Completed {
                task: task.id(),
                reparsed: 0,
                cancelled: false
            }]
        );
        assert_eq!(parser.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn only_moved_mtime_is_stale() {
        let (_dir, mut items) = fixture(&["a.mp3", "b.mp3"]);
        for item in &mut items {
            item.recorded_mtime = mtime_of(&item.path);
        }
        set_mtime(&items[1].path, 1_000_060);

        let parser = CountingParser::new(None);
        let checker = StalenessChecker::new(parser.clone(), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        checker.spawn(items.clone(), tx);

        let events = collect(rx).await;
        match &events[0] {
            CheckerEvent::Parsed { key, outcome: ParseOutcome::Parsed { mtime, attributes }, .. } => {
                assert_eq!(key, &items[1].key);
                assert_eq!(*mtime, Some(1_000_060_000));
                assert_eq!(attributes["title"], AttrValue::from("b"));
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(events[1], CheckerEvent::Progress { done: 1, total: 1, .. }));
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_does_not_abort_batch() {
        let (_dir, items) = fixture(&["a.mp3", "bad.mp3", "c.mp3"]);
        let parser = CountingParser::new(Some("bad.mp3"));
        let checker = StalenessChecker::new(parser.clone(), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        checker.spawn(items, tx);

        let events = collect(rx).await;
        let failed = events
            .iter()
            .filter(|e| matches!(e, CheckerEvent::Parsed { outcome: ParseOutcome::Failed { .. }, .. }))
            .count();
        assert_eq!(failed, 1);
        assert!(matches!(
            events.last(),
            Some(CheckerEvent::Completed { reparsed: 3, cancelled: false, .. })
        ));
    }

    #[tokio::test]
    async fn vanished_items_are_skipped() {
        let (_dir, items) = fixture(&["a.mp3", "b.mp3"]);
        std::fs::remove_file(&items[0].path).unwrap();
        let checker = StalenessChecker::new(CountingParser::new(None), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        checker.spawn(items, tx);

        let events = collect(rx).await;
        assert!(matches!(
            events.last(),
            Some(CheckerEvent::Completed { reparsed: 1, .. })
        ));
    }

    struct GatedParser {
        started: mpsc::UnboundedSender<()>,
        gate: std::sync::Mutex<std::sync::mpsc::Receiver<()>>,
        calls: AtomicUsize,
    }

    impl MetadataParser for GatedParser {
        fn parse(&self, _path: &Path, _object_type: &str) -> Result<Attributes, ParseFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let _ = self.started.send(());
            if let Ok(gate) = self.gate.lock() {
                let _ = gate.recv();
            }
            Ok(Attributes::new())
        }
    }

    #[tokio::test]
    async fn cancellation_stops_between_items() {
        let (_dir, items) = fixture(&["a.mp3", "b.mp3", "c.mp3"]);
        let (started_tx, mut started_rx) = mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel();
        let parser = Arc::new(GatedParser {
            started: started_tx,
            gate: std::sync::Mutex::new(gate_rx),
            calls: AtomicUsize::new(0),
        });
        let checker = StalenessChecker::new(parser.clone(), 1);
        let (tx, rx) = mpsc::unbounded_channel();
        let task = checker.spawn(items, tx);

        started_rx.recv().await.unwrap();
        task.cancel();
        task.cancel();
        gate_tx.send(()).unwrap();

        let events = collect(rx).await;
        assert_eq!(
            events,
            vec![CheckerEvent::Completed {
                task: task.id(),
                reparsed: 0,
                cancelled: true
            }]
        );
        assert_eq!(parser.calls.load(Ordering::SeqCst), 1);
    }
}
