//! A connection to a trove server.
//!
//! [`Session`] is a cheap, cloneable handle. Requests are written as JSON
//! lines and matched to their responses by id; a reader task routes
//! responses to the waiting caller and monitor notifications to the
//! [`MonitorProxy`] that owns the subscription.
//!
//! The server may send a subscription's first events before the response
//! that names it. Such events are held until the proxy is created, then
//! delivered ahead of anything newer.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use trove_types::{
    AttrValue, MonitorEvent, Mountpoint, Object, ObjectKey, Query, RemoteError, Request,
    RequestBody, ResponseBody, ResultSetId, ServerFrame, ServerStats, SubscriptionId,
};

use crate::constants::{CONNECT_ATTEMPTS, CONNECT_RETRY_DELAY, CONNECT_TIMEOUT, EARLY_EVENT_LIMIT};
use crate::error::{ClientError, ClientResult};
use crate::monitor::MonitorProxy;

type Reply = oneshot::Sender<Result<ResponseBody, RemoteError>>;

/// A query result held by the server under `handle`.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub handle: ResultSetId,
    pub objects: Vec<Object>,
}

/// Where notifications go.
#[derive(Default)]
struct Routes {
    live: HashMap<SubscriptionId, Vec<mpsc::UnboundedSender<MonitorEvent>>>,
    early: HashMap<SubscriptionId, Vec<MonitorEvent>>,
    /// Subscriptions this session stopped. Their stragglers are dropped.
    stopped: HashSet<SubscriptionId>,
}

impl Routes {
    fn route(&mut self, subscription: SubscriptionId, event: MonitorEvent) {
        if let Some(senders) = self.live.get_mut(&subscription) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
            if senders.is_empty() {
                self.live.remove(&subscription);
            }
            return;
        }
        if self.stopped.contains(&subscription) {
            log::trace!("dropping event for stopped {subscription}");
            return;
        }
        let held = self.early.entry(subscription).or_default();
        if held.len() >= EARLY_EVENT_LIMIT {
            log::warn!("dropping early event for {subscription}: too many unclaimed");
            held.remove(0);
        }
        held.push(event);
    }

    fn attach(&mut self, subscription: SubscriptionId) -> mpsc::UnboundedReceiver<MonitorEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stopped.remove(&subscription);
        for event in self.early.remove(&subscription).unwrap_or_default() {
            let _ = tx.send(event);
        }
        self.live.entry(subscription).or_default().push(tx);
        rx
    }

    fn forget(&mut self, subscription: SubscriptionId) {
        self.live.remove(&subscription);
        self.early.remove(&subscription);
        self.stopped.insert(subscription);
    }
}

struct Inner {
    path: PathBuf,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Mutex<HashMap<u64, Reply>>,
    routes: Mutex<Routes>,
    next_id: AtomicU64,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle to one server connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("path", &self.inner.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Connect to the server socket at `path`.
///
/// Each attempt is bounded by [`CONNECT_TIMEOUT`]; after
/// [`CONNECT_ATTEMPTS`] failures the error is [`ClientError::Connection`].
pub async fn connect(path: impl AsRef<Path>) -> ClientResult<Session> {
    let path = path.as_ref();
    let mut last_error = String::new();
    for attempt in 1..=CONNECT_ATTEMPTS {
        match tokio::time::timeout(CONNECT_TIMEOUT, UnixStream::connect(path)).await {
            Ok(Ok(stream)) => {
                log::debug!("connected to {} (attempt {attempt})", path.display());
                return Ok(Session::from_stream(stream, path));
            }
            Ok(Err(e)) => last_error = e.to_string(),
            Err(_) => last_error = format!("timed out after {:?}", CONNECT_TIMEOUT),
        }
        log::debug!("connect attempt {attempt}/{CONNECT_ATTEMPTS} to {} failed: {last_error}", path.display());
        if attempt < CONNECT_ATTEMPTS {
            tokio::time::sleep(CONNECT_RETRY_DELAY).await;
        }
    }
    Err(ClientError::Connection(format!("{}: {last_error}", path.display())))
}

impl Session {
    pub(crate) fn from_stream(stream: UnixStream, path: &Path) -> Self {
        let (reader, writer) = stream.into_split();
        let inner = Arc::new(Inner {
            path: path.to_path_buf(),
            writer: tokio::sync::Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            routes: Mutex::new(Routes::default()),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });
        let task = tokio::spawn(read_frames(Arc::clone(&inner), reader));
        *inner.reader.lock() = Some(task);
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    async fn request(&self, body: RequestBody) -> ClientResult<ResponseBody> {
        if self.is_closed() {
            return Err(ClientError::Closed);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, reply);

        let mut line = serde_json::to_vec(&Request { id, body })
            .map_err(|e| ClientError::Protocol(e.to_string()))?;
        line.push(b'\n');
        let written = self.inner.writer.lock().await.write_all(&line).await;
        if let Err(e) = written {
            self.inner.pending.lock().remove(&id);
            return Err(e.into());
        }

        let result = rx.await.map_err(|_| ClientError::Closed)?;
        Ok(result?)
    }

    // ── Queries and monitors ─────────────────────────────────────────────

    /// Evaluate `query`. The result set stays on the server until it is
    /// monitored or released.
    pub async fn query(&self, query: Query) -> ClientResult<ResultSet> {
        match self.request(RequestBody::Query { query }).await? {
            ResponseBody::ResultSet { handle, objects } => Ok(ResultSet { handle, objects }),
            other => Err(unexpected("result_set", &other)),
        }
    }

    /// Keep a result set live. Monitoring the same query twice yields two
    /// proxies over the same server-side monitor.
    pub async fn monitor(&self, results: &ResultSet) -> ClientResult<MonitorProxy> {
        match self.request(RequestBody::Monitor { handle: results.handle }).await? {
            ResponseBody::Subscribed {
                subscription,
                state,
                objects,
            } => {
                let rx = self.inner.routes.lock().attach(subscription);
                Ok(MonitorProxy::new(self.clone(), subscription, state, objects, rx))
            }
            other => Err(unexpected("subscribed", &other)),
        }
    }

    /// Stop a subscription. Stopping twice is not an error.
    pub async fn stop(&self, subscription: SubscriptionId) -> ClientResult<()> {
        self.inner.routes.lock().forget(subscription);
        self.expect_ack(RequestBody::Stop { subscription }).await
    }

    /// Drop a result-set handle without monitoring it.
    pub async fn release(&self, results: &ResultSet) -> ClientResult<()> {
        self.expect_ack(RequestBody::Release { handle: results.handle }).await
    }

    // ── Objects ──────────────────────────────────────────────────────────

    pub async fn get(&self, key: ObjectKey) -> ClientResult<Object> {
        self.expect_object(RequestBody::Get { key }).await
    }

    pub async fn children(&self, key: ObjectKey) -> ClientResult<Vec<Object>> {
        match self.request(RequestBody::Children { key }).await? {
            ResponseBody::Objects { objects } => Ok(objects),
            other => Err(unexpected("objects", &other)),
        }
    }

    pub async fn set_attribute(&self, key: ObjectKey, attr: &str, value: Option<AttrValue>) -> ClientResult<Object> {
        self.expect_object(RequestBody::SetAttribute {
            key,
            attr: attr.to_string(),
            value,
        })
        .await
    }

    // ── Mounts ───────────────────────────────────────────────────────────

    /// Attach a mountpoint; returns its root object.
    pub async fn add_mountpoint(&self, mountpoint: Mountpoint) -> ClientResult<Object> {
        self.expect_object(RequestBody::AddMountpoint { mountpoint }).await
    }

    pub async fn remove_mountpoint(&self, mount_path: impl Into<PathBuf>) -> ClientResult<()> {
        self.expect_ack(RequestBody::RemoveMountpoint {
            mount_path: mount_path.into(),
        })
        .await
    }

    pub async fn list_mounts(&self) -> ClientResult<Vec<Mountpoint>> {
        match self.request(RequestBody::ListMounts).await? {
            ResponseBody::Mounts { mounts } => Ok(mounts),
            other => Err(unexpected("mounts", &other)),
        }
    }

    pub async fn stats(&self) -> ClientResult<ServerStats> {
        match self.request(RequestBody::Stats).await? {
            ResponseBody::Stats { stats } => Ok(stats),
            other => Err(unexpected("stats", &other)),
        }
    }

    /// Close the connection. The server stops this session's monitors.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.inner.writer.lock().await.shutdown().await;
        if let Some(task) = self.inner.reader.lock().take() {
            task.abort();
        }
        fail_outstanding(&self.inner);
    }

    async fn expect_ack(&self, body: RequestBody) -> ClientResult<()> {
        match self.request(body).await? {
            ResponseBody::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn expect_object(&self, body: RequestBody) -> ClientResult<Object> {
        match self.request(body).await? {
            ResponseBody::Object { object } => Ok(object),
            other => Err(unexpected("object", &other)),
        }
    }
}

fn unexpected(wanted: &str, got: &ResponseBody) -> ClientError {
    ClientError::Protocol(format!("expected {wanted} response, got {got:?}"))
}

/// Drop every waiting reply and event route so callers see the session end.
fn fail_outstanding(inner: &Inner) {
    inner.pending.lock().clear();
    let mut routes = inner.routes.lock();
    routes.live.clear();
    routes.early.clear();
    routes.stopped.clear();
}

async fn read_frames(inner: Arc<Inner>, reader: OwnedReadHalf) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                log::warn!("session read failed: {e}");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ServerFrame>(&line) {
            Ok(ServerFrame::Response { id, result }) => {
                let reply = inner.pending.lock().remove(&id);
                match reply {
                    Some(reply) => {
                        let _ = reply.send(result);
                    }
                    None => log::debug!("response {id} has no waiting request"),
                }
            }
            Ok(ServerFrame::Notification { subscription, event }) => {
                inner.routes.lock().route(subscription, event);
            }
            Err(e) => log::warn!("ignoring undecodable frame: {e}"),
        }
    }
    log::debug!("session to {} ended", inner.path.display());
    inner.closed.store(true, Ordering::Release);
    fail_outstanding(&inner);
}
