//! One client session.
//!
//! A connection reads newline-delimited [`Request`]s, answers each through
//! the shared [`IndexHandle`], and writes [`ServerFrame`]s through an
//! [`OutboundQueue`] drained by a dedicated writer task. Monitor events
//! arrive on the connection's event sink and are queued as notifications
//! without waiting for the client.
//!
//! Result sets returned by `query` are held under per-connection handles
//! until the client monitors or releases them. When the connection ends,
//! for any reason, every monitor the client holds is stopped.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use trove_kernel::IndexHandle;
use trove_types::{
    ClientId, FaultKind, Query, RemoteError, Request, RequestBody, ResponseBody, ResultSetId,
    ServerFrame, ServerStats,
};

use crate::constants::MAX_REQUEST_LINE;
use crate::outbound::OutboundQueue;

/// State shared by every connection of one server.
#[derive(Debug)]
pub struct Shared {
    pub index: IndexHandle,
    pub event_queue_depth: usize,
    /// Live clients and the number of result sets each holds.
    sessions: DashMap<ClientId, usize>,
    next_client: AtomicU64,
}

impl Shared {
    pub fn new(index: IndexHandle, event_queue_depth: usize) -> Self {
        Self {
            index,
            event_queue_depth,
            sessions: DashMap::new(),
            next_client: AtomicU64::new(1),
        }
    }

    fn register(&self) -> ClientId {
        let client = ClientId::new(self.next_client.fetch_add(1, Ordering::Relaxed));
        self.sessions.insert(client, 0);
        client
    }

    fn unregister(&self, client: ClientId) {
        self.sessions.remove(&client);
    }

    fn set_result_sets(&self, client: ClientId, count: usize) {
        if let Some(mut entry) = self.sessions.get_mut(&client) {
            *entry = count;
        }
    }

    /// Index counters with the session-level ones filled in.
    pub async fn stats(&self) -> Result<ServerStats, RemoteError> {
        let mut stats = self.index.stats().await?;
        stats.clients = self.sessions.len() as u64;
        stats.result_sets = self.sessions.iter().map(|e| *e.value() as u64).sum();
        Ok(stats)
    }
}

/// Serve one accepted stream until the client hangs up.
pub async fn serve(shared: Arc<Shared>, stream: UnixStream) -> anyhow::Result<()> {
    let client = shared.register();
    tracing::debug!(client = %client, "client connected");

    let (reader, writer) = stream.into_split();
    let outbound = Arc::new(OutboundQueue::new(shared.event_queue_depth));
    let writer_task = tokio::spawn(write_frames(Arc::clone(&outbound), writer));

    let (sink, mut events) = mpsc::unbounded_channel();
    let forwarder = {
        let outbound = Arc::clone(&outbound);
        tokio::spawn(async move {
            while let Some((subscription, event)) = events.recv().await {
                outbound.push_event(subscription, event);
            }
        })
    };

    let mut session = Session {
        client,
        shared: Arc::clone(&shared),
        sink,
        result_sets: HashMap::new(),
        next_handle: 0,
    };
    let result = session.read_requests(reader, &outbound).await;

    // Stop monitors before the sink closes so no event is left half-routed.
    match shared.index.release_client(client).await {
        Ok(stopped) if stopped > 0 => tracing::debug!(client = %client, stopped, "released monitors"),
        Ok(_) => {}
        Err(e) => tracing::warn!(client = %client, error = %e, "could not release monitors"),
    }
    shared.unregister(client);
    drop(session);
    forwarder.abort();
    outbound.close();
    let _ = writer_task.await;
    tracing::debug!(client = %client, "client disconnected");
    result
}

async fn write_frames(outbound: Arc<OutboundQueue>, mut writer: OwnedWriteHalf) {
    while let Some(frame) = outbound.pop().await {
        let mut line = match serde_json::to_vec(&frame) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "unencodable frame dropped");
                continue;
            }
        };
        line.push(b'\n');
        if let Err(e) = writer.write_all(&line).await {
            tracing::debug!(error = %e, "client write failed");
            outbound.close();
            return;
        }
    }
    let _ = writer.shutdown().await;
}

struct Session {
    client: ClientId,
    shared: Arc<Shared>,
    sink: trove_kernel::EventSink,
    result_sets: HashMap<ResultSetId, Query>,
    next_handle: u64,
}

impl Session {
    async fn read_requests(
        &mut self,
        reader: tokio::net::unix::OwnedReadHalf,
        outbound: &OutboundQueue,
    ) -> anyhow::Result<()> {
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        loop {
            line.clear();
            let read = (&mut reader)
                .take(MAX_REQUEST_LINE as u64 + 1)
                .read_line(&mut line)
                .await?;
            if read == 0 {
                return Ok(());
            }
            if line.len() > MAX_REQUEST_LINE && !line.ends_with('\n') {
                anyhow::bail!("request line longer than {MAX_REQUEST_LINE} bytes");
            }
            let text = line.trim();
            if text.is_empty() {
                continue;
            }
            let (id, result) = match parse_request(text) {
                Ok(request) => {
                    let op = request.body.op_name();
                    let result = self.dispatch(request.body).await;
                    if let Err(e) = &result {
                        tracing::debug!(client = %self.client, op, error = %e, "request failed");
                    }
                    (request.id, result)
                }
                Err((id, e)) => (id, Err(e)),
            };
            outbound.push(ServerFrame::Response { id, result });
        }
    }

    async fn dispatch(&mut self, body: RequestBody) -> Result<ResponseBody, RemoteError> {
        let index = &self.shared.index;
        let response = match body {
            RequestBody::Query { query } => {
                let objects = index.query(query.clone()).await?;
                self.next_handle += 1;
                let handle = ResultSetId::new(self.next_handle);
                self.result_sets.insert(handle, query);
                self.shared.set_result_sets(self.client, self.result_sets.len());
                ResponseBody::ResultSet { handle, objects }
            }
            RequestBody::Monitor { handle } => {
                let Some(query) = self.result_sets.get(&handle).cloned() else {
                    return Err(RemoteError::new(FaultKind::NotFound, format!("result set {handle}")));
                };
                let sub = index.monitor(self.client, query, self.sink.clone()).await?;
                ResponseBody::Subscribed {
                    subscription: sub.id,
                    state: sub.state,
                    objects: sub.objects,
                }
            }
            RequestBody::Stop { subscription } => {
                index.stop_monitor(self.client, subscription).await?;
                ResponseBody::Ack
            }
            RequestBody::Release { handle } => {
                self.result_sets.remove(&handle);
                self.shared.set_result_sets(self.client, self.result_sets.len());
                ResponseBody::Ack
            }
            RequestBody::Get { key } => ResponseBody::Object {
                object: index.get(key).await?,
            },
            RequestBody::Children { key } => ResponseBody::Objects {
                objects: index.children(key).await?,
            },
            RequestBody::SetAttribute { key, attr, value } => ResponseBody::Object {
                object: index.set_attribute(key, &attr, value).await?,
            },
            RequestBody::AddMountpoint { mountpoint } => ResponseBody::Object {
                object: index.add_mountpoint(mountpoint).await?,
            },
            RequestBody::RemoveMountpoint { mount_path } => {
                index.remove_mountpoint(mount_path).await?;
                ResponseBody::Ack
            }
            RequestBody::ListMounts => ResponseBody::Mounts {
                mounts: index.list_mounts().await?,
            },
            RequestBody::Stats => ResponseBody::Stats {
                stats: self.shared.stats().await?,
            },
        };
        Ok(response)
    }
}

/// Decode a request line. On failure, the id is recovered when the line is
/// at least a JSON object with a numeric `id`, so the client can match the
/// error to its request.
fn parse_request(text: &str) -> Result<Request, (u64, RemoteError)> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| (0, RemoteError::new(FaultKind::InvalidRequest, format!("malformed JSON: {e}"))))?;
    let id = value.get("id").and_then(serde_json::Value::as_u64).unwrap_or(0);
    serde_json::from_value(value)
        .map_err(|e| (id, RemoteError::new(FaultKind::InvalidRequest, format!("unknown request: {e}"))))
}
