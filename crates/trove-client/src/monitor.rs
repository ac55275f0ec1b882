//! Client-side view of a live query.

use tokio::sync::mpsc;
use trove_types::{EventBus, MonitorEvent, MonitorState, ObjectKey, SubscriptionId};

use crate::error::{ClientError, ClientResult};
use crate::session::Session;

/// Mirror of one server-side monitor.
///
/// The proxy tracks the subscription's result set and state by applying each
/// event as it is read with [`MonitorProxy::next_event`]. Events are also
/// published on [`MonitorProxy::bus`] for callback-style consumers.
pub struct MonitorProxy {
    session: Session,
    subscription: SubscriptionId,
    state: MonitorState,
    objects: Vec<ObjectKey>,
    events: mpsc::UnboundedReceiver<MonitorEvent>,
    bus: EventBus<MonitorEvent>,
}

impl std::fmt::Debug for MonitorProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonitorProxy")
            .field("subscription", &self.subscription)
            .field("state", &self.state)
            .field("objects", &self.objects.len())
            .finish()
    }
}

impl MonitorProxy {
    pub(crate) fn new(
        session: Session,
        subscription: SubscriptionId,
        state: MonitorState,
        objects: Vec<ObjectKey>,
        events: mpsc::UnboundedReceiver<MonitorEvent>,
    ) -> Self {
        Self {
            session,
            subscription,
            state,
            objects,
            events,
            bus: EventBus::new(),
        }
    }

    pub fn subscription(&self) -> SubscriptionId {
        self.subscription
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    /// The result set as of the last event read.
    pub fn objects(&self) -> &[ObjectKey] {
        &self.objects
    }

    pub fn bus(&self) -> &EventBus<MonitorEvent> {
        &self.bus
    }

    /// Wait for the next event and apply it. `None` once the subscription
    /// or the session has ended.
    pub async fn next_event(&mut self) -> Option<MonitorEvent> {
        let event = self.events.recv().await?;
        self.apply(&event);
        self.bus.publish(&event);
        Some(event)
    }

    /// Read events through the end of the current scan cycle.
    pub async fn wait_up_to_date(&mut self) -> ClientResult<Vec<MonitorEvent>> {
        let mut seen = Vec::new();
        while let Some(event) = self.next_event().await {
            let done = event == MonitorEvent::UpToDate;
            seen.push(event);
            if done {
                return Ok(seen);
            }
        }
        Err(ClientError::Closed)
    }

    fn apply(&mut self, event: &MonitorEvent) {
        match event {
            MonitorEvent::Progress { .. } => self.state = MonitorState::Scanning,
            MonitorEvent::Changed { added, removed, .. } => {
                self.objects.retain(|k| !removed.contains(k));
                for key in added {
                    if !self.objects.contains(key) {
                        self.objects.push(key.clone());
                    }
                }
            }
            MonitorEvent::UpToDate => self.state = MonitorState::Idle,
        }
    }

    /// Stop the subscription on the server. Further events are not read.
    pub async fn stop(&mut self) -> ClientResult<()> {
        if self.state == MonitorState::Stopped {
            return Ok(());
        }
        self.state = MonitorState::Stopped;
        self.bus.clear();
        self.events.close();
        self.session.stop(self.subscription).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn key(id: i64) -> ObjectKey {
        ObjectKey::new("audio", id)
    }

    #[tokio::test]
    async fn events_update_the_mirror() {
        let (local, _remote) = tokio::net::UnixStream::pair().unwrap();
        let session = Session::from_stream(local, Path::new("pair"));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut proxy = MonitorProxy::new(session, SubscriptionId::new(1), MonitorState::Scanning, vec![key(1), key(2)], rx);

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        proxy.bus().subscribe(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(MonitorEvent::Progress { done: 1, total: 1 }).unwrap();
        tx.send(MonitorEvent::Changed {
            added: vec![key(3), key(2)],
            removed: vec![key(1)],
            updated: vec![],
        })
        .unwrap();
        tx.send(MonitorEvent::UpToDate).unwrap();

        let events = proxy.wait_up_to_date().await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(proxy.objects(), &[key(2), key(3)]);
        assert_eq!(proxy.state(), MonitorState::Idle);
        assert_eq!(seen.load(Ordering::SeqCst), 3);

        drop(tx);
        assert!(matches!(proxy.wait_up_to_date().await, Err(ClientError::Closed)));
    }
}
