//! Per-connection outbound frame queue.
//!
//! Responses and monitor notifications for one connection go through a
//! single FIFO so the writer task emits them in order. When the client reads
//! slowly and the queue reaches its depth, a new `Progress` for a
//! subscription whose latest queued frame is also a `Progress` replaces that
//! frame in place instead of growing the queue. Only intermediate counts are
//! lost: the replacement carries the newest count, and `Changed`/`UpToDate`
//! frames are never merged or dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use trove_types::{MonitorEvent, ServerFrame, SubscriptionId};

#[derive(Debug, Default)]
struct QueueState {
    frames: VecDeque<ServerFrame>,
    closed: bool,
    coalesced: u64,
}

/// Ordered frame buffer between a connection's producers and its writer.
#[derive(Debug)]
pub struct OutboundQueue {
    depth: usize,
    state: Mutex<QueueState>,
    ready: Notify,
}

impl OutboundQueue {
    /// A queue that starts coalescing progress once `depth` frames are waiting.
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            state: Mutex::new(QueueState::default()),
            ready: Notify::new(),
        }
    }

    /// Queue any frame. Frames pushed after `close` are discarded.
    pub fn push(&self, frame: ServerFrame) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            if let ServerFrame::Notification {
                subscription,
                event: event @ MonitorEvent::Progress { .. },
            } = &frame
                && state.frames.len() >= self.depth
                && let Some(slot) = latest_progress(&mut state.frames, *subscription)
            {
                *slot = event.clone();
                state.coalesced += 1;
                return;
            }
            state.frames.push_back(frame);
        }
        self.ready.notify_one();
    }

    /// Queue a monitor event for `subscription`.
    pub fn push_event(&self, subscription: SubscriptionId, event: MonitorEvent) {
        self.push(ServerFrame::Notification { subscription, event });
    }

    /// Next frame to write. Waits while the queue is empty; `None` once the
    /// queue is closed and drained.
    pub async fn pop(&self) -> Option<ServerFrame> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(frame) = state.frames.pop_front() {
                    return Some(frame);
                }
                if state.closed {
                    return None;
                }
            }
            self.ready.notified().await;
        }
    }

    /// Stop accepting frames. Already queued frames are still handed out.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.ready.notify_one();
    }

    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Progress frames merged into an earlier one so far.
    pub fn coalesced(&self) -> u64 {
        self.state.lock().coalesced
    }
}

/// The queued event of `subscription`'s most recent frame, if that frame is a
/// `Progress`.
fn latest_progress(frames: &mut VecDeque<ServerFrame>, subscription: SubscriptionId) -> Option<&mut MonitorEvent> {
    let last = frames.iter_mut().rev().find_map(|frame| match frame {
        ServerFrame::Notification { subscription: s, event } if *s == subscription => Some(event),
        _ => None,
    })?;
    last.is_progress().then_some(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trove_types::{ObjectKey, ResponseBody};

    fn sub(n: u64) -> SubscriptionId {
        SubscriptionId::new(n)
    }

    fn progress(done: u64, total: u64) -> MonitorEvent {
        MonitorEvent::Progress { done, total }
    }

    fn drain(queue: &OutboundQueue) -> Vec<ServerFrame> {
        let mut frames = Vec::new();
        let mut state = queue.state.lock();
        while let Some(f) = state.frames.pop_front() {
            frames.push(f);
        }
        frames
    }

    #[test]
    fn below_depth_nothing_is_merged() {
        let queue = OutboundQueue::new(8);
        for done in 1..=3 {
            queue.push_event(sub(1), progress(done, 3));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.coalesced(), 0);
    }

    #[test]
    fn slow_reader_keeps_only_latest_progress() {
        let queue = OutboundQueue::new(1);
        for done in 1..=5 {
            queue.push_event(sub(1), progress(done, 5));
        }
        queue.push_event(
            sub(1),
            MonitorEvent::Changed {
                added: vec![],
                removed: vec![],
                updated: vec![ObjectKey::new("audio", 1)],
            },
        );
        queue.push_event(sub(1), MonitorEvent::UpToDate);

        let events: Vec<MonitorEvent> = drain(&queue)
            .into_iter()
            .map(|f| match f {
                ServerFrame::Notification { event, .. } => event,
                other => panic!("unexpected frame {other:?}"),
            })
            .collect();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], progress(5, 5));
        assert_eq!(events[1].name(), "changed");
        assert_eq!(events[2], MonitorEvent::UpToDate);
        assert_eq!(queue.coalesced(), 4);
    }

    #[test]
    fn progress_after_terminal_event_is_not_merged_backwards() {
        let queue = OutboundQueue::new(1);
        queue.push_event(sub(1), progress(1, 1));
        queue.push_event(sub(1), MonitorEvent::UpToDate);
        queue.push_event(sub(1), progress(1, 2));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn subscriptions_coalesce_independently() {
        let queue = OutboundQueue::new(1);
        queue.push_event(sub(1), progress(1, 4));
        queue.push_event(sub(2), progress(1, 2));
        queue.push_event(sub(1), progress(2, 4));
        queue.push_event(sub(2), progress(2, 2));
        let frames = drain(&queue);
        assert_eq!(
            frames,
            vec![
                ServerFrame::Notification { subscription: sub(1), event: progress(2, 4) },
                ServerFrame::Notification { subscription: sub(2), event: progress(2, 2) },
            ]
        );
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let queue = OutboundQueue::new(4);
        queue.push(ServerFrame::Response { id: 1, result: Ok(ResponseBody::Ack) });
        queue.close();
        queue.push(ServerFrame::Response { id: 2, result: Ok(ResponseBody::Ack) });

        assert!(matches!(queue.pop().await, Some(ServerFrame::Response { id: 1, .. })));
        assert_eq!(queue.pop().await, None);
    }

    #[tokio::test]
    async fn pop_wakes_on_push() {
        let queue = std::sync::Arc::new(OutboundQueue::new(4));
        let reader = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push_event(sub(3), MonitorEvent::UpToDate);
        let frame = reader.await.unwrap();
        assert_eq!(
            frame,
            Some(ServerFrame::Notification { subscription: sub(3), event: MonitorEvent::UpToDate })
        );
    }
}
