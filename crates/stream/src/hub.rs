// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session fan-out hub.
//!
//! Single producer (the session's parser loop), many consumers. Each
//! subscriber drains a private bounded queue on its own task. A bounded
//! replay ring — capped in messages and bytes, whichever bites first —
//! lets late subscribers catch up by cursor.
//!
//! Backpressure on a full subscriber queue follows the configured
//! policy: `block` stalls the producer and evicts the subscriber past
//! the deadline, `drop_oldest` sheds that subscriber's oldest queued
//! message and coalesces contiguous sheds into one gap marker,
//! `close` disconnects the subscriber outright.

use amux_core::{
    ExecutionSummary, Message, SessionState, SlowConsumerPolicy, StreamConfig, SubscriberId,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;

/// Why a subscriber's stream ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The session reached `terminating` or `ended`.
    SessionClosed,
    /// Evicted for not draining its queue in time.
    SlowConsumer,
    /// The subscriber asked to detach.
    Unsubscribed,
}

amux_core::simple_display! {
    CloseReason {
        SessionClosed => "session_closed",
        SlowConsumer => "slow_consumer",
        Unsubscribed => "unsubscribed",
    }
}

/// One item delivered to a subscriber.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Message(Arc<Message>),
    /// Contiguous seq range this subscriber will never receive
    /// (drop-oldest policy).
    Gap { from: u64, to: u64 },
    /// The requested replay cursor fell off the ring; delivery starts
    /// at `oldest` instead.
    ReplayGap { requested: u64, oldest: u64 },
    /// Session state change, for status frames.
    Status(SessionState),
    /// An execution finished.
    ExecutionComplete(ExecutionSummary),
    /// Terminal sentinel; nothing follows.
    Closed(CloseReason),
}

enum Push {
    Ok,
    Full,
    Gone,
}

struct QueueState {
    items: VecDeque<StreamItem>,
    /// Message items currently queued; control items ride for free.
    messages: usize,
    close_reason: Option<CloseReason>,
}

struct SubQueue {
    capacity: usize,
    state: Mutex<QueueState>,
    /// Signalled on push and on close.
    ready: Notify,
    /// Signalled when a message slot frees up.
    space: Notify,
}

impl SubQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                messages: 0,
                close_reason: None,
            }),
            ready: Notify::new(),
            space: Notify::new(),
        }
    }

    fn push_message(&self, message: Arc<Message>) -> Push {
        let mut state = self.state.lock();
        if state.close_reason.is_some() {
            return Push::Gone;
        }
        if state.messages >= self.capacity {
            return Push::Full;
        }
        state.items.push_back(StreamItem::Message(message));
        state.messages += 1;
        drop(state);
        self.ready.notify_one();
        Push::Ok
    }

    /// Push ignoring capacity. Replay and control items use this.
    fn push_unbounded(&self, item: StreamItem) {
        let mut state = self.state.lock();
        if state.close_reason.is_some() {
            return;
        }
        if matches!(item, StreamItem::Message(_)) {
            state.messages += 1;
        }
        state.items.push_back(item);
        drop(state);
        self.ready.notify_one();
    }

    /// Shed the oldest queued message to make room, folding its seq
    /// into an adjacent gap marker when the shed range is contiguous,
    /// then enqueue `message`.
    fn shed_oldest_and_push(&self, message: Arc<Message>) {
        let mut state = self.state.lock();
        if state.close_reason.is_some() {
            return;
        }

        let victim = state.items.iter().position(|i| matches!(i, StreamItem::Message(_)));
        if let Some(index) = victim {
            let seq = match &state.items[index] {
                StreamItem::Message(m) => m.seq,
                _ => unreachable!("position matched a message"),
            };
            let merged = index > 0
                && match &mut state.items[index - 1] {
                    StreamItem::Gap { to, .. } if *to + 1 == seq => {
                        *to = seq;
                        true
                    }
                    _ => false,
                };
            if merged {
                state.items.remove(index);
            } else {
                state.items[index] = StreamItem::Gap { from: seq, to: seq };
            }
            state.messages -= 1;
        }

        state.items.push_back(StreamItem::Message(message));
        state.messages += 1;
        drop(state);
        self.ready.notify_one();
    }

    fn close(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        if state.close_reason.is_some() {
            return;
        }
        state.close_reason = Some(reason);
        state.items.push_back(StreamItem::Closed(reason));
        drop(state);
        self.ready.notify_one();
        self.space.notify_one();
    }

    fn pop(&self) -> Option<StreamItem> {
        let mut state = self.state.lock();
        let item = state.items.pop_front();
        if matches!(item, Some(StreamItem::Message(_))) {
            state.messages -= 1;
            drop(state);
            self.space.notify_one();
        }
        item
    }

    fn terminal(&self) -> Option<CloseReason> {
        self.state.lock().close_reason
    }
}

/// Consumer handle. Drop it (or read [`StreamItem::Closed`]) to detach.
pub struct Subscription {
    id: SubscriberId,
    queue: Arc<SubQueue>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next item, in publish order. After the queue has drained past
    /// its close, keeps returning the terminal sentinel.
    pub async fn next(&mut self) -> StreamItem {
        loop {
            if let Some(item) = self.queue.pop() {
                return item;
            }
            if let Some(reason) = self.queue.terminal() {
                return StreamItem::Closed(reason);
            }
            self.queue.ready.notified().await;
        }
    }

    /// Non-blocking variant for tests and draining.
    pub fn try_next(&mut self) -> Option<StreamItem> {
        self.queue.pop()
    }
}

struct SubEntry {
    id: SubscriberId,
    queue: Arc<SubQueue>,
}

struct HubInner {
    ring: VecDeque<Arc<Message>>,
    ring_bytes: usize,
    subscribers: Vec<SubEntry>,
    closed: bool,
    last_seq: u64,
}

/// Per-session fan-out with bounded replay.
pub struct Hub {
    config: StreamConfig,
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(HubInner {
                ring: VecDeque::new(),
                ring_bytes: 0,
                subscribers: Vec::new(),
                closed: false,
                last_seq: 0,
            }),
        }
    }

    /// Attach a subscriber. A cursor requests replay of retained
    /// messages with `seq >= cursor`; a cursor older than the ring gets
    /// a [`StreamItem::ReplayGap`] first.
    pub fn subscribe(&self, cursor: Option<u64>) -> Subscription {
        let id = SubscriberId::generate();
        let queue = Arc::new(SubQueue::new(self.config.subscriber_queue));

        let mut inner = self.inner.lock();
        if let Some(cursor) = cursor {
            let oldest = inner.ring.front().map(|m| m.seq);
            match oldest {
                Some(oldest_seq) if cursor < oldest_seq => {
                    queue.push_unbounded(StreamItem::ReplayGap {
                        requested: cursor,
                        oldest: oldest_seq,
                    });
                    for message in &inner.ring {
                        queue.push_unbounded(StreamItem::Message(Arc::clone(message)));
                    }
                }
                Some(_) => {
                    for message in inner.ring.iter().filter(|m| m.seq >= cursor) {
                        queue.push_unbounded(StreamItem::Message(Arc::clone(message)));
                    }
                }
                None if cursor <= inner.last_seq => {
                    queue.push_unbounded(StreamItem::ReplayGap {
                        requested: cursor,
                        oldest: inner.last_seq + 1,
                    });
                }
                None => {}
            }
        }

        if inner.closed {
            queue.close(CloseReason::SessionClosed);
        } else {
            inner.subscribers.push(SubEntry { id, queue: Arc::clone(&queue) });
        }
        Subscription { id, queue }
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        self.remove(id, CloseReason::Unsubscribed);
    }

    /// Fan a parsed message out to every subscriber and retain it for
    /// replay. Called only from the session's parser loop.
    pub async fn publish(&self, message: Message) {
        let message = Arc::new(message);
        let targets = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return;
            }
            inner.last_seq = message.seq;
            inner.ring_bytes += message.approx_bytes();
            inner.ring.push_back(Arc::clone(&message));
            while inner.ring.len() > self.config.replay_buffer_messages
                || inner.ring_bytes > self.config.replay_buffer_bytes
            {
                match inner.ring.pop_front() {
                    Some(evicted) => inner.ring_bytes -= evicted.approx_bytes(),
                    None => break,
                }
            }
            inner
                .subscribers
                .iter()
                .map(|s| (s.id, Arc::clone(&s.queue)))
                .collect::<Vec<_>>()
        };

        for (id, queue) in targets {
            match queue.push_message(Arc::clone(&message)) {
                Push::Ok | Push::Gone => continue,
                Push::Full => self.handle_full(id, &queue, &message).await,
            }
        }
    }

    async fn handle_full(&self, id: SubscriberId, queue: &Arc<SubQueue>, message: &Arc<Message>) {
        match self.config.slow_consumer_policy {
            SlowConsumerPolicy::Block => {
                let deadline =
                    tokio::time::Instant::now() + self.config.slow_consumer_deadline;
                loop {
                    let waited =
                        tokio::time::timeout_at(deadline, queue.space.notified()).await;
                    if waited.is_err() {
                        tracing::warn!(subscriber = %id, "evicting slow subscriber");
                        self.remove(id, CloseReason::SlowConsumer);
                        return;
                    }
                    match queue.push_message(Arc::clone(message)) {
                        Push::Ok | Push::Gone => return,
                        Push::Full => continue,
                    }
                }
            }
            SlowConsumerPolicy::DropOldest => queue.shed_oldest_and_push(Arc::clone(message)),
            SlowConsumerPolicy::Close => self.remove(id, CloseReason::SlowConsumer),
        }
    }

    /// Broadcast a session state change.
    pub fn publish_status(&self, state: SessionState) {
        self.broadcast(StreamItem::Status(state));
    }

    /// Broadcast an execution's terminal summary.
    pub fn publish_complete(&self, summary: ExecutionSummary) {
        self.broadcast(StreamItem::ExecutionComplete(summary));
    }

    fn broadcast(&self, item: StreamItem) {
        let inner = self.inner.lock();
        if inner.closed {
            return;
        }
        for entry in &inner.subscribers {
            entry.queue.push_unbounded(item.clone());
        }
    }

    /// Emit the terminal sentinel to every subscriber and refuse
    /// further publishes. Idempotent.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for entry in inner.subscribers.drain(..) {
            entry.queue.close(CloseReason::SessionClosed);
        }
    }

    fn remove(&self, id: SubscriberId, reason: CloseReason) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.subscribers.iter().position(|s| s.id == id) {
            let entry = inner.subscribers.remove(index);
            entry.queue.close(reason);
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }

    /// Bytes currently retained in the replay ring; feeds the pool's
    /// aggregate memory cap.
    pub fn retained_bytes(&self) -> usize {
        self.inner.lock().ring_bytes
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }
}

#[cfg(test)]
#[path = "hub_tests.rs"]
mod tests;
