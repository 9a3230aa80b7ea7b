//! Lifecycle event stream.
//!
//! Every subscriber owns a bounded queue. Producers never block: when a
//! queue is full, a non-terminal event replaces the resource's latest queued
//! event if that one is non-terminal too, and is dropped otherwise. A
//! terminal event evicts the oldest queued non-terminal event instead. A
//! queue holding only terminal events grows past its bound rather than lose
//! one.

use chrono::{DateTime, Utc};
use drydock_schema::Resource;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Parsed,
    Creating,
    Created,
    CreateFailed,
    Destroying,
    Destroyed,
    DestroyFailed,
    Refreshing,
    Refreshed,
    RefreshFailed,
}

impl EventKind {
    /// Terminal events are never dropped.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            EventKind::Created
                | EventKind::CreateFailed
                | EventKind::Destroyed
                | EventKind::DestroyFailed
                | EventKind::Refreshed
                | EventKind::RefreshFailed
        )
    }

    pub fn is_failure(self) -> bool {
        matches!(
            self,
            EventKind::CreateFailed | EventKind::DestroyFailed | EventKind::RefreshFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Parsed => "parsed",
            EventKind::Creating => "creating",
            EventKind::Created => "created",
            EventKind::CreateFailed => "create_failed",
            EventKind::Destroying => "destroying",
            EventKind::Destroyed => "destroyed",
            EventKind::DestroyFailed => "destroy_failed",
            EventKind::Refreshing => "refreshing",
            EventKind::Refreshed => "refreshed",
            EventKind::RefreshFailed => "refresh_failed",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub event: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(resource: &Resource, event: EventKind, error: Option<String>) -> Self {
        Self {
            id: resource.id().to_string(),
            kind: resource.kind().to_owned(),
            event,
            error,
            timestamp: Utc::now(),
        }
    }
}

struct Queue {
    events: Mutex<VecDeque<Event>>,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicUsize,
    capacity: usize,
}

impl Queue {
    fn push(&self, event: &Event) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            if !event.event.is_terminal() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let latest = events.iter_mut().rev().find(|e| e.id == event.id);
                if let Some(queued) = latest.filter(|e| !e.event.is_terminal()) {
                    queued.clone_from(event);
                    drop(events);
                    self.notify.notify_one();
                }
                return;
            }
            if let Some(pos) = events.iter().position(|e| !e.event.is_terminal()) {
                events.remove(pos);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        events.push_back(event.clone());
        drop(events);
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }
}

struct Inner {
    subscribers: Mutex<Vec<Weak<Queue>>>,
    capacity: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for queue in self.subscribers.get_mut().iter().filter_map(Weak::upgrade) {
            queue.close();
        }
    }
}

/// Fan-out of lifecycle events to any number of subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: Mutex::new(Vec::new()),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> Subscription {
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            dropped: AtomicUsize::new(0),
            capacity: self.inner.capacity,
        });
        self.inner.subscribers.lock().push(Arc::downgrade(&queue));
        Subscription { queue }
    }

    pub fn publish(&self, event: &Event) {
        tracing::trace!("{} {}", event.event, event.id);
        let mut subscribers = self.inner.subscribers.lock();
        subscribers.retain(|weak| match weak.upgrade() {
            Some(queue) => {
                queue.push(event);
                true
            }
            None => false,
        });
    }

    pub fn emit(&self, resource: &Resource, kind: EventKind, error: Option<String>) {
        self.publish(&Event::new(resource, kind, error));
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|w| w.strong_count() > 0)
            .count()
    }
}

/// Receiving end of an [`EventBus`] subscription.
pub struct Subscription {
    queue: Arc<Queue>,
}

impl Subscription {
    /// Next event, or `None` once the bus is gone and the queue drained.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if let Some(event) = self.try_recv() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::SeqCst) {
                return self.try_recv();
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.queue.events.lock().pop_front()
    }

    /// Everything queued right now.
    pub fn drain(&mut self) -> Vec<Event> {
        self.queue.events.lock().drain(..).collect()
    }

    /// Events discarded because this subscriber fell behind.
    pub fn dropped(&self) -> usize {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}
