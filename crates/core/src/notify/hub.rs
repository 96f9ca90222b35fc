//! Topic-based publish/subscribe keyed by job id.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

use super::JobEvent;

/// Identifies one connected listener.
pub type ListenerId = u64;

/// Receiving side of a hub connection.
///
/// Dropping the listener closes its channel; the hub removes it (and every
/// subscription it holds) on the next delivery attempt or prune.
#[derive(Debug)]
pub struct Listener {
    id: ListenerId,
    rx: mpsc::Receiver<JobEvent>,
}

impl Listener {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next event. Returns None once the hub disconnects us.
    pub async fn recv(&mut self) -> Option<JobEvent> {
        self.rx.recv().await
    }

    /// Take the next event if one is already buffered.
    pub fn try_recv(&mut self) -> Option<JobEvent> {
        self.rx.try_recv().ok()
    }
}

/// Counters describing hub state.
#[derive(Debug, Clone, Default, Serialize)]
pub struct HubStats {
    pub listeners: usize,
    pub subscriptions: usize,
    pub delivered: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct HubInner {
    listeners: HashMap<ListenerId, mpsc::Sender<JobEvent>>,
    subscriptions: HashMap<String, HashSet<ListenerId>>,
}

impl HubInner {
    fn remove_listener(&mut self, id: ListenerId) -> bool {
        let existed = self.listeners.remove(&id).is_some();
        self.subscriptions.retain(|_, subscribers| {
            subscribers.remove(&id);
            !subscribers.is_empty()
        });
        existed
    }
}

/// Notification hub delivering job events to subscribed listeners.
///
/// Every listener owns a bounded channel, so events for one job reach a
/// given listener in publish order. Delivery is best-effort: a full buffer
/// drops the event for that listener only.
pub struct NotificationHub {
    inner: Mutex<HubInner>,
    next_id: AtomicU64,
    buffer: usize,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl NotificationHub {
    /// Create a hub whose listeners buffer up to `buffer` undelivered events.
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            next_id: AtomicU64::new(1),
            buffer: buffer.max(1),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HubInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new listener.
    pub fn connect(&self) -> Listener {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.buffer);
        self.lock().listeners.insert(id, tx);
        debug!("Listener {} connected", id);
        Listener { id, rx }
    }

    /// Remove a listener and all of its subscriptions.
    pub fn disconnect(&self, listener: ListenerId) {
        if self.lock().remove_listener(listener) {
            debug!("Listener {} disconnected", listener);
        }
    }

    /// Subscribe a listener to one job's events.
    ///
    /// Returns false if the listener is not connected.
    pub fn subscribe(&self, job_id: &str, listener: ListenerId) -> bool {
        let mut inner = self.lock();
        if !inner.listeners.contains_key(&listener) {
            return false;
        }
        inner
            .subscriptions
            .entry(job_id.to_string())
            .or_default()
            .insert(listener);
        true
    }

    /// Drop a listener's interest in a job. Returns true if it was subscribed.
    pub fn unsubscribe(&self, job_id: &str, listener: ListenerId) -> bool {
        let mut inner = self.lock();
        let Some(subscribers) = inner.subscriptions.get_mut(job_id) else {
            return false;
        };
        let removed = subscribers.remove(&listener);
        if subscribers.is_empty() {
            inner.subscriptions.remove(job_id);
        }
        removed
    }

    /// Number of listeners subscribed to a job.
    pub fn subscriber_count(&self, job_id: &str) -> usize {
        self.lock()
            .subscriptions
            .get(job_id)
            .map_or(0, HashSet::len)
    }

    /// Number of connected listeners.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Deliver an event to the listeners subscribed to `job_id`.
    ///
    /// Returns the number of listeners the event was queued for.
    pub fn publish(&self, job_id: &str, event: &str, payload: Value) -> usize {
        let envelope = JobEvent::new(event, Some(job_id.to_string()), payload);
        let mut inner = self.lock();
        let targets: Vec<ListenerId> = inner
            .subscriptions
            .get(job_id)
            .map(|subscribers| subscribers.iter().copied().collect())
            .unwrap_or_default();
        self.deliver(&mut inner, &targets, &envelope)
    }

    /// Deliver an event to every connected listener.
    pub fn broadcast(&self, event: &str, payload: Value) -> usize {
        let envelope = JobEvent::new(event, None, payload);
        let mut inner = self.lock();
        let targets: Vec<ListenerId> = inner.listeners.keys().copied().collect();
        self.deliver(&mut inner, &targets, &envelope)
    }

    fn deliver(&self, inner: &mut HubInner, targets: &[ListenerId], envelope: &JobEvent) -> usize {
        let mut delivered = 0;
        let mut closed = Vec::new();

        for id in targets {
            let Some(tx) = inner.listeners.get(id) else {
                continue;
            };
            match tx.try_send(envelope.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "Listener {} buffer full, dropped {} event",
                        id, envelope.event
                    );
                }
                Err(TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            inner.remove_listener(id);
            debug!("Removed closed listener {}", id);
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// Remove listeners whose receiving side has gone away.
    pub fn prune_closed(&self) -> usize {
        let mut inner = self.lock();
        let closed: Vec<ListenerId> = inner
            .listeners
            .iter()
            .filter(|(_, tx)| tx.is_closed())
            .map(|(id, _)| *id)
            .collect();
        for id in &closed {
            inner.remove_listener(*id);
        }
        closed.len()
    }

    pub fn stats(&self) -> HubStats {
        let inner = self.lock();
        HubStats {
            listeners: inner.listeners.len(),
            subscriptions: inner.subscriptions.values().map(HashSet::len).sum(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(256)
    }
}
