//! Unified publish/subscribe bus for runtime lifecycle events (§6).
//!
//! Grounded on the teacher's broadcast-channel + observer-list pattern: a
//! bounded `tokio::sync::broadcast` channel for passive subscribers (tests,
//! a future UI) plus a registered-observer list for callers that want
//! guaranteed delivery semantics (retry/log on failure) rather than
//! best-effort broadcast.

use crate::events::{Envelope, PublishedEvent};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::broadcast;
use tokio::task;
use tokio::task::JoinSet;

const EVENT_BUS_BUFFER: usize = 1024;

pub type ObserverToken = u64;

#[async_trait]
pub trait EventObserver: Send + Sync {
    async fn on_event(&self, event: &Envelope) -> anyhow::Result<()>;
}

type ObserverList = Vec<(ObserverToken, Arc<dyn EventObserver>)>;

pub struct EventBus {
    sender: broadcast::Sender<Envelope>,
    observers: Arc<Mutex<ObserverList>>,
    sequence: AtomicU64,
    observer_sequence: AtomicU64,
    observer_tasks: Arc<TokioMutex<JoinSet<()>>>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_BUS_BUFFER);
        Self {
            sender,
            observers: Arc::new(Mutex::new(Vec::new())),
            sequence: AtomicU64::new(1),
            observer_sequence: AtomicU64::new(1),
            observer_tasks: Arc::new(TokioMutex::new(JoinSet::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.sender.subscribe()
    }

    pub fn add_observer(&self, observer: Arc<dyn EventObserver>) -> ObserverToken {
        let token = self.observer_sequence.fetch_add(1, Ordering::Relaxed);
        self.observers.lock().push((token, observer));
        token
    }

    pub fn remove_observer(&self, token: ObserverToken) -> bool {
        let mut observers = self.observers.lock();
        let before = observers.len();
        observers.retain(|(observer_token, _)| *observer_token != token);
        before != observers.len()
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().len()
    }

    /// Publish an event to all subscribers and observers (§6's topic list;
    /// the topic itself is derived from the event via [`PublishedEvent::topic`]).
    pub fn publish(&self, event: PublishedEvent) {
        let envelope = Envelope {
            seq: self.sequence.fetch_add(1, Ordering::Relaxed),
            timestamp: unix_timestamp_now(),
            event,
        };
        self.dispatch(envelope);
    }

    pub async fn shutdown(&self) {
        tracing::debug!("event bus shutting down, aborting observer tasks");
        let mut tasks = self.observer_tasks.lock().await;
        tasks.shutdown().await;
    }

    fn dispatch(&self, envelope: Envelope) {
        let _ = self.sender.send(envelope.clone());

        let observers = self
            .observers
            .lock()
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect::<Vec<_>>();

        let tasks = self.observer_tasks.clone();
        task::spawn(async move {
            let mut tasks_guard = tasks.lock().await;
            for observer in observers {
                let envelope = envelope.clone();
                tasks_guard.spawn(async move {
                    if let Err(err) = observer.on_event(&envelope).await {
                        tracing::error!(seq = envelope.seq, error = %err, "event observer failed");
                    }
                });
            }
        });
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Wall-clock seconds since epoch. Kept as a single indirection point since
/// most of this crate avoids `SystemTime::now()` in favor of injected clocks
/// for testability; the event bus is the one place true wall time is fine.
fn unix_timestamp_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
