//! Cache events and the in-process bus that delivers them
//!
//! The cache store publishes invalidation and clear events; the file tracker
//! subscribes and deletes the artifacts those events name. Listeners are run
//! one after another and awaited before `emit` returns. A listener that errors
//! or panics is logged and skipped so the remaining listeners still run.

use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, error};

/// Kind of event, used as the subscription key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "cache:block:invalidated")]
    BlockInvalidated,
    #[serde(rename = "cache:cleared")]
    CacheCleared,
}

impl EventKind {
    /// Wire name of the event
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::BlockInvalidated => "cache:block:invalidated",
            EventKind::CacheCleared => "cache:cleared",
        }
    }
}

/// Event payloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum CacheEvent {
    /// A block's cached record was discarded
    #[serde(rename = "cache:block:invalidated", rename_all = "camelCase")]
    BlockInvalidated {
        block_id: String,
        file_ids: Vec<String>,
    },
    /// Every cached record was discarded
    #[serde(rename = "cache:cleared", rename_all = "camelCase")]
    CacheCleared { file_ids: Vec<String> },
}

impl CacheEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            CacheEvent::BlockInvalidated { .. } => EventKind::BlockInvalidated,
            CacheEvent::CacheCleared { .. } => EventKind::CacheCleared,
        }
    }

    /// File ids carried by the event
    pub fn file_ids(&self) -> &[String] {
        match self {
            CacheEvent::BlockInvalidated { file_ids, .. } => file_ids,
            CacheEvent::CacheCleared { file_ids } => file_ids,
        }
    }
}

/// Subscriber to cache events
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &CacheEvent) -> Result<()>;
}

type ListenerFn = dyn Fn(CacheEvent) -> BoxFuture<'static, Result<()>> + Send + Sync;

/// Adapter turning a closure into an [`EventListener`]
pub struct FnListener {
    callback: Box<ListenerFn>,
}

impl FnListener {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(CacheEvent) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static,
    {
        Self {
            callback: Box::new(callback),
        }
    }
}

#[async_trait]
impl EventListener for FnListener {
    async fn on_event(&self, event: &CacheEvent) -> Result<()> {
        (self.callback)(event.clone()).await
    }
}

/// Handle returned by [`EventBus::on`], needed to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerHandle {
    id: u64,
    kind: EventKind,
}

impl ListenerHandle {
    pub fn kind(&self) -> EventKind {
        self.kind
    }
}

struct Registration {
    handle: ListenerHandle,
    listener: Arc<dyn EventListener>,
}

/// Minimal publish/subscribe bus
#[derive(Default)]
pub struct EventBus {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for one event kind
    pub fn on(&self, kind: EventKind, listener: Arc<dyn EventListener>) -> ListenerHandle {
        let handle = ListenerHandle {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
        };
        self.lock().push(Registration { handle, listener });
        debug!("Registered listener {} for {}", handle.id, kind.as_str());
        handle
    }

    /// Remove a listener; returns false if it was not registered
    pub fn off(&self, handle: &ListenerHandle) -> bool {
        let mut registrations = self.lock();
        let before = registrations.len();
        registrations.retain(|r| r.handle != *handle);
        before != registrations.len()
    }

    /// Number of listeners registered for a kind
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.lock()
            .iter()
            .filter(|r| r.handle.kind == kind)
            .count()
    }

    /// Deliver an event to every listener of its kind, in registration order.
    ///
    /// Returns how many listeners completed successfully.
    pub async fn emit(&self, event: &CacheEvent) -> usize {
        let kind = event.kind();
        let listeners: Vec<Arc<dyn EventListener>> = self
            .lock()
            .iter()
            .filter(|r| r.handle.kind == kind)
            .map(|r| Arc::clone(&r.listener))
            .collect();

        let mut delivered = 0;
        for listener in listeners {
            match AssertUnwindSafe(listener.on_event(event))
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => error!("Error in event listener for {}: {:#}", kind.as_str(), e),
                Err(_) => error!("Event listener for {} panicked", kind.as_str()),
            }
        }
        delivered
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Registration>> {
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
