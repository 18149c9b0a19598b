//! Asynchronous event bus used to broadcast subnet, pool and network
//! lifecycle events to collaborating services (router agents, DHCP agents,
//! policy hooks).
//!
//! BEFORE-phase events carry a veto contract: if any listener fails, the
//! publish as a whole fails and the publisher must abort the guarded
//! operation. AFTER-phase events are published lossily, listener failures
//! are logged only.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use log::warn;
use thiserror::Error;
use tokio::sync::RwLock;
use vnet_shared_types::IpamEvent;

/// Result alias for event bus operations
pub type EventBusResult<T> = Result<T, EventBusError>;

/// Contract implemented by listeners interested in [`IpamEvent`]
/// notifications. Returning an error from a BEFORE-phase event vetoes the
/// operation being announced.
#[async_trait]
pub trait EventListener: Send + Sync {
    async fn on_event(&self, event: &IpamEvent) -> anyhow::Result<()>;
}

/// Shared event bus that multiplexes published [`IpamEvent`] values to
/// registered listeners.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<HashMap<String, Arc<dyn EventListener>>>>,
}

impl EventBus {
    /// Create a new bus instance without any registered listeners.
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a listener under the given name. Listener names must be
    /// unique so that they can be replaced or removed later on.
    pub async fn register_listener<L>(
        &self,
        name: impl Into<String>,
        listener: L,
    ) -> EventBusResult<()>
    where
        L: EventListener + 'static,
    {
        let name = name.into();
        let mut guard = self.listeners.write().await;
        if guard.contains_key(&name) {
            return Err(EventBusError::ListenerExists(name));
        }

        guard.insert(name, Arc::new(listener));
        Ok(())
    }

    /// Remove a listener by name.
    pub async fn unregister_listener(&self, name: &str) -> EventBusResult<()> {
        let mut guard = self.listeners.write().await;
        guard
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| EventBusError::ListenerNotFound(name.to_string()))
    }

    /// Publish a guarded BEFORE-phase event. Every listener runs; if any of
    /// them fails, the failures are collected into a single
    /// [`EventBusError::Vetoed`] and the publisher must treat the guarded
    /// operation as rejected.
    pub async fn publish_guarded(&self, event: IpamEvent) -> EventBusResult<()> {
        let mut failures = Vec::new();
        for (name, listener) in self.snapshot().await {
            if let Err(err) = listener.on_event(&event).await {
                failures.push(ListenerFailure {
                    listener: name,
                    error: err.to_string(),
                });
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EventBusError::Vetoed(ListenerFailureReport(failures)))
        }
    }

    /// Publish an AFTER-phase event. Listener failures are logged and
    /// otherwise ignored: the announced operation has already committed.
    pub async fn publish(&self, event: IpamEvent) {
        for (name, listener) in self.snapshot().await {
            if let Err(err) = listener.on_event(&event).await {
                warn!("event listener '{}' failed: {}", name, err);
            }
        }
    }

    async fn snapshot(&self) -> Vec<(String, Arc<dyn EventListener>)> {
        let guard = self.listeners.read().await;
        guard
            .iter()
            .map(|(name, listener)| (name.clone(), Arc::clone(listener)))
            .collect()
    }
}

/// Error type returned by event bus operations.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("listener '{0}' already registered")]
    ListenerExists(String),
    #[error("listener '{0}' not found")]
    ListenerNotFound(String),
    #[error("operation vetoed by listener: {0}")]
    Vetoed(ListenerFailureReport),
}

impl EventBusError {
    pub fn vetoes(&self) -> Option<&[ListenerFailure]> {
        match self {
            EventBusError::Vetoed(report) => Some(&report.0),
            _ => None,
        }
    }
}

/// A single listener rejection.
#[derive(Debug, Clone)]
pub struct ListenerFailure {
    pub listener: String,
    pub error: String,
}

impl std::fmt::Display for ListenerFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.listener, self.error)
    }
}

/// Wrapper used to present multiple rejections as a single error payload.
#[derive(Debug, Clone)]
pub struct ListenerFailureReport(pub Vec<ListenerFailure>);

impl std::fmt::Display for ListenerFailureReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut first = true;
        for failure in &self.0 {
            if !first {
                write!(f, "; ")?;
            }
            first = false;
            write!(f, "{}", failure)?;
        }
        Ok(())
    }
}
