//! Lifecycle events, out-of-band messages and the spawn capability
//!
//! Listeners run synchronously in registration order. A panicking listener
//! is caught and logged; the remaining listeners still run.

use crate::error::{FailureSource, RuntimeError};
use crate::instance::InstanceId;
use sapi_api::{SpawnOutput, SpawnRequest};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Kinds of lifecycle events listeners subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    RuntimeInitialized,
    RequestStarted,
    RequestEnded,
    RequestError,
    BeforeDestroy,
}

/// Lifecycle event emitted by an engine instance
#[derive(Debug)]
pub enum EngineEvent<'a> {
    /// A module was installed (first initialization or hot swap)
    RuntimeInitialized { instance: InstanceId },

    RequestStarted { instance: InstanceId, uri: &'a str },

    /// Emitted after every execution, whatever its outcome
    RequestEnded { instance: InstanceId },

    RequestError {
        instance: InstanceId,
        error: &'a RuntimeError,
        source: FailureSource,
    },

    BeforeDestroy { instance: InstanceId },
}

impl EngineEvent<'_> {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::RuntimeInitialized { .. } => EventKind::RuntimeInitialized,
            Self::RequestStarted { .. } => EventKind::RequestStarted,
            Self::RequestEnded { .. } => EventKind::RequestEnded,
            Self::RequestError { .. } => EventKind::RequestError,
            Self::BeforeDestroy { .. } => EventKind::BeforeDestroy,
        }
    }

    pub fn instance(&self) -> InstanceId {
        match self {
            Self::RuntimeInitialized { instance }
            | Self::RequestStarted { instance, .. }
            | Self::RequestEnded { instance }
            | Self::RequestError { instance, .. }
            | Self::BeforeDestroy { instance } => *instance,
        }
    }
}

pub type EventListener = Arc<dyn Fn(&EngineEvent<'_>) + Send + Sync>;

/// Handle for removing a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Listener registry keyed by event kind
#[derive(Default)]
pub struct EventBus {
    listeners: RwLock<HashMap<EventKind, Vec<(ListenerId, EventListener)>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: EventKind, listener: EventListener) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(kind).or_default().push((id, listener));
        id
    }

    pub fn remove(&self, kind: EventKind, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(list) = listeners.get_mut(&kind) else {
            return false;
        };
        let before = list.len();
        list.retain(|(listener_id, _)| *listener_id != id);
        list.len() != before
    }

    /// Invoke every listener for the event's kind
    pub fn dispatch(&self, event: &EngineEvent<'_>) {
        // Snapshot so listeners may register or remove listeners themselves
        let snapshot: Vec<EventListener> = {
            let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
            match listeners.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };

        for listener in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!(
                    instance = %event.instance(),
                    kind = ?event.kind(),
                    "Event listener panicked"
                );
            }
        }
    }
}

pub type MessageListener = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// Fan-out for messages pushed by the running program
///
/// Listeners are asked in registration order; the first reply wins.
#[derive(Default)]
pub struct MessageHub {
    listeners: RwLock<Vec<MessageListener>>,
}

impl MessageHub {
    pub fn add(&self, listener: MessageListener) {
        self.listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(listener);
    }

    pub fn dispatch(&self, message: &str) -> Option<String> {
        let snapshot = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in snapshot {
            match catch_unwind(AssertUnwindSafe(|| listener(message))) {
                Ok(Some(reply)) => return Some(reply),
                Ok(None) => {}
                Err(_) => tracing::error!("Message listener panicked"),
            }
        }
        None
    }
}

/// Host-side emulation of subprocesses requested by the program
pub trait SpawnHandler: Send + Sync {
    fn spawn(&self, request: &SpawnRequest) -> SpawnOutput;
}

impl<F> SpawnHandler for F
where
    F: Fn(&SpawnRequest) -> SpawnOutput + Send + Sync,
{
    fn spawn(&self, request: &SpawnRequest) -> SpawnOutput {
        self(request)
    }
}

/// Callbacks an instance hands to its loaded module
///
/// Clones share state, so handlers installed on the instance are seen by
/// whichever module is currently loaded, including after a hot swap.
#[derive(Clone, Default)]
pub struct HostCallbacks {
    messages: Arc<MessageHub>,
    spawn: Arc<RwLock<Option<Arc<dyn SpawnHandler>>>>,
}

impl HostCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_message(&self, listener: MessageListener) {
        self.messages.add(listener);
    }

    pub fn set_spawn_handler(&self, handler: Option<Arc<dyn SpawnHandler>>) {
        *self.spawn.write().unwrap_or_else(|e| e.into_inner()) = handler;
    }

    pub fn post_message(&self, message: &str) -> Option<String> {
        self.messages.dispatch(message)
    }

    pub fn spawn(&self, request: &SpawnRequest) -> SpawnOutput {
        let handler = self
            .spawn
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match handler {
            Some(handler) => handler.spawn(request),
            None => {
                tracing::debug!(command = %request.command, "No spawn handler installed");
                SpawnOutput::unsupported(&request.command)
            }
        }
    }
}
