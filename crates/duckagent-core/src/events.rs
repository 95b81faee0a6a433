//! Run lifecycle events for observers.
//!
//! Emitted over a [`tokio::sync::broadcast`] channel; with no subscribers the
//! events are dropped.

use serde::{Deserialize, Serialize};

use duckagent_types::{NodeStatus, RunStatus};

use crate::backend::BackendKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RunEvent {
    RunStarted {
        run_id: String,
        node_count: usize,
    },
    BackendSelected {
        backend: BackendKind,
    },
    NodeStarted {
        node_id: String,
        step: String,
        attempt: usize,
    },
    NodeCompleted {
        node_id: String,
        status: NodeStatus,
        duration_ms: u64,
    },
    NodeRetrying {
        node_id: String,
        attempt: usize,
        reason: String,
    },
    NodeSkipped {
        node_id: String,
        reason: String,
    },
    NodeSubstituted {
        node_id: String,
        substitute_id: String,
        step: String,
    },
    ValidationWarning {
        node_id: String,
        reason: String,
    },
    BackendDowngraded {
        from: BackendKind,
        to: BackendKind,
        node_id: String,
    },
    RunCompleted {
        run_id: String,
        status: RunStatus,
        duration_ms: u64,
    },
}

#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<RunEvent>,
}

impl EventEmitter {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    pub fn emit(&self, event: RunEvent) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
