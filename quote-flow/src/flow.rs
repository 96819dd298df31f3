//! Flow tracking: which wizard variant the browsing session is enrolled in.
//!
//! The active flow is a single scalar held in session-scoped storage. The
//! storage medium can be broken (privacy mode), so [`FlowSession`] degrades
//! every failure to "no flow chosen" rather than propagating an error.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::warn;

/// One of the mutually exclusive wizard variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flow {
    Classic,
    Modern,
}

impl fmt::Display for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flow::Classic => write!(f, "classic"),
            Flow::Modern => write!(f, "modern"),
        }
    }
}

impl FromStr for Flow {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "classic" => Ok(Flow::Classic),
            "modern" => Ok(Flow::Modern),
            other => Err(format!("unknown flow: {other}")),
        }
    }
}

/// Raised by a [`FlowStore`] whose backing medium is unavailable.
#[derive(Debug, Clone)]
pub struct StoreUnavailable;

/// Session-scoped key-value storage for the active-flow scalar.
///
/// Implementations are synchronous; the scalar is tiny and confined to the
/// session. A failing store is a supported state, not a bug.
pub trait FlowStore: Send + Sync {
    fn load(&self) -> Result<Option<Flow>, StoreUnavailable>;
    fn store(&self, flow: Flow) -> Result<(), StoreUnavailable>;
    fn clear(&self) -> Result<(), StoreUnavailable>;
}

/// In-memory store standing in for browser session storage.
#[derive(Default)]
pub struct MemoryFlowStore {
    flow: Mutex<Option<Flow>>,
}

impl MemoryFlowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FlowStore for MemoryFlowStore {
    fn load(&self) -> Result<Option<Flow>, StoreUnavailable> {
        Ok(*self.flow.lock().unwrap())
    }

    fn store(&self, flow: Flow) -> Result<(), StoreUnavailable> {
        *self.flow.lock().unwrap() = Some(flow);
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreUnavailable> {
        *self.flow.lock().unwrap() = None;
        Ok(())
    }
}

/// The injectable session context handed down through the step tree.
///
/// Wraps a [`FlowStore`] and absorbs its failures: a broken store behaves
/// exactly like "no flow chosen", so the guard and entry screens need no
/// special casing.
#[derive(Clone)]
pub struct FlowSession {
    store: Arc<dyn FlowStore>,
}

impl FlowSession {
    pub fn new(store: Arc<dyn FlowStore>) -> Self {
        Self { store }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryFlowStore::new()))
    }

    pub fn set_active_flow(&self, flow: Flow) {
        if self.store.store(flow).is_err() {
            warn!(%flow, "flow store unavailable, set dropped");
        }
    }

    pub fn active_flow(&self) -> Option<Flow> {
        match self.store.load() {
            Ok(flow) => flow,
            Err(StoreUnavailable) => {
                warn!("flow store unavailable, reading as no active flow");
                None
            }
        }
    }

    pub fn clear_active_flow(&self) {
        if self.store.clear().is_err() {
            warn!("flow store unavailable, clear dropped");
        }
    }

    pub fn is_flow_active(&self, flow: Flow) -> bool {
        self.active_flow() == Some(flow)
    }
}
