//! Executing-context identity.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: ContextId = ContextId::for_current_thread();
}

/// Identity of the thread that allocated, freed, or faulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ContextId {
    pub name: String,
    pub id: u64,
}

impl ContextId {
    #[must_use]
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }

    /// Identity of the calling thread. Stable for the thread's lifetime.
    #[must_use]
    pub fn current() -> Self {
        CURRENT.with(Clone::clone)
    }

    fn for_current_thread() -> Self {
        let thread = std::thread::current();
        let name = thread.name().unwrap_or("<unnamed>");
        Self::new(name, NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.name, self.id)
    }
}
