//! Stack-trace collaborator.
//!
//! Track records hold an opaque [`StackHandle`]. Frames are only materialized
//! when a report expands them. The bundled [`StackDepot`] deduplicates
//! identical traces by their BLAKE3 digest, so repeated allocation sites cost
//! one entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

/// Maximum number of distinct traces a depot retains.
const DEPOT_MAX_ENTRIES: usize = 16_384;

/// Maximum frames kept per trace.
const MAX_FRAMES: usize = 64;

/// Opaque identifier of a stored trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StackHandle(pub u64);

/// One symbolized frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Frame {
    pub symbol: String,
    pub location: Option<String>,
}

impl Frame {
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            location: None,
        }
    }

    #[must_use]
    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "{} ({loc})", self.symbol),
            None => f.write_str(&self.symbol),
        }
    }
}

/// Capture and expansion service for stack traces.
pub trait StackTraceProvider: Send + Sync {
    /// Capture the calling thread's stack, dropping the innermost `skip` frames.
    fn capture(&self, skip: usize) -> Option<StackHandle>;

    /// Expand a handle into its frames. `None` if the trace is gone or unknown.
    fn expand(&self, handle: StackHandle) -> Option<Vec<Frame>>;
}

/// Provider that never has a stack. Reports fall back to placeholders.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoStacks;

impl StackTraceProvider for NoStacks {
    fn capture(&self, _skip: usize) -> Option<StackHandle> {
        None
    }

    fn expand(&self, _handle: StackHandle) -> Option<Vec<Frame>> {
        None
    }
}

/// Content-addressed trace store.
pub struct StackDepot {
    traces: RwLock<HashMap<StackHandle, Arc<[Frame]>>>,
}

impl StackDepot {
    #[must_use]
    pub fn new() -> Self {
        Self {
            traces: RwLock::new(HashMap::new()),
        }
    }

    /// Store `frames` and return their handle.
    ///
    /// Returns `None` for an empty trace or when the depot is full.
    pub fn save(&self, frames: &[Frame]) -> Option<StackHandle> {
        if frames.is_empty() {
            return None;
        }
        let frames = &frames[..frames.len().min(MAX_FRAMES)];
        let handle = digest(frames);

        if self.traces.read().contains_key(&handle) {
            return Some(handle);
        }
        let mut traces = self.traces.write();
        if traces.len() >= DEPOT_MAX_ENTRIES && !traces.contains_key(&handle) {
            return None;
        }
        traces
            .entry(handle)
            .or_insert_with(|| Arc::from(frames.to_vec()));
        Some(handle)
    }

    /// Number of distinct traces stored.
    #[must_use]
    pub fn len(&self) -> usize {
        self.traces.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for StackDepot {
    fn default() -> Self {
        Self::new()
    }
}

impl StackTraceProvider for StackDepot {
    fn capture(&self, skip: usize) -> Option<StackHandle> {
        let rendered = std::backtrace::Backtrace::force_capture().to_string();
        let frames: Vec<Frame> = parse_backtrace(&rendered)
            .into_iter()
            .skip(skip)
            .collect();
        self.save(&frames)
    }

    fn expand(&self, handle: StackHandle) -> Option<Vec<Frame>> {
        self.traces.read().get(&handle).map(|frames| frames.to_vec())
    }
}

fn digest(frames: &[Frame]) -> StackHandle {
    let mut hasher = blake3::Hasher::new();
    for frame in frames {
        hasher.update(frame.symbol.as_bytes());
        hasher.update(&[0]);
        if let Some(loc) = &frame.location {
            hasher.update(loc.as_bytes());
        }
        hasher.update(&[b'\n']);
    }
    let bytes = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&bytes.as_bytes()[..8]);
    StackHandle(u64::from_le_bytes(head))
}

/// Parse the `Display` form of `std::backtrace::Backtrace`.
///
/// Frame lines look like `  3: symbol::path` and may be followed by an
/// `at file:line:col` line. Anything else is ignored.
fn parse_backtrace(rendered: &str) -> Vec<Frame> {
    let mut frames: Vec<Frame> = Vec::new();
    for line in rendered.lines().map(str::trim) {
        if let Some(loc) = line.strip_prefix("at ") {
            if let Some(last) = frames.last_mut() {
                last.location = Some(loc.to_string());
            }
            continue;
        }
        let Some((index, symbol)) = line.split_once(": ") else {
            continue;
        };
        if !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()) {
            frames.push(Frame::new(symbol));
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(names: &[&str]) -> Vec<Frame> {
        names.iter().map(|n| Frame::new(*n)).collect()
    }

    #[test]
    fn identical_traces_share_a_handle() {
        let depot = StackDepot::new();
        let a = depot.save(&trace(&["kmalloc", "alloc_thing"])).unwrap();
        let b = depot.save(&trace(&["kmalloc", "alloc_thing"])).unwrap();
        let c = depot.save(&trace(&["kfree", "drop_thing"])).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(depot.len(), 2);
    }

    #[test]
    fn expand_returns_saved_frames() {
        let depot = StackDepot::new();
        let frames = vec![Frame::new("alloc").at("src/a.rs:10:5"), Frame::new("main")];
        let handle = depot.save(&frames).unwrap();
        assert_eq!(depot.expand(handle), Some(frames));
        assert_eq!(depot.expand(StackHandle(0xDEAD)), None);
    }

    #[test]
    fn empty_trace_has_no_handle() {
        let depot = StackDepot::new();
        assert_eq!(depot.save(&[]), None);
        assert!(depot.is_empty());
    }

    #[test]
    fn parse_std_backtrace_format() {
        let rendered = "   0: shadowscan_core::stack::capture\n             at ./src/stack.rs:120:9\n   1: main\n";
        let frames = parse_backtrace(rendered);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].symbol, "shadowscan_core::stack::capture");
        assert_eq!(frames[0].location.as_deref(), Some("./src/stack.rs:120:9"));
        assert_eq!(frames[1].location, None);
    }

    #[test]
    fn no_stacks_provider_is_empty() {
        assert_eq!(NoStacks.capture(0), None);
        assert_eq!(NoStacks.expand(StackHandle(1)), None);
    }
}
