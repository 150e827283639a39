//! Abstract capability surface of the VM introspection service.
//!
//! The wire protocol itself is out of scope. Cosecha only depends on the
//! [`VmService`] trait and the small data model here; a production binding
//! implements it on top of a websocket JSON-RPC client, while tests use
//! the scriptable fake in [`crate::mock`].

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;
use std::sync::Arc;

use crate::result::CollectResult;

/// Stream of service events, delivered in arrival order
pub type EventStream<T> = BoxStream<'static, T>;

/// Opaque reference to one isolate inside the observed process
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IsolateRef {
    /// Service-assigned identity, stable for the isolate's lifetime
    pub id: String,
    /// Human-readable name, informational only
    pub name: String,
}

impl IsolateRef {
    /// Create a reference from id and name
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Pause state of an isolate as last reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseState {
    /// Executing normally
    Running,
    /// Paused before running any code
    PauseStart,
    /// Paused at a breakpoint
    PauseBreakpoint,
    /// Paused by an external interrupt
    PauseInterrupted,
    /// Paused on an unhandled exception
    PauseException,
    /// Paused immediately before terminating
    PauseExit,
}

impl PauseState {
    /// True for every suspension state, whatever its cause
    #[must_use]
    pub const fn is_paused(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// True only for the about-to-exit pause
    #[must_use]
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::PauseExit)
    }
}

/// Lifecycle event delivered on an isolate's pause/resume stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateEvent {
    /// The isolate suspended in the given state
    Paused(PauseState),
    /// The isolate resumed execution
    Resumed,
}

/// Opaque reference to a source unit known to the service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRef {
    /// Service-assigned identity used for metadata lookups
    pub id: String,
    /// Source unit URI
    pub uri: String,
}

impl ScriptRef {
    /// Create a reference from id and URI
    pub fn new(id: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            uri: uri.into(),
        }
    }
}

/// Loaded source unit metadata: its URI plus the token position table
/// needed to map instruction tokens back to lines.
#[derive(Debug, Clone)]
pub struct Script {
    /// Source unit URI
    pub uri: String,
    token_lines: HashMap<u32, u32>,
}

impl Script {
    /// Build a script from the service's token position table.
    ///
    /// Each row is `[line, tokenPos, column, tokenPos, column, ...]` with a
    /// 1-based line number, the shape the introspection service reports.
    #[must_use]
    pub fn new(uri: impl Into<String>, token_pos_table: &[Vec<u32>]) -> Self {
        let mut token_lines = HashMap::new();
        for row in token_pos_table {
            let Some((&line, positions)) = row.split_first() else {
                continue;
            };
            for pair in positions.chunks(2) {
                if let Some(&token) = pair.first() {
                    token_lines.insert(token, line.saturating_sub(1));
                }
            }
        }
        Self {
            uri: uri.into(),
            token_lines,
        }
    }

    /// 0-based line containing the given token position, if known
    #[must_use]
    pub fn line_of(&self, token_pos: u32) -> Option<u32> {
        self.token_lines.get(&token_pos).copied()
    }
}

/// Hit and miss token positions for one compiled range
#[derive(Debug, Clone, Default)]
pub struct RangeCoverage {
    /// Token positions that executed at least once
    pub hits: Vec<u32>,
    /// Token positions that were compiled but never executed
    pub misses: Vec<u32>,
}

/// One range of a source report, scoped to a single script
#[derive(Debug, Clone)]
pub struct SourceReportRange {
    /// Index into [`SourceReport::scripts`]
    pub script_index: usize,
    /// Whether the range was compiled; uncompiled ranges carry no coverage
    pub compiled: bool,
    /// Coverage data, present for compiled ranges
    pub coverage: Option<RangeCoverage>,
}

/// Per-isolate coverage snapshot produced on demand by the service
#[derive(Debug, Clone, Default)]
pub struct SourceReport {
    /// Scripts referenced by the ranges, indexed by `script_index`
    pub scripts: Vec<ScriptRef>,
    /// Coverage ranges, in service order
    pub ranges: Vec<SourceReportRange>,
}

/// Live connection to the VM introspection service.
///
/// Every method is a network round-trip and therefore a suspension point.
/// Implementations must be shareable across tasks; the collectors clone an
/// `Arc<dyn VmService>` into event-handling tasks.
#[async_trait]
pub trait VmService: Send + Sync + std::fmt::Debug {
    /// Lightweight liveness probe, used while establishing the connection
    async fn ping(&self) -> CollectResult<()>;

    /// Enumerate the isolates currently known to the service
    async fn list_isolates(&self) -> CollectResult<Vec<IsolateRef>>;

    /// Current pause state, or `None` if the isolate has since terminated
    async fn isolate_state(&self, isolate: &IsolateRef) -> CollectResult<Option<PauseState>>;

    /// Request a coverage source report for one isolate
    async fn source_report(
        &self,
        isolate: &IsolateRef,
        force_compile: bool,
    ) -> CollectResult<SourceReport>;

    /// Resume a paused isolate
    async fn resume(&self, isolate: &IsolateRef) -> CollectResult<()>;

    /// Load full script metadata for a script reference
    async fn load_script(&self, script: &ScriptRef) -> CollectResult<Script>;

    /// Subscribe to isolates starting after this call
    async fn subscribe_isolate_started(&self) -> CollectResult<EventStream<IsolateRef>>;

    /// Subscribe to one isolate's pause/resume events
    async fn subscribe_pause_events(
        &self,
        isolate: &IsolateRef,
    ) -> CollectResult<EventStream<IsolateEvent>>;

    /// Close the connection; the handle must not be used afterwards
    async fn close(&self) -> CollectResult<()>;
}

/// Opens service connections from an already-derived websocket URI.
///
/// This is the seam between the collection engine and the wire client.
#[async_trait]
pub trait VmConnector: Send + Sync {
    /// Open a connection; each call produces an independent handle
    async fn connect(&self, ws_uri: &str) -> CollectResult<Arc<dyn VmService>>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_pause_state_is_paused() {
        assert!(!PauseState::Running.is_paused());
        assert!(PauseState::PauseStart.is_paused());
        assert!(PauseState::PauseBreakpoint.is_paused());
        assert!(PauseState::PauseInterrupted.is_paused());
        assert!(PauseState::PauseException.is_paused());
        assert!(PauseState::PauseExit.is_paused());
    }

    #[test]
    fn test_pause_state_is_exit() {
        assert!(PauseState::PauseExit.is_exit());
        assert!(!PauseState::PauseBreakpoint.is_exit());
    }

    #[test]
    fn test_script_token_table() {
        // Line 3 holds tokens 10 and 14, line 7 holds token 22.
        let script = Script::new(
            "package:app/main.dart",
            &[vec![3, 10, 0, 14, 8], vec![7, 22, 2]],
        );
        assert_eq!(script.line_of(10), Some(2));
        assert_eq!(script.line_of(14), Some(2));
        assert_eq!(script.line_of(22), Some(6));
        assert_eq!(script.line_of(99), None);
    }

    #[test]
    fn test_script_empty_rows_ignored() {
        let script = Script::new("file:///a.dart", &[vec![], vec![1, 5, 0]]);
        assert_eq!(script.line_of(5), Some(0));
    }
}
