//! Debug events for protocol tracing.
//!
//! These events trace protocol flow during simulation and testing. A node
//! emits them only when an emitter is attached.

use crate::state::NodeState;
use crate::types::{HashRange, Link, PeerAddr};

/// Trait for receiving debug events from a node.
/// Implemented by test harnesses to collect/print events.
pub trait DebugEmitter {
    /// Called when a debug event is emitted.
    fn emit(&mut self, event: DebugEvent);
}

/// Debug events emitted by the node for protocol tracing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Router moved between states.
    StateChanged {
        from: NodeState,
        to: NodeState,
        event: &'static str,
    },
    /// Our range was set (claimed, granted, merged or split).
    RangeAssigned { range: HashRange },
    /// We split for a prospect.
    RangeSplit {
        kept: HashRange,
        granted: HashRange,
        prospect: PeerAddr,
    },
    /// A Join was passed on to the successor.
    JoinForwarded { max_span: u8, max_addr: PeerAddr },
    /// A Join could not be honoured (range too small to split, or no
    /// successor to pass it to).
    JoinDropped { prospect: PeerAddr },
    /// Shutdown is waiting for the predecessor link to come back.
    LeaveDeferred,
    /// A keyed request was handled locally.
    RequestServed { tag: u8, hash: u8 },
    /// A keyed request was passed to the successor.
    RequestForwarded { tag: u8, hash: u8 },
    /// Entries were sent to a neighbour.
    EntriesTransferred { to: Link, count: usize },
    /// An event arrived that the current state does not handle.
    EventDropped {
        state: NodeState,
        event: &'static str,
    },
    /// A message could not be decoded.
    DecodeFailed { data_len: usize },
}

/// Emitter that forwards every event to `tracing` at TRACE level.
#[derive(Default)]
pub struct TracingEmitter;

impl DebugEmitter for TracingEmitter {
    fn emit(&mut self, event: DebugEvent) {
        tracing::trace!(?event, "protocol");
    }
}

/// Emit a debug event if the node has an emitter attached.
macro_rules! emit_debug {
    ($node:expr, $event:expr) => {
        if let Some(emitter) = $node.debug.as_mut() {
            emitter.emit($event);
        }
    };
}
