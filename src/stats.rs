//! Splitter statistics
//!
//! One counter set per worker thread. Envoy runs each Wasm VM on a single
//! worker, so increments are plain additions and no aggregation happens here.

use serde::Serialize;
use std::cell::RefCell;

thread_local! {
    static STATS: RefCell<SplitterStats> = RefCell::new(SplitterStats::default());
}

/// Peg counters for the rt_service inspector and its splitters
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SplitterStats {
    /// Packets evaluated by the inspector
    pub packets: u64,
    /// `flush` commands
    pub flush_requests: u64,
    /// `hold` commands and script markers
    pub hold_requests: u64,
    /// Segments answered with SEARCH
    pub search_requests: u64,
    /// `send_data` commands
    pub send_data_requests: u64,
    /// `send_data_direct` commands
    pub send_data_direct_requests: u64,
}

/// Name and help text of one peg counter
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PegInfo {
    pub name: &'static str,
    pub help: &'static str,
}

const PEGS: &[PegInfo] = &[
    PegInfo { name: "packets", help: "total packets" },
    PegInfo { name: "flush_requests", help: "total splitter flush requests" },
    PegInfo { name: "hold_requests", help: "total splitter hold requests" },
    PegInfo { name: "search_requests", help: "total splitter search requests" },
    PegInfo { name: "send_data_requests", help: "total splitter send data requests" },
    PegInfo {
        name: "send_data_direct_requests",
        help: "total splitter send data direct requests",
    },
];

impl SplitterStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peg table, in the same order as `counts()`
    pub fn pegs() -> &'static [PegInfo] {
        PEGS
    }

    /// Counter values, in the same order as `pegs()`
    pub fn counts(&self) -> [u64; 6] {
        [
            self.packets,
            self.flush_requests,
            self.hold_requests,
            self.search_requests,
            self.send_data_requests,
            self.send_data_direct_requests,
        ]
    }

    /// Look up a counter by peg name
    pub fn get(&self, name: &str) -> Option<u64> {
        PEGS.iter()
            .position(|peg| peg.name == name)
            .map(|i| self.counts()[i])
    }

    /// Zero every counter. Only the host's global counter reset calls this.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Run `f` against this thread's counters
pub fn with_thread_stats<R>(f: impl FnOnce(&mut SplitterStats) -> R) -> R {
    STATS.with(|s| f(&mut s.borrow_mut()))
}

/// Copy of this thread's counters
pub fn thread_stats() -> SplitterStats {
    STATS.with(|s| s.borrow().clone())
}

/// Zero this thread's counters
pub fn clear_thread_stats() {
    STATS.with(|s| s.borrow_mut().clear());
}
