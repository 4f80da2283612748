//! rt_service inspector
//!
//! Service inspector used by regression tests that need custom service
//! inspection. It counts packets and hands out one command-driven splitter
//! per flow direction.

use std::sync::atomic::{AtomicU32, Ordering};

use log::info;

use crate::config::FilterConfig;
use crate::splitter::{Direction, RegTestSplitter};
use crate::stats::{PegInfo, SplitterStats};

const FIRST_TEST_ID: u32 = 100;

static NEXT_TEST_ID: AtomicU32 = AtomicU32::new(FIRST_TEST_ID);

/// Name, help text and pegs of the inspector module
#[derive(Clone, Copy, Debug)]
pub struct ModuleInfo {
    pub name: &'static str,
    pub help: &'static str,
}

pub const MODULE: ModuleInfo = ModuleInfo {
    name: "rt_service",
    help: "The regression test service inspector is used by regression tests \
           that require custom service inspector support.",
};

impl ModuleInfo {
    pub fn pegs(&self) -> &'static [PegInfo] {
        SplitterStats::pegs()
    }
}

/// The service inspector
#[derive(Debug)]
pub struct ServiceInspector {
    carry_marker_state: bool,
}

impl ServiceInspector {
    pub fn new(config: &FilterConfig) -> Self {
        Self {
            carry_marker_state: config.carry_marker_state,
        }
    }

    /// Count one packet
    pub fn eval(&self, stats: &mut SplitterStats) {
        stats.packets += 1;
    }

    /// Splitter for one direction of a new flow
    pub fn get_splitter(&self, to_server: bool) -> RegTestSplitter {
        RegTestSplitter::with_marker_carry(
            Direction::from_to_server(to_server),
            self.carry_marker_state,
        )
    }
}

/// Per-flow data tagged with a process-wide test id
#[derive(Debug)]
pub struct ServiceFlowData {
    test_id: u32,
}

impl ServiceFlowData {
    pub fn new() -> Self {
        Self {
            test_id: NEXT_TEST_ID.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn test_id(&self) -> u32 {
        self.test_id
    }

    /// Called when an expected flow materializes
    pub fn handle_expected(&self) {
        info!(
            "Reg Test Service Inspector: handle expected, test_id={}",
            self.test_id
        );
    }
}

impl Default for ServiceFlowData {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ServiceFlowData {
    fn drop(&mut self) {
        info!(
            "Reg Test Service Inspector: delete flow data, test_id={}",
            self.test_id
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_info() {
        assert_eq!(MODULE.name, "rt_service");
        assert_eq!(MODULE.pegs()[0].name, "packets");
        assert!(MODULE.help.starts_with("The regression test service inspector"));
    }

    #[test]
    fn test_eval_counts_packets() {
        let inspector = ServiceInspector::new(&FilterConfig::default());
        let mut stats = SplitterStats::new();
        inspector.eval(&mut stats);
        inspector.eval(&mut stats);
        assert_eq!(stats.packets, 2);
        assert_eq!(stats.search_requests, 0);
    }

    #[test]
    fn test_get_splitter_direction() {
        let inspector = ServiceInspector::new(&FilterConfig::default());
        assert_eq!(inspector.get_splitter(true).direction(), Direction::ToServer);
        assert_eq!(inspector.get_splitter(false).direction(), Direction::ToClient);
    }

    #[test]
    fn test_get_splitter_carries_marker_when_configured() {
        let config = FilterConfig {
            carry_marker_state: true,
            ..Default::default()
        };
        let inspector = ServiceInspector::new(&config);
        let mut splitter = inspector.get_splitter(true);
        let mut stats = SplitterStats::new();

        splitter.decide(b"<scri", &mut stats);
        splitter.decide(b"pt>", &mut stats);
        assert_eq!(stats.hold_requests, 1);
    }

    #[test]
    fn test_flow_data_ids_increase() {
        let first = ServiceFlowData::new();
        let second = ServiceFlowData::new();
        assert!(first.test_id() >= FIRST_TEST_ID);
        assert!(second.test_id() > first.test_id());
        second.handle_expected();
    }
}
