//! rt_service Stream Splitter Filter for Envoy Proxy
//!
//! A network (TCP) filter that scans each data segment in both directions
//! for embedded command tokens. Test traffic uses these tokens to steer
//! flushing, packet holds, injected responses and no-ack mode without
//! changing the proxy.
//!
//! Targets: wasm32-wasi (Envoy proxy-wasm ABI)

pub mod config;
pub mod inspector;
pub mod splitter;
pub mod stats;
pub mod telemetry;

use log::{debug, info, warn};
use proxy_wasm::traits::{Context, RootContext, StreamContext};
use proxy_wasm::types::{Action, ContextType, LogLevel, PeerType};
use std::cell::RefCell;

use crate::config::FilterConfig;
use crate::inspector::{ServiceFlowData, ServiceInspector, MODULE};
use crate::splitter::{
    Direction, EncodeFlags, Packet, PacketFlags, RegTestSplitter, ScanOutcome, ScanVerdict,
    SplitterHost,
};
use crate::stats::SplitterStats;
use crate::telemetry::{AuditEvent, AuditEventType};

/// Segment flag passed to the splitter on the last segment of a direction
pub const SEGMENT_END_OF_STREAM: u32 = 0x1;

// Thread-local storage for filter configuration
thread_local! {
    static CONFIG: RefCell<FilterConfig> = RefCell::new(FilterConfig::default());
}

/// Root context for filter lifecycle management
struct RtServiceRootContext {
    config: FilterConfig,
}

impl RtServiceRootContext {
    fn new() -> Self {
        Self {
            config: FilterConfig::default(),
        }
    }
}

impl Context for RtServiceRootContext {}

impl RootContext for RtServiceRootContext {
    fn on_configure(&mut self, _plugin_configuration_size: usize) -> bool {
        if let Some(config_bytes) = self.get_plugin_configuration() {
            match FilterConfig::from_bytes(&config_bytes) {
                Ok(config) => self.config = config,
                Err(e) => {
                    // Fail open with defaults
                    warn!("{}: ignoring plugin configuration: {}", MODULE.name, e);
                    self.config = FilterConfig::default();
                }
            }
        }

        if let Some(level) = self.config.level_filter() {
            log::set_max_level(level);
        }

        CONFIG.with(|c| {
            *c.borrow_mut() = self.config.clone();
        });

        info!(
            "{} initialized (carry_marker_state={}, reset_on_send_data={}): {}",
            MODULE.name,
            self.config.carry_marker_state,
            self.config.reset_on_send_data,
            MODULE.help
        );

        true
    }

    fn create_stream_context(&self, context_id: u32) -> Option<Box<dyn StreamContext>> {
        Some(Box::new(RtServiceStreamContext::new(context_id)))
    }

    fn get_type(&self) -> Option<ContextType> {
        Some(ContextType::StreamContext)
    }
}

/// Flow-level state the splitters act on
#[derive(Debug, Default)]
struct FlowState {
    /// Data waiting to be injected toward the server
    to_server_injection: Vec<u8>,
    /// Data waiting to be injected toward the client
    to_client_injection: Vec<u8>,
    /// Close both sides once pending injections are delivered
    reset_requested: bool,
    reset_on_send_data: bool,
    /// Current segment must not be forwarded yet
    held: bool,
    no_ack: bool,
}

impl FlowState {
    fn new(reset_on_send_data: bool) -> Self {
        Self {
            reset_on_send_data,
            ..Default::default()
        }
    }

    fn pending_mut(&mut self, direction: Direction) -> &mut Vec<u8> {
        match direction {
            Direction::ToServer => &mut self.to_server_injection,
            Direction::ToClient => &mut self.to_client_injection,
        }
    }

    /// Queued injection for `direction`, and whether both sides close after it
    fn take_injection(&mut self, direction: Direction) -> Option<(Vec<u8>, bool)> {
        let payload = std::mem::take(self.pending_mut(direction));
        if payload.is_empty() {
            return None;
        }
        Some((payload, std::mem::take(&mut self.reset_requested)))
    }
}

impl SplitterHost for FlowState {
    fn send_data(&mut self, packet: &Packet, flags: EncodeFlags, payload: &[u8]) {
        let target = packet.direction.opposite();
        debug!(
            "queueing {} bytes toward {:?} (direct={}, flags={:#x})",
            payload.len(),
            target,
            packet.flags.contains(PacketFlags::USE_DIRECT_INJECT),
            flags.bits()
        );
        self.pending_mut(target).extend_from_slice(payload);

        if self.reset_on_send_data
            && (flags.contains(EncodeFlags::RST_SRVR) || flags.contains(EncodeFlags::RST_CLNT))
        {
            self.reset_requested = true;
        }
    }

    fn set_packet_hold(&mut self, _packet: &Packet) {
        self.held = true;
    }

    fn set_no_ack_mode(&mut self, enabled: bool) {
        self.no_ack = enabled;
    }
}

/// Stream context for one proxied connection
struct RtServiceStreamContext {
    context_id: u32,
    config: FilterConfig,
    inspector: ServiceInspector,
    flow_data: ServiceFlowData,
    to_server: RegTestSplitter,
    to_client: RegTestSplitter,
    /// Bytes at the front of each buffer already scanned while held
    to_server_scanned: usize,
    to_client_scanned: usize,
    flow: FlowState,
}

impl RtServiceStreamContext {
    fn new(context_id: u32) -> Self {
        let config = CONFIG.with(|c| c.borrow().clone());
        let inspector = ServiceInspector::new(&config);

        Self {
            context_id,
            to_server: inspector.get_splitter(true),
            to_client: inspector.get_splitter(false),
            to_server_scanned: 0,
            to_client_scanned: 0,
            flow: FlowState::new(config.reset_on_send_data),
            flow_data: ServiceFlowData::new(),
            inspector,
            config,
        }
    }

    fn get_data(&self, direction: Direction, size: usize) -> Vec<u8> {
        match direction {
            Direction::ToServer => self.get_downstream_data(0, size),
            Direction::ToClient => self.get_upstream_data(0, size),
        }
        .unwrap_or_default()
    }

    /// Prepend any queued injection to the buffer heading in `direction`
    fn deliver_injection(&mut self, direction: Direction) {
        let Some((payload, close)) = self.flow.take_injection(direction) else {
            return;
        };

        match direction {
            Direction::ToServer => self.set_downstream_data(0, 0, &payload),
            Direction::ToClient => self.set_upstream_data(0, 0, &payload),
        }
        telemetry::audit_injected(direction, payload.len())
            .with_context(self.context_id, self.flow_data.test_id())
            .emit();

        if close {
            AuditEvent::new(AuditEventType::ConnectionReset)
                .with_context(self.context_id, self.flow_data.test_id())
                .emit();
            self.close_downstream();
            self.close_upstream();
        }
    }

    fn on_segment(&mut self, direction: Direction, data_size: usize, end_of_stream: bool) -> Action {
        let data = self.get_data(direction, data_size);

        let (splitter, scanned) = match direction {
            Direction::ToServer => (&mut self.to_server, &mut self.to_server_scanned),
            Direction::ToClient => (&mut self.to_client, &mut self.to_client_scanned),
        };
        let inspector = &self.inspector;
        let flow = &mut self.flow;

        let result = stats::with_thread_stats(|stats| {
            process_segment(splitter, scanned, inspector, flow, &data, end_of_stream, stats)
        });

        debug!(
            "[context_id={}] {:?} segment: {} new bytes (flags={:#x}), verdict {:?}",
            self.context_id,
            direction,
            result.new_bytes,
            if end_of_stream { SEGMENT_END_OF_STREAM } else { 0 },
            result.outcome.verdict
        );

        if let Some(command) = result.outcome.command {
            telemetry::audit_command(command, direction, result.new_bytes)
                .with_context(self.context_id, self.flow_data.test_id())
                .emit();
        }
        if result.released_hold {
            info!(
                "[context_id={}] releasing held {:?} data at end of stream",
                self.context_id, direction
            );
        }

        if matches!(result.action, Action::Continue) {
            self.deliver_injection(direction);
        }
        result.action
    }
}

/// What happened to one delivered data buffer
struct SegmentResult {
    outcome: ScanOutcome,
    action: Action,
    /// Bytes scanned in this call (held bytes are not rescanned)
    new_bytes: usize,
    /// A hold was dropped because the direction ended
    released_hold: bool,
}

/// Forwarding decision for one buffer, and the scanned offset to keep.
///
/// A held buffer is paused and its bytes are skipped when Envoy redelivers
/// them with the next data. The last buffer of a direction is never paused.
fn segment_action(
    verdict: ScanVerdict,
    held: bool,
    end_of_stream: bool,
    data_len: usize,
) -> (Action, usize) {
    match verdict {
        ScanVerdict::Search if held && !end_of_stream => (Action::Pause, data_len),
        _ => (Action::Continue, 0),
    }
}

/// Scan the unscanned tail of `data` and update the per-direction state
fn process_segment(
    splitter: &mut RegTestSplitter,
    scanned: &mut usize,
    inspector: &ServiceInspector,
    flow: &mut FlowState,
    data: &[u8],
    end_of_stream: bool,
    stats: &mut SplitterStats,
) -> SegmentResult {
    let segment = data.get(*scanned..).unwrap_or_default();

    inspector.eval(stats);
    let outcome = splitter.decide(segment, stats);
    if let Some(action) = outcome.action {
        let mut packet = Packet::new(splitter.direction());
        splitter.dispatch(flow, &mut packet, action);
    }

    if let ScanVerdict::Flush(_) = outcome.verdict {
        splitter.reset();
    }

    let held = std::mem::take(&mut flow.held);
    let (action, next_scanned) = segment_action(outcome.verdict, held, end_of_stream, data.len());
    *scanned = next_scanned;

    SegmentResult {
        outcome,
        action,
        new_bytes: segment.len(),
        released_hold: held && end_of_stream,
    }
}

impl Context for RtServiceStreamContext {}

impl StreamContext for RtServiceStreamContext {
    fn on_new_connection(&mut self) -> Action {
        debug!(
            "[context_id={}] new connection, test_id={}",
            self.context_id,
            self.flow_data.test_id()
        );
        Action::Continue
    }

    fn on_downstream_data(&mut self, data_size: usize, end_of_stream: bool) -> Action {
        self.on_segment(Direction::ToServer, data_size, end_of_stream)
    }

    fn on_downstream_close(&mut self, peer_type: PeerType) {
        debug!(
            "[context_id={}] downstream closed by peer type {}",
            self.context_id, peer_type as u32
        );
    }

    fn on_upstream_data(&mut self, data_size: usize, end_of_stream: bool) -> Action {
        self.on_segment(Direction::ToClient, data_size, end_of_stream)
    }

    fn on_upstream_close(&mut self, peer_type: PeerType) {
        debug!(
            "[context_id={}] upstream closed by peer type {}",
            self.context_id, peer_type as u32
        );
    }

    fn on_log(&mut self) {
        if self.flow.no_ack {
            info!(
                "[context_id={}] connection closed with no_ack mode on",
                self.context_id
            );
        }
        if self.config.emit_stats_on_close {
            telemetry::audit_closed(stats::thread_stats())
                .with_context(self.context_id, self.flow_data.test_id())
                .emit();
        }
    }
}

// Register the filter with proxy-wasm runtime
proxy_wasm::main! {{
    proxy_wasm::set_log_level(LogLevel::Info);
    proxy_wasm::set_root_context(|_| -> Box<dyn RootContext> {
        Box::new(RtServiceRootContext::new())
    });
}}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::splitter::SplitterAction;

    fn scan(flow: &mut FlowState, direction: Direction, data: &[u8]) -> ScanVerdict {
        let mut splitter = RegTestSplitter::new(direction);
        let mut packet = Packet::new(direction);
        let mut stats = SplitterStats::new();
        splitter.scan(flow, &mut packet, data, 0, &mut stats)
    }

    #[test]
    fn test_send_data_queues_opposite_direction() {
        let mut flow = FlowState::new(true);
        scan(&mut flow, Direction::ToServer, b"send_data");

        assert_eq!(flow.to_client_injection, b"send_data packet");
        assert!(flow.to_server_injection.is_empty());
        assert!(flow.reset_requested);
    }

    #[test]
    fn test_send_data_without_reset() {
        let mut flow = FlowState::new(false);
        scan(&mut flow, Direction::ToClient, b"send_data_direct");

        assert_eq!(flow.to_server_injection, b"send_data_direct packet");
        assert!(!flow.reset_requested);
    }

    #[test]
    fn test_hold_and_no_ack_update_flow() {
        let mut flow = FlowState::new(true);
        scan(&mut flow, Direction::ToServer, b"hold");
        assert!(flow.held);

        scan(&mut flow, Direction::ToServer, b"<no_ack>");
        assert!(flow.no_ack);
        scan(&mut flow, Direction::ToClient, b"</no_ack>");
        assert!(!flow.no_ack);
    }

    #[test]
    fn test_dispatch_direct_flag_is_cleared() {
        let mut flow = FlowState::new(true);
        let splitter = RegTestSplitter::new(Direction::ToServer);
        let mut packet = Packet::new(Direction::ToServer);
        splitter.dispatch(
            &mut flow,
            &mut packet,
            SplitterAction::SendData {
                payload: b"x",
                flags: EncodeFlags::NONE,
                direct: true,
            },
        );
        assert_eq!(packet.flags, PacketFlags::NONE);
        assert_eq!(flow.to_client_injection, b"x");
        assert!(!flow.reset_requested);
    }

    fn segment(
        splitter: &mut RegTestSplitter,
        scanned: &mut usize,
        flow: &mut FlowState,
        stats: &mut SplitterStats,
        data: &[u8],
        end_of_stream: bool,
    ) -> SegmentResult {
        let inspector = ServiceInspector::new(&FilterConfig::default());
        process_segment(splitter, scanned, &inspector, flow, data, end_of_stream, stats)
    }

    #[test]
    fn test_segment_action() {
        assert!(matches!(
            segment_action(ScanVerdict::Search, false, false, 10),
            (Action::Continue, 0)
        ));
        assert!(matches!(
            segment_action(ScanVerdict::Search, true, false, 10),
            (Action::Pause, 10)
        ));
        assert!(matches!(
            segment_action(ScanVerdict::Search, true, true, 10),
            (Action::Continue, 0)
        ));
        assert!(matches!(
            segment_action(ScanVerdict::Flush(10), false, false, 10),
            (Action::Continue, 0)
        ));
    }

    #[test]
    fn test_held_segment_redelivered_with_flush() {
        let mut splitter = RegTestSplitter::new(Direction::ToServer);
        let mut scanned = 0;
        let mut flow = FlowState::new(true);
        let mut stats = SplitterStats::new();

        let first = segment(&mut splitter, &mut scanned, &mut flow, &mut stats, b"hold this", false);
        assert!(matches!(first.action, Action::Pause));
        assert_eq!(scanned, 9);
        assert!(!flow.held);

        let second = segment(
            &mut splitter,
            &mut scanned,
            &mut flow,
            &mut stats,
            b"hold thisflush",
            false,
        );
        assert_eq!(second.outcome.verdict, ScanVerdict::Flush(5));
        assert_eq!(second.new_bytes, 5);
        assert!(matches!(second.action, Action::Continue));
        assert_eq!(scanned, 0);
        assert_eq!(splitter.byte_count(), 0);
        assert_eq!(splitter.segment_count(), 0);
        assert_eq!(stats.hold_requests, 1);
        assert_eq!(stats.flush_requests, 1);
        assert_eq!(stats.packets, 2);
    }

    #[test]
    fn test_held_bytes_are_not_rescanned() {
        let mut splitter = RegTestSplitter::new(Direction::ToClient);
        let mut scanned = 0;
        let mut flow = FlowState::new(true);
        let mut stats = SplitterStats::new();

        segment(&mut splitter, &mut scanned, &mut flow, &mut stats, b"hold", false);
        let next = segment(&mut splitter, &mut scanned, &mut flow, &mut stats, b"hold more", false);

        assert!(matches!(next.action, Action::Continue));
        assert_eq!(next.new_bytes, 5);
        assert_eq!(stats.hold_requests, 1);
        assert_eq!(scanned, 0);
    }

    #[test]
    fn test_hold_released_at_end_of_stream() {
        let mut splitter = RegTestSplitter::new(Direction::ToServer);
        let mut scanned = 0;
        let mut flow = FlowState::new(true);
        let mut stats = SplitterStats::new();

        let last = segment(&mut splitter, &mut scanned, &mut flow, &mut stats, b"hold", true);
        assert!(matches!(last.action, Action::Continue));
        assert!(last.released_hold);
        assert_eq!(scanned, 0);
        assert!(!flow.held);
        assert_eq!(stats.hold_requests, 1);
    }

    #[test]
    fn test_injection_taken_once_with_reset() {
        let mut splitter = RegTestSplitter::new(Direction::ToServer);
        let mut scanned = 0;
        let mut flow = FlowState::new(true);
        let mut stats = SplitterStats::new();

        segment(&mut splitter, &mut scanned, &mut flow, &mut stats, b"send_data", false);

        assert_eq!(flow.take_injection(Direction::ToServer), None);
        assert_eq!(
            flow.take_injection(Direction::ToClient),
            Some((b"send_data packet".to_vec(), true))
        );
        assert_eq!(flow.take_injection(Direction::ToClient), None);
        assert!(!flow.reset_requested);
    }

    #[test]
    fn test_injection_without_reset_keeps_connection() {
        let mut flow = FlowState::new(false);
        scan(&mut flow, Direction::ToClient, b"send_data_direct");
        assert_eq!(
            flow.take_injection(Direction::ToServer),
            Some((b"send_data_direct packet".to_vec(), false))
        );
    }
}
