//! Command-driven stream splitter
//!
//! One `RegTestSplitter` per flow direction. Each segment is scanned for a
//! command token; the matching action is handed to the host and a verdict
//! tells the host whether to keep buffering or cut the stream.

use std::ops::BitOr;

use log::{debug, info};

use super::marker::{MarkerState, SCRIPT_MARKER};
use super::matcher::{match_command_with, Command};
use crate::stats::SplitterStats;

/// Payload injected for `send_data_direct`
pub const SEND_DATA_DIRECT_PAYLOAD: &[u8] = b"send_data_direct packet";
/// Payload injected for `send_data`
pub const SEND_DATA_PAYLOAD: &[u8] = b"send_data packet";

/// Direction of the segments a splitter sees
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to server
    ToServer,
    /// Server to client
    ToClient,
}

impl Direction {
    pub fn from_to_server(to_server: bool) -> Self {
        if to_server {
            Direction::ToServer
        } else {
            Direction::ToClient
        }
    }

    pub fn opposite(&self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }
}

/// Flags that accompany injected data
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct EncodeFlags(u32);

impl EncodeFlags {
    pub const NONE: EncodeFlags = EncodeFlags(0);
    /// Reset the server side of the connection
    pub const RST_SRVR: EncodeFlags = EncodeFlags(0x01);
    /// Reset the client side of the connection
    pub const RST_CLNT: EncodeFlags = EncodeFlags(0x02);

    pub fn contains(&self, other: EncodeFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

impl BitOr for EncodeFlags {
    type Output = EncodeFlags;

    fn bitor(self, rhs: EncodeFlags) -> EncodeFlags {
        EncodeFlags(self.0 | rhs.0)
    }
}

/// Per-packet flags visible to the host while an action runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketFlags(u32);

impl PacketFlags {
    pub const NONE: PacketFlags = PacketFlags(0);
    /// Inject on this packet's own path instead of queueing
    pub const USE_DIRECT_INJECT: PacketFlags = PacketFlags(0x01);

    pub fn contains(&self, other: PacketFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: PacketFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: PacketFlags) {
        self.0 &= !other.0;
    }
}

/// The packet carrying the current segment
#[derive(Clone, Debug)]
pub struct Packet {
    pub direction: Direction,
    pub flags: PacketFlags,
}

impl Packet {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            flags: PacketFlags::NONE,
        }
    }
}

/// Host services the splitter calls into. One implementation per flow.
pub trait SplitterHost {
    /// Inject `payload` in the direction opposite to `packet`
    fn send_data(&mut self, packet: &Packet, flags: EncodeFlags, payload: &[u8]);

    /// Defer delivery of `packet`
    fn set_packet_hold(&mut self, packet: &Packet);

    /// Toggle no-ack mode for the flow
    fn set_no_ack_mode(&mut self, enabled: bool);
}

/// Verdict for one segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScanVerdict {
    /// Keep buffering
    Search,
    /// Cut the stream this many bytes into the current segment
    Flush(u32),
}

/// Side effect selected for one segment
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitterAction {
    SendData {
        payload: &'static [u8],
        flags: EncodeFlags,
        direct: bool,
    },
    Hold,
    SetNoAck(bool),
}

/// Verdict plus the action to dispatch before returning it
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScanOutcome {
    pub verdict: ScanVerdict,
    pub command: Option<Command>,
    pub action: Option<SplitterAction>,
}

/// Splitter driven by command tokens embedded in the stream
#[derive(Debug)]
pub struct RegTestSplitter {
    direction: Direction,
    byte_count: u64,
    segment_count: u64,
    /// Script marker progress, kept between segments only when enabled
    marker: MarkerState,
    carry_marker_state: bool,
}

impl RegTestSplitter {
    pub fn new(direction: Direction) -> Self {
        Self::with_marker_carry(direction, false)
    }

    /// Create a splitter that optionally tracks the script marker across
    /// segment boundaries
    pub fn with_marker_carry(direction: Direction, carry_marker_state: bool) -> Self {
        let mut splitter = Self {
            direction,
            byte_count: 0,
            segment_count: 0,
            marker: MarkerState::new(),
            carry_marker_state,
        };
        splitter.reset();
        splitter
    }

    /// Decide the verdict and action for one segment without touching the host
    pub fn decide(&mut self, data: &[u8], stats: &mut SplitterStats) -> ScanOutcome {
        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        self.byte_count = self.byte_count.saturating_add(data.len() as u64);
        self.segment_count += 1;

        if !self.carry_marker_state {
            self.marker.reset();
        }
        let command = match_command_with(data, &mut self.marker);

        let action = match command {
            Some(Command::Flush) => {
                stats.flush_requests += 1;
                return ScanOutcome {
                    verdict: ScanVerdict::Flush(len),
                    command,
                    action: None,
                };
            }
            Some(Command::SendDataDirect) => {
                stats.send_data_direct_requests += 1;
                Some(SplitterAction::SendData {
                    payload: SEND_DATA_DIRECT_PAYLOAD,
                    flags: EncodeFlags::RST_SRVR | EncodeFlags::RST_CLNT,
                    direct: true,
                })
            }
            Some(Command::SendData) => {
                stats.send_data_requests += 1;
                Some(SplitterAction::SendData {
                    payload: SEND_DATA_PAYLOAD,
                    flags: EncodeFlags::RST_SRVR | EncodeFlags::RST_CLNT,
                    direct: false,
                })
            }
            Some(Command::Hold) => {
                stats.hold_requests += 1;
                Some(SplitterAction::Hold)
            }
            Some(Command::Script) => {
                debug!("rt_service: {} marker matched", SCRIPT_MARKER.name);
                stats.hold_requests += 1;
                Some(SplitterAction::Hold)
            }
            Some(Command::NoAckOn) => Some(SplitterAction::SetNoAck(true)),
            Some(Command::NoAckOff) => Some(SplitterAction::SetNoAck(false)),
            None => None,
        };

        stats.search_requests += 1;
        ScanOutcome {
            verdict: ScanVerdict::Search,
            command,
            action,
        }
    }

    /// Perform `action` against the host
    pub fn dispatch<H: SplitterHost + ?Sized>(
        &self,
        host: &mut H,
        packet: &mut Packet,
        action: SplitterAction,
    ) {
        match action {
            SplitterAction::SendData {
                payload,
                flags,
                direct,
            } => {
                if direct {
                    packet.flags.insert(PacketFlags::USE_DIRECT_INJECT);
                }
                host.send_data(packet, flags, payload);
                if direct {
                    packet.flags.remove(PacketFlags::USE_DIRECT_INJECT);
                }
            }
            SplitterAction::Hold => host.set_packet_hold(packet),
            SplitterAction::SetNoAck(true) => {
                host.set_no_ack_mode(true);
                info!("rt_service: turn on no_ack mode");
            }
            SplitterAction::SetNoAck(false) => {
                host.set_no_ack_mode(false);
                info!("rt_service: turn off no_ack mode");
            }
        }
    }

    /// Scan one segment, run its action and return the verdict
    pub fn scan<H: SplitterHost + ?Sized>(
        &mut self,
        host: &mut H,
        packet: &mut Packet,
        data: &[u8],
        flags: u32,
        stats: &mut SplitterStats,
    ) -> ScanVerdict {
        let outcome = self.decide(data, stats);

        debug!(
            "rt_service: {:?} segment {} ({} bytes, flags={:#x}) -> {:?}",
            self.direction,
            self.segment_count,
            data.len(),
            flags,
            outcome.command
        );

        if let Some(action) = outcome.action {
            self.dispatch(host, packet, action);
        }
        outcome.verdict
    }

    /// Called by the host when buffering parameters change
    pub fn update(&mut self) {
        self.reset();
    }

    /// Partial flushing is always allowed
    pub fn init_partial_flush(&self) -> bool {
        true
    }

    /// Flush points are chosen by scanning (protocol-aware flushing)
    pub fn is_paf(&self) -> bool {
        true
    }

    pub fn reset(&mut self) {
        self.byte_count = 0;
        self.segment_count = 0;
        self.marker.reset();
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn segment_count(&self) -> u64 {
        self.segment_count
    }
}
