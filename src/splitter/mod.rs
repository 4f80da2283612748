//! Stream splitting driven by command tokens
//!
//! This module provides:
//! - Embedded marker scanning (`<script>`)
//! - Command token matching with fixed priority
//! - The per-direction splitter state machine

pub mod marker;
pub mod matcher;
pub mod regtest;

pub use marker::{Marker, MarkerState, SCRIPT_MARKER};
pub use matcher::{match_command, Command};
pub use regtest::{
    Direction, EncodeFlags, Packet, PacketFlags, RegTestSplitter, ScanOutcome, ScanVerdict,
    SplitterAction, SplitterHost,
};
