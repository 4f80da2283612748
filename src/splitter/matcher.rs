//! Command token matching
//!
//! Maps one segment to at most one command. Literal tokens are tested as
//! prefixes in a fixed priority order, then the embedded script marker.
//! The first match wins.

use super::marker::{MarkerState, SCRIPT_MARKER};

/// Commands recognized in segment payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    /// `flush` - cut the stream at the end of the segment
    Flush,
    /// `send_data_direct` - inject a response using direct injection
    SendDataDirect,
    /// `send_data` - inject a response
    SendData,
    /// `hold` - hold the current packet
    Hold,
    /// `<script>` anywhere in the segment - hold the current packet
    Script,
    /// `<no_ack>` - turn on no-ack mode for the flow
    NoAckOn,
    /// `</no_ack>` - turn off no-ack mode for the flow
    NoAckOff,
}

impl Command {
    /// Name used in logs and audit events
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Flush => "flush",
            Command::SendDataDirect => "send_data_direct",
            Command::SendData => "send_data",
            Command::Hold => "hold",
            Command::Script => "script",
            Command::NoAckOn => "no_ack_on",
            Command::NoAckOff => "no_ack_off",
        }
    }
}

/// Literal prefixes checked before the script marker.
/// `send_data_direct` must come before `send_data`.
const LEADING_TOKENS: &[(&[u8], Command)] = &[
    (b"flush", Command::Flush),
    (b"send_data_direct", Command::SendDataDirect),
    (b"send_data", Command::SendData),
    (b"hold", Command::Hold),
];

/// Literal prefixes checked after the script marker
const TRAILING_TOKENS: &[(&[u8], Command)] = &[
    (b"<no_ack>", Command::NoAckOn),
    (b"</no_ack>", Command::NoAckOff),
];

fn match_prefix(data: &[u8], tokens: &[(&[u8], Command)]) -> Option<Command> {
    tokens
        .iter()
        .find(|(token, _)| data.starts_with(token))
        .map(|&(_, command)| command)
}

/// Match a segment with fresh marker state
pub fn match_command(data: &[u8]) -> Option<Command> {
    match_command_with(data, &mut MarkerState::new())
}

/// Match a segment, feeding the script scan through `marker`.
///
/// `marker` is only advanced when none of the leading tokens matched.
pub fn match_command_with(data: &[u8], marker: &mut MarkerState) -> Option<Command> {
    if let Some(command) = match_prefix(data, LEADING_TOKENS) {
        return Some(command);
    }

    if marker.scan(data, &SCRIPT_MARKER) {
        return Some(Command::Script);
    }

    match_prefix(data, TRAILING_TOKENS)
}
