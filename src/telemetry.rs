//! Telemetry Module for rt_service
//!
//! Structured audit lines emitted through the proxy-wasm logger so Envoy's
//! log collection can pick them up.

use log::{info, warn};
use serde::Serialize;

use crate::splitter::{Command, Direction};
use crate::stats::SplitterStats;

/// Audit event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    /// A command token was acted on
    CommandMatched,
    /// Injected data was delivered to a peer
    DataInjected,
    /// The connection was reset after injection
    ConnectionReset,
    /// The connection closed
    FlowClosed,
}

/// Audit event for logging
#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    /// Event type
    pub event_type: AuditEventType,
    /// Envoy context id of the connection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_id: Option<u32>,
    /// Per-flow test id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_id: Option<u32>,
    /// Segment direction
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<&'static str>,
    /// Command name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<&'static str>,
    /// Byte count involved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<usize>,
    /// Counter snapshot
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SplitterStats>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            context_id: None,
            test_id: None,
            direction: None,
            command: None,
            bytes: None,
            stats: None,
        }
    }

    pub fn with_context(mut self, context_id: u32, test_id: u32) -> Self {
        self.context_id = Some(context_id);
        self.test_id = Some(test_id);
        self
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = Some(direction_name(direction));
        self
    }

    pub fn with_command(mut self, command: Command) -> Self {
        self.command = Some(command.as_str());
        self
    }

    pub fn with_bytes(mut self, bytes: usize) -> Self {
        self.bytes = Some(bytes);
        self
    }

    pub fn with_stats(mut self, stats: SplitterStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Log the event
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => match self.event_type {
                AuditEventType::ConnectionReset => warn!("[RT-SERVICE-AUDIT] {}", json),
                _ => info!("[RT-SERVICE-AUDIT] {}", json),
            },
            Err(e) => {
                warn!("Failed to serialize audit event: {}", e);
            }
        }
    }
}

fn direction_name(direction: Direction) -> &'static str {
    match direction {
        Direction::ToServer => "to_server",
        Direction::ToClient => "to_client",
    }
}

/// Create a command audit event
pub fn audit_command(command: Command, direction: Direction, bytes: usize) -> AuditEvent {
    AuditEvent::new(AuditEventType::CommandMatched)
        .with_command(command)
        .with_direction(direction)
        .with_bytes(bytes)
}

/// Create an injection audit event
pub fn audit_injected(direction: Direction, bytes: usize) -> AuditEvent {
    AuditEvent::new(AuditEventType::DataInjected)
        .with_direction(direction)
        .with_bytes(bytes)
}

/// Create a flow close audit event carrying the counters
pub fn audit_closed(stats: SplitterStats) -> AuditEvent {
    AuditEvent::new(AuditEventType::FlowClosed).with_stats(stats)
}
