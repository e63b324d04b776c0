//! Event Sink Trait
//!
//! This module provides the EventSink trait for decoupling event emission
//! from GUI frameworks. Implementations can emit events to a desktop shell,
//! write to stdout (CLI), or any other sink.

use async_trait::async_trait;

use crate::connection::ConnectionStatus;

/// Event sink for emitting connection events to listeners
///
/// This trait abstracts event emission so the lifecycle controller can work
/// with different frontends (GUI shell, CLI, tests, etc.)
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a connection status change
    async fn connection_status_changed(&self, status: ConnectionStatus) -> Result<(), String>;

    /// Emit an unsolicited disconnect (a supervised process died)
    ///
    /// Distinct from a status change so a frontend can offer "reconnecting"
    /// semantics instead of silently flipping to disconnected.
    async fn connection_lost(&self, record_id: &str) -> Result<(), String>;
}

/// No-op event sink for testing or headless use without event emission
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn connection_status_changed(&self, _status: ConnectionStatus) -> Result<(), String> {
        Ok(())
    }

    async fn connection_lost(&self, _record_id: &str) -> Result<(), String> {
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn connection_status_changed(&self, status: ConnectionStatus) -> Result<(), String> {
        if self.json_output {
            println!(
                r#"{{"event":"status_changed","status":{}}}"#,
                serde_json::to_string(&status).unwrap_or_default()
            );
        } else {
            println!("Status: {status}");
        }
        Ok(())
    }

    async fn connection_lost(&self, record_id: &str) -> Result<(), String> {
        if self.json_output {
            println!(r#"{{"event":"connection_lost","record_id":"{record_id}"}}"#);
        } else {
            println!("Connection lost: {record_id}");
        }
        Ok(())
    }
}
