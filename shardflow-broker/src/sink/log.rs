// shardflow-broker/src/sink/log.rs
// ============================================================================
// Module: Broker Log Sink
// Description: Log-only sink writing audit-grade delivery records.
// Purpose: Persist outbound envelopes as JSON lines without an external
//          broker.
// Dependencies: serde_json, std, crate::{payload, sink}
// ============================================================================

//! ## Overview
//! `LogSink` writes one JSON line per envelope. It backs deployments that
//! route events through their logging pipeline instead of a broker, and
//! doubles as the audit record in tests.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::io::Write;
use std::sync::Mutex;

use crate::payload::EventEnvelope;
use crate::sink::Sink;
use crate::sink::SinkError;

// ============================================================================
// SECTION: Log Sink
// ============================================================================

/// Log-only event sink.
pub struct LogSink<W: Write + Send> {
    /// Output writer for delivery records.
    writer: Mutex<W>,
}

impl<W: Write + Send> LogSink<W> {
    /// Creates a log sink over a writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }
}

impl<W: Write + Send> Sink for LogSink<W> {
    fn deliver(&self, envelope: &EventEnvelope) -> Result<(), SinkError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| SinkError::LogWriteFailed("log writer mutex poisoned".to_string()))?;
        serde_json::to_writer(&mut *guard, envelope)
            .map_err(|err| SinkError::LogWriteFailed(err.to_string()))?;
        guard.write_all(b"\n").map_err(|err| SinkError::LogWriteFailed(err.to_string()))?;
        drop(guard);
        Ok(())
    }
}
