// shardflow-broker/tests/adapter_tests.rs
// ============================================================================
// Module: Broker Adapter Tests
// Description: Tests for the composite adapter, dedupe, and sources.
// Purpose: Validate the publisher contract, duplicate suppression, and
//          command sourcing.
// Dependencies: serde_json, shardflow-broker, shardflow-core, tokio
// ============================================================================
//! ## Overview
//! The adapter must render event records into wire envelopes, require a
//! sink at build time, and surface delivery failures as publish errors.
//! Consumers dedupe duplicate deliveries by event id, and sources yield
//! commands in arrival order.

#![allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    reason = "Test-only panic-based assertions are permitted."
)]

use serde_json::json;
use shardflow_broker::AdapterError;
use shardflow_broker::ChannelSink;
use shardflow_broker::ChannelSource;
use shardflow_broker::EventBusAdapter;
use shardflow_broker::EventDeduper;
use shardflow_broker::EventEnvelope;
use shardflow_broker::InlineSource;
use shardflow_core::EventId;
use shardflow_core::EventKind;
use shardflow_core::EventRecord;
use shardflow_core::MigrationId;
use shardflow_core::Timestamp;
use shardflow_core::interfaces::CommandEnvelope;
use shardflow_core::interfaces::CommandSource;
use shardflow_core::interfaces::EventPublisher;
use shardflow_core::interfaces::MigrationCommand;

fn record(id: &str, kind: EventKind) -> EventRecord {
    EventRecord::new(
        EventId::new(id),
        MigrationId::new("mig-1"),
        kind,
        Timestamp::Logical(0),
        json!({}),
    )
}

/// Verifies the adapter renders records into wire envelopes.
#[tokio::test]
async fn adapter_publishes_wire_envelopes() {
    let (sink, mut receiver) = ChannelSink::new();
    let adapter = EventBusAdapter::builder().sink(sink).build().unwrap();

    adapter.publish(&record("e-1", EventKind::Created)).unwrap();
    let delivered = receiver.try_recv().unwrap();
    assert_eq!(delivered.wire_type, "migration.created");
    assert_eq!(delivered.event_id, EventId::new("e-1"));
    assert_eq!(delivered.migration_id, MigrationId::new("mig-1"));
}

/// Verifies the builder requires a sink.
#[test]
fn adapter_requires_a_sink() {
    let err = EventBusAdapter::builder().build().unwrap_err();
    assert!(matches!(err, AdapterError::MissingSink));
}

/// Verifies a failed delivery surfaces as a publish error.
#[tokio::test]
async fn adapter_surfaces_delivery_failure() {
    let (sink, receiver) = ChannelSink::new();
    drop(receiver);
    let adapter = EventBusAdapter::builder().sink(sink).build().unwrap();
    assert!(adapter.publish(&record("e-1", EventKind::Created)).is_err());
}

/// Verifies consumers drop duplicate deliveries by event id.
#[test]
fn deduper_drops_duplicate_deliveries() {
    let mut deduper = EventDeduper::new();
    let envelope = EventEnvelope::from_record(&record("e-1", EventKind::Progress));
    assert!(deduper.observe(&envelope));
    assert!(!deduper.observe(&envelope));
    let other = EventEnvelope::from_record(&record("e-2", EventKind::Progress));
    assert!(deduper.observe(&other));
}

/// Verifies the inline source yields commands in order, then ends.
#[test]
fn inline_source_yields_in_order() {
    let mut source = InlineSource::new(vec![
        CommandEnvelope {
            command_id: "c-1".to_string(),
            command: MigrationCommand::Cancel {
                migration_id: MigrationId::new("mig-1"),
            },
        },
        CommandEnvelope {
            command_id: "c-2".to_string(),
            command: MigrationCommand::Cancel {
                migration_id: MigrationId::new("mig-2"),
            },
        },
    ]);
    assert_eq!(source.next_command().unwrap().command_id, "c-1");
    assert_eq!(source.next_command().unwrap().command_id, "c-2");
    assert!(source.next_command().is_none());
}

/// Verifies the channel source drains pushed commands without blocking.
#[tokio::test]
async fn channel_source_drains_pushed_commands() {
    let (sender, mut source) = ChannelSource::new();
    assert!(source.next_command().is_none());

    sender
        .send(CommandEnvelope {
            command_id: "c-1".to_string(),
            command: MigrationCommand::Cancel {
                migration_id: MigrationId::new("mig-1"),
            },
        })
        .unwrap();
    assert_eq!(source.next_command().unwrap().command_id, "c-1");
    assert!(source.next_command().is_none());
}
