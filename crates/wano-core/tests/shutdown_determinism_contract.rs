//! Architectural Contract Test: Shutdown Determinism
//!
//! This test verifies that shutdown is deterministic and complete.
//!
//! Constraints verified:
//! - Orchestrator terminates on shutdown signal
//! - Every plugin instance is finalized exactly once
//! - Uplink status rows are removed before exit
//! - A Stopped event is the last thing emitted
//!
//! If this test fails, someone has added:
//! - Detached background tasks
//! - Plugin instances that are dropped without fini()
//! - Store writes that are queued but never flushed
//! - Blocking operations in shutdown path

mod common;

use common::*;
use std::sync::Arc;
use wano_core::registry::PluginDescriptor;
use wano_core::traits::{AlwaysReachable, MASK_IPV4, MASK_IPV6, PluginStatus};
use wano_core::{EngineEvent, MemoryConfigStore, PluginRegistry};

#[tokio::test]
async fn shutdown_signal_terminates_orchestrator() {
    let store = MemoryConfigStore::new();
    let mut running = Running::start(
        fast_config(""),
        PluginRegistry::new(),
        &store,
        Arc::new(AlwaysReachable),
    );

    running
        .wait_for("startup", |e| matches!(e, EngineEvent::Started { pipelines: 0 }))
        .await;

    let events = running.stop().await;
    assert!(
        matches!(events.last(), Some(EngineEvent::Stopped { .. })),
        "Stopped must be the last event, got {:?}",
        events.last()
    );
}

#[tokio::test]
async fn shutdown_finalizes_every_instance() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;
    store.set_carrier("eth1", true).await;

    let (provisioning, provisioning_counters) = ScriptedPlugin::new(Some(PluginStatus::ok()));
    let (silent, silent_counters) = ScriptedPlugin::new(None);
    let mut registry = PluginRegistry::new();
    registry.register(PluginDescriptor::new("v4", 10, MASK_IPV4, provisioning));
    registry.register(PluginDescriptor::new("v6", 10, MASK_IPV6, silent));

    let mut running = Running::start(
        fast_config("eth0 eth1"),
        registry,
        &store,
        Arc::new(AlwaysReachable),
    );

    running
        .wait_for("eth0 provisioning", |e| is_provisioned(e, "eth0"))
        .await;
    running
        .wait_for("eth1 provisioning", |e| is_provisioned(e, "eth1"))
        .await;
    assert!(store.uplink("eth0").await.is_some());

    let events = running.stop().await;
    assert!(matches!(events.last(), Some(EngineEvent::Stopped { .. })));

    assert_eq!(provisioning_counters.active_count(), 0);
    assert_eq!(silent_counters.active_count(), 0);
    assert_eq!(
        provisioning_counters.fini_call_count(),
        provisioning_counters.init_call_count(),
        "every instance finalized exactly once"
    );
    assert_eq!(
        silent_counters.fini_call_count(),
        silent_counters.init_call_count(),
        "every instance finalized exactly once"
    );

    assert!(store.uplink("eth0").await.is_none(), "eth0 uplink row left behind");
    assert!(store.uplink("eth1").await.is_none(), "eth1 uplink row left behind");
}

#[tokio::test]
async fn reporting_after_shutdown_is_harmless() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;

    let (plugin, counters) = ScriptedPlugin::new(None);
    let mut registry = PluginRegistry::new();
    registry.register(PluginDescriptor::new("late", 10, MASK_IPV4, plugin));

    let mut running = Running::start(
        fast_config("eth0"),
        registry,
        &store,
        Arc::new(AlwaysReachable),
    );
    running
        .wait_for("plugin start", |e| is_started(e, "eth0", "late"))
        .await;
    let reporter = counters.last_reporter().expect("instance ran");

    running.stop().await;
    assert!(
        !reporter.report(PluginStatus::ok()),
        "reporter must notice the orchestrator is gone"
    );
}
