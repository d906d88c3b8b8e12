//! Architectural Contract Test: Plugin Host Services
//!
//! This test verifies the services plugins use to build on other interfaces:
//! interface state watches and child pipelines.
//!
//! Constraints verified:
//! - A state watch delivers changes written by the plugin itself
//! - The probe is sourced from the address the plugin obtained
//! - A child pipeline never runs plugins its owner excluded
//! - A child's success is reported through its owner
//! - A child pipeline dies with the instance that spawned it
//! - A second pipeline on the same interface is refused
//!
//! If this test fails, someone has added:
//! - Plugins that poll the store instead of watching it
//! - Child pipelines that outlive their owner
//! - Interfaces driven by two pipelines at once

mod common;

use common::*;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use wano_core::pipeline::{PipelineEvent, PipelineState};
use wano_core::registry::PluginDescriptor;
use wano_core::traits::{
    AssignScheme, InetConfigUpdate, MASK_ALL, MASK_IPV4, MASK_IPV6, Plugin, PluginContext,
    PluginInstance, PluginStatus,
};
use wano_core::{EngineEvent, MemoryConfigStore, PluginRegistry};

const LEASE: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);

/// Assigns a static address and reports OK once the store shows it
struct AddressingPlugin;

struct AddressingInstance {
    ctx: PluginContext,
    task: Option<JoinHandle<()>>,
}

impl Plugin for AddressingPlugin {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        Some(Box::new(AddressingInstance { ctx, task: None }))
    }
}

impl PluginInstance for AddressingInstance {
    fn run(&mut self) {
        let ifname = self.ctx.ifname.clone();
        let store = self.ctx.store.clone();
        let reporter = self.ctx.reporter.clone();
        let mut watch = self.ctx.host.watch_inet_state(&ifname);

        self.task = Some(tokio::spawn(async move {
            let update = InetConfigUpdate {
                ip_assign_scheme: Some(AssignScheme::Static),
                inet_addr: Some(LEASE),
                ..Default::default()
            };
            if store.update_inet_config(&ifname, &update).await.is_err() {
                reporter.report(PluginStatus::Error);
                return;
            }
            while let Some(snapshot) = watch.recv().await {
                if snapshot.and_then(|s| s.inet_addr) == Some(LEASE) {
                    reporter.report(PluginStatus::ok());
                    return;
                }
            }
        }));
    }

    fn fini(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Spawns a child pipeline and reports the child's outcome
struct ChildSpawningPlugin {
    child: &'static str,
}

struct ChildSpawningInstance {
    ctx: PluginContext,
    child: &'static str,
    task: Option<JoinHandle<()>>,
}

impl Plugin for ChildSpawningPlugin {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        Some(Box::new(ChildSpawningInstance {
            ctx,
            child: self.child,
            task: None,
        }))
    }
}

impl PluginInstance for ChildSpawningInstance {
    fn run(&mut self) {
        let mut watch = self
            .ctx
            .host
            .spawn_pipeline(self.child, "vlan", !(MASK_IPV4 | MASK_IPV6));
        let reporter = self.ctx.reporter.clone();
        let child = self.child;

        self.task = Some(tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                match event {
                    PipelineEvent::Ok => {
                        reporter.report(PluginStatus::ok_on(child, "vlan"));
                    }
                    PipelineEvent::Idle => {
                        reporter.report(PluginStatus::Error);
                    }
                    _ => {}
                }
            }
            // Refused or torn down
            reporter.report(PluginStatus::Error);
        }));
    }

    fn fini(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn vlan_registry(child: &'static str) -> (PluginRegistry, PluginCounters) {
    let (static_plugin, counters) = ScriptedPlugin::new(Some(PluginStatus::ok()));
    let mut registry = PluginRegistry::new();
    registry.register(PluginDescriptor::new(
        "vlan",
        40,
        MASK_ALL,
        ChildSpawningPlugin { child },
    ));
    registry.register(PluginDescriptor::new("static", 90, MASK_IPV4, static_plugin));
    (registry, counters)
}

#[tokio::test]
async fn state_watch_sees_plugin_writes() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;

    let mut registry = PluginRegistry::new();
    registry.register(PluginDescriptor::new("static", 10, MASK_IPV4, AddressingPlugin));
    let probe = Arc::new(ScriptedProbe::new(true));

    let mut running = Running::start(fast_config("eth0"), registry, &store, probe.clone());

    running
        .wait_for("provisioning", |e| is_provisioned(e, "eth0"))
        .await;
    assert_eq!(probe.last_local_addr(), Some(IpAddr::V4(LEASE)));

    running.stop().await;
}

#[tokio::test]
async fn child_result_provisions_owner() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;
    store.set_carrier("eth0.100", true).await;

    let (registry, static_counters) = vlan_registry("eth0.100");
    let mut running = Running::start(
        fast_config("eth0"),
        registry,
        &store,
        Arc::new(ScriptedProbe::new(true)),
    );

    running
        .wait_for("child creation", |e| {
            matches!(e, EngineEvent::PipelineCreated { ifname, iftype } if ifname == "eth0.100" && iftype == "vlan")
        })
        .await;
    running
        .wait_for("child provisioning", |e| is_provisioned(e, "eth0.100"))
        .await;
    let event = running
        .wait_for("owner provisioning", |e| is_provisioned(e, "eth0"))
        .await;
    match event {
        EngineEvent::Provisioned { plugin, target, .. } => {
            assert_eq!(plugin, "vlan");
            assert_eq!(target, "eth0.100");
        }
        other => panic!("unexpected event {:?}", other),
    }

    // The excluded plugin only ever ran on the child
    assert!(
        !running
            .seen()
            .iter()
            .any(|e| is_started(e, "eth0", "static")),
        "static ran on the VLAN owner"
    );
    assert!(
        !running
            .seen()
            .iter()
            .any(|e| is_started(e, "eth0.100", "vlan")),
        "vlan ran on its own child"
    );
    assert_eq!(static_counters.run_call_count(), 1);

    let uplink = store.uplink("eth0.100").await.expect("child uplink row");
    assert_eq!(uplink.has_l3, Some(true));
    assert_eq!(uplink.if_type.as_deref(), Some("vlan"));
    uplink_eventually(&store, "eth0", |row| {
        row.is_some_and(|r| r.has_l2 == Some(true) && r.has_l3.is_none())
    })
    .await;

    running.stop().await;
    assert!(store.uplink("eth0.100").await.is_none());
}

#[tokio::test]
async fn child_dies_with_its_owner() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;
    store.set_carrier("eth0.100", true).await;

    let (registry, static_counters) = vlan_registry("eth0.100");
    let mut running = Running::start(
        fast_config("eth0"),
        registry,
        &store,
        Arc::new(ScriptedProbe::new(true)),
    );

    running
        .wait_for("owner provisioning", |e| is_provisioned(e, "eth0"))
        .await;

    store.set_carrier("eth0", false).await;
    running
        .wait_for("owner restart", |e| is_state(e, "eth0", PipelineState::Init))
        .await;
    running
        .wait_for("child removal", |e| {
            matches!(e, EngineEvent::PipelineRemoved { ifname } if ifname == "eth0.100")
        })
        .await;
    count_eventually("child instance finalized", 1, || {
        static_counters.fini_call_count()
    })
    .await;

    running.stop().await;
}

#[tokio::test]
async fn second_pipeline_on_interface_is_refused() {
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;
    store.set_carrier("eth1", true).await;

    // eth0's plugin tries to take over eth1, which has its own pipeline
    let mut registry = PluginRegistry::new();
    registry.register(PluginDescriptor::new(
        "vlan",
        40,
        MASK_ALL,
        ChildSpawningPlugin { child: "eth1" },
    ));
    let mut running = Running::start(
        fast_config("eth0 eth1"),
        registry,
        &store,
        Arc::new(ScriptedProbe::new(true)),
    );

    running
        .wait_for("refusal reported", |e| {
            matches!(
                e,
                EngineEvent::PluginStatus { ifname, plugin, status: PluginStatus::Error }
                    if ifname == "eth0" && plugin == "vlan"
            )
        })
        .await;

    let created = running
        .seen()
        .iter()
        .filter(|e| matches!(e, EngineEvent::PipelineCreated { ifname, .. } if ifname == "eth1"))
        .count();
    assert_eq!(created, 1, "eth1 got a second pipeline");

    running.stop().await;
}
