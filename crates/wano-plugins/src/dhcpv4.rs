//! DHCPv4 client plugin
//!
//! Switches the interface to DHCP addressing and reports OK as soon as a
//! lease shows up in the interface state. Being DHCP-class, it only runs once
//! the WAN selector reached its last configuration, or when the current
//! configuration asks for DHCP explicitly.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use wano_core::registry::PluginDescriptor;
use wano_core::traits::{
    AssignScheme, InetConfigUpdate, MASK_IPV4, Plugin, PluginContext, PluginInstance,
    PluginStatus,
};
use wano_core::wan::{WanConfigStatus, WanType};

pub const NAME: &str = "dhcpv4";
pub const PRIORITY: i32 = 100;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, PRIORITY, MASK_IPV4, Dhcpv4).dhcp_class()
}

pub struct Dhcpv4;

impl Plugin for Dhcpv4 {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        Some(Box::new(Dhcpv4Instance {
            ctx,
            priority: None,
            task: None,
        }))
    }
}

struct Dhcpv4Instance {
    ctx: PluginContext,
    /// Priority of the `dhcp` WAN configuration in use, once running
    priority: Option<i64>,
    task: Option<JoinHandle<()>>,
}

impl PluginInstance for Dhcpv4Instance {
    fn run(&mut self) {
        let ifname = self.ctx.ifname.clone();
        let store = self.ctx.store.clone();
        let reporter = self.ctx.reporter.clone();
        let host = self.ctx.host.clone();
        // A `dhcp` WAN row at the current priority gets its status reported
        self.priority = self.ctx.wan.config_for(WanType::Dhcp).map(|e| e.priority);
        let priority = self.priority;
        let mut watch = host.watch_inet_state(&ifname);

        info!("{}: Starting DHCPv4 client.", ifname);
        self.task = Some(tokio::spawn(async move {
            let update = InetConfigUpdate {
                enabled: Some(true),
                network: Some(true),
                ip_assign_scheme: Some(AssignScheme::Dhcp),
                ..Default::default()
            };
            if let Err(e) = store.update_inet_config(&ifname, &update).await {
                warn!("{}: Error enabling the DHCPv4 client: {}", ifname, e);
                reporter.report(PluginStatus::Error);
                return;
            }

            while let Some(snapshot) = watch.recv().await {
                let lease = snapshot
                    .filter(|s| s.ip_assign_scheme == AssignScheme::Dhcp)
                    .and_then(|s| s.inet_addr);
                if let Some(addr) = lease {
                    info!("{}: DHCPv4 lease acquired: {}", ifname, addr);
                    if let Some(priority) = priority {
                        host.set_wan_status(WanType::Dhcp, priority, WanConfigStatus::Success);
                    }
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
        if let Some(priority) = self.priority.take() {
            self.ctx
                .host
                .set_wan_status(WanType::Dhcp, priority, WanConfigStatus::Error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use wano_core::engine::detached::detached_context;
    use wano_core::{EngineEvent, MemoryConfigStore};

    const LEASE: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 77);

    #[test]
    fn test_descriptor_is_dhcp_class() {
        let descriptor = descriptor();
        assert_eq!(descriptor.name(), NAME);
        assert!(descriptor.is_dhcp_class());
    }

    #[tokio::test]
    async fn test_lease_provisions_interface() {
        let store = MemoryConfigStore::new();
        store.set_dhcp_lease(Some(LEASE)).await;
        store.set_carrier("eth0", true).await;

        let mut harness = Harness::start(&store, builtin_registry());

        // static_ipv4 skips without configuration, then DHCP takes over
        harness
            .wait_for("static skip", |e| {
                is_status(e, crate::static_ipv4::NAME, &PluginStatus::Skip)
            })
            .await;
        let event = harness
            .wait_for("provisioning", |e| {
                matches!(e, EngineEvent::Provisioned { ifname, .. } if ifname == "eth0")
            })
            .await;
        assert!(matches!(event, EngineEvent::Provisioned { plugin, .. } if plugin == NAME));

        let state = store.inet_state("eth0").await.expect("interface row");
        assert_eq!(state.ip_assign_scheme, AssignScheme::Dhcp);
        assert_eq!(state.inet_addr, Some(LEASE));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_reports_status_of_dhcp_configuration() {
        let store = MemoryConfigStore::new();
        store.set_dhcp_lease(Some(LEASE)).await;
        store.set_carrier("eth0", true).await;
        store.insert_wan_config(wan_row("dhcp", "dhcp", 10, &[])).await;

        let mut harness = Harness::start(&store, builtin_registry());

        harness
            .wait_for("provisioning", |e| {
                matches!(e, EngineEvent::Provisioned { ifname, .. } if ifname == "eth0")
            })
            .await;
        eventually("success status on the WAN row", || {
            let store = store.clone();
            async move { store.wan_configs().await[0].status.as_deref() == Some("success") }
        })
        .await;

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unstarted_instance_leaves_wan_status_alone() {
        let store = Arc::new(MemoryConfigStore::new());
        store.insert_wan_config(wan_row("dhcp", "dhcp", 10, &[])).await;
        let view = wan_view(&store.wan_configs().await);

        // Initialized for the attempt but never scheduled
        let (ctx, mut host) = detached_context("eth0", "eth", store.clone(), view.clone());
        let mut idle = Dhcpv4.init(ctx).expect("dhcpv4 always starts");
        idle.fini();
        assert!(host.wan_statuses().is_empty());

        let (ctx, mut host) = detached_context("eth0", "eth", store.clone(), view);
        let mut running = Dhcpv4.init(ctx).expect("dhcpv4 always starts");
        running.run();
        running.fini();
        assert_eq!(
            host.wan_statuses(),
            vec![(WanType::Dhcp, 10, WanConfigStatus::Error)]
        );
    }
}
