//! DHCPv6 client plugin
//!
//! Requests a DHCPv6 client on the interface and detaches: IPv6 never blocks
//! the pipeline, the client keeps running until the instance is finalized.

use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::{Claim, Handover, spawn_cleanup};
use wano_core::registry::PluginDescriptor;
use wano_core::traits::{MASK_IPV6, Plugin, PluginContext, PluginInstance, PluginStatus};

pub const NAME: &str = "dhcpv6";
pub const PRIORITY: i32 = 100;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, PRIORITY, MASK_IPV6, Dhcpv6::default())
}

#[derive(Default)]
pub struct Dhcpv6 {
    /// Client requests per interface
    handover: Handover,
}

impl Plugin for Dhcpv6 {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        Some(Box::new(Dhcpv6Instance {
            ctx,
            handover: self.handover.clone(),
            claim: None,
            task: None,
        }))
    }
}

struct Dhcpv6Instance {
    ctx: PluginContext,
    handover: Handover,
    /// Set once the client was requested
    claim: Option<Claim>,
    task: Option<JoinHandle<()>>,
}

impl PluginInstance for Dhcpv6Instance {
    fn run(&mut self) {
        let ifname = self.ctx.ifname.clone();
        let store = self.ctx.store.clone();
        let reporter = self.ctx.reporter.clone();
        let claim = self.handover.claim(&ifname);
        self.claim = Some(claim.clone());

        self.task = Some(tokio::spawn(async move {
            let result = {
                let _guard = claim.lock().await;
                store.set_dhcpv6_client(&ifname, true).await
            };
            match result {
                Ok(()) => {
                    info!("{}: DHCPv6 client requested.", ifname);
                    reporter.report(PluginStatus::Detach);
                }
                Err(e) => {
                    warn!("{}: Error requesting the DHCPv6 client: {}", ifname, e);
                    reporter.report(PluginStatus::Error);
                }
            }
        }));
    }

    fn fini(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let Some(claim) = self.claim.take() else {
            return;
        };

        let ifname = self.ctx.ifname.clone();
        let store = self.ctx.store.clone();
        spawn_cleanup(claim, move || async move {
            if let Err(e) = store.set_dhcpv6_client(&ifname, false).await {
                warn!("{}: Error stopping the DHCPv6 client: {}", ifname, e);
            }
        });
    }
}
