//! VLAN plugin
//!
//! Provisions the uplink through an 802.1Q sub-interface. The plugin creates
//! `<ifname>.<vid>` from the `vlan` WAN configuration selected for the current
//! attempt and runs a child pipeline on it. The child only schedules plugins
//! confined to IPv4/IPv6, so VLANs never nest: the parent keeps the VLAN
//! plugin, the child does the addressing.
//!
//! | Child event | Reported status |
//! |-------------|-----------------|
//! | OK          | BUSY (the child owns L3) |
//! | IDLE        | ERROR           |
//! | RESTART     | none            |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Claim, Handover, spawn_cleanup};
use wano_core::engine::{HostHandle, StatusReporter};
use wano_core::pipeline::PipelineEvent;
use wano_core::registry::PluginDescriptor;
use wano_core::traits::{
    AssignScheme, ConfigStore, InetConfigUpdate, InetState, MASK_ALL, MASK_IPV4, MASK_IPV6,
    Plugin, PluginContext, PluginInstance, PluginStatus,
};
use wano_core::wan::{WanConfigStatus, WanParams, WanType};

pub const NAME: &str = "vlan";
pub const PRIORITY: i32 = 40;

/// Interface type of the created sub-interface
pub const VLAN_IFTYPE: &str = "vlan";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, PRIORITY, MASK_ALL, Vlan::default())
}

/// Name of the VLAN interface on top of `parent`
pub fn vlan_ifname(parent: &str, vlan_id: u16) -> String {
    format!("{}.{}", parent, vlan_id)
}

#[derive(Default)]
pub struct Vlan {
    /// VLAN interfaces by name
    handover: Handover,
}

impl Plugin for Vlan {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        let entry = ctx.wan.config_for(WanType::Vlan)?;
        let priority = entry.priority;
        let WanParams::Vlan { vlan_id, qos } = entry.params else {
            return None;
        };
        debug!(
            "{}: VLAN {} selected (qos {:?}, priority {})",
            ctx.ifname, vlan_id, qos, priority
        );

        Some(Box::new(VlanInstance {
            ifvlan: vlan_ifname(&ctx.ifname, vlan_id),
            vlan_id,
            priority,
            created: Arc::new(AtomicBool::new(false)),
            handover: self.handover.clone(),
            claim: None,
            task: None,
            ctx,
        }))
    }
}

struct VlanInstance {
    ctx: PluginContext,
    ifvlan: String,
    vlan_id: u16,
    priority: i64,
    /// The sub-interface was written to the store
    created: Arc<AtomicBool>,
    handover: Handover,
    claim: Option<Claim>,
    task: Option<JoinHandle<()>>,
}

fn is_created(state: &InetState) -> bool {
    state.enabled && state.network && state.ip_assign_scheme == AssignScheme::None
}

/// Everything the VLAN task needs, detached from the instance
struct VlanJob {
    parent: String,
    ifvlan: String,
    vlan_id: u16,
    priority: i64,
    store: Arc<dyn ConfigStore>,
    host: HostHandle,
    reporter: StatusReporter,
    created: Arc<AtomicBool>,
    claim: Claim,
}

impl VlanJob {
    async fn run(self) {
        let mut watch = self.host.watch_inet_state(&self.ifvlan);
        let update = InetConfigUpdate {
            if_type: Some(VLAN_IFTYPE.to_string()),
            parent_ifname: Some(self.parent.clone()),
            vlan_id: Some(self.vlan_id),
            enabled: Some(true),
            network: Some(true),
            ip_assign_scheme: Some(AssignScheme::None),
            ..Default::default()
        };
        let written = {
            let _guard = self.claim.lock().await;
            self.store.update_inet_config(&self.ifvlan, &update).await
        };
        if let Err(e) = written {
            warn!("{}: Error creating VLAN interface {}: {}", self.parent, self.ifvlan, e);
            self.reporter.report(PluginStatus::Error);
            return;
        }
        self.created.store(true, Ordering::SeqCst);

        loop {
            match watch.recv().await {
                Some(Some(state)) if is_created(&state) => break,
                Some(_) => continue,
                None => return,
            }
        }
        drop(watch);
        info!("{}: VLAN interface {} created.", self.parent, self.ifvlan);

        let mut child = self
            .host
            .spawn_pipeline(&self.ifvlan, VLAN_IFTYPE, !(MASK_IPV4 | MASK_IPV6));
        let mut busy = false;
        while let Some(event) = child.recv().await {
            match event {
                PipelineEvent::Ok => {
                    info!("{}: VLAN {} is up.", self.parent, self.ifvlan);
                    self.host
                        .set_wan_status(WanType::Vlan, self.priority, WanConfigStatus::Success);
                    if !busy {
                        busy = true;
                        self.reporter.report(PluginStatus::Busy);
                    }
                }
                PipelineEvent::Idle => {
                    warn!("{}: VLAN {} pipeline went idle.", self.parent, self.ifvlan);
                    self.reporter.report(PluginStatus::Error);
                    return;
                }
                PipelineEvent::Restart => {
                    info!("{}: VLAN {} pipeline restarted.", self.parent, self.ifvlan);
                }
                PipelineEvent::Abort | PipelineEvent::Freeze => {
                    debug!("{}: VLAN {} pipeline event {:?}", self.parent, self.ifvlan, event);
                }
            }
        }

        warn!("{}: Lost the VLAN {} pipeline.", self.parent, self.ifvlan);
        self.reporter.report(PluginStatus::Error);
    }
}

impl PluginInstance for VlanInstance {
    fn run(&mut self) {
        info!("{}: Creating VLAN interface {}", self.ctx.ifname, self.ifvlan);
        let claim = self.handover.claim(&self.ifvlan);
        self.claim = Some(claim.clone());
        let job = VlanJob {
            parent: self.ctx.ifname.clone(),
            ifvlan: self.ifvlan.clone(),
            vlan_id: self.vlan_id,
            priority: self.priority,
            store: self.ctx.store.clone(),
            host: self.ctx.host.clone(),
            reporter: self.ctx.reporter.clone(),
            created: self.created.clone(),
            claim,
        };
        self.task = Some(tokio::spawn(job.run()));
    }

    fn fini(&mut self) {
        // Dropping the task drops the child watch, which tears the child down
        if let Some(task) = self.task.take() {
            task.abort();
        }
        let claim = self.claim.take();
        if !self.created.swap(false, Ordering::SeqCst) {
            return;
        }
        let Some(claim) = claim else {
            return;
        };

        let ifvlan = self.ifvlan.clone();
        let store = self.ctx.store.clone();
        spawn_cleanup(claim, move || async move {
            let update = InetConfigUpdate {
                enabled: Some(false),
                network: Some(false),
                ..Default::default()
            };
            match store.update_inet_config(&ifvlan, &update).await {
                Ok(()) => info!("{}: VLAN interface disabled.", ifvlan),
                Err(e) => warn!("{}: Error disabling VLAN interface: {}", ifvlan, e),
            }
        });
    }
}
