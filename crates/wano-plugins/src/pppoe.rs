//! PPPoE plugin
//!
//! Brings the uplink up through a PPP session on `ppp-<ifname>`, using the
//! credentials of the `pppoe` WAN configuration selected for the current
//! attempt. The PPP interface is first written disabled with its session
//! options, then enabled once the store shows it down. The plugin reports OK
//! on the PPP interface as soon as the session has an address.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Claim, Handover, spawn_cleanup};
use wano_core::engine::{HostHandle, InetStateWatch, StatusReporter};
use wano_core::registry::PluginDescriptor;
use wano_core::traits::{
    ConfigStore, InetConfigUpdate, InetState, MASK_IPV4, MASK_IPV6, Plugin, PluginContext,
    PluginInstance, PluginStatus,
};
use wano_core::wan::{WanConfigStatus, WanParams, WanType};

pub const NAME: &str = "pppoe";
pub const PRIORITY: i32 = 50;

/// Interface type of the PPP device
pub const PPPOE_IFTYPE: &str = "pppoe";

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, PRIORITY, MASK_IPV4 | MASK_IPV6, Pppoe::default())
}

/// Name of the PPP interface riding on `parent`
pub fn ppp_ifname(parent: &str) -> String {
    format!("ppp-{}", parent)
}

#[derive(Default)]
pub struct Pppoe {
    /// PPP interfaces by name
    handover: Handover,
}

impl Plugin for Pppoe {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        Some(Box::new(PppoeInstance {
            ifppp: ppp_ifname(&ctx.ifname),
            handover: self.handover.clone(),
            claim: None,
            priority: None,
            task: None,
            ctx,
        }))
    }
}

struct PppoeInstance {
    ctx: PluginContext,
    ifppp: String,
    handover: Handover,
    /// Set once the PPP interface may have been written
    claim: Option<Claim>,
    /// Priority of the `pppoe` WAN configuration in use
    priority: Option<i64>,
    task: Option<JoinHandle<()>>,
}

fn session_options(username: &str, password: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("username".to_string(), username.to_string()),
        ("password".to_string(), password.to_string()),
    ])
}

/// Everything the session task needs, detached from the instance
struct PppoeJob {
    parent: String,
    ifppp: String,
    priority: i64,
    options: BTreeMap<String, String>,
    store: Arc<dyn ConfigStore>,
    host: HostHandle,
    reporter: StatusReporter,
    claim: Claim,
}

impl PppoeJob {
    async fn write(&self, update: &InetConfigUpdate) -> bool {
        let _guard = self.claim.lock().await;
        match self.store.update_inet_config(&self.ifppp, update).await {
            Ok(()) => true,
            Err(e) => {
                warn!("{}: Error writing PPPoE interface {}: {}", self.parent, self.ifppp, e);
                self.reporter.report(PluginStatus::Error);
                false
            }
        }
    }

    /// Wait for a snapshot of the PPP interface matching `pred`
    async fn wait_until<F>(watch: &mut InetStateWatch, pred: F) -> bool
    where
        F: Fn(&InetState) -> bool,
    {
        while let Some(snapshot) = watch.recv().await {
            if snapshot.as_ref().is_some_and(&pred) {
                return true;
            }
        }
        false
    }

    async fn run(self) {
        let mut watch = self.host.watch_inet_state(&self.ifppp);

        info!(
            "{}: Enabling PPPoE interface {} with parent interface {}.",
            self.parent, self.ifppp, self.parent
        );
        let create = InetConfigUpdate {
            if_type: Some(PPPOE_IFTYPE.to_string()),
            parent_ifname: Some(self.parent.clone()),
            enabled: Some(false),
            network: Some(false),
            ppp_options: Some(self.options.clone()),
            ..Default::default()
        };
        if !self.write(&create).await {
            return;
        }
        if !Self::wait_until(&mut watch, |s| !s.enabled && !s.network).await {
            return;
        }

        info!("{}: Waiting for PPPoE address.", self.ifppp);
        let enable = InetConfigUpdate {
            enabled: Some(true),
            network: Some(true),
            ..Default::default()
        };
        if !self.write(&enable).await {
            return;
        }
        let up = |s: &InetState| s.enabled && s.network && s.inet_addr.is_some();
        if !Self::wait_until(&mut watch, up).await {
            return;
        }
        drop(watch);

        info!("{}: PPPoE session is up.", self.ifppp);
        self.host
            .set_wan_status(WanType::Pppoe, self.priority, WanConfigStatus::Success);
        self.reporter
            .report(PluginStatus::ok_on(&self.ifppp, PPPOE_IFTYPE));
    }
}

impl PluginInstance for PppoeInstance {
    fn run(&mut self) {
        let ifname = self.ctx.ifname.clone();
        let Some((priority, username, password)) =
            self.ctx
                .wan
                .config_for(WanType::Pppoe)
                .and_then(|entry| match &entry.params {
                    WanParams::Pppoe { username, password } => {
                        Some((entry.priority, username.clone(), password.clone()))
                    }
                    _ => None,
                })
        else {
            info!("{}: No PPPoE configuration is present, skipping.", ifname);
            self.ctx.reporter.report(PluginStatus::Skip);
            return;
        };
        debug!("{}: PPPoE account {} (priority {})", ifname, username, priority);

        let claim = self.handover.claim(&self.ifppp);
        self.claim = Some(claim.clone());
        self.priority = Some(priority);

        let job = PppoeJob {
            parent: ifname,
            ifppp: self.ifppp.clone(),
            priority,
            options: session_options(&username, &password),
            store: self.ctx.store.clone(),
            host: self.ctx.host.clone(),
            reporter: self.ctx.reporter.clone(),
            claim,
        };
        self.task = Some(tokio::spawn(job.run()));
    }

    fn fini(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(priority) = self.priority.take() {
            self.ctx
                .host
                .set_wan_status(WanType::Pppoe, priority, WanConfigStatus::Error);
        }
        let Some(claim) = self.claim.take() else {
            return;
        };

        let ifppp = self.ifppp.clone();
        let store = self.ctx.store.clone();
        spawn_cleanup(claim, move || async move {
            let update = InetConfigUpdate {
                enabled: Some(false),
                network: Some(false),
                ..Default::default()
            };
            match store.update_inet_config(&ifppp, &update).await {
                Ok(()) => info!("{}: PPPoE interface disabled.", ifppp),
                Err(e) => warn!("{}: Error disabling PPPoE interface: {}", ifppp, e),
            }
        });
    }
}
