//! Static IPv4 plugin
//!
//! Applies the `static_ipv4` WAN configuration selected for the current
//! attempt. The address, netmask, gateway and DNS servers are written in one
//! interface config update; the plugin reports OK once the interface shows
//! the configured address.
//!
//! A static address belongs to a single uplink: while one instance holds the
//! configuration, instances on other interfaces are not started.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use wano_core::registry::PluginDescriptor;
use wano_core::traits::{
    AssignScheme, InetConfigUpdate, InetState, MASK_IPV4, Plugin, PluginContext, PluginInstance,
    PluginStatus,
};
use wano_core::wan::{WanConfigStatus, WanParams, WanType};

pub const NAME: &str = "static_ipv4";
pub const PRIORITY: i32 = 90;

pub fn descriptor() -> PluginDescriptor {
    PluginDescriptor::new(NAME, PRIORITY, MASK_IPV4, StaticIpv4::default())
}

#[derive(Default)]
pub struct StaticIpv4 {
    /// Instance holding the static configuration, 0 when free
    owner: Arc<AtomicU64>,
}

impl Plugin for StaticIpv4 {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        if self.owner.load(Ordering::SeqCst) != 0 {
            info!("{}: Another plug-in instance is active, not starting.", ctx.ifname);
            return None;
        }
        Some(Box::new(StaticIpv4Instance {
            ctx,
            owner: self.owner.clone(),
            priority: None,
            task: None,
        }))
    }
}

struct StaticIpv4Instance {
    ctx: PluginContext,
    owner: Arc<AtomicU64>,
    /// Priority of the applied WAN configuration
    priority: Option<i64>,
    task: Option<JoinHandle<()>>,
}

fn static_update(params: &WanParams) -> Option<InetConfigUpdate> {
    let WanParams::StaticIpv4 {
        ip,
        subnet,
        gateway,
        primary_dns,
        secondary_dns,
    } = params
    else {
        return None;
    };

    Some(InetConfigUpdate {
        enabled: Some(true),
        network: Some(true),
        ip_assign_scheme: Some(AssignScheme::Static),
        inet_addr: Some(*ip),
        netmask: Some(*subnet),
        gateway: Some(*gateway),
        dns_primary: Some(*primary_dns),
        dns_secondary: *secondary_dns,
        ..Default::default()
    })
}

fn is_applied(state: &InetState, addr: Ipv4Addr) -> bool {
    state.enabled
        && state.network
        && state.ip_assign_scheme == AssignScheme::Static
        && state.inet_addr == Some(addr)
}

impl PluginInstance for StaticIpv4Instance {
    fn run(&mut self) {
        let ifname = self.ctx.ifname.clone();
        let Some((priority, update)) = self
            .ctx
            .wan
            .config_for(WanType::StaticIpv4)
            .and_then(|entry| Some((entry.priority, static_update(&entry.params)?)))
        else {
            info!("{}: No static IPv4 configuration present, skipping.", ifname);
            self.ctx.reporter.report(PluginStatus::Skip);
            return;
        };
        let Some(addr) = update.inet_addr else {
            self.ctx.reporter.report(PluginStatus::Skip);
            return;
        };
        let id = self.ctx.reporter.instance();
        if self
            .owner
            .compare_exchange(0, id, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            info!("{}: Static IPv4 configuration in use on another interface, skipping.", ifname);
            self.ctx.reporter.report(PluginStatus::Skip);
            return;
        }
        self.priority = Some(priority);

        info!(
            "{}: Applying static IPv4 address {} netmask {:?} gateway {:?}",
            ifname, addr, update.netmask, update.gateway
        );

        let store = self.ctx.store.clone();
        let reporter = self.ctx.reporter.clone();
        let host = self.ctx.host.clone();
        let mut watch = host.watch_inet_state(&ifname);

        self.task = Some(tokio::spawn(async move {
            if let Err(e) = store.update_inet_config(&ifname, &update).await {
                warn!("{}: Error writing static IPv4 settings: {}", ifname, e);
                reporter.report(PluginStatus::Error);
                return;
            }

            while let Some(snapshot) = watch.recv().await {
                if snapshot.as_ref().is_some_and(|s| is_applied(s, addr)) {
                    info!("{}: Static IPv4 address {} is up.", ifname, addr);
                    host.set_wan_status(WanType::StaticIpv4, priority, WanConfigStatus::Success);
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
        let id = self.ctx.reporter.instance();
        if self
            .owner
            .compare_exchange(id, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("{}: Released the static IPv4 configuration", self.ctx.ifname);
        }
        // The configuration is no longer in use on this interface
        if let Some(priority) = self.priority.take() {
            self.ctx
                .host
                .set_wan_status(WanType::StaticIpv4, priority, WanConfigStatus::Error);
        }
    }
}
