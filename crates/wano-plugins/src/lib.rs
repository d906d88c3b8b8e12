// # Built-in WAN Plugins
//
// Provisioning strategies shipped with the orchestrator. Every plugin is
// declarative: it writes interface intents to the config store, watches the
// resulting interface state and reports the outcome to its pipeline.
//
// | Plugin        | Priority | Mask      | Notes                                  |
// |---------------|----------|-----------|----------------------------------------|
// | `vlan`        | 40       | ALL       | Runs a child pipeline on `ifname.vid`  |
// | `pppoe`       | 50       | IPV4 IPV6 | Reports OK on `ppp-<ifname>`           |
// | `static_ipv4` | 90       | IPV4      | One interface at a time                |
// | `dhcpv4`      | 100      | IPV4      | DHCP-class, waits for the last config  |
// | `dhcpv6`      | 100      | IPV6      | Detaches once the client is requested  |
//
// ## Usage
//
// ```rust,ignore
// let mut registry = PluginRegistry::new();
// wano_plugins::register(&mut registry);
// ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, warn};
use wano_core::PluginRegistry;

pub mod dhcpv4;
pub mod dhcpv6;
pub mod pppoe;
pub mod static_ipv4;
pub mod vlan;

/// Register every built-in plugin
pub fn register(registry: &mut PluginRegistry) {
    registry.register(vlan::descriptor());
    registry.register(pppoe::descriptor());
    registry.register(static_ipv4::descriptor());
    registry.register(dhcpv4::descriptor());
    registry.register(dhcpv6::descriptor());
}

/// Ordering of store writes on a shared resource across plugin instances
///
/// An instance claims the resource it provisions when it runs. Writes made
/// under a claim are serialized with every other claim on the same resource,
/// and a newer claim supersedes older ones so that a late cleanup never undoes
/// the work of the instance that replaced it.
#[derive(Debug, Clone, Default)]
pub(crate) struct Handover {
    resources: Arc<Mutex<HashMap<String, Arc<Resource>>>>,
}

#[derive(Debug, Default)]
struct Resource {
    generation: AtomicU64,
    lock: tokio::sync::Mutex<()>,
}

impl Handover {
    /// Claim `key`, superseding every earlier claim on it
    pub(crate) fn claim(&self, key: &str) -> Claim {
        let resource = self
            .resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.to_string())
            .or_default()
            .clone();
        let generation = resource.generation.fetch_add(1, Ordering::SeqCst) + 1;
        Claim {
            key: key.to_string(),
            resource,
            generation,
        }
    }
}

/// One instance's hold on a resource
#[derive(Debug, Clone)]
pub(crate) struct Claim {
    key: String,
    resource: Arc<Resource>,
    generation: u64,
}

impl Claim {
    /// No newer claim was taken on the resource
    pub(crate) fn is_current(&self) -> bool {
        self.resource.generation.load(Ordering::SeqCst) == self.generation
    }

    /// Wait for writes under other claims to finish
    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.resource.lock.lock().await
    }
}

/// Run the cleanup of a finalized instance on the current runtime
///
/// `fini()` is synchronous; cleanup writes to the store are handed to the
/// runtime instead. The cleanup is dropped if another instance claimed the
/// resource in the meantime.
fn spawn_cleanup<F, Fut>(claim: Claim, f: F)
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        warn!("{}: No runtime available, skipping plug-in cleanup", claim.key);
        return;
    };
    handle.spawn(async move {
        let _guard = claim.lock().await;
        if !claim.is_current() {
            debug!("{}: Taken over by a newer plug-in instance, skipping cleanup", claim.key);
            return;
        }
        f().await;
    });
}
