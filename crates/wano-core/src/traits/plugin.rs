// # Plugin Trait
//
// Defines the interface for WAN provisioning strategies (DHCP, PPPoE, static
// IPv4, VLAN, ...).
//
// ## Lifecycle
//
// 1. `Plugin::init()` is called when the pipeline schedules the plugin on an
//    interface. Returning `None` means "not applicable" and the plugin is
//    silently skipped.
// 2. `PluginInstance::run()` is called once the interface has been reset for
//    the plugin's capabilities.
// 3. The instance reports progress through its `StatusReporter`.
// 4. `PluginInstance::fini()` is called exactly once when the pipeline drops
//    the instance (error, timeout, restart, teardown).
//
// ## Usage
//
// ```rust,ignore
// struct Noop;
//
// impl Plugin for Noop {
//     fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
//         Some(Box::new(NoopInstance { ctx }))
//     }
// }
//
// impl PluginInstance for NoopInstance {
//     fn run(&mut self) {
//         self.ctx.reporter.report(PluginStatus::ok());
//     }
// }
// ```

use std::fmt;
use std::sync::Arc;

use crate::engine::{HostHandle, StatusReporter};
use crate::traits::ConfigStore;
use crate::wan::WanView;

/// Capability bit: layer-2 link ownership
pub const MASK_L2: u64 = 1 << 0;
/// Capability bit: IPv4 addressing
pub const MASK_IPV4: u64 = 1 << 1;
/// Capability bit: IPv6 addressing
pub const MASK_IPV6: u64 = 1 << 2;
/// Every capability
pub const MASK_ALL: u64 = u64::MAX;

/// Status reported by a running plugin instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PluginStatus {
    /// Link provisioned; the pipeline probes reachability before accepting it.
    /// `ifname`/`iftype` override the interface the result applies to.
    Ok {
        ifname: Option<String>,
        iftype: Option<String>,
    },
    /// Interface claimed without asserting layer-3 connectivity
    Reserved {
        ifname: Option<String>,
        iftype: Option<String>,
    },
    /// Plugin failed
    Error,
    /// Plugin is not applicable after all
    Skip,
    /// Plugin is making progress; suspends its timeout
    Busy,
    /// Restart the whole pipeline
    Restart,
    /// Abort the pipeline with maximum backoff
    Abort,
    /// Keep running but stop claiming capabilities
    Detach,
}

impl PluginStatus {
    /// `Ok` on the pipeline's own interface
    pub fn ok() -> Self {
        PluginStatus::Ok {
            ifname: None,
            iftype: None,
        }
    }

    /// `Ok` applying to another interface (e.g. a VLAN or PPP device)
    pub fn ok_on(ifname: impl Into<String>, iftype: impl Into<String>) -> Self {
        PluginStatus::Ok {
            ifname: Some(ifname.into()),
            iftype: Some(iftype.into()),
        }
    }

    /// `Reserved` on the pipeline's own interface
    pub fn reserved() -> Self {
        PluginStatus::Reserved {
            ifname: None,
            iftype: None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PluginStatus::Ok { .. } => "OK",
            PluginStatus::Reserved { .. } => "RESERVED",
            PluginStatus::Error => "ERROR",
            PluginStatus::Skip => "SKIP",
            PluginStatus::Busy => "BUSY",
            PluginStatus::Restart => "RESTART",
            PluginStatus::Abort => "ABORT",
            PluginStatus::Detach => "DETACH",
        }
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PluginStatus::Ok {
                ifname: Some(ifname),
                ..
            }
            | PluginStatus::Reserved {
                ifname: Some(ifname),
                ..
            } => write!(f, "{}({})", self.name(), ifname),
            _ => f.write_str(self.name()),
        }
    }
}

/// Everything a plugin instance gets to work with
#[derive(Clone)]
pub struct PluginContext {
    /// Interface the pipeline runs on
    pub ifname: String,
    /// Interface type of the pipeline
    pub iftype: String,
    /// Store used for declarative interface configuration
    pub store: Arc<dyn ConfigStore>,
    /// WAN configuration selected for this attempt
    pub wan: WanView,
    /// Status mailbox of this instance
    pub reporter: StatusReporter,
    /// Access to orchestrator services (state watches, child pipelines)
    pub host: HostHandle,
}

impl fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContext")
            .field("ifname", &self.ifname)
            .field("iftype", &self.iftype)
            .field("wan", &self.wan)
            .finish()
    }
}

/// A provisioning strategy
///
/// # Trust Level: Semi-Trusted
///
/// ## Allowed Capabilities
/// - ✅ Write declarative interface configuration through `PluginContext::store`
/// - ✅ Spawn tasks owned by the instance (aborted in `fini()`)
/// - ✅ Watch interface state and spawn child pipelines through `PluginContext::host`
///
/// ## Forbidden Capabilities
/// - ❌ Block in `init()`, `run()` or `fini()` (they run on the orchestrator loop)
/// - ❌ Touch uplink status rows (the pipeline owns them)
/// - ❌ Implement retry/backoff (report `Error` and let the pipeline reschedule)
pub trait Plugin: Send + Sync {
    /// Create an instance for `ctx.ifname`, or `None` if not applicable
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>>;
}

/// A plugin bound to one interface
pub trait PluginInstance: Send {
    /// Start provisioning; must return promptly
    fn run(&mut self);

    /// Release everything the instance holds
    fn fini(&mut self) {}
}
