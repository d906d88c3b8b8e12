// # Reachability Probe Trait
//
// Validates a freshly provisioned link before the pipeline declares success.
//
// ## Implementations
//
// - DNS resolution probe: `wano_core::probe::DnsProbe`
// - `AlwaysReachable` for setups without a probe target

use async_trait::async_trait;
use std::net::IpAddr;

/// Trait for reachability probe implementations
///
/// The probe runs in its own task; the orchestrator loop is never blocked on
/// it.
///
/// # Fail-open
///
/// Implementations must return `true` when they cannot run at all (no target,
/// no resolvers). Only positive evidence of a dead link returns `false`.
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// Probe reachability through `ifname`
    ///
    /// # Parameters
    ///
    /// - `ifname`: Interface the link was provisioned on
    /// - `local_addr`: Address assigned to the interface, used as the source
    ///   address of the probe when known
    async fn probe(&self, ifname: &str, local_addr: Option<IpAddr>) -> bool;
}

/// Probe that always succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReachable;

#[async_trait]
impl ReachabilityProbe for AlwaysReachable {
    async fn probe(&self, _ifname: &str, _local_addr: Option<IpAddr>) -> bool {
        true
    }
}
