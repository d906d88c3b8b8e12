// # Config Store Trait
//
// Defines the interface to the configuration/state store the orchestrator
// writes its intents to and reads interface state from.
//
// ## Tables
//
// - Interface config (desired state, written) / interface state (observed, read)
// - Bridge port membership (read)
// - Uplink status (written, its `bridge` column is read)
// - WAN configuration rows (read, `status` column written)
//
// ## Implementations
//
// - In-memory: `wano_core::store::MemoryConfigStore`
// - Future: OVSDB or any other row store with change monitoring

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::pin::Pin;
use tokio_stream::Stream;

use crate::Result;

/// IP address assignment scheme of an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssignScheme {
    /// No address management
    #[default]
    None,
    /// Statically assigned address
    Static,
    /// DHCP client
    Dhcp,
}

impl fmt::Display for AssignScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AssignScheme::None => write!(f, "none"),
            AssignScheme::Static => write!(f, "static"),
            AssignScheme::Dhcp => write!(f, "dhcp"),
        }
    }
}

/// Partial update of an interface's desired configuration
///
/// `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetConfigUpdate {
    pub if_type: Option<String>,
    pub enabled: Option<bool>,
    pub network: Option<bool>,
    pub nat: Option<bool>,
    pub ip_assign_scheme: Option<AssignScheme>,
    pub parent_ifname: Option<String>,
    pub vlan_id: Option<u16>,
    pub inet_addr: Option<Ipv4Addr>,
    pub netmask: Option<Ipv4Addr>,
    pub gateway: Option<Ipv4Addr>,
    pub dns_primary: Option<Ipv4Addr>,
    pub dns_secondary: Option<Ipv4Addr>,
    /// PPP session options (credentials) of a `pppoe` interface
    pub ppp_options: Option<BTreeMap<String, String>>,
}

/// Observed interface state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InetState {
    pub ifname: String,
    pub if_type: String,
    pub enabled: bool,
    pub network: bool,
    pub nat: bool,
    pub ip_assign_scheme: AssignScheme,
    /// Currently assigned IPv4 address, if any
    pub inet_addr: Option<Ipv4Addr>,
    /// Carrier (link) state
    pub port_state: bool,
    pub parent_ifname: Option<String>,
    pub vlan_id: Option<u16>,
}

impl InetState {
    pub fn new(ifname: impl Into<String>) -> Self {
        Self {
            ifname: ifname.into(),
            ..Default::default()
        }
    }
}

/// Uplink status row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkState {
    pub ifname: String,
    pub if_type: Option<String>,
    pub has_l2: Option<bool>,
    pub has_l3: Option<bool>,
    pub loop_detected: Option<bool>,
    /// Bridge the uplink is attached to; set by the connection manager
    pub bridge: Option<String>,
}

/// Partial update of an uplink status row; the row is created if missing
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UplinkUpdate {
    pub if_type: Option<String>,
    pub has_l2: Option<bool>,
    /// `Some(None)` clears the column
    pub has_l3: Option<Option<bool>>,
    pub loop_detected: Option<bool>,
}

/// Bridge port membership row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortState {
    pub name: String,
    pub bridge: String,
}

/// Raw WAN configuration row
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanConfigRow {
    /// Stable row identity
    pub uuid: String,
    /// "pppoe", "vlan", "static_ipv4" or "dhcp"
    #[serde(rename = "type")]
    pub wan_type: String,
    pub priority: i64,
    #[serde(default = "default_enable")]
    pub enable: bool,
    #[serde(default)]
    pub other_config: BTreeMap<String, String>,
    #[serde(default)]
    pub status: Option<String>,
}

fn default_enable() -> bool {
    true
}

/// Kind of row change delivered by [`ConfigStore::watch()`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowChange<T> {
    New(T),
    Modify(T),
    /// Row deleted; carries the row key
    Delete(String),
}

/// Change event delivered by [`ConfigStore::watch()`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    InetState(RowChange<InetState>),
    Uplink(RowChange<UplinkState>),
    Port(RowChange<PortState>),
    WanConfig(RowChange<WanConfigRow>),
    /// Changes were lost; everything cached from the store must be re-read
    Resync,
}

/// Trait for configuration store implementations
///
/// All writes are partial updates keyed by interface name. Reads return
/// `Ok(None)` when the row does not exist.
///
/// # Trust Level: Trusted
///
/// The store is the single source of truth for interface and uplink state.
/// The orchestrator never caches a row it did not receive from `watch()` or
/// a `select_*` call.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Apply a partial update to the interface's desired configuration
    async fn update_inet_config(&self, ifname: &str, update: &InetConfigUpdate) -> Result<()>;

    /// Read the observed interface state
    async fn select_inet_state(&self, ifname: &str) -> Result<Option<InetState>>;

    /// Purge IPv6 addressing, prefix delegation, DHCPv6 and router
    /// advertisement configuration of the interface
    ///
    /// Implementations must keep the interface's IP row because QoS links hang
    /// off it.
    async fn reset_ipv6(&self, ifname: &str) -> Result<()>;

    /// Enable or disable the DHCPv6 client on the interface
    async fn set_dhcpv6_client(&self, ifname: &str, enable: bool) -> Result<()>;

    /// Apply a partial update to the uplink status row
    async fn update_uplink(&self, ifname: &str, update: &UplinkUpdate) -> Result<()>;

    /// Delete the uplink status row; returns true if a row was removed
    async fn delete_uplink(&self, ifname: &str) -> Result<bool>;

    /// Read the uplink status row
    async fn select_uplink(&self, ifname: &str) -> Result<Option<UplinkState>>;

    /// Read the bridge port membership row
    async fn select_port(&self, name: &str) -> Result<Option<PortState>>;

    /// Read all WAN configuration rows
    async fn select_wan_configs(&self) -> Result<Vec<WanConfigRow>>;

    /// Write the status column of every WAN row matching (type, priority);
    /// `None` clears the column
    async fn set_wan_config_status(
        &self,
        wan_type: &str,
        priority: i64,
        status: Option<&str>,
    ) -> Result<()>;

    /// Stream of row changes
    ///
    /// Called once by the orchestrator at startup.
    fn watch(&self) -> Pin<Box<dyn Stream<Item = StoreEvent> + Send + 'static>>;
}
