// # Memory Config Store
//
// In-memory implementation of ConfigStore.
//
// ## Purpose
//
// Stands in for the device configuration database when running the
// orchestrator without one: tests, demos and the daemon's dry-run mode.
//
// ## Behavior
//
// - Interface config writes are mirrored straight into the observed interface
//   state (no real network stack behind it)
// - Setting the assignment scheme to `none` drops the interface address
// - Setting it to `dhcp` acquires the configured lease, if any, once the
//   interface has carrier
// - VLAN and PPPoE interfaces follow the carrier of their parent
// - A PPPoE interface gets the session address of the configured account once
//   it is enabled with matching credentials
// - Every change is broadcast to `watch()` streams; a watcher that falls
//   behind receives `StoreEvent::Resync` in place of the lost events
//
// ## Crash Behavior
//
// - All state is lost on restart/crash

use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use crate::Error;
use crate::traits::{
    AssignScheme, ConfigStore, InetConfigUpdate, InetState, PortState, RowChange, StoreEvent,
    UplinkState, UplinkUpdate, WanConfigRow,
};

const EVENT_CAPACITY: usize = 1024;

const PPPOE_IFTYPE: &str = "pppoe";

/// Simulated PPPoE access concentrator account
#[derive(Debug, Clone)]
struct PppAccount {
    username: String,
    password: String,
    lease: Ipv4Addr,
}

#[derive(Debug, Default)]
struct Tables {
    inet: BTreeMap<String, InetState>,
    uplinks: BTreeMap<String, UplinkState>,
    ports: BTreeMap<String, PortState>,
    /// Keyed by row identity
    wan: BTreeMap<String, WanConfigRow>,
    dhcpv6_clients: BTreeMap<String, bool>,
    ipv6_resets: BTreeMap<String, usize>,
    uplink_deletes: usize,
    dhcp_lease: Option<Ipv4Addr>,
    ppp_options: BTreeMap<String, BTreeMap<String, String>>,
    ppp_account: Option<PppAccount>,
}

impl Tables {
    /// Session address of a PPPoE interface whose credentials match the account
    fn ppp_lease(&self, ifname: &str) -> Option<Ipv4Addr> {
        let account = self.ppp_account.as_ref()?;
        let options = self.ppp_options.get(ifname)?;
        let authenticated = options.get("username") == Some(&account.username)
            && options.get("password") == Some(&account.password);
        authenticated.then_some(account.lease)
    }

    /// Re-derive the address of an interface after a config or carrier change
    fn settle_addr(&mut self, ifname: &str) {
        let lease = self.dhcp_lease;
        let ppp_lease = self.ppp_lease(ifname);
        if let Some(state) = self.inet.get_mut(ifname) {
            if state.if_type == PPPOE_IFTYPE {
                let up = state.enabled && state.network && state.port_state;
                state.inet_addr = ppp_lease.filter(|_| up);
                return;
            }
            match state.ip_assign_scheme {
                AssignScheme::None => state.inet_addr = None,
                AssignScheme::Dhcp if state.inet_addr.is_none() => {
                    if state.enabled && state.port_state {
                        state.inet_addr = lease;
                    }
                }
                AssignScheme::Dhcp | AssignScheme::Static => {}
            }
        }
    }
}

/// In-memory configuration store
///
/// # Example
///
/// ```rust,no_run
/// use wano_core::store::MemoryConfigStore;
/// use wano_core::traits::ConfigStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryConfigStore::new();
///     store.set_carrier("eth0", true).await;
///
///     let state = store.select_inet_state("eth0").await?;
///     assert!(state.map(|s| s.port_state).unwrap_or(false));
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<Tables>>,
    tx: broadcast::Sender<StoreEvent>,
}

impl MemoryConfigStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::with_event_capacity(EVENT_CAPACITY)
    }

    /// Create a store whose watchers buffer at most `capacity` changes
    pub fn with_event_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(RwLock::new(Tables::default())),
            tx,
        }
    }

    fn publish(&self, event: StoreEvent) {
        // No receivers is fine: nobody is watching yet
        let _ = self.tx.send(event);
    }

    fn publish_inet(&self, state: &InetState, created: bool) {
        let change = if created {
            RowChange::New(state.clone())
        } else {
            RowChange::Modify(state.clone())
        };
        self.publish(StoreEvent::InetState(change));
    }

    /// Address handed out when an interface switches to DHCP
    pub async fn set_dhcp_lease(&self, lease: Option<Ipv4Addr>) {
        self.inner.write().await.dhcp_lease = lease;
    }

    /// Accept PPPoE sessions with these credentials and hand out `lease`
    pub async fn set_ppp_account(&self, username: &str, password: &str, lease: Ipv4Addr) {
        self.inner.write().await.ppp_account = Some(PppAccount {
            username: username.to_string(),
            password: password.to_string(),
            lease,
        });
    }

    /// Set the carrier of an interface (created if missing)
    ///
    /// VLAN and PPPoE interfaces on top of `ifname` follow.
    pub async fn set_carrier(&self, ifname: &str, up: bool) {
        let mut tables = self.inner.write().await;
        let mut touched = vec![ifname.to_string()];
        touched.extend(
            tables
                .inet
                .values()
                .filter(|s| s.parent_ifname.as_deref() == Some(ifname))
                .map(|s| s.ifname.clone()),
        );

        for name in touched {
            let created = !tables.inet.contains_key(&name);
            let state = tables
                .inet
                .entry(name.clone())
                .or_insert_with(|| InetState::new(name.clone()));
            state.port_state = up;
            if !up && state.ip_assign_scheme == AssignScheme::Dhcp {
                state.inet_addr = None;
            }
            tables.settle_addr(&name);
            if let Some(state) = tables.inet.get(&name) {
                self.publish_inet(state, created);
            }
        }
    }

    /// Force the observed address of an interface
    pub async fn assign_addr(&self, ifname: &str, addr: Option<Ipv4Addr>) {
        let mut tables = self.inner.write().await;
        let created = !tables.inet.contains_key(ifname);
        let state = tables
            .inet
            .entry(ifname.to_string())
            .or_insert_with(|| InetState::new(ifname));
        state.inet_addr = addr;
        let state = state.clone();
        drop(tables);
        self.publish_inet(&state, created);
    }

    /// Add or replace a bridge port row
    pub async fn set_port(&self, name: &str, bridge: &str) {
        let row = PortState {
            name: name.to_string(),
            bridge: bridge.to_string(),
        };
        let created = self
            .inner
            .write()
            .await
            .ports
            .insert(name.to_string(), row.clone())
            .is_none();
        self.publish(StoreEvent::Port(if created {
            RowChange::New(row)
        } else {
            RowChange::Modify(row)
        }));
    }

    pub async fn remove_port(&self, name: &str) {
        if self.inner.write().await.ports.remove(name).is_some() {
            self.publish(StoreEvent::Port(RowChange::Delete(name.to_string())));
        }
    }

    /// Set the bridge column of an uplink row (created if missing)
    pub async fn set_uplink_bridge(&self, ifname: &str, bridge: Option<&str>) {
        let mut tables = self.inner.write().await;
        let created = !tables.uplinks.contains_key(ifname);
        let row = tables
            .uplinks
            .entry(ifname.to_string())
            .or_insert_with(|| UplinkState {
                ifname: ifname.to_string(),
                ..Default::default()
            });
        row.bridge = bridge.map(str::to_string);
        let row = row.clone();
        drop(tables);
        self.publish(StoreEvent::Uplink(if created {
            RowChange::New(row)
        } else {
            RowChange::Modify(row)
        }));
    }

    /// Add or replace a WAN configuration row
    pub async fn insert_wan_config(&self, row: WanConfigRow) {
        let created = self
            .inner
            .write()
            .await
            .wan
            .insert(row.uuid.clone(), row.clone())
            .is_none();
        self.publish(StoreEvent::WanConfig(if created {
            RowChange::New(row)
        } else {
            RowChange::Modify(row)
        }));
    }

    pub async fn remove_wan_config(&self, uuid: &str) {
        if self.inner.write().await.wan.remove(uuid).is_some() {
            self.publish(StoreEvent::WanConfig(RowChange::Delete(uuid.to_string())));
        }
    }

    /// Load WAN configuration rows from a JSON array file
    ///
    /// # Errors
    ///
    /// Returns an error if the file can't be read or parsed.
    pub async fn load_wan_seed(&self, path: impl AsRef<Path>) -> Result<usize, Error> {
        let contents = tokio::fs::read_to_string(path.as_ref()).await?;
        let rows: Vec<WanConfigRow> = serde_json::from_str(&contents)?;
        let count = rows.len();
        for row in rows {
            self.insert_wan_config(row).await;
        }
        Ok(count)
    }

    pub async fn inet_state(&self, ifname: &str) -> Option<InetState> {
        self.inner.read().await.inet.get(ifname).cloned()
    }

    pub async fn uplink(&self, ifname: &str) -> Option<UplinkState> {
        self.inner.read().await.uplinks.get(ifname).cloned()
    }

    pub async fn wan_configs(&self) -> Vec<WanConfigRow> {
        self.inner.read().await.wan.values().cloned().collect()
    }

    pub async fn ppp_options(&self, ifname: &str) -> Option<BTreeMap<String, String>> {
        self.inner.read().await.ppp_options.get(ifname).cloned()
    }

    pub async fn dhcpv6_client(&self, ifname: &str) -> Option<bool> {
        self.inner.read().await.dhcpv6_clients.get(ifname).copied()
    }

    /// Number of IPv6 resets performed on `ifname`
    pub async fn ipv6_resets(&self, ifname: &str) -> usize {
        self.inner
            .read()
            .await
            .ipv6_resets
            .get(ifname)
            .copied()
            .unwrap_or(0)
    }

    /// Number of uplink rows actually deleted
    pub async fn uplink_deletes(&self) -> usize {
        self.inner.read().await.uplink_deletes
    }
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn update_inet_config(&self, ifname: &str, update: &InetConfigUpdate) -> Result<(), Error> {
        let mut tables = self.inner.write().await;
        let parent_carrier = update
            .parent_ifname
            .as_ref()
            .and_then(|p| tables.inet.get(p))
            .map(|p| p.port_state);
        if let Some(options) = &update.ppp_options {
            tables
                .ppp_options
                .insert(ifname.to_string(), options.clone());
        }

        let created = !tables.inet.contains_key(ifname);
        let state = tables
            .inet
            .entry(ifname.to_string())
            .or_insert_with(|| InetState::new(ifname));

        if let Some(if_type) = &update.if_type {
            state.if_type = if_type.clone();
        }
        if let Some(enabled) = update.enabled {
            state.enabled = enabled;
        }
        if let Some(network) = update.network {
            state.network = network;
        }
        if let Some(nat) = update.nat {
            state.nat = nat;
        }
        if let Some(scheme) = update.ip_assign_scheme {
            if scheme != state.ip_assign_scheme {
                state.inet_addr = None;
            }
            state.ip_assign_scheme = scheme;
        }
        if update.parent_ifname.is_some() {
            state.parent_ifname = update.parent_ifname.clone();
        }
        if update.vlan_id.is_some() {
            state.vlan_id = update.vlan_id;
        }
        if let Some(carrier) = parent_carrier {
            state.port_state = carrier;
        }
        if state.ip_assign_scheme == AssignScheme::Static && update.inet_addr.is_some() {
            state.inet_addr = update.inet_addr;
        }

        tables.settle_addr(ifname);
        let state = tables.inet.get(ifname).cloned();
        drop(tables);

        if let Some(state) = state {
            debug!("{}: inet config {:?}", ifname, update);
            self.publish_inet(&state, created);
        }
        Ok(())
    }

    async fn select_inet_state(&self, ifname: &str) -> Result<Option<InetState>, Error> {
        Ok(self.inner.read().await.inet.get(ifname).cloned())
    }

    async fn reset_ipv6(&self, ifname: &str) -> Result<(), Error> {
        let mut tables = self.inner.write().await;
        *tables.ipv6_resets.entry(ifname.to_string()).or_default() += 1;
        tables.dhcpv6_clients.remove(ifname);
        Ok(())
    }

    async fn set_dhcpv6_client(&self, ifname: &str, enable: bool) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .dhcpv6_clients
            .insert(ifname.to_string(), enable);
        Ok(())
    }

    async fn update_uplink(&self, ifname: &str, update: &UplinkUpdate) -> Result<(), Error> {
        let mut tables = self.inner.write().await;
        let created = !tables.uplinks.contains_key(ifname);
        let row = tables
            .uplinks
            .entry(ifname.to_string())
            .or_insert_with(|| UplinkState {
                ifname: ifname.to_string(),
                ..Default::default()
            });

        if let Some(if_type) = &update.if_type {
            row.if_type = Some(if_type.clone());
        }
        if let Some(has_l2) = update.has_l2 {
            row.has_l2 = Some(has_l2);
        }
        if let Some(has_l3) = update.has_l3 {
            row.has_l3 = has_l3;
        }
        if let Some(loop_detected) = update.loop_detected {
            row.loop_detected = Some(loop_detected);
        }
        let row = row.clone();
        drop(tables);

        self.publish(StoreEvent::Uplink(if created {
            RowChange::New(row)
        } else {
            RowChange::Modify(row)
        }));
        Ok(())
    }

    async fn delete_uplink(&self, ifname: &str) -> Result<bool, Error> {
        let mut tables = self.inner.write().await;
        let removed = tables.uplinks.remove(ifname).is_some();
        if removed {
            tables.uplink_deletes += 1;
        }
        drop(tables);

        if removed {
            self.publish(StoreEvent::Uplink(RowChange::Delete(ifname.to_string())));
        }
        Ok(removed)
    }

    async fn select_uplink(&self, ifname: &str) -> Result<Option<UplinkState>, Error> {
        Ok(self.inner.read().await.uplinks.get(ifname).cloned())
    }

    async fn select_port(&self, name: &str) -> Result<Option<PortState>, Error> {
        Ok(self.inner.read().await.ports.get(name).cloned())
    }

    async fn select_wan_configs(&self) -> Result<Vec<WanConfigRow>, Error> {
        Ok(self.inner.read().await.wan.values().cloned().collect())
    }

    async fn set_wan_config_status(
        &self,
        wan_type: &str,
        priority: i64,
        status: Option<&str>,
    ) -> Result<(), Error> {
        let mut tables = self.inner.write().await;
        let mut changed = Vec::new();
        for row in tables.wan.values_mut() {
            if row.wan_type == wan_type && row.priority == priority {
                row.status = status.map(str::to_string);
                changed.push(row.clone());
            }
        }
        drop(tables);

        if changed.is_empty() {
            warn!("wan_config: No row for {} priority {}", wan_type, priority);
        }
        for row in changed {
            self.publish(StoreEvent::WanConfig(RowChange::Modify(row)));
        }
        Ok(())
    }

    fn watch(&self) -> Pin<Box<dyn Stream<Item = StoreEvent> + Send + 'static>> {
        let stream = BroadcastStream::new(self.tx.subscribe()).map(|event| match event {
            Ok(event) => event,
            Err(BroadcastStreamRecvError::Lagged(missed)) => {
                warn!("Store watcher lagged by {} event(s), requesting resync", missed);
                StoreEvent::Resync
            }
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inet_config_mirrors_into_state() {
        let store = MemoryConfigStore::new();
        let update = InetConfigUpdate {
            if_type: Some("eth".to_string()),
            enabled: Some(true),
            network: Some(true),
            nat: Some(true),
            ip_assign_scheme: Some(AssignScheme::None),
            ..Default::default()
        };
        store.update_inet_config("eth0", &update).await.unwrap();

        let state = store.select_inet_state("eth0").await.unwrap().unwrap();
        assert!(state.enabled && state.network && state.nat);
        assert_eq!(state.ip_assign_scheme, AssignScheme::None);
        assert!(!state.port_state);
    }

    #[tokio::test]
    async fn test_dhcp_lease_requires_carrier() {
        let store = MemoryConfigStore::new();
        let lease: Ipv4Addr = "192.0.2.10".parse().unwrap();
        store.set_dhcp_lease(Some(lease)).await;

        let update = InetConfigUpdate {
            enabled: Some(true),
            ip_assign_scheme: Some(AssignScheme::Dhcp),
            ..Default::default()
        };
        store.update_inet_config("eth0", &update).await.unwrap();
        assert_eq!(store.inet_state("eth0").await.unwrap().inet_addr, None);

        store.set_carrier("eth0", true).await;
        assert_eq!(store.inet_state("eth0").await.unwrap().inet_addr, Some(lease));

        let none = InetConfigUpdate {
            ip_assign_scheme: Some(AssignScheme::None),
            ..Default::default()
        };
        store.update_inet_config("eth0", &none).await.unwrap();
        assert_eq!(store.inet_state("eth0").await.unwrap().inet_addr, None);
    }

    #[tokio::test]
    async fn test_vlan_follows_parent_carrier() {
        let store = MemoryConfigStore::new();
        store.set_carrier("eth0", true).await;

        let update = InetConfigUpdate {
            if_type: Some("vlan".to_string()),
            parent_ifname: Some("eth0".to_string()),
            vlan_id: Some(100),
            ..Default::default()
        };
        store.update_inet_config("eth0.100", &update).await.unwrap();
        assert!(store.inet_state("eth0.100").await.unwrap().port_state);

        store.set_carrier("eth0", false).await;
        assert!(!store.inet_state("eth0.100").await.unwrap().port_state);
    }

    #[tokio::test]
    async fn test_uplink_update_and_delete() {
        let store = MemoryConfigStore::new();
        let update = UplinkUpdate {
            has_l3: Some(Some(true)),
            ..Default::default()
        };
        store.update_uplink("eth0", &update).await.unwrap();
        assert_eq!(store.uplink("eth0").await.unwrap().has_l3, Some(true));

        let clear = UplinkUpdate {
            has_l3: Some(None),
            ..Default::default()
        };
        store.update_uplink("eth0", &clear).await.unwrap();
        assert_eq!(store.uplink("eth0").await.unwrap().has_l3, None);

        assert!(store.delete_uplink("eth0").await.unwrap());
        assert!(!store.delete_uplink("eth0").await.unwrap());
        assert_eq!(store.uplink_deletes().await, 1);
    }

    #[tokio::test]
    async fn test_watch_sees_changes() {
        let store = MemoryConfigStore::new();
        let mut events = store.watch();

        store.set_port("eth1", "br-home").await;
        store.remove_port("eth1").await;

        let first = events.next().await.unwrap();
        assert!(matches!(first, StoreEvent::Port(RowChange::New(ref p)) if p.bridge == "br-home"));
        let second = events.next().await.unwrap();
        assert_eq!(second, StoreEvent::Port(RowChange::Delete("eth1".to_string())));
    }

    #[tokio::test]
    async fn test_lagging_watcher_gets_resync() {
        let store = MemoryConfigStore::with_event_capacity(2);
        let mut events = store.watch();

        for i in 0..5 {
            store.set_port(&format!("lan{}", i), "br-home").await;
        }

        assert_eq!(events.next().await, Some(StoreEvent::Resync));
        let next = events.next().await.unwrap();
        assert!(matches!(next, StoreEvent::Port(RowChange::New(ref p)) if p.name == "lan3"));
    }

    #[tokio::test]
    async fn test_pppoe_session_needs_credentials() {
        let store = MemoryConfigStore::new();
        let lease = Ipv4Addr::new(203, 0, 113, 7);
        store.set_ppp_account("subscriber", "secret", lease).await;
        store.set_carrier("eth0", true).await;

        let options = |password: &str| {
            BTreeMap::from([
                ("username".to_string(), "subscriber".to_string()),
                ("password".to_string(), password.to_string()),
            ])
        };
        let mut update = InetConfigUpdate {
            if_type: Some("pppoe".to_string()),
            parent_ifname: Some("eth0".to_string()),
            enabled: Some(true),
            network: Some(true),
            ppp_options: Some(options("wrong")),
            ..Default::default()
        };
        store.update_inet_config("ppp-eth0", &update).await.unwrap();
        assert_eq!(store.inet_state("ppp-eth0").await.unwrap().inet_addr, None);

        update.ppp_options = Some(options("secret"));
        store.update_inet_config("ppp-eth0", &update).await.unwrap();
        assert_eq!(store.inet_state("ppp-eth0").await.unwrap().inet_addr, Some(lease));

        store.set_carrier("eth0", false).await;
        assert_eq!(store.inet_state("ppp-eth0").await.unwrap().inet_addr, None);
    }

    #[tokio::test]
    async fn test_wan_status_and_seed() {
        use std::io::Write;

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"[
                {{"uuid": "a", "type": "dhcp", "priority": 10}},
                {{"uuid": "b", "type": "dhcp", "priority": 10, "enable": false}}
            ]"#
        )
        .unwrap();

        let store = MemoryConfigStore::new();
        assert_eq!(store.load_wan_seed(file.path()).await.unwrap(), 2);

        store
            .set_wan_config_status("dhcp", 10, Some("success"))
            .await
            .unwrap();
        let rows = store.wan_configs().await;
        assert!(rows.iter().all(|r| r.status.as_deref() == Some("success")));
    }
}
