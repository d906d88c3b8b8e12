//! WAN configuration selector
//!
//! Externally supplied WAN configurations (PPPoE credentials, VLAN tags,
//! static IPv4 settings, plain DHCP) are cached in a [`WanConfigTable`]. Each
//! built-in pipeline owns a [`WanSelector`] that walks the distinct priorities
//! of the table from highest to lowest; all entries sharing a priority form
//! one attempt. When the lowest priority has been tried the selector wraps
//! around to the highest one and counts a rollover.
//!
//! ## Example
//!
//! With entries {10: dhcp, 20: pppoe, 20: static_ipv4}:
//!
//! ```text
//! reset()  -> priority 20 (pppoe + static_ipv4), rollover 0
//! next()   -> priority 10 (dhcp)
//! next()   -> priority 20, rollover 1
//! ```
//!
//! ## Status rollup
//!
//! Plugins report a per-(type, priority) outcome on their pipeline's selector.
//! The value written back to the WAN row is rolled up across all unpaused
//! selectors by [`rollup()`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::traits::{RowChange, WanConfigRow};

/// WAN configuration type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WanType {
    Pppoe,
    Vlan,
    StaticIpv4,
    Dhcp,
}

impl WanType {
    pub fn as_str(&self) -> &'static str {
        match self {
            WanType::Pppoe => "pppoe",
            WanType::Vlan => "vlan",
            WanType::StaticIpv4 => "static_ipv4",
            WanType::Dhcp => "dhcp",
        }
    }
}

impl fmt::Display for WanType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WanType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pppoe" => Ok(WanType::Pppoe),
            "vlan" => Ok(WanType::Vlan),
            "static_ipv4" => Ok(WanType::StaticIpv4),
            "dhcp" => Ok(WanType::Dhcp),
            other => Err(Error::wan_config(format!("Unknown WAN type: {}", other))),
        }
    }
}

/// Type-specific WAN parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WanParams {
    Pppoe {
        username: String,
        password: String,
    },
    Vlan {
        vlan_id: u16,
        /// 802.1p priority tag
        qos: Option<u8>,
    },
    StaticIpv4 {
        ip: Ipv4Addr,
        subnet: Ipv4Addr,
        gateway: Ipv4Addr,
        primary_dns: Ipv4Addr,
        secondary_dns: Option<Ipv4Addr>,
    },
    Dhcp,
}

impl WanParams {
    pub fn wan_type(&self) -> WanType {
        match self {
            WanParams::Pppoe { .. } => WanType::Pppoe,
            WanParams::Vlan { .. } => WanType::Vlan,
            WanParams::StaticIpv4 { .. } => WanType::StaticIpv4,
            WanParams::Dhcp => WanType::Dhcp,
        }
    }
}

/// A parsed, enabled WAN configuration row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WanConfigEntry {
    pub uuid: String,
    pub priority: i64,
    pub params: WanParams,
}

const VLAN_ID_MIN: u16 = 1;
const VLAN_ID_MAX: u16 = 4094;

fn required<'a>(row: &'a WanConfigRow, key: &str) -> Result<&'a str> {
    match row.other_config.get(key) {
        Some(v) if !v.is_empty() => Ok(v.as_str()),
        _ => Err(Error::wan_config(format!(
            "{} ({}): missing `{}` setting",
            row.wan_type, row.uuid, key
        ))),
    }
}

fn ipv4(row: &WanConfigRow, key: &str) -> Result<Ipv4Addr> {
    let value = required(row, key)?;
    value.parse().map_err(|_| {
        Error::wan_config(format!(
            "{} ({}): invalid `{}` setting: {}",
            row.wan_type, row.uuid, key, value
        ))
    })
}

impl WanConfigEntry {
    pub fn wan_type(&self) -> WanType {
        self.params.wan_type()
    }

    /// Parse a raw row
    ///
    /// # Returns
    ///
    /// - `Ok(Some(entry))`: Valid, enabled row
    /// - `Ok(None)`: Row is disabled
    /// - `Err(Error::WanConfig)`: Unknown type or missing/invalid settings
    pub fn from_row(row: &WanConfigRow) -> Result<Option<Self>> {
        if !row.enable {
            return Ok(None);
        }

        let params = match row.wan_type.parse::<WanType>()? {
            WanType::Pppoe => WanParams::Pppoe {
                username: required(row, "username")?.to_string(),
                password: required(row, "password")?.to_string(),
            },
            WanType::Vlan => {
                let raw = required(row, "vlan_id")?;
                let vlan_id: u16 = raw.parse().map_err(|_| {
                    Error::wan_config(format!("vlan ({}): invalid VLAN value: {}", row.uuid, raw))
                })?;
                if !(VLAN_ID_MIN..=VLAN_ID_MAX).contains(&vlan_id) {
                    return Err(Error::wan_config(format!(
                        "vlan ({}): VLAN value out of range: {}",
                        row.uuid, vlan_id
                    )));
                }
                let qos = match row.other_config.get("qos") {
                    Some(q) => Some(q.parse::<u8>().ok().filter(|q| *q <= 7).ok_or_else(|| {
                        Error::wan_config(format!("vlan ({}): invalid qos value: {}", row.uuid, q))
                    })?),
                    None => None,
                };
                WanParams::Vlan { vlan_id, qos }
            }
            WanType::StaticIpv4 => WanParams::StaticIpv4 {
                ip: ipv4(row, "ip")?,
                subnet: ipv4(row, "subnet")?,
                gateway: ipv4(row, "gateway")?,
                primary_dns: ipv4(row, "primary_dns")?,
                secondary_dns: ipv4(row, "secondary_dns").ok(),
            },
            WanType::Dhcp => WanParams::Dhcp,
        };

        Ok(Some(Self {
            uuid: row.uuid.clone(),
            priority: row.priority,
            params,
        }))
    }
}

/// Cache of valid WAN configurations indexed by row identity
#[derive(Debug, Clone, Default)]
pub struct WanConfigTable {
    by_uuid: BTreeMap<String, WanConfigEntry>,
}

impl WanConfigTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a row change
    ///
    /// Invalid rows are not cached; an invalid update of a previously valid
    /// row removes it.
    ///
    /// # Returns
    ///
    /// `true` if the effective set of configurations changed
    pub fn apply(&mut self, change: &RowChange<WanConfigRow>) -> bool {
        match change {
            RowChange::New(row) | RowChange::Modify(row) => match WanConfigEntry::from_row(row) {
                Ok(Some(entry)) => {
                    let changed = self.by_uuid.get(&row.uuid) != Some(&entry);
                    if changed {
                        info!(
                            "wan_config: {} priority {} ({})",
                            entry.wan_type(),
                            entry.priority,
                            entry.uuid
                        );
                        self.by_uuid.insert(row.uuid.clone(), entry);
                    }
                    changed
                }
                Ok(None) => {
                    debug!("wan_config: {} is disabled", row.uuid);
                    self.by_uuid.remove(&row.uuid).is_some()
                }
                Err(e) => {
                    error!("wan_config: Ignoring row: {}", e);
                    self.by_uuid.remove(&row.uuid).is_some()
                }
            },
            RowChange::Delete(uuid) => self.by_uuid.remove(uuid).is_some(),
        }
    }

    /// Replace the table with a full row listing
    pub fn load(&mut self, rows: &[WanConfigRow]) -> bool {
        let before = self.by_uuid.clone();
        self.by_uuid.clear();
        for row in rows {
            self.apply(&RowChange::New(row.clone()));
        }
        before != self.by_uuid
    }

    pub fn len(&self) -> usize {
        self.by_uuid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_uuid.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WanConfigEntry> {
        self.by_uuid.values()
    }

    pub fn max_priority(&self) -> Option<i64> {
        self.iter().map(|e| e.priority).max()
    }

    /// Greatest priority strictly below `bound`
    pub fn highest_below(&self, bound: i64) -> Option<i64> {
        self.iter().map(|e| e.priority).filter(|p| *p < bound).max()
    }

    /// Entry of `wan_type` at `priority`
    ///
    /// Duplicate (type, priority) pairs are one logical group; the entry with
    /// the lowest row identity represents it.
    pub fn lookup(&self, wan_type: WanType, priority: i64) -> Option<&WanConfigEntry> {
        self.iter()
            .find(|e| e.priority == priority && e.wan_type() == wan_type)
    }

    /// All distinct (type, priority) groups
    pub fn keys(&self) -> BTreeSet<(WanType, i64)> {
        self.iter().map(|e| (e.wan_type(), e.priority)).collect()
    }
}

/// Outcome of a WAN configuration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WanConfigStatus {
    /// Not reported yet
    Empty,
    Success,
    Error,
}

impl WanConfigStatus {
    /// Value of the row's `status` column; `None` clears it
    pub fn as_column(&self) -> Option<&'static str> {
        match self {
            WanConfigStatus::Empty => None,
            WanConfigStatus::Success => Some("success"),
            WanConfigStatus::Error => Some("error"),
        }
    }
}

/// Per-pipeline cursor over the WAN configuration table
#[derive(Debug, Clone)]
pub struct WanSelector {
    priority: i64,
    next_priority: i64,
    rollover: u32,
    paused: bool,
    pause_requested: bool,
    statuses: BTreeMap<(WanType, i64), WanConfigStatus>,
}

impl WanSelector {
    /// Create a selector positioned before the first configuration
    pub fn new() -> Self {
        Self {
            priority: i64::MAX,
            next_priority: i64::MAX,
            rollover: 0,
            paused: false,
            pause_requested: false,
            statuses: BTreeMap::new(),
        }
    }

    /// Restart from the highest priority with a cleared rollover count
    pub fn reset(&mut self, table: &WanConfigTable) {
        self.next_priority = i64::MAX;
        self.priority = i64::MAX;
        self.next(table);
        self.rollover = 0;
    }

    /// Advance to the next lower priority, wrapping around to the highest one
    ///
    /// An empty table parks the selector at the `i64::MAX` sentinel.
    pub fn next(&mut self, table: &WanConfigTable) {
        let new_priority = match table.highest_below(self.next_priority) {
            Some(p) => p,
            None => {
                self.rollover += 1;
                info!("wan: WAN rollover count {}", self.rollover);
                table.max_priority().unwrap_or(i64::MAX)
            }
        };

        debug!("wan: Next priority is {} -> {}", self.priority, new_priority);
        self.priority = new_priority;
        self.next_priority = new_priority;
    }

    /// Force the next call to [`next()`](Self::next) to roll over
    pub fn rollover(&mut self) {
        self.next_priority = i64::MIN;
    }

    pub fn rollover_count(&self) -> u32 {
        self.rollover
    }

    /// Current priority; `None` when the table was empty at the last advance
    pub fn priority(&self) -> Option<i64> {
        (self.priority != i64::MAX).then_some(self.priority)
    }

    /// True if the next advance will roll over
    pub fn is_last_config(&self, table: &WanConfigTable) -> bool {
        table.highest_below(self.next_priority).is_none()
    }

    /// Entry of `wan_type` at the current priority
    pub fn config_for<'a>(
        &self,
        table: &'a WanConfigTable,
        wan_type: WanType,
    ) -> Option<&'a WanConfigEntry> {
        table.lookup(wan_type, self.priority)
    }

    /// Record the outcome of (type, priority) on this selector
    pub fn status_set(&mut self, wan_type: WanType, priority: i64, status: WanConfigStatus) {
        self.statuses.insert((wan_type, priority), status);
    }

    pub fn status(&self, wan_type: WanType, priority: i64) -> Option<WanConfigStatus> {
        self.statuses.get(&(wan_type, priority)).copied()
    }

    /// Groups this selector has reported on
    pub fn status_keys(&self) -> impl Iterator<Item = (WanType, i64)> + '_ {
        self.statuses.keys().copied()
    }

    /// Request a pause change; takes effect on [`apply_pause()`](Self::apply_pause)
    pub fn request_pause(&mut self, pause: bool) {
        self.pause_requested = pause;
    }

    /// Apply the requested pause state; returns true if it changed
    pub fn apply_pause(&mut self) -> bool {
        let changed = self.paused != self.pause_requested;
        self.paused = self.pause_requested;
        changed
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Snapshot handed to plugins instantiated for this attempt
    pub fn view(&self, table: &WanConfigTable) -> WanView {
        let priority = self.priority();
        WanView {
            priority,
            rollover: self.rollover,
            is_last: self.is_last_config(table),
            configs: priority
                .map(|p| table.iter().filter(|e| e.priority == p).cloned().collect())
                .unwrap_or_default(),
        }
    }
}

impl Default for WanSelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Roll up the status of one (type, priority) group across selectors
///
/// - any unpaused selector reported success: `Success`
/// - otherwise any unpaused selector has not reported: `Empty`
/// - otherwise: `Error` (also when no selector participates)
pub fn rollup<'a>(
    selectors: impl IntoIterator<Item = &'a WanSelector>,
    key: (WanType, i64),
) -> WanConfigStatus {
    let mut status = WanConfigStatus::Error;
    for selector in selectors {
        if selector.paused {
            continue;
        }
        match selector.statuses.get(&key) {
            None | Some(WanConfigStatus::Empty) => status = WanConfigStatus::Empty,
            Some(WanConfigStatus::Success) => return WanConfigStatus::Success,
            Some(WanConfigStatus::Error) => {}
        }
    }
    status
}

/// Pending rollup writes, flushed by the orchestrator's debounce timer
#[derive(Debug, Default)]
pub struct WanRollup {
    dirty: BTreeSet<(WanType, i64)>,
    pause_dirty: bool,
}

impl WanRollup {
    pub fn new() -> Self {
        Self::default()
    }

    /// A group's status changed
    pub fn mark(&mut self, key: (WanType, i64)) {
        self.dirty.insert(key);
    }

    /// A selector requested a pause change
    pub fn mark_pause(&mut self) {
        self.pause_dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.pause_dirty || !self.dirty.is_empty()
    }

    /// Apply pending pause requests and compute the status writes
    ///
    /// A pause change recomputes every group known to the table.
    pub fn flush(
        &mut self,
        selectors: &mut [&mut WanSelector],
        table: &WanConfigTable,
    ) -> Vec<((WanType, i64), WanConfigStatus)> {
        let mut keys = std::mem::take(&mut self.dirty);
        if std::mem::take(&mut self.pause_dirty) {
            for selector in selectors.iter_mut() {
                selector.apply_pause();
            }
            keys.extend(table.keys());
        }

        keys.into_iter()
            .map(|key| (key, rollup(selectors.iter().map(|s| &**s), key)))
            .collect()
    }
}

/// Read-only view of the WAN selection for one attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WanView {
    /// Current priority, `None` without WAN configuration
    pub priority: Option<i64>,
    pub rollover: u32,
    /// The selector is on its last configuration before rollover
    pub is_last: bool,
    /// Entries at the current priority
    pub configs: Vec<WanConfigEntry>,
}

impl WanView {
    pub fn config_for(&self, wan_type: WanType) -> Option<&WanConfigEntry> {
        self.configs.iter().find(|e| e.wan_type() == wan_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(uuid: &str, wan_type: &str, priority: i64, kv: &[(&str, &str)]) -> WanConfigRow {
        WanConfigRow {
            uuid: uuid.to_string(),
            wan_type: wan_type.to_string(),
            priority,
            enable: true,
            other_config: kv
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            status: None,
        }
    }

    fn example_table() -> WanConfigTable {
        let mut table = WanConfigTable::new();
        table.load(&[
            row("a", "dhcp", 10, &[]),
            row("b", "pppoe", 20, &[("username", "u"), ("password", "p")]),
            row(
                "c",
                "static_ipv4",
                20,
                &[
                    ("ip", "192.0.2.2"),
                    ("subnet", "255.255.255.0"),
                    ("gateway", "192.0.2.1"),
                    ("primary_dns", "192.0.2.53"),
                ],
            ),
        ]);
        table
    }

    #[test]
    fn test_next_walks_priorities_and_rolls_over() {
        let table = example_table();
        let mut sel = WanSelector::new();

        sel.reset(&table);
        assert_eq!(sel.priority(), Some(20));
        assert_eq!(sel.rollover_count(), 0);
        assert!(sel.config_for(&table, WanType::Pppoe).is_some());
        assert!(sel.config_for(&table, WanType::StaticIpv4).is_some());
        assert!(!sel.is_last_config(&table));

        sel.next(&table);
        assert_eq!(sel.priority(), Some(10));
        assert!(sel.is_last_config(&table));
        assert!(sel.config_for(&table, WanType::Dhcp).is_some());
        assert!(sel.config_for(&table, WanType::Pppoe).is_none());

        sel.next(&table);
        assert_eq!(sel.priority(), Some(20));
        assert_eq!(sel.rollover_count(), 1);
    }

    #[test]
    fn test_each_priority_once_per_cycle() {
        let mut table = WanConfigTable::new();
        table.load(&[
            row("a", "dhcp", 5, &[]),
            row("b", "dhcp", 15, &[]),
            row("c", "dhcp", 15, &[]),
            row("d", "vlan", 30, &[("vlan_id", "100")]),
            row("e", "dhcp", -3, &[]),
        ]);

        let mut sel = WanSelector::new();
        sel.reset(&table);
        let mut seen = vec![sel.priority().unwrap()];
        for cycle in 1..=3u32 {
            loop {
                sel.next(&table);
                if sel.rollover_count() == cycle {
                    break;
                }
                seen.push(sel.priority().unwrap());
            }
            assert_eq!(seen, vec![30, 15, 5, -3], "cycle {}", cycle);
            seen = vec![sel.priority().unwrap()];
        }
    }

    #[test]
    fn test_empty_table_parks_at_sentinel() {
        let table = WanConfigTable::new();
        let mut sel = WanSelector::new();
        sel.reset(&table);
        assert_eq!(sel.priority(), None);
        assert!(sel.is_last_config(&table));

        sel.next(&table);
        assert_eq!(sel.priority(), None);
        assert_eq!(sel.rollover_count(), 1);
        assert!(sel.view(&table).configs.is_empty());
    }

    #[test]
    fn test_forced_rollover() {
        let table = example_table();
        let mut sel = WanSelector::new();
        sel.reset(&table);

        sel.rollover();
        sel.next(&table);
        assert_eq!(sel.priority(), Some(20));
        assert_eq!(sel.rollover_count(), 1);
    }

    #[test]
    fn test_parse_rows() {
        let entry = WanConfigEntry::from_row(&row("v", "vlan", 1, &[("vlan_id", "4094"), ("qos", "3")]))
            .unwrap()
            .unwrap();
        assert_eq!(entry.params, WanParams::Vlan { vlan_id: 4094, qos: Some(3) });

        assert!(WanConfigEntry::from_row(&row("v", "vlan", 1, &[("vlan_id", "0")])).is_err());
        assert!(WanConfigEntry::from_row(&row("v", "vlan", 1, &[("vlan_id", "4095")])).is_err());
        assert!(WanConfigEntry::from_row(&row("v", "vlan", 1, &[("vlan_id", "x")])).is_err());
        assert!(WanConfigEntry::from_row(&row("p", "pppoe", 1, &[("username", "u")])).is_err());
        assert!(WanConfigEntry::from_row(&row("l", "lte", 1, &[])).is_err());

        let entry = WanConfigEntry::from_row(&row(
            "s",
            "static_ipv4",
            1,
            &[
                ("ip", "192.0.2.2"),
                ("subnet", "255.255.255.0"),
                ("gateway", "192.0.2.1"),
                ("primary_dns", "192.0.2.53"),
                ("secondary_dns", "bogus"),
            ],
        ))
        .unwrap()
        .unwrap();
        match entry.params {
            WanParams::StaticIpv4 { secondary_dns, .. } => assert!(secondary_dns.is_none()),
            other => panic!("unexpected params {:?}", other),
        }

        let mut disabled = row("d", "dhcp", 1, &[]);
        disabled.enable = false;
        assert!(WanConfigEntry::from_row(&disabled).unwrap().is_none());
    }

    #[test]
    fn test_table_apply_reports_changes() {
        let mut table = WanConfigTable::new();
        let r = row("a", "dhcp", 10, &[]);
        assert!(table.apply(&RowChange::New(r.clone())));
        assert!(!table.apply(&RowChange::Modify(r.clone())));

        // An invalid update drops the cached entry
        let bad = row("a", "vlan", 10, &[]);
        assert!(table.apply(&RowChange::Modify(bad.clone())));
        assert!(table.is_empty());
        assert!(!table.apply(&RowChange::Modify(bad)));

        assert!(table.apply(&RowChange::New(r)));
        assert!(table.apply(&RowChange::Delete("a".to_string())));
        assert!(!table.apply(&RowChange::Delete("a".to_string())));
    }

    #[test]
    fn test_rollup() {
        let key = (WanType::Pppoe, 20);
        let mut a = WanSelector::new();
        let mut b = WanSelector::new();

        // No participants
        assert_eq!(rollup(std::iter::empty(), key), WanConfigStatus::Error);

        // b has not reported
        a.status_set(WanType::Pppoe, 20, WanConfigStatus::Error);
        assert_eq!(rollup([&a, &b], key), WanConfigStatus::Empty);

        b.status_set(WanType::Pppoe, 20, WanConfigStatus::Error);
        assert_eq!(rollup([&a, &b], key), WanConfigStatus::Error);

        b.status_set(WanType::Pppoe, 20, WanConfigStatus::Success);
        assert_eq!(rollup([&a, &b], key), WanConfigStatus::Success);

        // Paused selectors do not participate
        b.request_pause(true);
        assert!(b.apply_pause());
        assert_eq!(rollup([&a, &b], key), WanConfigStatus::Error);
    }

    #[test]
    fn test_rollup_flush_applies_pause() {
        let table = example_table();
        let mut a = WanSelector::new();
        let mut b = WanSelector::new();
        a.status_set(WanType::Dhcp, 10, WanConfigStatus::Error);

        let mut pending = WanRollup::new();
        b.request_pause(true);
        pending.mark_pause();
        assert!(pending.is_dirty());

        let writes = pending.flush(&mut [&mut a, &mut b], &table);
        assert!(b.is_paused());
        assert!(!pending.is_dirty());
        // Every group of the table is recomputed
        assert_eq!(writes.len(), 3);
        assert!(writes.contains(&((WanType::Dhcp, 10), WanConfigStatus::Error)));
        assert!(writes.contains(&((WanType::Pppoe, 20), WanConfigStatus::Empty)));
    }

    #[test]
    fn test_view() {
        let table = example_table();
        let mut sel = WanSelector::new();
        sel.reset(&table);

        let view = sel.view(&table);
        assert_eq!(view.priority, Some(20));
        assert_eq!(view.configs.len(), 2);
        assert!(view.config_for(WanType::Pppoe).is_some());
        assert!(view.config_for(WanType::Dhcp).is_none());
        assert!(!view.is_last);
    }
}
