//! Configuration types for the WAN orchestrator
//!
//! This module defines all configuration structures used throughout the crate.
//! Every field has a serde default, so an empty JSON object is a valid
//! configuration (with no built-in interfaces).

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Main orchestrator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanoConfig {
    /// Space-separated list of uplink interfaces that get a pipeline at startup
    /// (e.g. "eth0 eth1")
    #[serde(default)]
    pub builtin_interfaces: String,

    /// Interface type assigned to built-in interfaces
    #[serde(default = "default_builtin_iftype")]
    pub builtin_iftype: String,

    /// Pipeline timing settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// WAN configuration selector settings
    #[serde(default)]
    pub wan: WanSelectorConfig,

    /// Reachability probe settings
    #[serde(default)]
    pub probe: ProbeConfig,

    /// Optional engine settings
    #[serde(default)]
    pub engine: EngineConfig,
}

impl WanoConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self {
            builtin_interfaces: String::new(),
            builtin_iftype: default_builtin_iftype(),
            pipeline: PipelineConfig::default(),
            wan: WanSelectorConfig::default(),
            probe: ProbeConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    /// Set the built-in interface list
    pub fn with_builtin_interfaces(mut self, interfaces: impl Into<String>) -> Self {
        self.builtin_interfaces = interfaces.into();
        self
    }

    /// Load a configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, crate::Error> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: WanoConfig = serde_json::from_str(&data)?;
        Ok(config)
    }

    /// Parse the built-in interface list
    ///
    /// The list is split on whitespace; duplicates are dropped and the first
    /// occurrence wins.
    pub fn builtin_interfaces(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        for ifname in self.builtin_interfaces.split_whitespace() {
            if !out.iter().any(|i| i == ifname) {
                out.push(ifname.to_string());
            }
        }
        out
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.builtin_iftype.is_empty() {
            return Err(crate::Error::config("Built-in interface type cannot be empty"));
        }

        self.pipeline.validate()?;
        self.wan.validate()?;
        self.probe.validate()?;

        if self.engine.event_channel_capacity == 0 {
            return Err(crate::Error::config("Event channel capacity must be > 0"));
        }

        Ok(())
    }
}

impl Default for WanoConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn default_builtin_iftype() -> String {
    "eth".to_string()
}

/// Pipeline timing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Time a running plugin may take before it is forced into an error
    #[serde(default = "default_plugin_timeout_ms")]
    pub plugin_timeout_ms: u64,

    /// Grace window after (re)start during which an exhausted pipeline
    /// restarts immediately instead of backing off
    #[serde(default = "default_immediate_restart_ms")]
    pub immediate_restart_ms: u64,

    /// Base of the exponential retry backoff
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,

    /// Retry counter clamp for the backoff exponent
    #[serde(default = "default_retry_cap")]
    pub retry_cap: u32,
}

impl PipelineConfig {
    pub fn plugin_timeout(&self) -> Duration {
        Duration::from_millis(self.plugin_timeout_ms)
    }

    pub fn immediate_restart(&self) -> Duration {
        Duration::from_millis(self.immediate_restart_ms)
    }

    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    /// Validate the pipeline configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.plugin_timeout_ms == 0 {
            return Err(crate::Error::config("Plugin timeout must be > 0"));
        }
        if self.retry_base_ms == 0 {
            return Err(crate::Error::config("Retry base must be > 0"));
        }
        // 2^cap multiplies the base; keep it well inside u64 milliseconds
        if self.retry_cap > 16 {
            return Err(crate::Error::config("Retry cap must be <= 16"));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            plugin_timeout_ms: default_plugin_timeout_ms(),
            immediate_restart_ms: default_immediate_restart_ms(),
            retry_base_ms: default_retry_base_ms(),
            retry_cap: default_retry_cap(),
        }
    }
}

fn default_plugin_timeout_ms() -> u64 {
    60_000
}

fn default_immediate_restart_ms() -> u64 {
    30_000
}

fn default_retry_base_ms() -> u64 {
    3_000
}

fn default_retry_cap() -> u32 {
    5
}

/// WAN configuration selector settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanSelectorConfig {
    /// Debounce for pause changes and status rollup writes
    #[serde(default = "default_status_debounce_ms")]
    pub status_debounce_ms: u64,

    /// Upper bound on how long a burst of pause/status changes is deferred
    #[serde(default = "default_status_debounce_max_ms")]
    pub status_debounce_max_ms: u64,

    /// Debounce between a WAN configuration change and the pipeline restart
    #[serde(default = "default_restart_debounce_ms")]
    pub restart_debounce_ms: u64,

    /// Upper bound on how long a burst of WAN configuration changes is deferred
    #[serde(default = "default_restart_debounce_max_ms")]
    pub restart_debounce_max_ms: u64,
}

impl WanSelectorConfig {
    pub fn status_debounce(&self) -> Duration {
        Duration::from_millis(self.status_debounce_ms)
    }

    pub fn status_debounce_max(&self) -> Duration {
        Duration::from_millis(self.status_debounce_max_ms)
    }

    pub fn restart_debounce(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_ms)
    }

    pub fn restart_debounce_max(&self) -> Duration {
        Duration::from_millis(self.restart_debounce_max_ms)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.status_debounce_max_ms < self.status_debounce_ms {
            return Err(crate::Error::config(
                "wan.status_debounce_max_ms must not be below wan.status_debounce_ms",
            ));
        }
        if self.restart_debounce_max_ms < self.restart_debounce_ms {
            return Err(crate::Error::config(
                "wan.restart_debounce_max_ms must not be below wan.restart_debounce_ms",
            ));
        }
        Ok(())
    }
}

impl Default for WanSelectorConfig {
    fn default() -> Self {
        Self {
            status_debounce_ms: default_status_debounce_ms(),
            status_debounce_max_ms: default_status_debounce_max_ms(),
            restart_debounce_ms: default_restart_debounce_ms(),
            restart_debounce_max_ms: default_restart_debounce_max_ms(),
        }
    }
}

fn default_status_debounce_ms() -> u64 {
    3_000
}

fn default_status_debounce_max_ms() -> u64 {
    5_000
}

fn default_restart_debounce_ms() -> u64 {
    1_000
}

fn default_restart_debounce_max_ms() -> u64 {
    5_000
}

/// Reachability probe configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Host name to resolve. When unset the probe is skipped and succeeds.
    #[serde(default)]
    pub target: Option<String>,

    /// Explicit resolver list. When empty, `resolv_conf` is read instead.
    #[serde(default)]
    pub resolvers: Vec<IpAddr>,

    /// Path of the resolver configuration file
    #[serde(default = "default_resolv_conf")]
    pub resolv_conf: String,

    /// Timeout of a single probe round
    #[serde(default = "default_round_timeout_ms")]
    pub round_timeout_ms: u64,

    /// Number of probe rounds
    #[serde(default = "default_rounds")]
    pub rounds: u32,

    /// Maximum number of resolvers probed in parallel
    #[serde(default = "default_max_resolvers")]
    pub max_resolvers: usize,

    /// Port the resolvers listen on
    #[serde(default = "default_dns_port")]
    pub port: u16,
}

impl ProbeConfig {
    pub fn round_timeout(&self) -> Duration {
        Duration::from_millis(self.round_timeout_ms)
    }

    /// Validate the probe configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if let Some(target) = &self.target {
            if target.is_empty() {
                return Err(crate::Error::config("Probe target cannot be empty"));
            }
        }
        if self.rounds == 0 {
            return Err(crate::Error::config("Probe rounds must be > 0"));
        }
        if self.round_timeout_ms == 0 {
            return Err(crate::Error::config("Probe round timeout must be > 0"));
        }
        if self.max_resolvers == 0 {
            return Err(crate::Error::config("Probe resolver limit must be > 0"));
        }
        if self.port == 0 {
            return Err(crate::Error::config("Probe DNS port must be > 0"));
        }
        Ok(())
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            target: None,
            resolvers: Vec::new(),
            resolv_conf: default_resolv_conf(),
            round_timeout_ms: default_round_timeout_ms(),
            rounds: default_rounds(),
            max_resolvers: default_max_resolvers(),
            port: default_dns_port(),
        }
    }
}

fn default_resolv_conf() -> String {
    "/etc/resolv.conf".to_string()
}

fn default_round_timeout_ms() -> u64 {
    1_000
}

fn default_rounds() -> u32 {
    5
}

fn default_max_resolvers() -> usize {
    32
}

fn default_dns_port() -> u16 {
    53
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Capacity of the engine event channel
    ///
    /// When full, new events are dropped (with a warning log).
    ///
    /// Default: 1000 events
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

fn default_event_channel_capacity() -> usize {
    1000
}
