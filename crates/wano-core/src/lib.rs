// # wano-core
//
// Core library for the WAN auto-provisioning orchestrator.
//
// ## Architecture Overview
//
// This library brings uplink interfaces from "cable plugged in" to "verified
// internet connectivity" by trying provisioning strategies in order:
// - **Plugin**: Trait for a provisioning strategy (DHCP, static, VLAN, ...)
// - **PluginRegistry**: Explicit, priority-ordered registry of plugins
// - **Pipeline**: Per-interface state machine sequencing plugin instances
// - **WanSelector**: Walks user-supplied WAN configurations by priority
// - **ChangeCache**: Refcounted change-notification caches fed by the store
// - **ReachabilityProbe**: DNS-based validation of a provisioned link
// - **Orchestrator**: Single-task loop driving all of the above
//
// ## Design Principles
//
// 1. **Single Owner**: All mutable state lives on the orchestrator task
// 2. **Event-Driven**: Store changes, plugin statuses and timers are messages
// 3. **Plugin-Based**: Strategies are registered, never hard-coded
// 4. **Declarative Output**: The orchestrator only writes store rows
// 5. **Library-First**: The daemon is a thin wrapper around this crate

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod pipeline;
pub mod probe;
pub mod registry;
pub mod store;
pub mod traits;
pub mod wan;

// Re-export core types for convenience
pub use config::WanoConfig;
pub use engine::{EngineEvent, Orchestrator};
pub use error::{Error, Result};
pub use probe::DnsProbe;
pub use registry::{PluginDescriptor, PluginRegistry};
pub use store::MemoryConfigStore;
pub use traits::{ConfigStore, Plugin, PluginInstance, PluginStatus, ReachabilityProbe};
