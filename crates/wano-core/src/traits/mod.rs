//! Core traits for the WAN orchestrator
//!
//! This module defines the abstract interfaces that all implementations must follow.
//!
//! - [`Plugin`]: WAN provisioning strategy
//! - [`ConfigStore`]: Configuration/state store the orchestrator drives
//! - [`ReachabilityProbe`]: Post-success link validation

pub mod config_store;
pub mod plugin;
pub mod probe;

pub use config_store::{
    AssignScheme, ConfigStore, InetConfigUpdate, InetState, PortState, RowChange, StoreEvent,
    UplinkState, UplinkUpdate, WanConfigRow,
};
pub use plugin::{
    MASK_ALL, MASK_IPV4, MASK_IPV6, MASK_L2, Plugin, PluginContext, PluginInstance, PluginStatus,
};
pub use probe::{AlwaysReachable, ReachabilityProbe};
