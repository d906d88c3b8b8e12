//! Plugin registry
//!
//! The registry holds the provisioning strategies available to pipelines,
//! ordered by ascending (priority, name). Pipelines walk it in that order when
//! they populate their wait queue, so a lower priority value runs first.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use wano_core::registry::{PluginDescriptor, PluginRegistry};
//! use wano_core::traits::{MASK_IPV4, MASK_IPV6};
//!
//! let mut registry = PluginRegistry::new();
//! registry.register(PluginDescriptor::new("static_ipv4", 90, MASK_IPV4, StaticIpv4));
//! registry.register(PluginDescriptor::new("dhcpv6", 100, MASK_IPV6, Dhcpv6));
//!
//! for desc in registry.iter() {
//!     println!("{} ({})", desc.name(), desc.priority());
//! }
//! ```
//!
//! ## Registration
//!
//! Plugin crates expose a registration function:
//!
//! ```rust,ignore
//! // In the wano-plugins crate
//! pub fn register(registry: &mut PluginRegistry) {
//!     registry.register(PluginDescriptor::new("vlan", 40, MASK_ALL, VlanPlugin));
//! }
//! ```
//!
//! The registry is an explicit object: it is built before the orchestrator
//! starts and handed to it by value. There is no global plugin list.

use std::fmt;
use std::sync::Arc;

use tracing::{debug, error};

use crate::error::{Error, Result};
use crate::traits::{Plugin, PluginContext, PluginInstance};

/// Immutable description of a provisioning strategy
pub struct PluginDescriptor {
    name: String,
    priority: i32,
    mask: u64,
    dhcp_class: bool,
    plugin: Arc<dyn Plugin>,
}

impl PluginDescriptor {
    /// Create a new descriptor
    ///
    /// # Parameters
    ///
    /// - `name`: Plugin name; several descriptors may share a name
    /// - `priority`: Ordering key, lower runs first
    /// - `mask`: Capabilities claimed while the plugin runs
    /// - `plugin`: Strategy implementation
    pub fn new(
        name: impl Into<String>,
        priority: i32,
        mask: u64,
        plugin: impl Plugin + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            mask,
            dhcp_class: false,
            plugin: Arc::new(plugin),
        }
    }

    /// Mark the plugin as a DHCP-class fallback
    ///
    /// DHCP-class plugins are held back until the WAN selector reaches its
    /// last configuration or the current configuration asks for DHCP.
    pub fn dhcp_class(mut self) -> Self {
        self.dhcp_class = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn mask(&self) -> u64 {
        self.mask
    }

    pub fn is_dhcp_class(&self) -> bool {
        self.dhcp_class
    }
}

impl fmt::Debug for PluginDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginDescriptor")
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("mask", &format_args!("{:#x}", self.mask))
            .field("dhcp_class", &self.dhcp_class)
            .finish()
    }
}

/// Ordered collection of plugin descriptors
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Arc<PluginDescriptor>>,
}

impl PluginRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin descriptor
    ///
    /// Descriptors with an equal (priority, name) key keep their registration
    /// order.
    ///
    /// # Returns
    ///
    /// The shared descriptor, to be passed to [`unregister()`](Self::unregister)
    pub fn register(&mut self, descriptor: PluginDescriptor) -> Arc<PluginDescriptor> {
        let descriptor = Arc::new(descriptor);
        let pos = self
            .plugins
            .iter()
            .position(|p| {
                (p.priority, p.name.as_str()) > (descriptor.priority, descriptor.name.as_str())
            })
            .unwrap_or(self.plugins.len());

        debug!(
            "Registered plugin {} (priority {}, mask {:#x})",
            descriptor.name, descriptor.priority, descriptor.mask
        );
        self.plugins.insert(pos, descriptor.clone());
        descriptor
    }

    /// Remove a previously registered descriptor
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Descriptor removed
    /// - `Err(Error::NotRegistered)`: Descriptor was never registered or was
    ///   already removed. This is a caller bug and panics in debug builds.
    pub fn unregister(&mut self, descriptor: &Arc<PluginDescriptor>) -> Result<()> {
        match self.plugins.iter().position(|p| Arc::ptr_eq(p, descriptor)) {
            Some(pos) => {
                self.plugins.remove(pos);
                debug!("Unregistered plugin {}", descriptor.name);
                Ok(())
            }
            None => {
                error!("Unregistering plugin {} which is not registered", descriptor.name);
                debug_assert!(false, "plugin {} not registered", descriptor.name);
                Err(Error::not_registered(descriptor.name.clone()))
            }
        }
    }

    /// Iterate descriptors in ascending (priority, name) order
    ///
    /// The iterator borrows the registry, so it cannot observe concurrent
    /// registration; calling `iter()` again restarts from the beginning.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<PluginDescriptor>> + Clone + '_ {
        self.plugins.iter()
    }

    /// Find the first (lowest priority) descriptor with `name`
    pub fn find_by_name(&self, name: &str) -> Option<&Arc<PluginDescriptor>> {
        self.plugins.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Instantiate a plugin for an interface
    ///
    /// # Returns
    ///
    /// - `Some(PluginHandle)`: Instance created; its `fini()` runs exactly once
    /// - `None`: Plugin is not applicable to this interface
    pub fn instantiate(
        &self,
        descriptor: &Arc<PluginDescriptor>,
        ctx: PluginContext,
    ) -> Option<PluginHandle> {
        let ifname = ctx.ifname.clone();
        match descriptor.plugin.init(ctx) {
            Some(instance) => Some(PluginHandle::new(descriptor.clone(), instance)),
            None => {
                debug!("{}: Plugin {} not applicable", ifname, descriptor.name);
                None
            }
        }
    }
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.plugins.iter()).finish()
    }
}

/// A live plugin instance
///
/// `fini()` runs on [`release()`](Self::release) or on drop, whichever comes
/// first, and never twice.
pub struct PluginHandle {
    descriptor: Arc<PluginDescriptor>,
    instance: Box<dyn PluginInstance>,
    released: bool,
}

impl PluginHandle {
    fn new(descriptor: Arc<PluginDescriptor>, instance: Box<dyn PluginInstance>) -> Self {
        Self {
            descriptor,
            instance,
            released: false,
        }
    }

    pub fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    /// Start the instance
    pub fn run(&mut self) {
        if self.released {
            error!("Running released plugin {}", self.descriptor.name);
            return;
        }
        self.instance.run();
    }

    /// Finalize the instance; idempotent
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.instance.fini();
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for PluginHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginHandle")
            .field("plugin", &self.descriptor.name)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::test_context;
    use crate::traits::{MASK_ALL, MASK_IPV4, MASK_IPV6};
    use std::sync::atomic::{AtomicUsize, Ordering};

    // Mock plugin for testing
    struct MockPlugin {
        applicable: bool,
        runs: Arc<AtomicUsize>,
        finis: Arc<AtomicUsize>,
    }

    impl MockPlugin {
        fn new(applicable: bool) -> Self {
            Self {
                applicable,
                runs: Arc::new(AtomicUsize::new(0)),
                finis: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    struct MockInstance {
        runs: Arc<AtomicUsize>,
        finis: Arc<AtomicUsize>,
    }

    impl Plugin for MockPlugin {
        fn init(&self, _ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
            if !self.applicable {
                return None;
            }
            Some(Box::new(MockInstance {
                runs: self.runs.clone(),
                finis: self.finis.clone(),
            }))
        }
    }

    impl PluginInstance for MockInstance {
        fn run(&mut self) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }

        fn fini(&mut self) {
            self.finis.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn names(registry: &PluginRegistry) -> Vec<(i32, String)> {
        registry
            .iter()
            .map(|d| (d.priority(), d.name().to_string()))
            .collect()
    }

    #[test]
    fn test_registry_orders_by_priority_then_name() {
        let mut registry = PluginRegistry::new();
        registry.register(PluginDescriptor::new("dhcpv6", 100, MASK_IPV6, MockPlugin::new(true)));
        registry.register(PluginDescriptor::new("vlan", 40, MASK_ALL, MockPlugin::new(true)));
        registry.register(PluginDescriptor::new("dhcpv4", 100, MASK_IPV4, MockPlugin::new(true)));
        registry.register(PluginDescriptor::new("static_ipv4", 90, MASK_IPV4, MockPlugin::new(true)));

        assert_eq!(
            names(&registry),
            vec![
                (40, "vlan".to_string()),
                (90, "static_ipv4".to_string()),
                (100, "dhcpv4".to_string()),
                (100, "dhcpv6".to_string()),
            ]
        );

        // Restartable
        assert_eq!(registry.iter().count(), 4);
        assert_eq!(registry.iter().count(), 4);
    }

    #[test]
    fn test_equal_keys_keep_registration_order() {
        let mut registry = PluginRegistry::new();
        let first = registry.register(PluginDescriptor::new("dup", 10, MASK_IPV4, MockPlugin::new(true)));
        let second = registry.register(PluginDescriptor::new("dup", 10, MASK_IPV6, MockPlugin::new(true)));

        let order: Vec<_> = registry.iter().cloned().collect();
        assert!(Arc::ptr_eq(&order[0], &first));
        assert!(Arc::ptr_eq(&order[1], &second));
    }

    #[test]
    fn test_find_by_name_returns_lowest_priority() {
        let mut registry = PluginRegistry::new();
        registry.register(PluginDescriptor::new("dhcp", 100, MASK_IPV6, MockPlugin::new(true)));
        registry.register(PluginDescriptor::new("dhcp", 50, MASK_IPV4, MockPlugin::new(true)));

        let found = registry.find_by_name("dhcp").unwrap();
        assert_eq!(found.priority(), 50);
        assert!(registry.find_by_name("pppoe").is_none());
    }

    #[test]
    fn test_unregister() {
        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("vlan", 40, MASK_ALL, MockPlugin::new(true)));
        assert_eq!(registry.len(), 1);

        registry.unregister(&desc).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not registered")]
    fn test_double_unregister_panics_in_debug() {
        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("vlan", 40, MASK_ALL, MockPlugin::new(true)));
        registry.unregister(&desc).unwrap();
        let _ = registry.unregister(&desc);
    }

    #[test]
    #[cfg(not(debug_assertions))]
    fn test_double_unregister_is_an_error_in_release() {
        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("vlan", 40, MASK_ALL, MockPlugin::new(true)));
        registry.unregister(&desc).unwrap();
        assert!(matches!(registry.unregister(&desc), Err(Error::NotRegistered(_))));
    }

    #[test]
    fn test_instantiate_and_release_once() {
        let plugin = MockPlugin::new(true);
        let runs = plugin.runs.clone();
        let finis = plugin.finis.clone();

        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("mock", 1, MASK_IPV4, plugin));

        let mut handle = registry.instantiate(&desc, test_context("eth0")).unwrap();
        handle.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        handle.release();
        handle.release();
        drop(handle);
        assert_eq!(finis.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_instantiate_not_applicable() {
        let plugin = MockPlugin::new(false);
        let finis = plugin.finis.clone();

        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("mock", 1, MASK_IPV4, plugin));

        assert!(registry.instantiate(&desc, test_context("eth0")).is_none());
        // fini never runs for an instance that was never created
        assert_eq!(finis.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_drop_releases() {
        let plugin = MockPlugin::new(true);
        let finis = plugin.finis.clone();

        let mut registry = PluginRegistry::new();
        let desc = registry.register(PluginDescriptor::new("mock", 1, MASK_IPV4, plugin));

        let handle = registry.instantiate(&desc, test_context("eth0")).unwrap();
        drop(handle);
        assert_eq!(finis.load(Ordering::SeqCst), 1);
    }
}
