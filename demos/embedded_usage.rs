//! Minimal embedding example for wano-core
//!
//! This example runs the orchestrator inside an application: an in-memory
//! store stands in for the device database, the built-in plugins provision
//! `eth0` from a seeded WAN configuration, and a custom probe decides which
//! links count as reachable. The orchestrator lifecycle is fully managed by
//! the application.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::oneshot;
use wano_core::traits::{ReachabilityProbe, WanConfigRow};
use wano_core::{EngineEvent, MemoryConfigStore, Orchestrator, PluginRegistry, Result, WanoConfig};

/// Probe that only trusts addresses outside the documentation range
/// 198.51.100.0/24, so the static configuration below is rejected and the
/// pipeline falls back to DHCP.
struct EmbeddedProbe {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ReachabilityProbe for EmbeddedProbe {
    async fn probe(&self, ifname: &str, local_addr: Option<IpAddr>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reachable = !matches!(
            local_addr,
            Some(IpAddr::V4(addr)) if addr.octets()[..3] == [198, 51, 100]
        );
        println!("[Probe] {} from {:?}: {}", ifname, local_addr, reachable);
        reachable
    }
}

fn wan_row(uuid: &str, wan_type: &str, priority: i64, kv: &[(&str, &str)]) -> WanConfigRow {
    WanConfigRow {
        uuid: uuid.to_string(),
        wan_type: wan_type.to_string(),
        priority,
        enable: true,
        other_config: kv
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<BTreeMap<_, _>>(),
        status: None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    println!("=== Embedded wano-core Example ===\n");

    // Simulated device: eth0 has carrier, a DHCP server hands out 192.0.2.10
    println!("1. Preparing the store...");
    let store = MemoryConfigStore::new();
    store.set_carrier("eth0", true).await;
    store.set_dhcp_lease(Some(Ipv4Addr::new(192, 0, 2, 10))).await;
    store
        .insert_wan_config(wan_row(
            "static",
            "static_ipv4",
            20,
            &[
                ("ip", "198.51.100.10"),
                ("subnet", "255.255.255.0"),
                ("gateway", "198.51.100.1"),
                ("primary_dns", "198.51.100.53"),
            ],
        ))
        .await;
    store.insert_wan_config(wan_row("dhcp", "dhcp", 10, &[])).await;

    let mut registry = PluginRegistry::new();
    wano_plugins::register(&mut registry);

    let mut config = WanoConfig::new().with_builtin_interfaces("eth0");
    config.pipeline.plugin_timeout_ms = 2_000;
    config.pipeline.immediate_restart_ms = 0;
    config.pipeline.retry_base_ms = 50;
    config.pipeline.retry_cap = 2;
    config.engine.event_channel_capacity = 1_000;

    let probe_calls = Arc::new(AtomicUsize::new(0));
    let probe = Arc::new(EmbeddedProbe {
        calls: probe_calls.clone(),
    });

    println!("2. Creating orchestrator...");
    let (orchestrator, mut event_rx) =
        Orchestrator::new(config, registry, Arc::new(store.clone()), probe)?;

    // Forward events until the link is up
    let (up_tx, up_rx) = oneshot::channel();
    let event_listener = tokio::spawn(async move {
        let mut up_tx = Some(up_tx);
        while let Some(event) = event_rx.recv().await {
            println!("[Event] {:?}", event);
            if let EngineEvent::Provisioned { plugin, .. } = &event
                && let Some(tx) = up_tx.take()
            {
                let _ = tx.send(plugin.clone());
            }
        }
    });

    println!("3. Starting orchestrator in background...");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let orchestrator_handle =
        tokio::spawn(async move { orchestrator.run_with_shutdown(Some(shutdown_rx)).await });

    match tokio::time::timeout(Duration::from_secs(10), up_rx).await {
        Ok(Ok(plugin)) => println!("\n4. eth0 provisioned by {}", plugin),
        _ => println!("\n4. eth0 was not provisioned in time"),
    }

    if let Some(uplink) = store.uplink("eth0").await {
        println!("   uplink: has_L2={:?} has_L3={:?}", uplink.has_l2, uplink.has_l3);
    }
    if let Some(state) = store.inet_state("eth0").await {
        println!(
            "   address: {:?} ({:?})",
            state.inet_addr, state.ip_assign_scheme
        );
    }
    println!("   probes run: {}", probe_calls.load(Ordering::SeqCst));

    // Statuses are debounced; give the rollup a moment
    tokio::time::sleep(Duration::from_millis(500)).await;
    for row in store.wan_configs().await {
        println!(
            "   WAN {} ({}, priority {}): {:?}",
            row.uuid, row.wan_type, row.priority, row.status
        );
    }

    println!("\n5. Stopping orchestrator...");
    let _ = shutdown_tx.send(());
    match orchestrator_handle.await {
        Ok(result) => result?,
        Err(e) => println!("Orchestrator task failed: {}", e),
    }
    let _ = tokio::time::timeout(Duration::from_secs(1), event_listener).await;

    println!("\n6. Orchestrator stopped cleanly.");
    println!("\n=== Embedding Successful ===");
    println!("Key Points:");
    println!("- Orchestrator lifecycle is fully controlled by the application");
    println!("- The store, the plugins and the probe are all pluggable");
    println!("- Every pipeline is torn down before run_with_shutdown() returns");

    Ok(())
}
