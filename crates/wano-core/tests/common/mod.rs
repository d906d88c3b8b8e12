//! Test doubles and common utilities for architecture contract tests
//!
//! This module provides minimal test doubles that verify architectural
//! constraints without implementing real provisioning.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use wano_core::engine::StatusReporter;
use wano_core::traits::{
    Plugin, PluginContext, PluginInstance, PluginStatus, ReachabilityProbe, UplinkState,
    WanConfigRow,
};
use wano_core::wan::WanConfigStatus;
use wano_core::{EngineEvent, MemoryConfigStore, Orchestrator, PluginRegistry, WanoConfig};

/// Upper bound for anything a test waits on
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared observation points of a scripted plugin
#[derive(Clone, Default)]
pub struct PluginCounters {
    inits: Arc<AtomicUsize>,
    runs: Arc<AtomicUsize>,
    finis: Arc<AtomicUsize>,
    /// Instances between run() and fini()
    active: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    priorities: Arc<Mutex<Vec<Option<i64>>>>,
    reporters: Arc<Mutex<Vec<StatusReporter>>>,
}

impl PluginCounters {
    pub fn init_call_count(&self) -> usize {
        self.inits.load(Ordering::SeqCst)
    }

    pub fn run_call_count(&self) -> usize {
        self.runs.load(Ordering::SeqCst)
    }

    pub fn fini_call_count(&self) -> usize {
        self.finis.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Highest number of simultaneously running instances observed
    pub fn peak_active(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// WAN priority handed to each run, in order
    pub fn priorities(&self) -> Vec<Option<i64>> {
        self.priorities.lock().unwrap().clone()
    }

    /// Reporter of the most recently started instance
    pub fn last_reporter(&self) -> Option<StatusReporter> {
        self.reporters.lock().unwrap().last().cloned()
    }
}

/// A plugin that replies with a fixed status as soon as it runs
///
/// With no reply the instance stays silent until its timeout.
pub struct ScriptedPlugin {
    reply: Option<PluginStatus>,
    wan_status: Option<WanConfigStatus>,
    counters: PluginCounters,
}

impl ScriptedPlugin {
    pub fn new(reply: Option<PluginStatus>) -> (Self, PluginCounters) {
        let counters = PluginCounters::default();
        (Self::with_counters(reply, counters.clone()), counters)
    }

    /// Share counters between several plugins
    pub fn with_counters(reply: Option<PluginStatus>, counters: PluginCounters) -> Self {
        Self {
            reply,
            wan_status: None,
            counters,
        }
    }

    /// Report `status` for the first WAN configuration of each attempt
    pub fn reporting_wan_status(mut self, status: WanConfigStatus) -> Self {
        self.wan_status = Some(status);
        self
    }
}

impl Plugin for ScriptedPlugin {
    fn init(&self, ctx: PluginContext) -> Option<Box<dyn PluginInstance>> {
        self.counters.inits.fetch_add(1, Ordering::SeqCst);
        Some(Box::new(ScriptedInstance {
            ctx,
            reply: self.reply.clone(),
            wan_status: self.wan_status,
            counters: self.counters.clone(),
            running: false,
        }))
    }
}

struct ScriptedInstance {
    ctx: PluginContext,
    reply: Option<PluginStatus>,
    wan_status: Option<WanConfigStatus>,
    counters: PluginCounters,
    running: bool,
}

impl PluginInstance for ScriptedInstance {
    fn run(&mut self) {
        self.running = true;
        self.counters.runs.fetch_add(1, Ordering::SeqCst);
        let active = self.counters.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak.fetch_max(active, Ordering::SeqCst);
        self.counters.priorities.lock().unwrap().push(self.ctx.wan.priority);
        self.counters
            .reporters
            .lock()
            .unwrap()
            .push(self.ctx.reporter.clone());

        if let (Some(status), Some(entry)) = (self.wan_status, self.ctx.wan.configs.first()) {
            self.ctx
                .host
                .set_wan_status(entry.wan_type(), entry.priority, status);
        }
        if let Some(reply) = &self.reply {
            self.ctx.reporter.report(reply.clone());
        }
    }

    fn fini(&mut self) {
        self.counters.finis.fetch_add(1, Ordering::SeqCst);
        if std::mem::take(&mut self.running) {
            self.counters.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// A reachability probe with a switchable verdict
#[derive(Clone)]
pub struct ScriptedProbe {
    reachable: Arc<AtomicBool>,
    calls: Arc<AtomicUsize>,
    last_local_addr: Arc<Mutex<Option<IpAddr>>>,
}

impl ScriptedProbe {
    pub fn new(reachable: bool) -> Self {
        Self {
            reachable: Arc::new(AtomicBool::new(reachable)),
            calls: Arc::new(AtomicUsize::new(0)),
            last_local_addr: Arc::new(Mutex::new(None)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn probe_call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Source address handed to the most recent probe
    pub fn last_local_addr(&self) -> Option<IpAddr> {
        *self.last_local_addr.lock().unwrap()
    }
}

#[async_trait]
impl ReachabilityProbe for ScriptedProbe {
    async fn probe(&self, _ifname: &str, local_addr: Option<IpAddr>) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_local_addr.lock().unwrap() = local_addr;
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Configuration with test-friendly timings
///
/// No immediate-restart window, so an exhausted pipeline always backs off.
pub fn fast_config(interfaces: &str) -> WanoConfig {
    let mut config = WanoConfig::new().with_builtin_interfaces(interfaces);
    config.pipeline.plugin_timeout_ms = 300;
    config.pipeline.immediate_restart_ms = 0;
    config.pipeline.retry_base_ms = 20;
    config.pipeline.retry_cap = 2;
    config.wan.status_debounce_ms = 10;
    config.wan.status_debounce_max_ms = 50;
    config.wan.restart_debounce_ms = 10;
    config.wan.restart_debounce_max_ms = 50;
    config.engine.event_channel_capacity = 100_000;
    config
}

/// A valid static IPv4 WAN configuration row
pub fn static_wan_row(uuid: &str, priority: i64) -> WanConfigRow {
    let other_config: BTreeMap<String, String> = [
        ("ip", "198.51.100.10"),
        ("subnet", "255.255.255.0"),
        ("gateway", "198.51.100.1"),
        ("primary_dns", "198.51.100.53"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();

    WanConfigRow {
        uuid: uuid.to_string(),
        wan_type: "static_ipv4".to_string(),
        priority,
        enable: true,
        other_config,
        status: None,
    }
}

/// A DHCP WAN configuration row
pub fn dhcp_wan_row(uuid: &str, priority: i64) -> WanConfigRow {
    WanConfigRow {
        uuid: uuid.to_string(),
        wan_type: "dhcp".to_string(),
        priority,
        enable: true,
        other_config: BTreeMap::new(),
        status: None,
    }
}

/// A running orchestrator and its event stream
pub struct Running {
    events: mpsc::Receiver<EngineEvent>,
    seen: Vec<EngineEvent>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<wano_core::Result<()>>,
}

impl Running {
    /// Build an orchestrator over `store` and run it with a controlled shutdown
    pub fn start(
        config: WanoConfig,
        registry: PluginRegistry,
        store: &MemoryConfigStore,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Self {
        let (orchestrator, events) =
            Orchestrator::new(config, registry, Arc::new(store.clone()), probe)
                .expect("orchestrator construction succeeds");
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let handle =
            tokio::spawn(async move { orchestrator.run_with_shutdown(Some(shutdown_rx)).await });

        Self {
            events,
            seen: Vec::new(),
            shutdown: Some(shutdown_tx),
            handle,
        }
    }

    /// Consume events until one matches `pred`
    ///
    /// Panics after [`WAIT_TIMEOUT`].
    pub async fn wait_for<F>(&mut self, what: &str, pred: F) -> EngineEvent
    where
        F: Fn(&EngineEvent) -> bool,
    {
        let found = tokio::time::timeout(WAIT_TIMEOUT, async {
            while let Some(event) = self.events.recv().await {
                self.seen.push(event.clone());
                if pred(&event) {
                    return Some(event);
                }
            }
            None
        })
        .await;

        match found {
            Ok(Some(event)) => event,
            Ok(None) => panic!("event channel closed while waiting for {}", what),
            Err(_) => panic!("timed out waiting for {}", what),
        }
    }

    /// Pull everything emitted so far without waiting
    pub fn collect_pending(&mut self) -> &[EngineEvent] {
        while let Ok(event) = self.events.try_recv() {
            self.seen.push(event);
        }
        &self.seen
    }

    /// Events consumed so far
    pub fn seen(&self) -> &[EngineEvent] {
        &self.seen
    }

    /// Send the shutdown signal and wait for the orchestrator to return
    ///
    /// Returns every event emitted over the orchestrator's lifetime.
    pub async fn stop(mut self) -> Vec<EngineEvent> {
        if let Some(tx) = self.shutdown.take() {
            assert!(tx.send(()).is_ok(), "shutdown signal send succeeds");
        }

        let joined = tokio::time::timeout(WAIT_TIMEOUT, &mut self.handle)
            .await
            .expect("orchestrator should terminate within 5 seconds");
        let result = joined.expect("orchestrator task should not panic");
        tokio_test::assert_ok!(result);

        self.collect_pending();
        std::mem::take(&mut self.seen)
    }
}

/// Poll the uplink row of `ifname` until `pred` holds
pub async fn uplink_eventually<F>(store: &MemoryConfigStore, ifname: &str, pred: F)
where
    F: Fn(Option<&UplinkState>) -> bool,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    loop {
        let row = store.uplink(ifname).await;
        if pred(row.as_ref()) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("{}: uplink row never matched, last seen {:?}", ifname, row);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll `counter` until it reaches `expected`
pub async fn count_eventually<F>(what: &str, expected: usize, count: F)
where
    F: Fn() -> usize,
{
    let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
    while count() < expected {
        if tokio::time::Instant::now() >= deadline {
            panic!("{}: expected {}, got {}", what, expected, count());
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn is_state(event: &EngineEvent, ifname: &str, to: wano_core::pipeline::PipelineState) -> bool {
    matches!(event, EngineEvent::StateChanged { ifname: i, to: t, .. } if i == ifname && *t == to)
}

pub fn is_started(event: &EngineEvent, ifname: &str, plugin: &str) -> bool {
    matches!(event, EngineEvent::PluginStarted { ifname: i, plugin: p } if i == ifname && p == plugin)
}

pub fn is_provisioned(event: &EngineEvent, ifname: &str) -> bool {
    matches!(event, EngineEvent::Provisioned { ifname: i, .. } if i == ifname)
}
