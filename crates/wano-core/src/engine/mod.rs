//! WAN orchestrator
//!
//! The Orchestrator is responsible for:
//! - Creating a pipeline per built-in uplink interface
//! - Feeding store changes into the change-notification caches
//! - Executing the store writes queued by pipelines, in order
//! - Running loop timers (plugin timeouts, retries, WAN debounces)
//! - Rolling up WAN configuration status across pipelines
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   StoreEvent   ┌──────────────┐  snapshot   ┌──────────────┐
//! │ ConfigStore  │───────────────►│    Caches    │────────────►│  Pipelines   │
//! │              │◄──── select ───│ (refcounted) │             │ (per ifname) │
//! └──────────────┘                └──────────────┘             └──────────────┘
//!        ▲                                                       │      ▲
//!        │                    StoreWrite (in order)              │      │ LoopEvent
//!        └───────────────────────────────────────────────────────┘      │
//!                                                              ┌──────────────┐
//!                                                              │   Plugins    │
//!                                                              │ probes/timers│
//!                                                              └──────────────┘
//! ```
//!
//! ## Event Flow
//!
//! 1. A store change or loop event arrives
//! 2. The owning cache or pipeline handles it synchronously
//! 3. The loop drains: queued writes, then cache refreshes, then
//!    notifications, until nothing is pending
//! 4. Engine events are emitted for monitoring/logging

#[cfg(feature = "test-util")]
pub mod detached;
mod handle;
mod timer;

pub use handle::{HostHandle, InetStateWatch, PipelineWatch, StatusReporter};
pub(crate) use timer::{TimerKey, Timers};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use crate::cache::{ChangeCache, Subscription};
use crate::config::WanoConfig;
use crate::error::{Error, Result};
use crate::pipeline::{
    Caches, Env, Exception, InetObserver, InstanceId, Pipeline, PipelineEvent, PipelineState,
    StoreWrite,
};
use crate::registry::PluginRegistry;
use crate::traits::{ConfigStore, InetState, PluginStatus, ReachabilityProbe, RowChange, StoreEvent};
use crate::wan::{WanConfigStatus, WanConfigTable, WanRollup, WanType};

/// Upper bound on drain rounds after one input
const MAX_DRAIN_ROUNDS: usize = 32;

/// Events emitted by the Orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// Orchestrator started
    Started {
        pipelines: usize,
    },

    /// Pipeline created (built-in or child)
    PipelineCreated {
        ifname: String,
        iftype: String,
    },

    /// Child pipeline torn down
    PipelineRemoved {
        ifname: String,
    },

    /// Pipeline state transition
    StateChanged {
        ifname: String,
        from: PipelineState,
        to: PipelineState,
    },

    /// Plugin instance started
    PluginStarted {
        ifname: String,
        plugin: String,
    },

    /// Plugin instance reported a status
    PluginStatus {
        ifname: String,
        plugin: String,
        status: PluginStatus,
    },

    /// Plugin instance did not report in time
    PluginTimedOut {
        ifname: String,
        plugin: String,
    },

    /// Reachability probe rejected an OK status
    ProbeFailed {
        ifname: String,
        plugin: String,
    },

    /// A plugin provisioned the link
    Provisioned {
        ifname: String,
        plugin: String,
        /// Interface the result applies to
        target: String,
        /// Layer-3 connectivity was verified
        l3: bool,
        at: DateTime<Utc>,
    },

    /// Pipeline retry timer armed
    RetryScheduled {
        ifname: String,
        delay: Duration,
        retries: u32,
    },

    /// Rolled-up WAN configuration status written to the store
    WanStatusWritten {
        wan_type: WanType,
        priority: i64,
        status: WanConfigStatus,
    },

    /// Orchestrator stopped
    Stopped {
        reason: String,
    },
}

/// Messages posted into the orchestrator loop
#[derive(Debug)]
pub(crate) enum LoopEvent {
    PluginStatus {
        ifname: String,
        instance: InstanceId,
        status: PluginStatus,
    },
    ProbeDone {
        ifname: String,
        instance: InstanceId,
        reachable: bool,
    },
    Timer {
        key: TimerKey,
        generation: u64,
    },
    WatchInetState {
        id: u64,
        ifname: String,
        tx: mpsc::UnboundedSender<Option<InetState>>,
    },
    Unwatch {
        id: u64,
    },
    SpawnPipeline {
        token: u64,
        ifname: String,
        iftype: String,
        emask: u64,
        observer: mpsc::UnboundedSender<PipelineEvent>,
    },
    TeardownPipeline {
        token: u64,
        ifname: String,
    },
    WanStatus {
        ifname: String,
        wan_type: WanType,
        priority: i64,
        status: WanConfigStatus,
    },
}

/// Bounded engine event channel
#[derive(Debug, Clone)]
pub(crate) struct EventSink(mpsc::Sender<EngineEvent>);

impl EventSink {
    pub(crate) fn new(tx: mpsc::Sender<EngineEvent>) -> Self {
        Self(tx)
    }

    /// Emit an engine event
    ///
    /// When the channel is full the event is dropped with a warning; a closed
    /// channel (nobody listening) is not an error.
    pub(crate) fn emit(&self, event: EngineEvent) {
        match self.0.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Event channel full, dropping event. Consider increasing event_channel_capacity.");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }
}

/// Build the services a pipeline borrows, leaving `pipelines` free
macro_rules! pipeline_env {
    ($s:ident) => {
        Env {
            registry: &$s.registry,
            config: &$s.config,
            wan_table: &$s.wan_table,
            caches: &mut $s.caches,
            timers: &mut $s.timers,
            writes: &mut $s.writes,
            rollup: &mut $s.rollup,
            events: &$s.events,
            host: &$s.host,
            probe: &$s.probe,
        }
    };
}

/// WAN orchestrator
///
/// Owns every pipeline and cache. All state lives on one task: handlers run
/// to completion and never await, store I/O happens in the drain phase
/// between inputs.
///
/// ## Lifecycle
///
/// 1. Create with [`Orchestrator::new()`]
/// 2. Start with [`Orchestrator::run()`]
/// 3. Runs until SIGINT/SIGTERM; every pipeline is torn down on the way out
pub struct Orchestrator {
    config: WanoConfig,
    registry: PluginRegistry,
    store: Arc<dyn ConfigStore>,
    probe: Arc<dyn ReachabilityProbe>,
    pipelines: BTreeMap<String, Pipeline>,
    caches: Caches,
    timers: Timers,
    wan_table: WanConfigTable,
    rollup: WanRollup,
    /// Interface state watches held by plugins
    watches: HashMap<u64, Subscription>,
    writes: Vec<StoreWrite>,
    host: HostHandle,
    loop_rx: Option<mpsc::UnboundedReceiver<LoopEvent>>,
    events: EventSink,
}

/// Resolve on SIGTERM or SIGINT
#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
        }
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

impl Orchestrator {
    /// Create a new orchestrator
    ///
    /// # Parameters
    ///
    /// - `config`: Orchestrator configuration
    /// - `registry`: Plugins available to pipelines
    /// - `store`: Configuration store
    /// - `probe`: Reachability probe run after a plugin reports OK
    ///
    /// # Returns
    ///
    /// A tuple of (orchestrator, event_receiver) where event_receiver yields engine events
    pub fn new(
        config: WanoConfig,
        registry: PluginRegistry,
        store: Arc<dyn ConfigStore>,
        probe: Arc<dyn ReachabilityProbe>,
    ) -> Result<(Self, mpsc::Receiver<EngineEvent>)> {
        config.validate()?;

        let (event_tx, event_rx) = mpsc::channel(config.engine.event_channel_capacity);
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();

        let orchestrator = Self {
            host: HostHandle::new(store.clone(), loop_tx.clone()),
            timers: Timers::new(loop_tx),
            config,
            registry,
            store,
            probe,
            pipelines: BTreeMap::new(),
            caches: Caches::new(),
            wan_table: WanConfigTable::new(),
            rollup: WanRollup::new(),
            watches: HashMap::new(),
            writes: Vec::new(),
            loop_rx: Some(loop_rx),
            events: EventSink::new(event_tx),
        };

        Ok((orchestrator, event_rx))
    }

    /// Run the orchestrator until SIGINT/SIGTERM
    ///
    /// # Returns
    ///
    /// - `Ok(())`: Clean shutdown
    /// - `Err(Error)`: Fatal error
    pub async fn run(self) -> Result<()> {
        self.run_internal(None).await
    }

    /// Run the orchestrator until `shutdown_rx` fires
    ///
    /// Applications embedding the orchestrator (and the contract tests) use
    /// this to control its lifetime. With `None` it behaves like [`run()`].
    ///
    /// Plugins MUST NOT call this method.
    ///
    /// [`run()`]: Orchestrator::run
    pub async fn run_with_shutdown(self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        self.run_internal(shutdown_rx).await
    }

    async fn run_internal(mut self, shutdown_rx: Option<oneshot::Receiver<()>>) -> Result<()> {
        let mut loop_rx = self
            .loop_rx
            .take()
            .ok_or_else(|| Error::Other("Orchestrator loop already consumed".to_string()))?;
        let mut store_events = self.store.watch();

        match self.store.select_wan_configs().await {
            Ok(rows) => {
                self.wan_table.load(&rows);
                info!("Loaded {} WAN configuration(s)", self.wan_table.len());
            }
            Err(e) => warn!("Failed to read WAN configuration: {}", e),
        }

        let iftype = self.config.builtin_iftype.clone();
        for ifname in self.config.builtin_interfaces() {
            self.create_pipeline(ifname, iftype.clone(), 0, true, None, None);
        }
        if self.pipelines.is_empty() {
            warn!("No built-in interfaces configured");
        }
        self.events.emit(EngineEvent::Started {
            pipelines: self.pipelines.len(),
        });
        self.drain().await;

        let shutdown = async move {
            match shutdown_rx {
                // Controlled mode: wait for the provided shutdown signal
                Some(rx) => {
                    let _ = rx.await;
                }
                // Production mode: wait for SIGTERM/SIGINT
                None => wait_for_signal().await,
            }
        };
        tokio::pin!(shutdown);

        // Main event loop
        loop {
            tokio::select! {
                Some(event) = loop_rx.recv() => {
                    self.handle_loop_event(event);
                }

                Some(event) = store_events.next() => {
                    self.handle_store_event(event).await;
                }

                _ = &mut shutdown => {
                    info!("Shutdown signal received");
                    break;
                }
            }
            self.drain().await;
        }

        self.shutdown().await;
        self.events.emit(EngineEvent::Stopped {
            reason: "Shutdown signal".to_string(),
        });
        info!("Orchestrator stopped");

        Ok(())
    }

    fn create_pipeline(
        &mut self,
        ifname: String,
        iftype: String,
        emask: u64,
        with_selector: bool,
        owner: Option<u64>,
        observer: Option<mpsc::UnboundedSender<PipelineEvent>>,
    ) {
        if self.pipelines.contains_key(&ifname) {
            error!("{}: Pipeline already exists", ifname);
            return;
        }

        info!("{}: Creating pipeline (type {}, mask {:#x})", ifname, iftype, emask);
        let mut pipeline = Pipeline::new(ifname.clone(), iftype.clone(), emask, with_selector, owner);
        if let Some(observer) = observer {
            pipeline.add_observer(observer);
        }
        self.events.emit(EngineEvent::PipelineCreated {
            ifname: ifname.clone(),
            iftype,
        });

        let mut env = pipeline_env!(self);
        pipeline.start(&mut env);
        self.pipelines.insert(ifname, pipeline);
    }

    fn remove_pipeline(&mut self, ifname: &str) {
        let Some(mut pipeline) = self.pipelines.remove(ifname) else {
            return;
        };
        let mut env = pipeline_env!(self);
        pipeline.teardown(&mut env);
        self.events.emit(EngineEvent::PipelineRemoved {
            ifname: ifname.to_string(),
        });
    }

    fn with_pipeline<F>(&mut self, ifname: &str, f: F)
    where
        F: FnOnce(&mut Pipeline, &mut Env<'_>),
    {
        let Some(pipeline) = self.pipelines.get_mut(ifname) else {
            debug!("{}: No pipeline, dropping event", ifname);
            return;
        };
        let mut env = pipeline_env!(self);
        f(pipeline, &mut env);
    }

    fn handle_loop_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::PluginStatus {
                ifname,
                instance,
                status,
            } => self.with_pipeline(&ifname, |p, env| p.on_plugin_status(instance, status, env)),

            LoopEvent::ProbeDone {
                ifname,
                instance,
                reachable,
            } => self.with_pipeline(&ifname, |p, env| p.on_probe_done(instance, reachable, env)),

            LoopEvent::Timer { key, generation } => {
                if !self.timers.fire(&key, generation) {
                    return;
                }
                match key {
                    TimerKey::Retry(ifname) => {
                        self.with_pipeline(&ifname, |p, env| p.on_retry_timer(env))
                    }
                    TimerKey::PluginTimeout(ifname, instance) => {
                        self.with_pipeline(&ifname, |p, env| p.on_plugin_timeout(instance, env))
                    }
                    TimerKey::WanRollup => self.flush_rollup(),
                    TimerKey::WanRestart => self.restart_all(),
                }
            }

            LoopEvent::WatchInetState { id, ifname, tx } => {
                let subscription = self.caches.inet.subscribe(&ifname, InetObserver::Watch(tx));
                self.watches.insert(id, subscription);
            }

            LoopEvent::Unwatch { id } => {
                if let Some(subscription) = self.watches.remove(&id) {
                    self.caches.inet.unsubscribe(subscription);
                }
            }

            LoopEvent::SpawnPipeline {
                token,
                ifname,
                iftype,
                emask,
                observer,
            } => {
                if self.pipelines.contains_key(&ifname) {
                    error!("{}: Refusing child pipeline, interface already has one", ifname);
                    return;
                }
                self.create_pipeline(ifname, iftype, emask, false, Some(token), Some(observer));
            }

            LoopEvent::TeardownPipeline { token, ifname } => {
                let owned = self
                    .pipelines
                    .get(&ifname)
                    .is_some_and(|p| p.owner() == Some(token));
                if owned {
                    self.remove_pipeline(&ifname);
                }
            }

            LoopEvent::WanStatus {
                ifname,
                wan_type,
                priority,
                status,
            } => self.with_pipeline(&ifname, |p, env| {
                p.on_wan_status(wan_type, priority, status, env)
            }),
        }
    }

    fn schedule_wan_restart(&mut self) {
        info!("WAN configuration changed, scheduling pipeline restart");
        self.timers.debounce(
            TimerKey::WanRestart,
            self.config.wan.restart_debounce(),
            self.config.wan.restart_debounce_max(),
        );
    }

    async fn handle_store_event(&mut self, event: StoreEvent) {
        match event {
            StoreEvent::InetState(change) => {
                apply_change(&mut self.caches.inet, change, |s| s.ifname.clone())
            }
            StoreEvent::Uplink(change) => {
                apply_change(&mut self.caches.uplink, change, |s| s.ifname.clone())
            }
            StoreEvent::Port(change) => {
                apply_change(&mut self.caches.port, change, |s| s.name.clone())
            }
            StoreEvent::WanConfig(change) => {
                if self.wan_table.apply(&change) {
                    self.schedule_wan_restart();
                }
            }
            StoreEvent::Resync => {
                warn!("Store changes were lost, re-reading cached rows");
                self.caches.inet.refresh_all();
                self.caches.uplink.refresh_all();
                self.caches.port.refresh_all();
                match self.store.select_wan_configs().await {
                    Ok(rows) => {
                        if self.wan_table.load(&rows) {
                            self.schedule_wan_restart();
                        }
                    }
                    Err(e) => warn!("Failed to read WAN configuration: {}", e),
                }
            }
        }
    }

    /// Restart every pipeline from its first WAN configuration
    fn restart_all(&mut self) {
        info!("Restarting all pipelines after WAN configuration change");
        let names: Vec<String> = self.pipelines.keys().cloned().collect();
        for ifname in names {
            self.with_pipeline(&ifname, |p, env| {
                p.reset_selector(env.wan_table);
                p.raise(Exception::Restart, env);
            });
        }
    }

    fn flush_rollup(&mut self) {
        let mut selectors: Vec<_> = self
            .pipelines
            .values_mut()
            .filter_map(|p| p.selector_mut())
            .collect();
        let statuses = self.rollup.flush(&mut selectors, &self.wan_table);

        for ((wan_type, priority), status) in statuses {
            if self.wan_table.lookup(wan_type, priority).is_none() {
                continue;
            }
            self.writes
                .push(StoreWrite::WanStatus(wan_type, priority, status));
        }
    }

    /// Execute queued writes, refresh caches and deliver notifications until
    /// nothing is pending
    async fn drain(&mut self) {
        for _ in 0..MAX_DRAIN_ROUNDS {
            let inet = self.caches.inet.take_refreshes();
            let uplink = self.caches.uplink.take_refreshes();
            let port = self.caches.port.take_refreshes();

            if self.writes.is_empty()
                && inet.is_empty()
                && uplink.is_empty()
                && port.is_empty()
                && !self.caches.has_pending()
            {
                return;
            }

            // Writes first so refreshes observe them
            self.flush_writes().await;

            for key in inet {
                match self.store.select_inet_state(&key).await {
                    Ok(row) => self.caches.inet.on_refresh(&key, row),
                    Err(e) => warn!("{}: Failed to read interface state: {}", key, e),
                }
            }
            for key in uplink {
                match self.store.select_uplink(&key).await {
                    Ok(row) => self.caches.uplink.on_refresh(&key, row),
                    Err(e) => warn!("{}: Failed to read uplink: {}", key, e),
                }
            }
            for key in port {
                match self.store.select_port(&key).await {
                    Ok(row) => self.caches.port.on_refresh(&key, row),
                    Err(e) => warn!("{}: Failed to read port: {}", key, e),
                }
            }

            self.dispatch_notifications();
        }
        warn!("Drain did not settle after {} rounds", MAX_DRAIN_ROUNDS);
    }

    fn dispatch_notifications(&mut self) {
        for (observer, snapshot) in self.caches.inet.take_notifications() {
            match observer {
                InetObserver::Pipeline(ifname) => {
                    self.with_pipeline(&ifname, |p, env| p.on_inet_state(snapshot, env))
                }
                InetObserver::Watch(tx) => {
                    let _ = tx.send(snapshot);
                }
            }
        }
        for (ifname, snapshot) in self.caches.uplink.take_notifications() {
            self.with_pipeline(&ifname, |p, env| p.on_uplink(snapshot, env));
        }
        for (ifname, snapshot) in self.caches.port.take_notifications() {
            self.with_pipeline(&ifname, |p, env| p.on_port(snapshot, env));
        }
    }

    async fn flush_writes(&mut self) {
        let writes = std::mem::take(&mut self.writes);
        for write in writes {
            if let Err(e) = execute(self.store.as_ref(), &self.events, &write).await {
                error!("Store write {:?} failed: {}", write, e);
            }
        }
    }

    async fn shutdown(&mut self) {
        // Children first so their owners observe nothing half-torn
        let children: Vec<String> = self
            .pipelines
            .iter()
            .filter(|(_, p)| p.owner().is_some())
            .map(|(name, _)| name.clone())
            .collect();
        for ifname in children {
            self.remove_pipeline(&ifname);
        }
        let names: Vec<String> = self.pipelines.keys().cloned().collect();
        for ifname in names {
            self.remove_pipeline(&ifname);
        }

        self.flush_writes().await;
        self.timers.cancel_all();
        for (_, subscription) in self.watches.drain() {
            self.caches.inet.unsubscribe(subscription);
        }
    }
}

/// Execute one queued store write
async fn execute(store: &dyn ConfigStore, events: &EventSink, write: &StoreWrite) -> Result<()> {
    match write {
        StoreWrite::InetConfig(ifname, update) => store.update_inet_config(ifname, update).await,
        StoreWrite::ResetIpv6(ifname) => store.reset_ipv6(ifname).await,
        StoreWrite::Uplink(ifname, update) => store.update_uplink(ifname, update).await,
        StoreWrite::DeleteUplink(ifname) => {
            if store.delete_uplink(ifname).await? {
                info!("{}: Removed uplink status row", ifname);
            }
            Ok(())
        }
        StoreWrite::WanStatus(wan_type, priority, status) => {
            store
                .set_wan_config_status(wan_type.as_str(), *priority, status.as_column())
                .await?;
            events.emit(EngineEvent::WanStatusWritten {
                wan_type: *wan_type,
                priority: *priority,
                status: *status,
            });
            Ok(())
        }
    }
}

fn apply_change<S: Clone, O: Clone>(
    cache: &mut ChangeCache<S, O>,
    change: RowChange<S>,
    key: impl Fn(&S) -> String,
) {
    match change {
        RowChange::New(row) => cache.on_row_new(&key(&row), row),
        RowChange::Modify(row) => cache.on_row_modify(&key(&row), row),
        RowChange::Delete(k) => cache.on_row_delete(&k),
    }
}

/// Plugin context backed by a fresh in-memory store and a detached loop
#[cfg(test)]
pub(crate) fn test_context(ifname: &str) -> crate::traits::PluginContext {
    let store: Arc<dyn ConfigStore> = Arc::new(crate::store::MemoryConfigStore::new());
    let (tx, _rx) = mpsc::unbounded_channel();
    let host = HostHandle::new(store.clone(), tx);
    crate::traits::PluginContext {
        ifname: ifname.to_string(),
        iftype: "eth".to_string(),
        store,
        wan: crate::wan::WanView::default(),
        reporter: host.reporter(ifname, 0),
        host: host.for_pipeline(ifname),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_event_clone_eq() {
        let event = EngineEvent::StateChanged {
            ifname: "eth0".to_string(),
            from: PipelineState::Init,
            to: PipelineState::Start,
        };
        assert_eq!(event.clone(), event);
    }

    #[tokio::test]
    async fn test_event_sink_drops_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let sink = EventSink::new(tx);
        sink.emit(EngineEvent::Started { pipelines: 1 });
        sink.emit(EngineEvent::Started { pipelines: 2 });

        assert_eq!(rx.recv().await, Some(EngineEvent::Started { pipelines: 1 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = WanoConfig::new();
        config.engine.event_channel_capacity = 0;
        let store: Arc<dyn ConfigStore> = Arc::new(crate::store::MemoryConfigStore::new());
        let result = Orchestrator::new(
            config,
            PluginRegistry::new(),
            store,
            Arc::new(crate::traits::AlwaysReachable),
        );
        assert!(result.is_err());
    }
}
