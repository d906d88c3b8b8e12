//! Per-interface plugin pipeline
//!
//! A pipeline owns the plugin instances of one interface and drives them
//! through the provisioning state machine:
//!
//! ```text
//!            ┌──────┐   ┌───────┐   ┌───────────┐   ┌────────────┐
//!  start ──► │ INIT │──►│ START │──►│ IF_ENABLE │──►│ IF_CARRIER │
//!            └──────┘   └───────┘   └───────────┘   └────────────┘
//!               ▲           ▲                              │ carrier
//!               │           │                              ▼
//!               │           │       ┌──────────────┐   ┌──────────────┐
//!               │           │       │ IF_IPV4_RESET│◄──│ PLUGIN_SCHED │◄─┐
//!               │           │       └──────────────┘   └──────────────┘  │
//!               │           │              │                             │ plugin
//!               │           │              ▼                             │ update
//!               │           │       ┌──────────────┐   ┌──────────────┐  │
//!               │           │       │ IF_IPV6_RESET│──►│  PLUGIN_RUN  │──┘
//!               │           │       └──────────────┘   └──────────────┘
//!               │           │ retry                           │ exhausted
//!               │           │       ┌───────┐                 ▼
//!               │           └───────│ ABORT │           ┌──────────┐
//!               │                   └───────┘           │   IDLE   │
//!               │ unfreeze                              └──────────┘
//!           ┌────────┐
//!           │ FREEZE │   (entered whenever the interface is bridged)
//!           └────────┘
//! ```
//!
//! ## Admission
//!
//! Each plugin claims the capability bits of its mask while it is in the run
//! queue (unless it detached). A waiting plugin is admitted only if its mask
//! does not intersect the running mask.
//!
//! ## Events
//!
//! All inputs (cache snapshots, plugin statuses, probe results, timers) are
//! delivered by the orchestrator loop. Handlers never block: store writes are
//! queued on [`Env::writes`] and executed by the loop in order, probes run in
//! their own task and post their result back.

mod backoff;

pub use backoff::{backoff, random_backoff};

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cache::{ChangeCache, Subscription};
use crate::config::WanoConfig;
use crate::engine::{EngineEvent, EventSink, HostHandle, LoopEvent, TimerKey, Timers};
use crate::registry::{PluginDescriptor, PluginHandle, PluginRegistry};
use crate::traits::{
    AssignScheme, InetConfigUpdate, InetState, MASK_IPV4, MASK_IPV6, PluginContext, PluginStatus,
    PortState, ReachabilityProbe, UplinkState, UplinkUpdate,
};
use crate::wan::{WanConfigStatus, WanConfigTable, WanRollup, WanSelector, WanType};

/// Unique identity of a plugin instance
pub type InstanceId = u64;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Allocate an instance identity, never 0
pub(crate) fn next_instance_id() -> InstanceId {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// Upper bound on chained state transitions for one input
const MAX_TRANSITIONS: usize = 64;

/// Pipeline state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineState {
    Init,
    Start,
    IfEnable,
    IfCarrier,
    PluginSched,
    IfIpv4Reset,
    IfIpv6Reset,
    PluginRun,
    Idle,
    Abort,
    Freeze,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineState::Init => "INIT",
            PipelineState::Start => "START",
            PipelineState::IfEnable => "IF_ENABLE",
            PipelineState::IfCarrier => "IF_CARRIER",
            PipelineState::PluginSched => "PLUGIN_SCHED",
            PipelineState::IfIpv4Reset => "IF_IPV4_RESET",
            PipelineState::IfIpv6Reset => "IF_IPV6_RESET",
            PipelineState::PluginRun => "PLUGIN_RUN",
            PipelineState::Idle => "IDLE",
            PipelineState::Abort => "ABORT",
            PipelineState::Freeze => "FREEZE",
        };
        f.write_str(s)
    }
}

/// Events a pipeline dispatches to its observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A plugin provisioned the link
    Ok,
    /// The pipeline ran out of plugins without an active one
    Idle,
    /// The pipeline (re)started
    Restart,
    /// The pipeline aborted
    Abort,
    /// The pipeline froze because the interface is bridged
    Freeze,
}

/// Pipeline exceptions; each one pre-empts the current state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    Restart,
    Abort,
    Freeze,
}

/// Store write queued by a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StoreWrite {
    InetConfig(String, InetConfigUpdate),
    ResetIpv6(String),
    Uplink(String, UplinkUpdate),
    DeleteUplink(String),
    WanStatus(WanType, i64, WanConfigStatus),
}

/// Observer of the interface state cache
#[derive(Debug, Clone)]
pub(crate) enum InetObserver {
    Pipeline(String),
    Watch(mpsc::UnboundedSender<Option<InetState>>),
}

/// Caches feeding the pipelines
pub(crate) struct Caches {
    pub(crate) inet: ChangeCache<InetState, InetObserver>,
    pub(crate) uplink: ChangeCache<UplinkState, String>,
    pub(crate) port: ChangeCache<PortState, String>,
}

impl Caches {
    pub(crate) fn new() -> Self {
        Self {
            inet: ChangeCache::new("inet_state"),
            uplink: ChangeCache::new("uplink"),
            port: ChangeCache::new("port"),
        }
    }

    pub(crate) fn has_pending(&self) -> bool {
        self.inet.has_pending() || self.uplink.has_pending() || self.port.has_pending()
    }
}

/// Orchestrator services borrowed by a pipeline while it handles one input
pub(crate) struct Env<'a> {
    pub(crate) registry: &'a PluginRegistry,
    pub(crate) config: &'a WanoConfig,
    pub(crate) wan_table: &'a WanConfigTable,
    pub(crate) caches: &'a mut Caches,
    pub(crate) timers: &'a mut Timers,
    pub(crate) writes: &'a mut Vec<StoreWrite>,
    pub(crate) rollup: &'a mut WanRollup,
    pub(crate) events: &'a EventSink,
    pub(crate) host: &'a HostHandle,
    pub(crate) probe: &'a Arc<dyn ReachabilityProbe>,
}

impl Env<'_> {
    fn schedule_rollup(&mut self) {
        self.timers.debounce(
            TimerKey::WanRollup,
            self.config.wan.status_debounce(),
            self.config.wan.status_debounce_max(),
        );
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// In the wait queue, not instantiated
    Waiting,
    /// Admitted and instantiated, waiting for the interface reset
    Scheduled,
    Running,
    /// Reported OK, reachability probe in flight
    Probing,
    /// Provisioned the link
    Active,
    /// Running without claiming capabilities
    Detached,
}

struct Slot {
    id: InstanceId,
    descriptor: Arc<PluginDescriptor>,
    handle: Option<PluginHandle>,
    phase: Phase,
    probe_task: Option<JoinHandle<()>>,
    /// Interface and type reported with OK, applied once the probe succeeds
    ok_target: Option<(String, Option<String>)>,
    /// Uplink row written for an overriding interface, deleted on release
    uplink_row: Option<String>,
}

impl Slot {
    fn new(descriptor: Arc<PluginDescriptor>) -> Self {
        Self {
            id: next_instance_id(),
            descriptor,
            handle: None,
            phase: Phase::Waiting,
            probe_task: None,
            ok_target: None,
            uplink_row: None,
        }
    }

    fn name(&self) -> &str {
        self.descriptor.name()
    }

    fn mask(&self) -> u64 {
        self.descriptor.mask()
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        if let Some(task) = self.probe_task.take() {
            task.abort();
        }
        if let Some(handle) = self.handle.as_mut() {
            handle.release();
        }
    }
}

struct PipelineSubs {
    inet: Subscription,
    uplink: Subscription,
    port: Subscription,
}

/// Map the pipeline interface type to the uplink table type
fn map_iftype(iftype: &str) -> &str {
    match iftype {
        "unmanaged" => "eth",
        other => other,
    }
}

/// Plugin pipeline of one interface
pub struct Pipeline {
    ifname: String,
    iftype: String,
    /// Plugins intersecting this mask are never scheduled
    emask: u64,
    /// Spawn token of the plugin that created this (child) pipeline
    owner: Option<u64>,
    state: PipelineState,
    waitq: Vec<Slot>,
    runq: Vec<Slot>,
    pending_reset: u64,
    retries: u32,
    immediate_deadline: Instant,
    bridged: bool,
    uplink_has_bridge: bool,
    has_l3: bool,
    carrier_armed: bool,
    dhcp_released: bool,
    inet: Option<InetState>,
    selector: Option<WanSelector>,
    subs: Option<PipelineSubs>,
    observers: Vec<mpsc::UnboundedSender<PipelineEvent>>,
    started: bool,
}

impl Pipeline {
    /// Create a pipeline; nothing happens until [`start()`](Self::start)
    ///
    /// # Parameters
    ///
    /// - `ifname`: Interface to provision
    /// - `iftype`: Interface type written to the interface config
    /// - `emask`: Exclusion mask
    /// - `with_selector`: Attach a WAN configuration selector (built-in
    ///   uplinks); child pipelines run without one
    /// - `owner`: Spawn token of the creating plugin, if any
    pub(crate) fn new(
        ifname: impl Into<String>,
        iftype: impl Into<String>,
        emask: u64,
        with_selector: bool,
        owner: Option<u64>,
    ) -> Self {
        Self {
            ifname: ifname.into(),
            iftype: iftype.into(),
            emask,
            owner,
            state: PipelineState::Init,
            waitq: Vec::new(),
            runq: Vec::new(),
            pending_reset: 0,
            retries: 0,
            immediate_deadline: Instant::now(),
            bridged: false,
            uplink_has_bridge: false,
            has_l3: false,
            carrier_armed: false,
            dhcp_released: false,
            inet: None,
            selector: with_selector.then(WanSelector::new),
            subs: None,
            observers: Vec::new(),
            started: false,
        }
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn iftype(&self) -> &str {
        &self.iftype
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn has_l3(&self) -> bool {
        self.has_l3
    }

    pub(crate) fn owner(&self) -> Option<u64> {
        self.owner
    }

    pub(crate) fn selector_mut(&mut self) -> Option<&mut WanSelector> {
        self.selector.as_mut()
    }

    /// OR of the masks of run-queue instances that have not detached
    pub fn running_mask(&self) -> u64 {
        self.runq
            .iter()
            .filter(|s| s.phase != Phase::Detached)
            .fold(0, |mask, s| mask | s.mask())
    }

    pub(crate) fn add_observer(&mut self, tx: mpsc::UnboundedSender<PipelineEvent>) {
        self.observers.push(tx);
    }

    fn dispatch(&mut self, event: PipelineEvent) {
        debug!("{}: Pipeline event {:?}", self.ifname, event);
        self.observers.retain(|tx| tx.send(event).is_ok());
    }

    fn should_freeze(&self) -> bool {
        self.bridged || self.uplink_has_bridge
    }

    fn refresh_inet(&self, env: &mut Env<'_>) {
        if let Some(subs) = &self.subs {
            env.caches.inet.refresh(&subs.inet);
        }
    }

    fn request_pause(&mut self, pause: bool, env: &mut Env<'_>) {
        if let Some(selector) = self.selector.as_mut() {
            selector.request_pause(pause);
            env.rollup.mark_pause();
            env.schedule_rollup();
        }
    }

    fn write_inet(&self, env: &mut Env<'_>, update: InetConfigUpdate) {
        env.writes
            .push(StoreWrite::InetConfig(self.ifname.clone(), update));
    }

    fn write_uplink(&self, env: &mut Env<'_>, ifname: &str, update: UplinkUpdate) {
        env.writes
            .push(StoreWrite::Uplink(ifname.to_string(), update));
    }

    fn immediate_window(&self, env: &Env<'_>) -> Instant {
        Instant::now() + env.config.pipeline.immediate_restart()
    }

    /// Subscribe to the caches and enter INIT
    pub(crate) fn start(&mut self, env: &mut Env<'_>) {
        if self.started {
            return;
        }
        self.started = true;

        self.subs = Some(PipelineSubs {
            inet: env
                .caches
                .inet
                .subscribe(&self.ifname, InetObserver::Pipeline(self.ifname.clone())),
            uplink: env.caches.uplink.subscribe(&self.ifname, self.ifname.clone()),
            port: env.caches.port.subscribe(&self.ifname, self.ifname.clone()),
        });

        if let Some(selector) = self.selector.as_mut() {
            selector.reset(env.wan_table);
        }

        self.transition(PipelineState::Init, env);
    }

    /// Stop the pipeline and release everything it holds
    ///
    /// Safe on a pipeline that never started and safe to call twice.
    pub(crate) fn teardown(&mut self, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        self.started = false;
        info!("{}: Tearing down pipeline", self.ifname);

        env.timers.cancel(&TimerKey::Retry(self.ifname.clone()));
        for slot in std::mem::take(&mut self.runq) {
            self.release_slot(slot, env);
        }
        self.waitq.clear();

        if let Some(subs) = self.subs.take() {
            env.caches.inet.unsubscribe(subs.inet);
            env.caches.uplink.unsubscribe(subs.uplink);
            env.caches.port.unsubscribe(subs.port);
        }

        env.writes.push(StoreWrite::DeleteUplink(self.ifname.clone()));

        if let Some(selector) = self.selector.take() {
            // The remaining selectors decide the rollup from now on
            for key in selector.status_keys() {
                env.rollup.mark(key);
            }
            env.rollup.mark_pause();
            env.schedule_rollup();
        }

        self.observers.clear();
    }

    /// Drive chained transitions starting at `next`
    fn transition(&mut self, next: PipelineState, env: &mut Env<'_>) {
        let mut next = Some(next);
        let mut steps = 0;
        while let Some(to) = next {
            steps += 1;
            if steps > MAX_TRANSITIONS {
                error!(
                    "{}: Transition loop detected at {}, parking pipeline",
                    self.ifname, to
                );
                break;
            }

            let from = self.state;
            self.state = to;
            info!("{}: {} -> {}", self.ifname, from, to);
            env.events.emit(EngineEvent::StateChanged {
                ifname: self.ifname.clone(),
                from,
                to,
            });
            next = self.enter(to, env);
        }
    }

    fn enter(&mut self, state: PipelineState, env: &mut Env<'_>) -> Option<PipelineState> {
        match state {
            PipelineState::Init => self.enter_init(env),
            PipelineState::Start => self.enter_start(),
            PipelineState::IfEnable => self.enter_if_enable(env),
            PipelineState::IfCarrier => {
                info!("{}: Waiting for carrier.", self.ifname);
                self.refresh_inet(env);
                None
            }
            PipelineState::PluginSched => {
                self.schedule(env);
                Some(PipelineState::IfIpv4Reset)
            }
            PipelineState::IfIpv4Reset => self.enter_ipv4_reset(env),
            PipelineState::IfIpv6Reset => self.enter_ipv6_reset(env),
            PipelineState::PluginRun => self.enter_plugin_run(env),
            PipelineState::Idle => self.enter_idle(env),
            PipelineState::Abort => self.enter_abort(env),
            PipelineState::Freeze => self.enter_freeze(env),
        }
    }

    fn enter_init(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        self.dispatch(PipelineEvent::Restart);
        self.reset_plugins(true, env);
        self.dhcp_released = false;

        env.writes.push(StoreWrite::DeleteUplink(self.ifname.clone()));
        self.immediate_deadline = self.immediate_window(env);
        self.write_uplink(
            env,
            &self.ifname,
            UplinkUpdate {
                if_type: Some(map_iftype(&self.iftype).to_string()),
                has_l2: Some(false),
                ..Default::default()
            },
        );
        self.request_pause(true, env);
        self.has_l3 = false;

        if self.should_freeze() {
            return Some(PipelineState::Freeze);
        }
        Some(PipelineState::Start)
    }

    fn enter_start(&mut self) -> Option<PipelineState> {
        if self.waitq.is_empty() && self.runq.is_empty() {
            warn!(
                "{}: Plug-in pipeline is empty (mask = {:#x}).",
                self.ifname, self.emask
            );
        }
        Some(PipelineState::IfEnable)
    }

    fn enter_if_enable(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        info!("{}: Enabling interface.", self.ifname);
        self.write_inet(
            env,
            InetConfigUpdate {
                if_type: Some(self.iftype.clone()),
                enabled: Some(true),
                network: Some(true),
                nat: Some(true),
                ip_assign_scheme: Some(AssignScheme::None),
                ..Default::default()
            },
        );
        self.refresh_inet(env);
        None
    }

    fn enter_ipv4_reset(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        if self.pending_reset & MASK_IPV4 == 0 {
            return Some(PipelineState::IfIpv6Reset);
        }
        self.pending_reset &= !MASK_IPV4;

        info!(
            "{}: An IPv4 plugin is scheduled to run, resetting IPv4 settings.",
            self.ifname
        );
        self.write_inet(
            env,
            InetConfigUpdate {
                ip_assign_scheme: Some(AssignScheme::None),
                ..Default::default()
            },
        );
        self.refresh_inet(env);
        None
    }

    fn enter_ipv6_reset(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        if self.pending_reset & MASK_IPV6 != 0 {
            info!(
                "{}: An IPv6 plugin is scheduled to run, resetting IPv6 settings.",
                self.ifname
            );
            self.pending_reset = 0;
            env.writes.push(StoreWrite::ResetIpv6(self.ifname.clone()));
            // Plugins start once the reset has landed in the store
            self.refresh_inet(env);
            return None;
        }
        self.pending_reset = 0;
        Some(PipelineState::PluginRun)
    }

    fn enter_plugin_run(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        let timeout = env.config.pipeline.plugin_timeout();
        for slot in self.runq.iter_mut().filter(|s| s.phase == Phase::Scheduled) {
            slot.phase = Phase::Running;
            env.timers
                .arm(TimerKey::PluginTimeout(self.ifname.clone(), slot.id), timeout);
            info!("{}: Starting plug-in {}", self.ifname, slot.descriptor.name());
            env.events.emit(EngineEvent::PluginStarted {
                ifname: self.ifname.clone(),
                plugin: slot.descriptor.name().to_string(),
            });
            if let Some(handle) = slot.handle.as_mut() {
                handle.run();
            }
        }

        let running = self
            .runq
            .iter()
            .any(|s| matches!(s.phase, Phase::Running | Phase::Probing));
        if running {
            return None;
        }

        if !self.dhcp_released
            && self.at_last_config(env)
            && self.waitq.iter().any(|s| s.descriptor.is_dhcp_class())
        {
            info!("{}: Last WAN configuration, releasing DHCP plug-ins.", self.ifname);
            self.dhcp_released = true;
            return Some(PipelineState::PluginSched);
        }

        info!("{}: Pipeline exhausted plug-ins.", self.ifname);
        Some(PipelineState::Idle)
    }

    fn enter_idle(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        let active = self.runq.iter().any(|s| s.phase == Phase::Active);

        if !active {
            self.dispatch(PipelineEvent::Idle);
        }

        self.reset_plugins(false, env);
        self.dhcp_released = false;

        if active {
            info!("{}: Active plug-ins present, not resetting has_L3.", self.ifname);
        } else {
            // Move on to the next WAN configuration for the next attempt
            if let Some(selector) = self.selector.as_mut() {
                selector.next(env.wan_table);
            }

            let exhausted = self
                .selector
                .as_ref()
                .map(|s| s.rollover_count() > 0)
                .unwrap_or(true);
            if exhausted {
                self.write_uplink(
                    env,
                    &self.ifname,
                    UplinkUpdate {
                        has_l3: Some(Some(false)),
                        ..Default::default()
                    },
                );
            } else {
                info!(
                    "{}: Not updating has_L3 as WAN configuration not exhausted yet.",
                    self.ifname
                );
            }

            self.write_inet(
                env,
                InetConfigUpdate {
                    nat: Some(false),
                    ..Default::default()
                },
            );

            let now = Instant::now();
            if now < self.immediate_deadline {
                info!(
                    "{}: Performing immediate restarts for the next {:.2} seconds.",
                    self.ifname,
                    (self.immediate_deadline - now).as_secs_f64()
                );
                return Some(PipelineState::Start);
            }
        }

        let cfg = &env.config.pipeline;
        let delay = random_backoff(cfg.retry_base(), self.retries, cfg.retry_cap);
        self.arm_retry(delay, env);
        info!(
            "{}: Entered IDLE state, pipeline retry timer is {:.2} seconds.",
            self.ifname,
            delay.as_secs_f64()
        );
        None
    }

    fn enter_abort(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        self.dispatch(PipelineEvent::Abort);
        self.reset_plugins(true, env);
        self.dhcp_released = false;

        self.write_uplink(
            env,
            &self.ifname,
            UplinkUpdate {
                has_l3: Some(Some(false)),
                ..Default::default()
            },
        );
        self.write_inet(
            env,
            InetConfigUpdate {
                ip_assign_scheme: Some(AssignScheme::None),
                nat: Some(false),
                ..Default::default()
            },
        );

        let cfg = &env.config.pipeline;
        let delay = random_backoff(cfg.retry_base(), cfg.retry_cap, cfg.retry_cap);
        self.arm_retry(delay, env);
        info!(
            "{}: Entered ABORT state, pipeline retry timer is {:.2} seconds.",
            self.ifname,
            delay.as_secs_f64()
        );
        None
    }

    fn enter_freeze(&mut self, env: &mut Env<'_>) -> Option<PipelineState> {
        info!("{}: Pipeline frozen.", self.ifname);
        self.dispatch(PipelineEvent::Freeze);
        self.reset_plugins(true, env);
        self.carrier_armed = false;

        if !self.has_l3 {
            self.write_inet(
                env,
                InetConfigUpdate {
                    nat: Some(false),
                    ip_assign_scheme: Some(AssignScheme::None),
                    ..Default::default()
                },
            );
        }
        self.request_pause(true, env);
        None
    }

    fn arm_retry(&mut self, delay: std::time::Duration, env: &mut Env<'_>) {
        env.timers.arm(TimerKey::Retry(self.ifname.clone()), delay);
        self.retries += 1;
        env.events.emit(EngineEvent::RetryScheduled {
            ifname: self.ifname.clone(),
            delay,
            retries: self.retries,
        });
    }

    fn at_last_config(&self, env: &Env<'_>) -> bool {
        self.selector
            .as_ref()
            .map(|s| s.is_last_config(env.wan_table))
            .unwrap_or(true)
    }

    /// DHCP-class plugins are held back while other WAN configurations remain
    fn dhcp_allowed(&self, env: &Env<'_>) -> bool {
        if self.dhcp_released || env.wan_table.is_empty() {
            return true;
        }
        match &self.selector {
            None => true,
            Some(selector) => selector.config_for(env.wan_table, WanType::Dhcp).is_some(),
        }
    }

    fn release_slot(&self, mut slot: Slot, env: &mut Env<'_>) {
        env.timers
            .cancel(&TimerKey::PluginTimeout(self.ifname.clone(), slot.id));
        if let Some(row) = slot.uplink_row.take() {
            debug!("{}: Removing uplink row of {}", self.ifname, row);
            env.writes.push(StoreWrite::DeleteUplink(row));
        }
        drop(slot);
    }

    /// Return plugins to the wait queue
    ///
    /// With `force == false` active and detached instances survive.
    fn reset_plugins(&mut self, force: bool, env: &mut Env<'_>) {
        let runq = std::mem::take(&mut self.runq);
        for slot in runq {
            if !force && matches!(slot.phase, Phase::Active | Phase::Detached) {
                self.runq.push(slot);
            } else {
                debug!("{}: Stopping plug-in {}", self.ifname, slot.name());
                self.release_slot(slot, env);
            }
        }

        self.waitq.clear();
        self.pending_reset = 0;
        for descriptor in env.registry.iter() {
            if descriptor.mask() & self.emask != 0 {
                continue;
            }
            if self
                .runq
                .iter()
                .any(|s| Arc::ptr_eq(&s.descriptor, descriptor))
            {
                continue;
            }
            self.waitq.push(Slot::new(descriptor.clone()));
        }
    }

    /// Admit waiting plugins that do not conflict with the running mask
    fn schedule(&mut self, env: &mut Env<'_>) {
        let mut mask = self.running_mask();
        let dhcp_allowed = self.dhcp_allowed(env);
        let view = self
            .selector
            .as_ref()
            .map(|s| s.view(env.wan_table))
            .unwrap_or_default();

        let waiting = std::mem::take(&mut self.waitq);
        for mut slot in waiting {
            if slot.mask() & mask != 0 || (slot.descriptor.is_dhcp_class() && !dhcp_allowed) {
                self.waitq.push(slot);
                continue;
            }

            let ctx = PluginContext {
                ifname: self.ifname.clone(),
                iftype: self.iftype.clone(),
                store: env.host.store(),
                wan: view.clone(),
                reporter: env.host.reporter(&self.ifname, slot.id),
                host: env.host.for_pipeline(&self.ifname),
            };
            match env.registry.instantiate(&slot.descriptor, ctx) {
                Some(handle) => {
                    debug!("{}: Scheduling plug-in: {}", self.ifname, slot.name());
                    mask |= slot.mask();
                    self.pending_reset |= slot.mask();
                    slot.handle = Some(handle);
                    slot.phase = Phase::Scheduled;
                    self.runq.push(slot);
                }
                None => {
                    info!("{}: Skipping plug-in {}", self.ifname, slot.name());
                }
            }
        }
    }

    /// PLUGIN_UPDATE: the run queue changed
    fn plugin_update(&mut self, env: &mut Env<'_>) {
        match self.state {
            PipelineState::IfIpv4Reset | PipelineState::IfIpv6Reset | PipelineState::PluginRun => {
                self.transition(PipelineState::PluginSched, env)
            }
            _ => {}
        }
    }

    /// Raise an exception
    ///
    /// A frozen pipeline only leaves FREEZE through unfreeze.
    pub(crate) fn raise(&mut self, exception: Exception, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        if self.state == PipelineState::Freeze && exception != Exception::Freeze {
            debug!("{}: Ignoring {:?} while frozen", self.ifname, exception);
            return;
        }

        self.immediate_deadline = self.immediate_window(env);
        env.timers.cancel(&TimerKey::Retry(self.ifname.clone()));

        let next = match exception {
            Exception::Restart => PipelineState::Init,
            Exception::Abort => PipelineState::Abort,
            Exception::Freeze => PipelineState::Freeze,
        };
        self.transition(next, env);
    }

    /// Reset the WAN selector to its first configuration
    pub(crate) fn reset_selector(&mut self, table: &WanConfigTable) {
        if let Some(selector) = self.selector.as_mut() {
            selector.reset(table);
        }
    }

    fn check_freeze(&mut self, env: &mut Env<'_>) {
        let freeze = self.should_freeze();
        if !freeze && self.state == PipelineState::Freeze {
            info!("{}: Unfreezing pipeline.", self.ifname);
            self.request_pause(false, env);
            self.transition(PipelineState::Init, env);
        } else if freeze && self.state != PipelineState::Freeze {
            self.raise(Exception::Freeze, env);
        }
    }

    pub(crate) fn on_inet_state(&mut self, snapshot: Option<InetState>, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        self.inet = snapshot.clone();

        let carrier = snapshot.as_ref().map(|s| s.port_state).unwrap_or(false);
        if self.carrier_armed && !carrier {
            info!("{}: Carrier loss detected.", self.ifname);
            self.carrier_armed = false;
            self.raise(Exception::Restart, env);
            return;
        }

        let Some(state) = snapshot else {
            return;
        };

        let next = match self.state {
            PipelineState::IfEnable => (state.enabled
                && state.network
                && state.nat
                && state.ip_assign_scheme == AssignScheme::None)
                .then_some(PipelineState::IfCarrier),
            PipelineState::IfCarrier if state.port_state => {
                self.request_pause(false, env);
                self.carrier_armed = true;
                self.write_uplink(
                    env,
                    &self.ifname,
                    UplinkUpdate {
                        has_l2: Some(true),
                        ..Default::default()
                    },
                );
                info!("{}: Carrier detected.", self.ifname);
                Some(PipelineState::PluginSched)
            }
            PipelineState::IfIpv4Reset => (state.ip_assign_scheme == AssignScheme::None
                && (state.inet_addr.is_none() || self.iftype == "unmanaged"))
                .then_some(PipelineState::IfIpv6Reset),
            PipelineState::IfIpv6Reset => Some(PipelineState::PluginRun),
            _ => None,
        };

        if let Some(next) = next {
            self.transition(next, env);
        }
    }

    pub(crate) fn on_uplink(&mut self, snapshot: Option<UplinkState>, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        self.uplink_has_bridge = snapshot
            .and_then(|s| s.bridge)
            .is_some_and(|b| !b.is_empty());
        self.check_freeze(env);
    }

    pub(crate) fn on_port(&mut self, snapshot: Option<PortState>, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        self.bridged = snapshot.is_some();
        self.check_freeze(env);
    }

    fn slot_index(&self, id: InstanceId) -> Option<usize> {
        self.runq.iter().position(|s| s.id == id)
    }

    pub(crate) fn on_plugin_status(
        &mut self,
        id: InstanceId,
        status: PluginStatus,
        env: &mut Env<'_>,
    ) {
        if !self.started {
            return;
        }
        let Some(idx) = self.slot_index(id) else {
            debug!("{}: Dropping status {} of a stale instance", self.ifname, status);
            return;
        };
        let plugin = self.runq[idx].name().to_string();
        env.events.emit(EngineEvent::PluginStatus {
            ifname: self.ifname.clone(),
            plugin: plugin.clone(),
            status: status.clone(),
        });

        match status {
            PluginStatus::Ok { ifname, iftype } => {
                let slot = &mut self.runq[idx];
                if matches!(slot.phase, Phase::Probing | Phase::Active) {
                    debug!("{}: Plug-in {} already reported OK", self.ifname, plugin);
                    return;
                }
                env.timers
                    .cancel(&TimerKey::PluginTimeout(self.ifname.clone(), id));
                slot.phase = Phase::Probing;

                let target = ifname.unwrap_or_else(|| self.ifname.clone());
                let local_addr = if target == self.ifname {
                    self.inet.as_ref().and_then(|s| s.inet_addr)
                } else {
                    env.caches.inet.snapshot(&target).and_then(|s| s.inet_addr)
                };
                slot.ok_target = Some((target.clone(), iftype));

                let probe = env.probe.clone();
                let tx = env.host.sender();
                let pipeline = self.ifname.clone();
                slot.probe_task = Some(tokio::spawn(async move {
                    let reachable = probe.probe(&target, local_addr.map(Into::into)).await;
                    let _ = tx.send(LoopEvent::ProbeDone {
                        ifname: pipeline,
                        instance: id,
                        reachable,
                    });
                }));
            }

            PluginStatus::Reserved { iftype, .. } => {
                info!("{}: Interface reserved: {}", self.ifname, plugin);
                env.timers
                    .cancel(&TimerKey::PluginTimeout(self.ifname.clone(), id));
                self.runq[idx].phase = Phase::Active;

                let iftype = iftype.unwrap_or_else(|| map_iftype(&self.iftype).to_string());
                self.write_uplink(
                    env,
                    &self.ifname,
                    UplinkUpdate {
                        if_type: Some(iftype),
                        has_l2: Some(true),
                        has_l3: Some(None),
                        ..Default::default()
                    },
                );
                self.has_l3 = true;
                self.retries = 0;
                self.dispatch(PipelineEvent::Ok);
                env.events.emit(EngineEvent::Provisioned {
                    ifname: self.ifname.clone(),
                    plugin,
                    target: self.ifname.clone(),
                    l3: false,
                    at: Utc::now(),
                });
            }

            PluginStatus::Skip => {
                info!("{}: Plug-in requested skip: {}", self.ifname, plugin);
                let slot = self.runq.remove(idx);
                self.release_slot(slot, env);
                self.plugin_update(env);
            }

            PluginStatus::Error => {
                error!(
                    "{}: Error detected running plug-in: {}. Skipping.",
                    self.ifname, plugin
                );
                let slot = self.runq.remove(idx);
                self.release_slot(slot, env);
                self.plugin_update(env);
            }

            PluginStatus::Busy => {
                info!(
                    "{}: Plug-in {} is busy, stopping timeout timer and resetting has_L3.",
                    self.ifname, plugin
                );
                self.write_uplink(
                    env,
                    &self.ifname,
                    UplinkUpdate {
                        has_l3: Some(None),
                        ..Default::default()
                    },
                );
                env.timers
                    .cancel(&TimerKey::PluginTimeout(self.ifname.clone(), id));
            }

            PluginStatus::Detach => {
                info!("{}: Plug-in {} detached.", self.ifname, plugin);
                env.timers
                    .cancel(&TimerKey::PluginTimeout(self.ifname.clone(), id));
                self.runq[idx].phase = Phase::Detached;
                self.plugin_update(env);
            }

            PluginStatus::Restart => self.raise(Exception::Restart, env),
            PluginStatus::Abort => self.raise(Exception::Abort, env),
        }
    }

    /// Remove an instance as failed and reschedule
    fn force_error(&mut self, idx: usize, env: &mut Env<'_>) {
        let slot = self.runq.remove(idx);
        self.release_slot(slot, env);
        self.plugin_update(env);
    }

    pub(crate) fn on_plugin_timeout(&mut self, id: InstanceId, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        let Some(idx) = self.slot_index(id) else {
            return;
        };
        if self.runq[idx].phase != Phase::Running {
            return;
        }
        let plugin = self.runq[idx].name().to_string();
        warn!("{}: Plug-in timed out: {}. Terminating.", self.ifname, plugin);
        env.events.emit(EngineEvent::PluginTimedOut {
            ifname: self.ifname.clone(),
            plugin,
        });
        self.force_error(idx, env);
    }

    pub(crate) fn on_probe_done(&mut self, id: InstanceId, reachable: bool, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        let Some(idx) = self.slot_index(id) else {
            return;
        };
        if self.runq[idx].phase != Phase::Probing {
            return;
        }
        let slot = &mut self.runq[idx];
        slot.probe_task = None;
        let plugin = slot.name().to_string();
        let (target, iftype) = slot
            .ok_target
            .take()
            .unwrap_or_else(|| (self.ifname.clone(), None));

        if !reachable {
            warn!(
                "{}: WAN plug-in fail: {}, WAN probe failed",
                target, plugin
            );
            env.events.emit(EngineEvent::ProbeFailed {
                ifname: self.ifname.clone(),
                plugin,
            });
            self.force_error(idx, env);
            return;
        }

        slot.phase = Phase::Active;
        info!("{}: WAN plug-in success: {}", self.ifname, plugin);

        if target != self.ifname {
            slot.uplink_row = Some(target.clone());
            self.write_uplink(
                env,
                &self.ifname,
                UplinkUpdate {
                    has_l3: Some(None),
                    ..Default::default()
                },
            );
        }
        let iftype = iftype.unwrap_or_else(|| map_iftype(&self.iftype).to_string());
        self.write_uplink(
            env,
            &target,
            UplinkUpdate {
                if_type: Some(iftype),
                has_l2: Some(true),
                has_l3: Some(Some(true)),
                loop_detected: Some(false),
            },
        );

        self.has_l3 = true;
        self.retries = 0;
        self.dispatch(PipelineEvent::Ok);
        env.events.emit(EngineEvent::Provisioned {
            ifname: self.ifname.clone(),
            plugin,
            target,
            l3: true,
            at: Utc::now(),
        });
    }

    pub(crate) fn on_retry_timer(&mut self, env: &mut Env<'_>) {
        if !self.started {
            return;
        }
        let next = match self.state {
            PipelineState::Idle => {
                info!("{}: Idle timeout reached, restarting pipeline.", self.ifname);
                if self.runq.iter().any(|s| s.phase == Phase::Active) {
                    PipelineState::PluginSched
                } else {
                    PipelineState::Start
                }
            }
            PipelineState::Abort => {
                info!("{}: Abort timeout reached, restarting pipeline.", self.ifname);
                PipelineState::Start
            }
            _ => return,
        };
        self.transition(next, env);
    }

    pub(crate) fn on_wan_status(
        &mut self,
        wan_type: WanType,
        priority: i64,
        status: WanConfigStatus,
        env: &mut Env<'_>,
    ) {
        if let Some(selector) = self.selector.as_mut() {
            debug!(
                "{}: WAN status {} priority {} -> {:?}",
                self.ifname, wan_type, priority, status
            );
            selector.status_set(wan_type, priority, status);
            env.rollup.mark((wan_type, priority));
            env.schedule_rollup();
        }
    }

    #[cfg(test)]
    fn phases(&self) -> Vec<(String, Phase)> {
        self.runq
            .iter()
            .map(|s| (s.name().to_string(), s.phase))
            .collect()
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("ifname", &self.ifname)
            .field("state", &self.state)
            .field("waitq", &self.waitq.len())
            .field("runq", &self.runq.len())
            .field("retries", &self.retries)
            .finish()
    }
}
