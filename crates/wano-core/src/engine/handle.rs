//! Handles given to plugin instances
//!
//! Instances never touch orchestrator state directly. Everything they do
//! (report a status, watch an interface, spawn a child pipeline) is a message
//! posted into the orchestrator loop and handled there in order.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use super::LoopEvent;
use crate::pipeline::{InstanceId, PipelineEvent};
use crate::traits::{ConfigStore, InetState, PluginStatus};
use crate::wan::{WanConfigStatus, WanType};

/// Status mailbox of one plugin instance
#[derive(Clone)]
pub struct StatusReporter {
    ifname: String,
    instance: InstanceId,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl StatusReporter {
    /// Post a status to the owning pipeline
    ///
    /// Statuses of released instances are dropped by the pipeline. Returns
    /// false if the orchestrator has stopped.
    pub fn report(&self, status: PluginStatus) -> bool {
        self.tx
            .send(LoopEvent::PluginStatus {
                ifname: self.ifname.clone(),
                instance: self.instance,
                status,
            })
            .is_ok()
    }

    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }
}

impl fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatusReporter")
            .field("ifname", &self.ifname)
            .field("instance", &self.instance)
            .finish()
    }
}

/// Access to orchestrator services
#[derive(Clone)]
pub struct HostHandle {
    /// Pipeline the handle was issued to; empty for the orchestrator itself
    ifname: String,
    store: Arc<dyn ConfigStore>,
    tx: mpsc::UnboundedSender<LoopEvent>,
    ids: Arc<AtomicU64>,
}

impl HostHandle {
    pub(crate) fn new(store: Arc<dyn ConfigStore>, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            ifname: String::new(),
            store,
            tx,
            ids: Arc::new(AtomicU64::new(1)),
        }
    }

    pub(crate) fn for_pipeline(&self, ifname: &str) -> Self {
        Self {
            ifname: ifname.to_string(),
            ..self.clone()
        }
    }

    pub(crate) fn reporter(&self, ifname: &str, instance: InstanceId) -> StatusReporter {
        StatusReporter {
            ifname: ifname.to_string(),
            instance,
            tx: self.tx.clone(),
        }
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<LoopEvent> {
        self.tx.clone()
    }

    pub fn store(&self) -> Arc<dyn ConfigStore> {
        self.store.clone()
    }

    /// Observe the interface state of `ifname`
    ///
    /// The current snapshot (if known) is delivered first, then every change.
    /// `None` means the row does not exist (anymore). Dropping the watch
    /// releases the cache reference.
    pub fn watch_inet_state(&self, ifname: &str) -> InetStateWatch {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = self.tx.send(LoopEvent::WatchInetState {
            id,
            ifname: ifname.to_string(),
            tx,
        });
        InetStateWatch {
            id,
            rx,
            loop_tx: self.tx.clone(),
        }
    }

    /// Create a child pipeline on `ifname`
    ///
    /// The child never schedules plugins intersecting `emask`. Its pipeline
    /// events are delivered through the returned watch; dropping the watch
    /// tears the child down. If a pipeline already exists on `ifname` the
    /// request is refused and the watch yields `None` immediately.
    pub fn spawn_pipeline(&self, ifname: &str, iftype: &str, emask: u64) -> PipelineWatch {
        let token = self.ids.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        debug!("{}: Requesting child pipeline on {}", self.ifname, ifname);
        let _ = self.tx.send(LoopEvent::SpawnPipeline {
            token,
            ifname: ifname.to_string(),
            iftype: iftype.to_string(),
            emask,
            observer: tx,
        });
        PipelineWatch {
            token,
            ifname: ifname.to_string(),
            rx,
            loop_tx: self.tx.clone(),
        }
    }

    /// Report the outcome of a WAN configuration on this pipeline
    pub fn set_wan_status(&self, wan_type: WanType, priority: i64, status: WanConfigStatus) {
        let _ = self.tx.send(LoopEvent::WanStatus {
            ifname: self.ifname.clone(),
            wan_type,
            priority,
            status,
        });
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostHandle")
            .field("ifname", &self.ifname)
            .finish()
    }
}

/// Live interface state subscription
#[derive(Debug)]
pub struct InetStateWatch {
    id: u64,
    rx: mpsc::UnboundedReceiver<Option<InetState>>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
}

impl InetStateWatch {
    /// Next snapshot; `None` once the orchestrator stopped
    pub async fn recv(&mut self) -> Option<Option<InetState>> {
        self.rx.recv().await
    }
}

impl Drop for InetStateWatch {
    fn drop(&mut self) {
        let _ = self.loop_tx.send(LoopEvent::Unwatch { id: self.id });
    }
}

/// Observer side of a child pipeline
#[derive(Debug)]
pub struct PipelineWatch {
    token: u64,
    ifname: String,
    rx: mpsc::UnboundedReceiver<PipelineEvent>,
    loop_tx: mpsc::UnboundedSender<LoopEvent>,
}

impl PipelineWatch {
    pub fn ifname(&self) -> &str {
        &self.ifname
    }

    /// Next pipeline event; `None` once the child is gone
    pub async fn recv(&mut self) -> Option<PipelineEvent> {
        self.rx.recv().await
    }
}

impl Drop for PipelineWatch {
    fn drop(&mut self) {
        let _ = self.loop_tx.send(LoopEvent::TeardownPipeline {
            token: self.token,
            ifname: std::mem::take(&mut self.ifname),
        });
    }
}
