//! Plugin contexts without an orchestrator
//!
//! Lets plugin crates drive a single instance in unit tests: statuses, WAN
//! statuses and interface watches end up in a [`DetachedHost`] instead of the
//! orchestrator loop. Child pipelines are not supported.

use std::sync::Arc;

use tokio::sync::mpsc;

use super::{HostHandle, LoopEvent};
use crate::pipeline::next_instance_id;
use crate::traits::{ConfigStore, InetState, PluginContext, PluginStatus};
use crate::wan::{WanConfigStatus, WanType, WanView};

/// Build a plugin context whose host requests are captured
pub fn detached_context(
    ifname: &str,
    iftype: &str,
    store: Arc<dyn ConfigStore>,
    wan: WanView,
) -> (PluginContext, DetachedHost) {
    let (tx, rx) = mpsc::unbounded_channel();
    let host = HostHandle::new(store.clone(), tx).for_pipeline(ifname);
    let ctx = PluginContext {
        ifname: ifname.to_string(),
        iftype: iftype.to_string(),
        store,
        wan,
        reporter: host.reporter(ifname, next_instance_id()),
        host,
    };
    let detached = DetachedHost {
        rx,
        watches: Vec::new(),
        statuses: Vec::new(),
        wan_statuses: Vec::new(),
    };
    (ctx, detached)
}

/// Captured host side of a detached plugin context
#[derive(Debug)]
pub struct DetachedHost {
    rx: mpsc::UnboundedReceiver<LoopEvent>,
    watches: Vec<(u64, String, mpsc::UnboundedSender<Option<InetState>>)>,
    statuses: Vec<PluginStatus>,
    wan_statuses: Vec<(WanType, i64, WanConfigStatus)>,
}

impl DetachedHost {
    fn record(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::PluginStatus { status, .. } => self.statuses.push(status),
            LoopEvent::WanStatus {
                wan_type,
                priority,
                status,
                ..
            } => self.wan_statuses.push((wan_type, priority, status)),
            LoopEvent::WatchInetState { id, ifname, tx } => self.watches.push((id, ifname, tx)),
            LoopEvent::Unwatch { id } => self.watches.retain(|(w, _, _)| *w != id),
            _ => {}
        }
    }

    fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            self.record(event);
        }
    }

    /// Deliver an interface state snapshot to every watch on its interface
    pub fn publish(&mut self, state: &InetState) {
        self.drain();
        for (_, ifname, tx) in &self.watches {
            if *ifname == state.ifname {
                let _ = tx.send(Some(state.clone()));
            }
        }
    }

    /// Number of live watches on `ifname`
    pub fn watching(&mut self, ifname: &str) -> usize {
        self.drain();
        self.watches.iter().filter(|(_, i, _)| i == ifname).count()
    }

    /// Wait for the next reported plugin status
    pub async fn next_status(&mut self) -> Option<PluginStatus> {
        loop {
            self.drain();
            if !self.statuses.is_empty() {
                return Some(self.statuses.remove(0));
            }
            let event = self.rx.recv().await?;
            self.record(event);
        }
    }

    /// WAN statuses set so far
    pub fn wan_statuses(&mut self) -> Vec<(WanType, i64, WanConfigStatus)> {
        self.drain();
        self.wan_statuses.clone()
    }
}
