// # Loop Timers
//
// One-shot timers that post back into the orchestrator loop.
//
// Every arm bumps a generation counter; a fired timer whose generation does
// not match the armed one is stale (it was cancelled or re-armed after the
// wake-up was queued) and is dropped by `fire()`.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::LoopEvent;
use crate::pipeline::InstanceId;

/// Identity of a loop timer
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum TimerKey {
    /// Pipeline retry backoff (IDLE/ABORT)
    Retry(String),
    /// Per-instance plugin timeout
    PluginTimeout(String, InstanceId),
    /// WAN pause/status rollup debounce
    WanRollup,
    /// Restart-all debounce after WAN configuration changes
    WanRestart,
}

struct Armed {
    generation: u64,
    /// Start of the current debounce burst
    first: Instant,
    task: JoinHandle<()>,
}

pub(crate) struct Timers {
    tx: mpsc::UnboundedSender<LoopEvent>,
    armed: HashMap<TimerKey, Armed>,
    generation: u64,
}

impl Timers {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            tx,
            armed: HashMap::new(),
            generation: 0,
        }
    }

    fn spawn(&mut self, key: TimerKey, after: Duration, first: Instant) {
        self.cancel(&key);
        self.generation += 1;
        let generation = self.generation;
        let tx = self.tx.clone();
        let fire_key = key.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(after).await;
            let _ = tx.send(LoopEvent::Timer {
                key: fire_key,
                generation,
            });
        });
        self.armed.insert(
            key,
            Armed {
                generation,
                first,
                task,
            },
        );
    }

    /// Arm (or re-arm) a one-shot timer
    pub(crate) fn arm(&mut self, key: TimerKey, after: Duration) {
        self.spawn(key, after, Instant::now());
    }

    /// Debounce: every call pushes the deadline out to `now + min`, but never
    /// past `max` after the first call of the burst
    pub(crate) fn debounce(&mut self, key: TimerKey, min: Duration, max: Duration) {
        let now = Instant::now();
        let first = self.armed.get(&key).map(|a| a.first).unwrap_or(now);
        let deadline = (now + min).min(first + max.max(min));
        self.spawn(key, deadline.saturating_duration_since(now), first);
    }

    pub(crate) fn cancel(&mut self, key: &TimerKey) {
        if let Some(armed) = self.armed.remove(key) {
            armed.task.abort();
        }
    }

    pub(crate) fn is_armed(&self, key: &TimerKey) -> bool {
        self.armed.contains_key(key)
    }

    /// Accept a wake-up; returns false for stale generations
    pub(crate) fn fire(&mut self, key: &TimerKey, generation: u64) -> bool {
        match self.armed.get(key) {
            Some(armed) if armed.generation == generation => {
                self.armed.remove(key);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn cancel_all(&mut self) {
        for (_, armed) in self.armed.drain() {
            armed.task.abort();
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.armed.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
