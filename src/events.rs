//! Trigger events: a fan-out feed plus a bounded ring of recent events.

use serde::{Serialize, Serializer};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::sync::lock;
use crate::SourceId;

/// Number of events kept for `recent()`.
pub const RECENT_EVENTS: usize = 64;

/// One permitted trigger and the side effects it started.
#[derive(Clone, Debug, Serialize)]
pub struct TriggerEvent {
    pub source: SourceId,
    #[serde(rename = "at_epoch_s", serialize_with = "epoch_secs")]
    pub at: SystemTime,
    pub label: String,
    pub confidence: f32,
    /// A notification was dispatched (delivery itself is asynchronous).
    pub notified: bool,
    /// A new recording session was started for this trigger.
    pub recording_started: bool,
}

pub(crate) fn epoch_secs_of(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn epoch_secs<S: Serializer>(at: &SystemTime, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(epoch_secs_of(*at))
}

/// Fan-out of trigger events to any number of subscribers.
///
/// Subscribers get an unbounded `mpsc::Receiver`; dropped receivers are
/// pruned on the next publish. Publishing never blocks the capture loop.
#[derive(Debug, Default)]
pub struct TriggerFeed {
    subscribers: Mutex<Vec<Sender<TriggerEvent>>>,
    recent: Mutex<VecDeque<TriggerEvent>>,
}

impl TriggerFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<TriggerEvent> {
        let (tx, rx) = mpsc::channel();
        lock(&self.subscribers).push(tx);
        rx
    }

    pub fn publish(&self, event: TriggerEvent) {
        {
            let mut recent = lock(&self.recent);
            if recent.len() == RECENT_EVENTS {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        lock(&self.subscribers).retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Recent events, oldest first.
    pub fn recent(&self) -> Vec<TriggerEvent> {
        lock(&self.recent).iter().cloned().collect()
    }
}
