//! Operator lookup consulted at trigger time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use crate::config::OperatorSettings;

/// Who gets alerted, and whether they want to be.
///
/// Read on every permitted trigger, so a change takes effect without
/// restarting the pipelines.
pub trait OperatorDirectory: Send + Sync {
    fn notifications_enabled(&self) -> bool;

    fn recipient(&self) -> Option<String>;
}

/// In-memory operator record built from configuration.
#[derive(Debug, Default)]
pub struct StaticOperator {
    enabled: AtomicBool,
    recipient: RwLock<Option<String>>,
}

impl StaticOperator {
    pub fn new(enabled: bool, recipient: Option<String>) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            recipient: RwLock::new(recipient),
        }
    }

    pub fn from_settings(settings: &OperatorSettings) -> Self {
        Self::new(settings.notifications_enabled, settings.recipient.clone())
    }

    pub fn set_notifications_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn set_recipient(&self, recipient: Option<String>) {
        *self
            .recipient
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = recipient;
    }
}

impl OperatorDirectory for StaticOperator {
    fn notifications_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    fn recipient(&self) -> Option<String> {
        self.recipient
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}
