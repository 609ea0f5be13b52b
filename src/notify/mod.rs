//! Alert delivery.
//!
//! A permitted trigger hands an `AlertPayload` to the `NotifyDispatcher`,
//! which delivers it on a short-lived thread of its own. Delivery failures
//! are logged and counted; they are never retried and never reach the
//! capture loop.

use anyhow::Result;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use crate::config::{NotifyChannel, NotifySettings};
use crate::error::{ErrorKind, SourceError};
use crate::events::epoch_secs_of;
use crate::SourceId;

mod email;
mod mqtt;
mod webhook;

pub use email::EmailNotifier;
pub use mqtt::MqttNotifier;
pub use webhook::WebhookNotifier;

pub const ALERT_SUBJECT: &str = "Intruder alert";

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AlertPayload {
    pub source: SourceId,
    pub detected_at_epoch_s: u64,
    pub label: String,
    pub confidence: f32,
    pub recipient: Option<String>,
    pub subject: String,
    pub body: String,
}

impl AlertPayload {
    pub fn new(
        source: SourceId,
        detected_at: SystemTime,
        label: &str,
        confidence: f32,
        recipient: Option<String>,
    ) -> Self {
        let detected_at_epoch_s = epoch_secs_of(detected_at);
        let stamp = chrono::DateTime::<chrono::Utc>::from(detected_at)
            .format("%Y-%m-%d %H:%M:%S UTC");
        let body = format!(
            "A {label} was detected on camera {source} at {stamp} (confidence {:.0}%).",
            confidence * 100.0
        );
        Self {
            source,
            detected_at_epoch_s,
            label: label.to_string(),
            confidence,
            recipient,
            subject: ALERT_SUBJECT.to_string(),
            body,
        }
    }
}

/// One delivery channel.
///
/// `notify` may block (network I/O); it always runs on a dispatcher thread.
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &'static str;

    fn notify(&self, payload: &AlertPayload) -> Result<()>;
}

/// Writes alerts to the log. Useful on headless boxes and in demos.
#[derive(Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn channel(&self) -> &'static str {
        "log"
    }

    fn notify(&self, payload: &AlertPayload) -> Result<()> {
        log::warn!(
            "{}: {} (recipient: {})",
            payload.subject,
            payload.body,
            payload.recipient.as_deref().unwrap_or("-")
        );
        Ok(())
    }
}

/// Delivery counters. Shared across runs so totals survive `reconfigure`.
#[derive(Debug, Default)]
pub struct DeliveryStats {
    dispatched: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NotificationStats {
    pub dispatched: u64,
    pub delivered: u64,
    pub failed: u64,
}

impl DeliveryStats {
    pub fn snapshot(&self) -> NotificationStats {
        NotificationStats {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Fire-and-forget delivery on one thread per alert.
#[derive(Clone)]
pub struct NotifyDispatcher {
    notifier: Arc<dyn Notifier>,
    stats: Arc<DeliveryStats>,
}

impl NotifyDispatcher {
    pub fn new(notifier: Arc<dyn Notifier>, stats: Arc<DeliveryStats>) -> Self {
        Self { notifier, stats }
    }

    pub fn channel(&self) -> &'static str {
        self.notifier.channel()
    }

    /// Start delivery and return immediately.
    pub fn dispatch(&self, payload: AlertPayload) -> Result<()> {
        let notifier = self.notifier.clone();
        let stats = self.stats.clone();
        let name = format!("notify-{}", payload.source.file_stem());
        stats.dispatched.fetch_add(1, Ordering::Relaxed);
        let spawned = std::thread::Builder::new().name(name).spawn(move || {
            match notifier.notify(&payload) {
                Ok(()) => {
                    stats.delivered.fetch_add(1, Ordering::Relaxed);
                    log::info!(
                        "alert for {} delivered via {}",
                        payload.source,
                        notifier.channel()
                    );
                }
                Err(err) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    let err = SourceError::from_anyhow(ErrorKind::Delivery, &err);
                    log::warn!(
                        "alert for {} via {} not delivered: {}",
                        payload.source,
                        notifier.channel(),
                        err
                    );
                }
            }
        });
        if let Err(err) = spawned {
            self.stats.failed.fetch_add(1, Ordering::Relaxed);
            return Err(anyhow::anyhow!("spawn notification thread: {}", err));
        }
        Ok(())
    }
}

/// Build the configured notifier. `None` when notifications are off.
pub fn build_notifier(settings: &NotifySettings) -> Result<Option<Arc<dyn Notifier>>> {
    let notifier: Arc<dyn Notifier> = match settings.channel {
        NotifyChannel::None => return Ok(None),
        NotifyChannel::Log => Arc::new(LogNotifier),
        NotifyChannel::Webhook => Arc::new(WebhookNotifier::from_settings(settings)?),
        NotifyChannel::Mqtt => Arc::new(MqttNotifier::from_settings(settings)?),
        NotifyChannel::Email => Arc::new(EmailNotifier::from_settings(settings)?),
    };
    Ok(Some(notifier))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::{Duration, UNIX_EPOCH};

    struct ChannelNotifier {
        tx: std::sync::Mutex<mpsc::Sender<AlertPayload>>,
        fail: bool,
    }

    impl Notifier for ChannelNotifier {
        fn channel(&self) -> &'static str {
            "test"
        }

        fn notify(&self, payload: &AlertPayload) -> Result<()> {
            self.tx.lock().unwrap().send(payload.clone()).unwrap();
            if self.fail {
                anyhow::bail!("smtp relay refused");
            }
            Ok(())
        }
    }

    fn payload() -> AlertPayload {
        AlertPayload::new(
            SourceId::new("0"),
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
            "person",
            0.9,
            Some("guard@example.org".to_string()),
        )
    }

    #[test]
    fn payload_carries_subject_and_readable_body() {
        let payload = payload();
        assert_eq!(payload.subject, "Intruder alert");
        assert_eq!(payload.detected_at_epoch_s, 1_700_000_000);
        assert!(payload.body.contains("camera 0"));
        assert!(payload.body.contains("2023-11-14 22:13:20 UTC"));
        assert!(payload.body.contains("90%"));
    }

    #[test]
    fn dispatch_counts_delivery_outcomes() {
        for fail in [false, true] {
            let (tx, rx) = mpsc::channel();
            let stats = Arc::new(DeliveryStats::default());
            let dispatcher = NotifyDispatcher::new(
                Arc::new(ChannelNotifier {
                    tx: std::sync::Mutex::new(tx),
                    fail,
                }),
                stats.clone(),
            );
            dispatcher.dispatch(payload()).unwrap();
            rx.recv_timeout(Duration::from_secs(5)).unwrap();

            let deadline = std::time::Instant::now() + Duration::from_secs(5);
            while stats.snapshot().delivered + stats.snapshot().failed == 0 {
                assert!(std::time::Instant::now() < deadline);
                std::thread::sleep(Duration::from_millis(5));
            }
            let snapshot = stats.snapshot();
            assert_eq!(snapshot.dispatched, 1);
            assert_eq!(snapshot.failed, u64::from(fail));
            assert_eq!(snapshot.delivered, u64::from(!fail));
        }
    }

    #[test]
    fn build_notifier_follows_channel() -> Result<()> {
        assert!(build_notifier(&NotifySettings::default())?.is_none());

        let settings = NotifySettings {
            channel: NotifyChannel::Log,
            ..NotifySettings::default()
        };
        let notifier = build_notifier(&settings)?.expect("log notifier");
        assert_eq!(notifier.channel(), "log");

        let settings = NotifySettings {
            channel: NotifyChannel::Email,
            sender: Some("watchpost@example.org".to_string()),
            password: Some("app-password".to_string()),
            relay: Some("smtp.example.org:587".to_string()),
            ..NotifySettings::default()
        };
        let notifier = build_notifier(&settings)?.expect("email notifier");
        assert_eq!(notifier.channel(), "email");
        Ok(())
    }
}
