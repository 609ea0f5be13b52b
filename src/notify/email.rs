use anyhow::{anyhow, Context, Result};
use lettre::message::header::ContentType;
use lettre::message::{Mailbox, Message};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{SmtpTransport, Transport};

use super::{AlertPayload, Notifier};
use crate::config::NotifySettings;

const DEFAULT_SUBMISSION_PORT: u16 = 587;

/// Sends each alert as a plain-text email through an SMTP relay with
/// STARTTLS. The recipient comes from the payload, i.e. from the operator
/// directory at trigger time.
pub struct EmailNotifier {
    sender: Mailbox,
    transport: SmtpTransport,
}

impl EmailNotifier {
    pub fn from_settings(settings: &NotifySettings) -> Result<Self> {
        let sender_addr = settings
            .sender
            .as_deref()
            .ok_or_else(|| anyhow!("email notifier requires notify.sender"))?;
        let sender: Mailbox = sender_addr
            .parse()
            .with_context(|| format!("invalid sender address '{}'", sender_addr))?;
        let password = settings
            .password
            .clone()
            .ok_or_else(|| anyhow!("email notifier requires notify.password"))?;
        let relay = settings
            .relay
            .as_deref()
            .ok_or_else(|| anyhow!("email notifier requires notify.relay"))?;
        let (host, port) = split_relay(relay)?;
        let username = settings
            .username
            .clone()
            .unwrap_or_else(|| sender_addr.to_string());

        let transport = SmtpTransport::starttls_relay(&host)
            .with_context(|| format!("smtp relay {}", host))?
            .port(port)
            .credentials(Credentials::new(username, password))
            .timeout(Some(settings.timeout))
            .build();
        Ok(Self { sender, transport })
    }

    fn message(&self, payload: &AlertPayload) -> Result<Message> {
        let recipient = payload
            .recipient
            .as_deref()
            .ok_or_else(|| anyhow!("no alert recipient configured for {}", payload.source))?;
        let to: Mailbox = recipient
            .parse()
            .with_context(|| format!("invalid recipient address '{}'", recipient))?;
        let message = Message::builder()
            .from(self.sender.clone())
            .to(to)
            .subject(payload.subject.clone())
            .header(ContentType::TEXT_PLAIN)
            .body(payload.body.clone())?;
        Ok(message)
    }
}

impl Notifier for EmailNotifier {
    fn channel(&self) -> &'static str {
        "email"
    }

    fn notify(&self, payload: &AlertPayload) -> Result<()> {
        let message = self.message(payload)?;
        self.transport
            .send(&message)
            .context("smtp delivery failed")?;
        Ok(())
    }
}

fn split_relay(relay: &str) -> Result<(String, u16)> {
    let relay = relay.trim();
    if relay.is_empty() {
        return Err(anyhow!("smtp relay must not be empty"));
    }
    match relay.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && !host.contains(':') => {
            let port: u16 = port
                .parse()
                .with_context(|| format!("invalid smtp port in {}", relay))?;
            Ok((host.to_string(), port))
        }
        _ => Ok((relay.to_string(), DEFAULT_SUBMISSION_PORT)),
    }
}
