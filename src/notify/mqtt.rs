use anyhow::{anyhow, Context, Result};
use rand::Rng;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Event, MqttOptions};
use std::time::{Duration, Instant};

use super::{AlertPayload, Notifier};
use crate::config::NotifySettings;

const CLIENT_ID_PREFIX: &str = "watchpost";

/// Publishes each alert with QoS 1 on a fresh connection and waits for the
/// broker's PUBACK, bounded by the configured timeout.
pub struct MqttNotifier {
    host: String,
    port: u16,
    topic: String,
    username: Option<String>,
    password: Option<String>,
    timeout: Duration,
}

impl MqttNotifier {
    pub fn from_settings(settings: &NotifySettings) -> Result<Self> {
        let broker = settings
            .broker
            .as_deref()
            .ok_or_else(|| anyhow!("mqtt notifier requires notify.broker"))?;
        let broker = broker.strip_prefix("mqtt://").unwrap_or(broker);
        let (host, port) = split_host_port(broker)?;
        Ok(Self {
            host,
            port,
            topic: settings.topic.clone(),
            username: settings.username.clone(),
            password: settings.password.clone(),
            timeout: settings.timeout,
        })
    }

    fn options(&self) -> MqttOptions {
        let suffix: u32 = rand::thread_rng().gen();
        let client_id = format!("{CLIENT_ID_PREFIX}-{suffix:08x}");
        let mut options = MqttOptions::new(client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_start(true);
        if let Some(user) = self.username.as_deref() {
            options.set_credentials(user, self.password.clone().unwrap_or_default());
        }
        options
    }
}

impl Notifier for MqttNotifier {
    fn channel(&self) -> &'static str {
        "mqtt"
    }

    fn notify(&self, payload: &AlertPayload) -> Result<()> {
        let body = serde_json::to_vec(payload).context("serialize alert payload")?;
        let (client, mut connection) = Client::new(self.options(), 10);
        client
            .publish(self.topic.clone(), QoS::AtLeastOnce, false, body)
            .context("queue MQTT publish")?;

        let deadline = Instant::now() + self.timeout;
        let acked = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break false;
            }
            match connection.recv_timeout(remaining) {
                Ok(Ok(Event::Incoming(Packet::PubAck(_)))) => break true,
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    return Err(anyhow!(
                        "MQTT broker {}:{} connection failed: {}",
                        self.host,
                        self.port,
                        err
                    ))
                }
                Err(_) => break false,
            }
        };
        if let Err(err) = client.disconnect() {
            log::debug!("MQTT disconnect failed: {}", err);
        }
        if !acked {
            return Err(anyhow!(
                "MQTT broker {}:{} did not acknowledge within {:?}",
                self.host,
                self.port,
                self.timeout
            ));
        }
        Ok(())
    }
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    if let Some(rest) = addr.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok((host.to_string(), port));
    }

    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok((host.to_string(), port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_host_port_handles_ipv6() -> Result<()> {
        assert_eq!(split_host_port("[::1]:1883")?, ("::1".to_string(), 1883));
        assert_eq!(
            split_host_port("broker.local:8883")?,
            ("broker.local".to_string(), 8883)
        );
        assert!(split_host_port("broker.local").is_err());
        Ok(())
    }

    #[test]
    fn from_settings_accepts_mqtt_scheme() -> Result<()> {
        let settings = NotifySettings {
            broker: Some("mqtt://127.0.0.1:1883".to_string()),
            ..NotifySettings::default()
        };
        let notifier = MqttNotifier::from_settings(&settings)?;
        assert_eq!(notifier.host, "127.0.0.1");
        assert_eq!(notifier.port, 1883);
        assert_eq!(notifier.topic, "watchpost/alerts");
        Ok(())
    }
}
