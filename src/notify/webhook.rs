use anyhow::{anyhow, Context, Result};
use std::time::Duration;

use super::{AlertPayload, Notifier};
use crate::config::NotifySettings;

/// POSTs the JSON payload to an HTTP endpoint.
pub struct WebhookNotifier {
    agent: ureq::Agent,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new().timeout(timeout).build();
        Self {
            agent,
            url: url.into(),
        }
    }

    pub fn from_settings(settings: &NotifySettings) -> Result<Self> {
        let url = settings
            .url
            .clone()
            .ok_or_else(|| anyhow!("webhook notifier requires notify.url"))?;
        Ok(Self::new(url, settings.timeout))
    }
}

impl Notifier for WebhookNotifier {
    fn channel(&self) -> &'static str {
        "webhook"
    }

    fn notify(&self, payload: &AlertPayload) -> Result<()> {
        let body = serde_json::to_string(payload).context("serialize alert payload")?;
        match self
            .agent
            .post(&self.url)
            .set("Content-Type", "application/json")
            .send_string(&body)
        {
            Ok(_) => Ok(()),
            Err(ureq::Error::Status(code, _)) => {
                Err(anyhow!("webhook {} answered HTTP {}", self.url, code))
            }
            Err(err) => Err(anyhow!("webhook {} unreachable: {}", self.url, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::time::UNIX_EPOCH;

    use crate::SourceId;

    fn serve_once(status_line: &'static str) -> (String, std::thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/alert", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut content_length = 0usize;
            loop {
                let mut line = String::new();
                reader.read_line(&mut line).unwrap();
                if line == "\r\n" || line.is_empty() {
                    break;
                }
                if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
                    content_length = value.trim().parse().unwrap();
                }
            }
            let mut body = vec![0u8; content_length];
            reader.read_exact(&mut body).unwrap();
            let mut stream = stream;
            write!(stream, "{status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n")
                .unwrap();
            String::from_utf8(body).unwrap()
        });
        (url, handle)
    }

    fn payload() -> AlertPayload {
        AlertPayload::new(
            SourceId::new("stub://porch"),
            UNIX_EPOCH,
            "person",
            0.75,
            None,
        )
    }

    #[test]
    fn posts_json_payload() -> Result<()> {
        let (url, server) = serve_once("HTTP/1.1 204 No Content");
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5));
        notifier.notify(&payload())?;

        let body: serde_json::Value = serde_json::from_str(&server.join().unwrap())?;
        assert_eq!(body["source"], "stub://porch");
        assert_eq!(body["subject"], "Intruder alert");
        Ok(())
    }

    #[test]
    fn http_error_status_is_a_delivery_failure() {
        let (url, server) = serve_once("HTTP/1.1 503 Service Unavailable");
        let notifier = WebhookNotifier::new(url, Duration::from_secs(5));
        let err = notifier.notify(&payload()).unwrap_err();
        assert!(err.to_string().contains("503"));
        server.join().unwrap();
    }
}
