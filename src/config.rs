use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::ingest::SourceSpec;
use crate::SourceId;

const DEFAULT_COOLDOWN_SECS: u64 = 300;
const DEFAULT_TARGET_LABEL: &str = "person";
const DEFAULT_MIN_CONFIDENCE: f32 = 0.5;
const DEFAULT_LOOP_INTERVAL_MS: u64 = 30;
const DEFAULT_READ_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_STOP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_CAPTURE_WIDTH: u32 = 640;
const DEFAULT_CAPTURE_HEIGHT: u32 = 480;
const DEFAULT_CAPTURE_FPS: u32 = 10;
const DEFAULT_RECORD_SECS: u64 = 30;
const DEFAULT_OUTPUT_DIR: &str = "recordings";
const DEFAULT_WRITE_INTERVAL_MS: u64 = 100;
const DEFAULT_STARTUP_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_MQTT_TOPIC: &str = "watchpost/alerts";
const DEFAULT_NOTIFY_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_RESTART_BACKOFF_MS: u64 = 2_000;
const DEFAULT_API_ADDR: &str = "127.0.0.1:8800";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    sources: Option<Vec<String>>,
    cooldown_secs: Option<u64>,
    target_label: Option<String>,
    min_confidence: Option<f32>,
    loop_interval_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
    stop_timeout_ms: Option<u64>,
    capture: Option<CaptureConfigFile>,
    recording: Option<RecordingConfigFile>,
    detector: Option<DetectorConfigFile>,
    notify: Option<NotifyConfigFile>,
    operator: Option<OperatorConfigFile>,
    restart: Option<RestartConfigFile>,
    api: Option<ApiConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    width: Option<u32>,
    height: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct RecordingConfigFile {
    duration_secs: Option<u64>,
    output_dir: Option<PathBuf>,
    write_interval_ms: Option<u64>,
    startup_timeout_ms: Option<u64>,
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectorConfigFile {
    backend: Option<DetectorKind>,
    model_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    labels: Option<Vec<String>>,
    required: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
struct NotifyConfigFile {
    channel: Option<NotifyChannel>,
    url: Option<String>,
    sender: Option<String>,
    relay: Option<String>,
    broker: Option<String>,
    topic: Option<String>,
    username: Option<String>,
    password: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct OperatorConfigFile {
    notifications_enabled: Option<bool>,
    recipient: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RestartConfigFile {
    max_retries: Option<u32>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
    token_path: Option<PathBuf>,
}

/// Immutable configuration snapshot for one surveillance run.
///
/// A running pipeline never observes a change to its snapshot; new values
/// take effect through `SurveillanceSupervisor::reconfigure`.
#[derive(Debug, Clone)]
pub struct SurveillanceConfig {
    pub sources: Vec<SourceId>,
    pub cooldown: Duration,
    pub target_label: String,
    pub min_confidence: f32,
    pub loop_interval: Duration,
    pub read_timeout: Duration,
    pub stop_timeout: Duration,
    pub capture: CaptureSettings,
    pub recording: RecordingSettings,
    pub detector: DetectorSettings,
    pub notify: NotifySettings,
    pub operator: OperatorSettings,
    pub restart: RestartPolicy,
    pub api: ApiSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
}

#[derive(Debug, Clone)]
pub struct RecordingSettings {
    pub duration: Duration,
    pub output_dir: PathBuf,
    pub write_interval: Duration,
    pub startup_timeout: Duration,
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectorKind {
    Stub,
    Tract,
}

#[derive(Debug, Clone)]
pub struct DetectorSettings {
    pub backend: DetectorKind,
    pub model_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    /// Class names indexed by model class id.
    pub labels: Vec<String>,
    /// Fail `start_all` instead of running without detection.
    pub required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifyChannel {
    None,
    Log,
    Webhook,
    Mqtt,
    Email,
}

#[derive(Debug, Clone)]
pub struct NotifySettings {
    pub channel: NotifyChannel,
    pub url: Option<String>,
    /// Email sender address, also the SMTP login unless `username` is set.
    pub sender: Option<String>,
    /// SMTP relay, `host` or `host:port` (STARTTLS, port 587 by default).
    pub relay: Option<String>,
    pub broker: Option<String>,
    pub topic: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct OperatorSettings {
    pub notifications_enabled: bool,
    pub recipient: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RestartPolicy {
    /// Reopen attempts after a capture failure. Zero disables restarts.
    pub max_retries: u32,
    pub backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct ApiSettings {
    pub addr: String,
    pub token_path: Option<PathBuf>,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            width: DEFAULT_CAPTURE_WIDTH,
            height: DEFAULT_CAPTURE_HEIGHT,
            target_fps: DEFAULT_CAPTURE_FPS,
        }
    }
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(DEFAULT_RECORD_SECS),
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            write_interval: Duration::from_millis(DEFAULT_WRITE_INTERVAL_MS),
            startup_timeout: Duration::from_millis(DEFAULT_STARTUP_TIMEOUT_MS),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
        }
    }
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            backend: DetectorKind::Stub,
            model_path: None,
            input_width: DEFAULT_MODEL_INPUT,
            input_height: DEFAULT_MODEL_INPUT,
            labels: vec![DEFAULT_TARGET_LABEL.to_string()],
            required: false,
        }
    }
}

impl Default for NotifySettings {
    fn default() -> Self {
        Self {
            channel: NotifyChannel::None,
            url: None,
            sender: None,
            relay: None,
            broker: None,
            topic: DEFAULT_MQTT_TOPIC.to_string(),
            username: None,
            password: None,
            timeout: Duration::from_millis(DEFAULT_NOTIFY_TIMEOUT_MS),
        }
    }
}

impl Default for OperatorSettings {
    fn default() -> Self {
        Self {
            notifications_enabled: true,
            recipient: None,
        }
    }
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff: Duration::from_millis(DEFAULT_RESTART_BACKOFF_MS),
        }
    }
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            addr: DEFAULT_API_ADDR.to_string(),
            token_path: None,
        }
    }
}

impl Default for SurveillanceConfig {
    fn default() -> Self {
        Self {
            sources: Vec::new(),
            cooldown: Duration::from_secs(DEFAULT_COOLDOWN_SECS),
            target_label: DEFAULT_TARGET_LABEL.to_string(),
            min_confidence: DEFAULT_MIN_CONFIDENCE,
            loop_interval: Duration::from_millis(DEFAULT_LOOP_INTERVAL_MS),
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            stop_timeout: Duration::from_millis(DEFAULT_STOP_TIMEOUT_MS),
            capture: CaptureSettings::default(),
            recording: RecordingSettings::default(),
            detector: DetectorSettings::default(),
            notify: NotifySettings::default(),
            operator: OperatorSettings::default(),
            restart: RestartPolicy::default(),
            api: ApiSettings::default(),
        }
    }
}

impl SurveillanceConfig {
    /// Load from the file named by `WATCHPOST_CONFIG` (if set), then apply
    /// environment overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("WATCHPOST_CONFIG")
            .ok()
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, but with an explicit config file path.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => ConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with the given sources. Not validated.
    pub fn from_sources<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SourceId>,
    {
        Self {
            sources: sources.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    fn from_file(file: ConfigFile) -> Self {
        let defaults = Self::default();
        let capture = file.capture.unwrap_or_default();
        let recording = file.recording.unwrap_or_default();
        let detector = file.detector.unwrap_or_default();
        let notify = file.notify.unwrap_or_default();
        let operator = file.operator.unwrap_or_default();
        let restart = file.restart.unwrap_or_default();
        let api = file.api.unwrap_or_default();

        Self {
            sources: file
                .sources
                .unwrap_or_default()
                .into_iter()
                .map(SourceId::from)
                .collect(),
            cooldown: file
                .cooldown_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cooldown),
            target_label: file.target_label.unwrap_or(defaults.target_label),
            min_confidence: file.min_confidence.unwrap_or(defaults.min_confidence),
            loop_interval: file
                .loop_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.loop_interval),
            read_timeout: file
                .read_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.read_timeout),
            stop_timeout: file
                .stop_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.stop_timeout),
            capture: CaptureSettings {
                width: capture.width.unwrap_or(defaults.capture.width),
                height: capture.height.unwrap_or(defaults.capture.height),
                target_fps: capture.target_fps.unwrap_or(defaults.capture.target_fps),
            },
            recording: RecordingSettings {
                duration: recording
                    .duration_secs
                    .map(Duration::from_secs)
                    .unwrap_or(defaults.recording.duration),
                output_dir: recording
                    .output_dir
                    .unwrap_or(defaults.recording.output_dir),
                write_interval: recording
                    .write_interval_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.recording.write_interval),
                startup_timeout: recording
                    .startup_timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.recording.startup_timeout),
                jpeg_quality: recording
                    .jpeg_quality
                    .unwrap_or(defaults.recording.jpeg_quality),
            },
            detector: DetectorSettings {
                backend: detector.backend.unwrap_or(defaults.detector.backend),
                model_path: detector.model_path,
                input_width: detector
                    .input_width
                    .unwrap_or(defaults.detector.input_width),
                input_height: detector
                    .input_height
                    .unwrap_or(defaults.detector.input_height),
                labels: detector.labels.unwrap_or(defaults.detector.labels),
                required: detector.required.unwrap_or(defaults.detector.required),
            },
            notify: NotifySettings {
                channel: notify.channel.unwrap_or(defaults.notify.channel),
                url: notify.url,
                sender: notify.sender,
                relay: notify.relay,
                broker: notify.broker,
                topic: notify.topic.unwrap_or(defaults.notify.topic),
                username: notify.username,
                password: notify.password,
                timeout: notify
                    .timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.notify.timeout),
            },
            operator: OperatorSettings {
                notifications_enabled: operator
                    .notifications_enabled
                    .unwrap_or(defaults.operator.notifications_enabled),
                recipient: operator.recipient,
            },
            restart: RestartPolicy {
                max_retries: restart.max_retries.unwrap_or(defaults.restart.max_retries),
                backoff: restart
                    .backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.restart.backoff),
            },
            api: ApiSettings {
                addr: api.addr.unwrap_or(defaults.api.addr),
                token_path: api.token_path,
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(sources) = std::env::var("WATCHPOST_SOURCES") {
            let parsed = split_csv(&sources);
            if !parsed.is_empty() {
                self.sources = parsed.into_iter().map(SourceId::from).collect();
            }
        }
        if let Ok(cooldown) = std::env::var("WATCHPOST_COOLDOWN_SECS") {
            let seconds: u64 = cooldown.trim().parse().map_err(|_| {
                anyhow!("WATCHPOST_COOLDOWN_SECS must be an integer number of seconds")
            })?;
            self.cooldown = Duration::from_secs(seconds);
        }
        if let Ok(duration) = std::env::var("WATCHPOST_RECORD_SECS") {
            let seconds: u64 = duration.trim().parse().map_err(|_| {
                anyhow!("WATCHPOST_RECORD_SECS must be an integer number of seconds")
            })?;
            self.recording.duration = Duration::from_secs(seconds);
        }
        if let Ok(dir) = std::env::var("WATCHPOST_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                self.recording.output_dir = PathBuf::from(dir);
            }
        }
        if let Ok(url) = std::env::var("WATCHPOST_NOTIFY_URL") {
            if !url.trim().is_empty() {
                self.notify.url = Some(url);
                if self.notify.channel == NotifyChannel::None {
                    self.notify.channel = NotifyChannel::Webhook;
                }
            }
        }
        if let Ok(sender) = std::env::var("WATCHPOST_NOTIFY_SENDER") {
            if !sender.trim().is_empty() {
                self.notify.sender = Some(sender);
            }
        }
        if let Ok(password) = std::env::var("WATCHPOST_NOTIFY_PASSWORD") {
            if !password.is_empty() {
                self.notify.password = Some(password);
            }
        }
        if let Ok(recipient) = std::env::var("WATCHPOST_RECIPIENT") {
            if !recipient.trim().is_empty() {
                self.operator.recipient = Some(recipient);
            }
        }
        if let Ok(addr) = std::env::var("WATCHPOST_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr;
            }
        }
        if let Ok(path) = std::env::var("WATCHPOST_API_TOKEN_PATH") {
            if !path.trim().is_empty() {
                self.api.token_path = Some(PathBuf::from(path));
            }
        }
        Ok(())
    }

    /// Check the snapshot before a run starts.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() {
            return Err(anyhow!("at least one source must be configured"));
        }
        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.as_str().trim().is_empty() {
                return Err(anyhow!("source identifiers must not be empty"));
            }
            if !seen.insert(source) {
                return Err(anyhow!("source '{}' is configured more than once", source));
            }
        }
        if self.target_label.trim().is_empty() {
            return Err(anyhow!("target_label must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(anyhow!(
                "min_confidence must be within 0..=1, got {}",
                self.min_confidence
            ));
        }
        if self.read_timeout.is_zero() {
            return Err(anyhow!("read_timeout must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        if self.recording.duration.is_zero() {
            return Err(anyhow!("recording duration must be greater than zero"));
        }
        for (name, value) in [
            ("recording duration", self.recording.duration),
            ("recording startup timeout", self.recording.startup_timeout),
        ] {
            if Instant::now().checked_add(value).is_none() {
                return Err(anyhow!("{} of {:?} is out of range", name, value));
            }
        }
        if self.recording.write_interval.is_zero() {
            return Err(anyhow!("recording write interval must be greater than zero"));
        }
        if !(1..=100).contains(&self.recording.jpeg_quality) {
            return Err(anyhow!(
                "recording jpeg_quality must be within 1..=100, got {}",
                self.recording.jpeg_quality
            ));
        }
        let output_dir = &self.recording.output_dir;
        let meta = std::fs::metadata(output_dir).with_context(|| {
            format!("recording output dir {} is not accessible", output_dir.display())
        })?;
        if !meta.is_dir() {
            return Err(anyhow!(
                "recording output dir {} is not a directory",
                output_dir.display()
            ));
        }
        match self.notify.channel {
            NotifyChannel::Webhook => {
                let url = self
                    .notify
                    .url
                    .as_deref()
                    .ok_or_else(|| anyhow!("webhook notifications require notify.url"))?;
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(anyhow!("notify.url must be an http(s) URL"));
                }
            }
            NotifyChannel::Mqtt => {
                if self.notify.broker.as_deref().map_or(true, |b| b.trim().is_empty()) {
                    return Err(anyhow!("mqtt notifications require notify.broker"));
                }
                if self.notify.topic.trim().is_empty() {
                    return Err(anyhow!("notify.topic must not be empty"));
                }
            }
            NotifyChannel::Email => {
                let present = |value: &Option<String>| {
                    value.as_deref().is_some_and(|v| !v.trim().is_empty())
                };
                if !present(&self.notify.sender) {
                    return Err(anyhow!("email notifications require notify.sender"));
                }
                if !present(&self.notify.password) {
                    return Err(anyhow!(
                        "email notifications require notify.password (or WATCHPOST_NOTIFY_PASSWORD)"
                    ));
                }
                if !present(&self.notify.relay) {
                    return Err(anyhow!("email notifications require notify.relay"));
                }
            }
            NotifyChannel::None | NotifyChannel::Log => {}
        }
        Ok(())
    }

    /// Open parameters for one configured source.
    pub fn source_spec(&self, id: &SourceId) -> SourceSpec {
        let mut spec = SourceSpec::new(id.clone(), self.read_timeout);
        spec.width = self.capture.width;
        spec.height = self.capture.height;
        spec.target_fps = self.capture.target_fps;
        spec
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
