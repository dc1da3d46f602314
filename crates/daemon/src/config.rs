//! TOML config file loading and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;
use time::UtcOffset;

use crate::control::LightPolicy;
use crate::host::HostCommands;
use crate::sensors::{HealthProbe, SourceSpec};
use crate::supervisor::TunnelConfig;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub control: ControlConfig,
    pub sources: Vec<SourceSpec>,
    pub health: HealthProbe,
    pub tunnel: TunnelConfig,
    pub mqtt: MqttConfig,
    pub web: WebConfig,
    pub host: HostCommands,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    #[serde(flatten)]
    pub policy: LightPolicy,
    /// Source whose reading drives the light.
    pub light_source: String,
    /// BCM pin driving the lamp optocoupler.
    pub light_gpio_pin: u8,
    /// Many relay boards switch on a low level.
    pub relay_active_low: bool,
    pub telemetry_interval_secs: u64,
    pub evaluation_interval_secs: u64,
    /// Used instead of `evaluation_interval_secs` during sleep time.
    pub sleep_evaluation_interval_secs: u64,
    /// Fixed offset from UTC for the daily windows. It does not follow
    /// daylight saving; adjust it when the clocks change.
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub topic_prefix: String,
    pub client_id: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            control: ControlConfig::default(),
            sources: default_sources(),
            health: HealthProbe::default(),
            tunnel: TunnelConfig::default(),
            mqtt: MqttConfig::default(),
            web: WebConfig::default(),
            host: HostCommands::default(),
        }
    }
}

fn default_sources() -> Vec<SourceSpec> {
    ["thermistor", "photoresistor"]
        .into_iter()
        .zip(["temperature", "light"])
        .map(|(id, kind)| SourceSpec {
            id: id.to_string(),
            program: "porchlight-probe".to_string(),
            args: vec![kind.to_string()],
            timeout_ms: 10_000,
        })
        .collect()
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            policy: LightPolicy::default(),
            light_source: "photoresistor".to_string(),
            light_gpio_pin: 16,
            relay_active_low: false,
            telemetry_interval_secs: 5 * 60,
            evaluation_interval_secs: 5 * 60,
            sleep_evaluation_interval_secs: 60,
            utc_offset_minutes: 0,
        }
    }
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            topic_prefix: "porchlight".to_string(),
            client_id: "porchlight".to_string(),
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

impl ControlConfig {
    pub fn telemetry_interval(&self) -> Duration {
        Duration::from_secs(self.telemetry_interval_secs)
    }

    pub fn evaluation_interval(&self, sleep_time: bool) -> Duration {
        Duration::from_secs(if sleep_time {
            self.sleep_evaluation_interval_secs
        } else {
            self.evaluation_interval_secs
        })
    }

    pub fn utc_offset(&self) -> Result<UtcOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(|secs| UtcOffset::from_whole_seconds(secs).ok())
            .with_context(|| format!("utc_offset_minutes {} out of range", self.utc_offset_minutes))
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_control(&mut errors);
        self.validate_sources(&mut errors);
        self.validate_tunnel(&mut errors);

        if self.health.timeout_ms == 0 {
            errors.push("health: timeout_ms must be positive".into());
        }
        if self.mqtt.port == 0 {
            errors.push("mqtt: port must be non-zero".into());
        }
        if self.mqtt.topic_prefix.trim().is_empty() {
            errors.push("mqtt: topic_prefix is empty".into());
        }
        if self.web.port == 0 {
            errors.push("web: port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_control(&self, errors: &mut Vec<String>) {
        let c = &self.control;
        let p = &c.policy;

        for (name, v) in [
            ("dark_threshold", p.dark_threshold),
            ("sleep_threshold", p.sleep_threshold),
        ] {
            if !v.is_finite() {
                errors.push(format!("control: {name} must be a finite number, got {v}"));
            }
        }

        for (name, v) in [
            ("telemetry_interval_secs", c.telemetry_interval_secs),
            ("evaluation_interval_secs", c.evaluation_interval_secs),
            ("sleep_evaluation_interval_secs", c.sleep_evaluation_interval_secs),
        ] {
            if v == 0 {
                errors.push(format!("control: {name} must be positive"));
            }
        }

        if c.utc_offset().is_err() {
            errors.push(format!(
                "control: utc_offset_minutes {} out of range",
                c.utc_offset_minutes
            ));
        }

        if !self.sources.iter().any(|s| s.id == c.light_source) {
            errors.push(format!(
                "control: light_source '{}' does not match any configured source",
                c.light_source
            ));
        }
    }

    fn validate_sources(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sources.iter().enumerate() {
            let ctx = || {
                if s.id.is_empty() {
                    format!("sources[{i}]")
                } else {
                    format!("source '{}'", s.id)
                }
            };

            if s.id.trim().is_empty() {
                errors.push(format!("{}: id is empty", ctx()));
            } else if !seen_ids.insert(&s.id) {
                errors.push(format!("{}: duplicate id", ctx()));
            }
            if s.id == crate::sensors::HOST_HEALTH_ID {
                errors.push(format!("{}: id is reserved", ctx()));
            }
            if s.program.trim().is_empty() {
                errors.push(format!("{}: program is empty", ctx()));
            }
            if s.timeout_ms == 0 {
                errors.push(format!("{}: timeout_ms must be positive", ctx()));
            }
        }
    }

    fn validate_tunnel(&self, errors: &mut Vec<String>) {
        let t = &self.tunnel;
        if !t.enabled {
            return;
        }

        let valid_label = !t.subdomain.is_empty()
            && !t.subdomain.starts_with('-')
            && t.subdomain
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !valid_label {
            errors.push(format!(
                "tunnel: subdomain '{}' must be lowercase letters, digits and hyphens",
                t.subdomain
            ));
        }
        if url::Url::parse(&t.server).is_err() {
            errors.push(format!("tunnel: server '{}' is not a valid URL", t.server));
        }
        if t.max_attempts == 0 {
            errors.push("tunnel: max_attempts must be at least 1".into());
        }
        if t.request_timeout_secs == 0 {
            errors.push("tunnel: request_timeout_secs must be positive".into());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

impl Config {
    /// Apply the environment overrides. Unparseable values are logged and
    /// ignored.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(name: &str, raw: Option<String>) -> Option<T> {
            let raw = raw?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!(%name, value = %raw, "ignoring unparseable override");
                    None
                }
            }
        }

        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = parsed("MQTT_PORT", lookup("MQTT_PORT")) {
            self.mqtt.port = port;
        }
        if let Some(port) = parsed("WEB_PORT", lookup("WEB_PORT")) {
            self.web.port = port;
        }
        if let Some(v) = lookup("RELAY_ACTIVE_LOW") {
            self.control.relay_active_low = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }
}

/// Read, parse, apply env overrides and validate a TOML config file. A
/// missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    let mut config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => {
            toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(%path, "config file not found, using defaults");
            Config::default()
        }
        Err(e) => return Err(e).with_context(|| format!("failed to read config: {path}")),
    };
    config.apply_env(|name| std::env::var(name).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
