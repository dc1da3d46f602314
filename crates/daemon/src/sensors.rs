//! Sensor source adapter and host-health probe.
//!
//! A source is an external program that prints one number on stdout per
//! invocation (see the `porchlight-probe` crate). The first line wins: the
//! process is killed as soon as it has been read, and a timeout covers
//! spawn-to-first-line.

use serde::{Deserialize, Serialize};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::Error;

pub const HOST_HEALTH_ID: &str = "host-health";

/// Default Raspberry Pi diagnostics: model, CPU/GPU temperature, memory, top
/// processes, throttling flags and suspicious kernel messages.
pub const DEFAULT_HEALTH_SCRIPT: &str = r#"grep Raspberry /proc/cpuinfo; echo "----- Cpu temperature -----"; cat /sys/class/thermal/thermal_zone0/temp; echo "----- Gpu temperature -----"; vcgencmd measure_temp; echo "----- Memory Usage -----"; free -h; echo "----- Cpu Usage (top processes) -----"; ps -eo time,pmem,pcpu,command --sort -pcpu | head -8; echo "----- Voltage condition (expected: 0x0) -----"; vcgencmd get_throttled; echo "----- Critical system messages -----"; dmesg | grep -E 'voltage|error|fail' | cat"#;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceSpec {
    pub id: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_source_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_source_timeout_ms() -> u64 {
    10_000
}

impl SourceSpec {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outcome of one poll of one source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub source_id: String,
    pub value: f64,
    pub succeeded: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<&'static str>,
}

impl SensorReading {
    pub fn ok(source_id: &str, value: f64) -> Self {
        Self {
            source_id: source_id.to_string(),
            value,
            succeeded: true,
            error_detail: None,
            error_kind: None,
        }
    }

    pub fn failed(source_id: &str, err: &Error) -> Self {
        Self {
            source_id: source_id.to_string(),
            value: f64::NAN,
            succeeded: false,
            error_detail: Some(err.to_string()),
            error_kind: Some(err.kind()),
        }
    }

    /// The value, if the poll succeeded.
    pub fn value(&self) -> Option<f64> {
        self.succeeded.then_some(self.value)
    }
}

/// Run the source once and parse its first stdout line.
pub async fn read_value(spec: &SourceSpec) -> Result<f64, Error> {
    let unavailable = |reason: String| Error::SourceUnavailable {
        source_id: spec.id.clone(),
        reason,
    };

    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| unavailable(format!("spawn {} failed: {e}", spec.program)))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| unavailable("stdout not captured".into()))?;
    let mut lines = BufReader::new(stdout).lines();

    let line = match tokio::time::timeout(spec.timeout(), lines.next_line()).await {
        Err(_) => {
            return Err(Error::SourceTimeout {
                source_id: spec.id.clone(),
                after: spec.timeout(),
            })
        }
        Ok(Err(e)) => return Err(unavailable(format!("reading stdout failed: {e}"))),
        Ok(Ok(None)) => return Err(unavailable("stream closed without output".into())),
        Ok(Ok(Some(line))) => line,
    };

    // Dropping `child` kills it if it is still running.
    if let Err(e) = child.start_kill() {
        debug!(source = %spec.id, "source already exited: {e}");
    }

    parse_value(&spec.id, &line)
}

pub(crate) fn parse_value(source_id: &str, line: &str) -> Result<f64, Error> {
    match line.trim().parse::<f64>() {
        Ok(v) if v.is_finite() => Ok(v),
        _ => Err(Error::SourceMalformed {
            source_id: source_id.to_string(),
            output: line.trim().to_string(),
        }),
    }
}

/// Poll a source, folding any failure into the reading.
pub async fn read_source(spec: &SourceSpec) -> SensorReading {
    match read_value(spec).await {
        Ok(v) => {
            debug!(source = %spec.id, value = v, "source read");
            SensorReading::ok(&spec.id, v)
        }
        Err(e) => {
            warn!(source = %spec.id, kind = e.kind(), "source failed: {e}");
            SensorReading::failed(&spec.id, &e)
        }
    }
}

// ---------------------------------------------------------------------------
// Host health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthProbe {
    pub command: String,
    pub timeout_ms: u64,
}

impl Default for HealthProbe {
    fn default() -> Self {
        Self {
            command: DEFAULT_HEALTH_SCRIPT.to_string(),
            timeout_ms: 15_000,
        }
    }
}

impl HealthProbe {
    /// Run the diagnostics script through `sh -c`. The text is opaque.
    pub async fn run(&self) -> Result<String, Error> {
        let after = Duration::from_millis(self.timeout_ms);
        let unavailable = |reason: String| Error::SourceUnavailable {
            source_id: HOST_HEALTH_ID.to_string(),
            reason,
        };

        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let out = match tokio::time::timeout(after, child).await {
            Err(_) => {
                return Err(Error::SourceTimeout {
                    source_id: HOST_HEALTH_ID.to_string(),
                    after,
                })
            }
            Ok(Err(e)) => return Err(unavailable(format!("spawn failed: {e}"))),
            Ok(Ok(out)) => out,
        };

        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            return Err(unavailable(format!("{}: {}", out.status, stderr.trim())));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A source backed by a shell one-liner.
    pub(crate) fn sh_source(id: &str, script: &str) -> SourceSpec {
        SourceSpec {
            id: id.to_string(),
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout_ms: 2_000,
        }
    }

    #[test]
    fn parse_value_accepts_padded_numbers() {
        assert_eq!(parse_value("s", " 212.5\n"), Ok(212.5));
        assert_eq!(parse_value("s", "-3"), Ok(-3.0));
    }

    #[test]
    fn parse_value_rejects_text_and_non_finite() {
        assert!(matches!(parse_value("s", "dark"), Err(Error::SourceMalformed { .. })));
        assert!(matches!(parse_value("s", "NaN"), Err(Error::SourceMalformed { .. })));
        assert!(matches!(parse_value("s", ""), Err(Error::SourceMalformed { .. })));
    }

    #[tokio::test]
    async fn reads_first_line_only() {
        let spec = sh_source("light", "echo 220; echo 999");
        assert_eq!(read_value(&spec).await, Ok(220.0));
    }

    #[tokio::test]
    async fn first_line_wins_even_if_process_lingers() {
        let spec = sh_source("light", "echo 42; sleep 30");
        assert_eq!(read_value(&spec).await, Ok(42.0));
    }

    #[tokio::test]
    async fn non_numeric_output_is_malformed() {
        let spec = sh_source("light", "echo oops");
        let err = read_value(&spec).await.unwrap_err();
        assert!(matches!(err, Error::SourceMalformed { ref output, .. } if output == "oops"));
    }

    #[tokio::test]
    async fn silent_exit_is_unavailable() {
        let spec = sh_source("light", "exit 0");
        let err = read_value(&spec).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { ref reason, .. } if reason.contains("without output")));
    }

    #[tokio::test]
    async fn missing_program_is_unavailable() {
        let spec = SourceSpec {
            id: "ghost".into(),
            program: "/nonexistent/porchlight-probe".into(),
            args: vec![],
            timeout_ms: 1_000,
        };
        let err = read_value(&spec).await.unwrap_err();
        assert!(matches!(err, Error::SourceUnavailable { .. }));
    }

    #[tokio::test]
    async fn hang_becomes_timeout() {
        let mut spec = sh_source("slow", "sleep 5; echo 1");
        spec.timeout_ms = 100;
        let err = read_value(&spec).await.unwrap_err();
        assert!(matches!(err, Error::SourceTimeout { .. }));
    }

    #[tokio::test]
    async fn read_source_folds_failure_into_reading() {
        let r = read_source(&sh_source("thermistor", "echo hot")).await;
        assert!(!r.succeeded);
        assert_eq!(r.source_id, "thermistor");
        assert_eq!(r.value(), None);
        assert_eq!(r.error_kind, Some("source_malformed"));
    }

    #[tokio::test]
    async fn health_probe_returns_text() {
        let probe = HealthProbe {
            command: "echo temp=48.2C; echo throttled=0x0".into(),
            timeout_ms: 2_000,
        };
        let text = probe.run().await.unwrap();
        assert!(text.contains("throttled=0x0"));
    }

    #[tokio::test]
    async fn health_probe_nonzero_exit_fails() {
        let probe = HealthProbe {
            command: "echo broken >&2; exit 3".into(),
            timeout_ms: 2_000,
        };
        let err = probe.run().await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }
}
