//! Host lifecycle commands and structured host stats.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::process::Command;
use tracing::{error, info};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HostStats {
    pub pid: u32,
    pub uptime_secs: u64,
    pub load_one: f64,
    pub memory_used_mb: u64,
    pub memory_total_mb: u64,
}

impl HostStats {
    pub fn sample(sys: &mut System) -> Self {
        sys.refresh_memory();
        let load = System::load_average();
        Self {
            pid: std::process::id(),
            uptime_secs: System::uptime(),
            load_one: load.one,
            memory_used_mb: sys.used_memory() / 1024 / 1024,
            memory_total_mb: sys.total_memory() / 1024 / 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostCommands {
    pub reboot: String,
    pub poweroff: String,
}

impl Default for HostCommands {
    fn default() -> Self {
        Self {
            reboot: "sudo reboot".to_string(),
            poweroff: "sudo poweroff".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Reboot,
    Poweroff,
}

impl HostCommands {
    /// Fire a lifecycle command. Failures are logged and reported, never
    /// propagated.
    pub async fn run(&self, action: Lifecycle) -> Result<(), String> {
        let cmd = match action {
            Lifecycle::Reboot => &self.reboot,
            Lifecycle::Poweroff => &self.poweroff,
        };
        info!(?action, command = %cmd, "host lifecycle requested");

        match Command::new("sh").arg("-c").arg(cmd).output().await {
            Ok(out) if out.status.success() => Ok(()),
            Ok(out) => {
                let msg = format!(
                    "{:?} exited with {}: {}",
                    action,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                error!("{msg}");
                Err(msg)
            }
            Err(e) => {
                let msg = format!("{action:?} failed to start: {e}");
                error!("{msg}");
                Err(msg)
            }
        }
    }
}
