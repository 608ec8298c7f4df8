// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, ensure};
use serde::{Deserialize, Serialize};

/// Check cycles are jittered by +-5 s around `check_interval`.
pub const CHECK_JITTER: Duration = Duration::from_secs(5);

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Where the key/module daemon listens and how often it is pinged.
    pub daemon: DaemonConfig,
    /// Cheat-check pacing and client reply deadline.
    pub checks: CheckSchedule,
    /// What happens to clients that fail a check.
    pub discipline: Discipline,
    /// Location of the Warden module binaries, named by MD5 fingerprint.
    pub modules: Modules,
}

/// Daemon endpoint and heartbeat settings.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DaemonConfig {
    #[serde(rename = "DaemonAddress")]
    /// Host the key daemon listens on.
    pub address: String,

    #[serde(rename = "DaemonPort")]
    /// TCP port of the key daemon.
    pub port: u16,

    #[serde(
        rename = "PingIntervalMs",
        with = "serde_millis",
        default = "default_ping"
    )]
    /// Heartbeat period on the daemon link.
    pub ping_interval: Duration,
}

/// Pacing of check batches towards connected clients.
#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct CheckSchedule {
    #[serde(
        rename = "CheckIntervalMs",
        with = "serde_millis",
        default = "default_check_interval"
    )]
    /// Nominal delay between a validated reply and the next batch.
    pub check_interval: Duration,

    #[serde(
        rename = "ReplyTimeoutMs",
        with = "serde_millis",
        default = "default_reply_timeout"
    )]
    /// How long a client may sit on an outstanding batch.
    pub reply_timeout: Duration,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Discipline {
    #[serde(rename = "BanningEnabled")]
    /// When set, validated cheaters are banned in addition to being kicked.
    pub banning_enabled: bool,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Modules {
    #[serde(rename = "ModuleDir")]
    /// Directory holding module binaries; file names are the fingerprints.
    pub module_dir: PathBuf,
}

fn default_ping() -> Duration {
    Duration::from_millis(30_000)
}

fn default_check_interval() -> Duration {
    Duration::from_millis(30_000)
}

fn default_reply_timeout() -> Duration {
    Duration::from_millis(60_000)
}

impl Config {
    /// Loads the configuration from YAML, validates it, and returns the
    /// ready-to-use value.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let s = fs::read_to_string(path)?;
        let mut cfg: Config =
            serde_yaml::from_str(&s).context("failed to parse config YAML")?;
        cfg.validate_and_normalize()?;
        Ok(cfg)
    }

    /// Validates invariants and normalizes derived fields.
    pub fn validate_and_normalize(&mut self) -> Result<()> {
        ensure!(
            !self.daemon.address.is_empty(),
            "DaemonAddress must not be empty"
        );
        ensure!(self.daemon.port != 0, "DaemonPort must not be 0");
        ensure!(
            self.daemon.ping_interval >= Duration::from_secs(1),
            "PingIntervalMs must be at least 1000"
        );

        // The jitter window must fit inside the nominal interval.
        ensure!(
            self.checks.check_interval > CHECK_JITTER,
            "CheckIntervalMs must exceed the 5s jitter window"
        );
        ensure!(
            self.checks.reply_timeout >= Duration::from_secs(1),
            "ReplyTimeoutMs must be at least 1000"
        );

        ensure!(
            !self.modules.module_dir.as_os_str().is_empty(),
            "ModuleDir must not be empty"
        );

        Ok(())
    }

    /// `host:port` endpoint string for the daemon link.
    pub fn daemon_endpoint(&self) -> String {
        format!("{}:{}", self.daemon.address, self.daemon.port)
    }
}

/// Serde helpers for representing `Duration` as a number of milliseconds.
mod serde_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}
