//! Configuration structs and defaults.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SentinelConfig {
    #[serde(default)]
    pub hosts: Vec<HostConfig>,
    #[serde(default)]
    pub hosts_policy: HostsPolicy,
    #[serde(default)]
    pub ups: Vec<UpsConfig>,
    #[serde(default)]
    pub ups_units_policy: UpsUnitsPolicy,
    #[serde(default)]
    pub wol: WolSettings,
    #[serde(default = "default_ups_poll_interval")]
    pub ups_poll_interval: u64,
    #[serde(default = "default_hosts_check_interval")]
    pub hosts_check_interval: u64,
}

pub fn default_ups_poll_interval() -> u64 { 10 }
pub fn default_hosts_check_interval() -> u64 { 60 }

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    pub name: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub ssh_user: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostsPolicy {
    #[serde(default = "default_ack_status_interval")]
    pub ack_status_interval: u64,    // seconds between confirmation pings, >= 5
    #[serde(default = "default_ack_status_retry")]
    pub ack_status_retry: u32,       // >= 1
    #[serde(default = "default_wake_backoff")]
    pub wake_backoff: u64,
    #[serde(default = "default_cache_ttl")]
    pub ip_cache_ttl: u64,
    #[serde(default = "default_cache_ttl")]
    pub mac_cache_ttl: u64,
}

pub fn default_ack_status_interval() -> u64 { 15 }
pub fn default_ack_status_retry() -> u32 { 3 }
pub fn default_wake_backoff() -> u64 { 600 }
pub fn default_cache_ttl() -> u64 { 3600 }

impl Default for HostsPolicy {
    fn default() -> Self {
        Self {
            ack_status_interval: default_ack_status_interval(),
            ack_status_retry: default_ack_status_retry(),
            wake_backoff: default_wake_backoff(),
            ip_cache_ttl: default_cache_ttl(),
            mac_cache_ttl: default_cache_ttl(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsConfig {
    pub name: String,
    /// UPS identifier inside the NUT server (`LIST VAR <nut_id>`)
    pub nut_id: String,
    pub nut_host: String,
    #[serde(default = "default_nut_port")]
    pub nut_port: u16,
    #[serde(default)]
    pub hosts: Vec<String>,
}

pub fn default_nut_port() -> u16 { 3493 }

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpsUnitsPolicy {
    #[serde(default = "default_wake_cooldown")]
    pub wake_cooldown: u64,
    #[serde(default)]
    pub shutdown_threshold: ShutdownThreshold,
}

pub fn default_wake_cooldown() -> u64 { 120 }

impl Default for UpsUnitsPolicy {
    fn default() -> Self {
        Self {
            wake_cooldown: default_wake_cooldown(),
            shutdown_threshold: ShutdownThreshold::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WolSettings {
    #[serde(default = "default_wol_broadcast")]
    pub broadcast: String,
    #[serde(default = "default_wol_port")]
    pub port: u16,
}

pub fn default_wol_broadcast() -> String { "255.255.255.255".to_string() }
pub fn default_wol_port() -> u16 { 9 }

impl Default for WolSettings {
    fn default() -> Self {
        Self {
            broadcast: default_wol_broadcast(),
            port: default_wol_port(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdUnit {
    Percent,
    Seconds,
}

/// Battery level below which dependent hosts are shut down.
/// Written as `"<number><unit>"` where unit is `%` or `s`. A bare number means percent.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ThresholdRepr", into = "String")]
pub struct ShutdownThreshold {
    pub value: f64,
    pub unit: ThresholdUnit,
}

impl ShutdownThreshold {
    pub fn percent(value: f64) -> Self {
        Self { value, unit: ThresholdUnit::Percent }
    }

    pub fn seconds(value: f64) -> Self {
        Self { value, unit: ThresholdUnit::Seconds }
    }
}

impl Default for ShutdownThreshold {
    fn default() -> Self {
        Self::percent(30.0)
    }
}

impl fmt::Display for ShutdownThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            ThresholdUnit::Percent => write!(f, "{}%", self.value),
            ThresholdUnit::Seconds => write!(f, "{}s", self.value),
        }
    }
}

impl FromStr for ShutdownThreshold {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (number, unit) = if let Some(n) = s.strip_suffix('%') {
            (n, ThresholdUnit::Percent)
        } else if let Some(n) = s.strip_suffix('s') {
            (n, ThresholdUnit::Seconds)
        } else {
            (s, ThresholdUnit::Percent)
        };

        let value: f64 = number
            .trim()
            .parse()
            .map_err(|_| format!("invalid threshold '{}', expected e.g. \"30%\" or \"300s\"", s))?;

        match unit {
            ThresholdUnit::Percent if !(0.0..=100.0).contains(&value) => {
                Err(format!("percentage threshold must be between 0 and 100, got {}", value))
            }
            ThresholdUnit::Seconds if value <= 0.0 => {
                Err(format!("seconds threshold must be positive, got {}", value))
            }
            _ => Ok(Self { value, unit }),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdRepr {
    Number(f64),
    Text(String),
}

impl TryFrom<ThresholdRepr> for ShutdownThreshold {
    type Error = String;

    fn try_from(repr: ThresholdRepr) -> Result<Self, Self::Error> {
        match repr {
            ThresholdRepr::Number(n) => n.to_string().parse(),
            ThresholdRepr::Text(s) => s.parse(),
        }
    }
}

impl From<ShutdownThreshold> for String {
    fn from(t: ShutdownThreshold) -> Self {
        t.to_string()
    }
}
