//! Config file discovery, loading and validation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;

use crate::config::types::SentinelConfig;

const SYSTEM_CONFIG_PATHS: [&str; 2] = [
    "/etc/sentinel-hl/config.yml",
    "/etc/opt/sentinel-hl/config.yml",
];

/// Every problem found in a configuration document, reported as `field.path: message`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("Configuration file contains {} error(s):\n{}", .errors.len(), bullet_list(.errors))]
pub struct ConfigError {
    pub errors: Vec<FieldError>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

fn bullet_list(errors: &[FieldError]) -> String {
    errors.iter().map(|e| format!("  - {}\n", e)).collect()
}

/// Candidate config locations, most specific first.
pub fn config_search_paths() -> Vec<PathBuf> {
    let mut paths: Vec<PathBuf> = SYSTEM_CONFIG_PATHS.iter().map(PathBuf::from).collect();
    if let Some(dir) = dirs::config_dir() {
        paths.push(dir.join("sentinel-hl").join("config.yml"));
    }
    paths
}

pub fn resolve_config_path(path: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = path {
        return Ok(p.to_path_buf());
    }

    config_search_paths()
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| anyhow::anyhow!("No config file found (searched {:?})", config_search_paths()))
}

/// Load and validate the configuration. Validation failures are returned as a [`ConfigError`]
/// inside the `anyhow` error so callers can downcast and print the field list.
pub async fn load_config(path: Option<&Path>) -> Result<SentinelConfig> {
    let config_path = resolve_config_path(path)?;

    let content = tokio::fs::read_to_string(&config_path)
        .await
        .with_context(|| format!("Failed to read config file {:?}", config_path))?;

    let config = parse_config(&content)?;

    info!("Loaded configuration from: {:?}", config_path);
    Ok(config)
}

pub fn parse_config(content: &str) -> Result<SentinelConfig> {
    // An empty document is a valid config with every default
    let config: SentinelConfig = if content.trim().is_empty() {
        serde_yaml::from_str("{}")?
    } else {
        serde_yaml::from_str(content).map_err(|e| ConfigError {
            errors: vec![FieldError {
                field: e
                    .location()
                    .map(|l| format!("line {}", l.line()))
                    .unwrap_or_else(|| "general".to_string()),
                message: e.to_string(),
            }],
        })?
    };

    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &SentinelConfig) -> std::result::Result<(), ConfigError> {
    let mut errors = Vec::new();
    let mut push = |field: String, message: &str| {
        errors.push(FieldError { field, message: message.to_string() });
    };

    let mut host_names = HashSet::new();
    for (i, host) in config.hosts.iter().enumerate() {
        if host.name.trim().is_empty() {
            push(format!("hosts.{}.name", i), "must not be empty");
        }
        if !host_names.insert(host.name.as_str()) {
            push(format!("hosts.{}.name", i), "host names must be unique");
        }
        let has_hostname = host.hostname.as_deref().is_some_and(|h| !h.is_empty());
        let has_ip = host.ip.as_deref().is_some_and(|h| !h.is_empty());
        if !has_hostname && !has_ip {
            push(format!("hosts.{}", i), "either 'hostname' or 'ip' must be provided");
        }
        if let Some(ip) = host.ip.as_deref().filter(|s| !s.is_empty()) {
            if ip.parse::<std::net::IpAddr>().is_err() {
                push(format!("hosts.{}.ip", i), "not a valid IP address");
            }
        }
    }

    let policy = &config.hosts_policy;
    if policy.ack_status_interval < 5 {
        push("hosts_policy.ack_status_interval".into(), "must be greater than or equal to 5");
    }
    if policy.ack_status_retry < 1 {
        push("hosts_policy.ack_status_retry".into(), "must be greater than or equal to 1");
    }

    let mut ups_names = HashSet::new();
    for (i, ups) in config.ups.iter().enumerate() {
        if ups.name.trim().is_empty() {
            push(format!("ups.{}.name", i), "must not be empty");
        }
        if !ups_names.insert(ups.name.as_str()) {
            push(format!("ups.{}.name", i), "UPS names must be unique");
        }
        if ups.nut_id.trim().is_empty() {
            push(format!("ups.{}.nut_id", i), "must not be empty");
        }
        for (j, name) in ups.hosts.iter().enumerate() {
            if !config.hosts.iter().any(|h| &h.name == name) {
                push(format!("ups.{}.hosts.{}", i, j), "refers to an unknown host");
            }
        }
    }

    if config.ups_poll_interval < 5 {
        push("ups_poll_interval".into(), "must be greater than or equal to 5");
    }
    if config.hosts_check_interval < 30 {
        push("hosts_check_interval".into(), "must be greater than or equal to 30");
    }
    if config.wol.broadcast.parse::<std::net::Ipv4Addr>().is_err() {
        push("wol.broadcast".into(), "not a valid IPv4 address");
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigError { errors })
    }
}
