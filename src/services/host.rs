//! Per-host lifecycle: identity resolution, liveness probing, wake and shutdown.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::types::{HostConfig, HostsPolicy};
use crate::network::discovery::HostDiscovery;
use crate::network::wol::WakeSender;
use crate::services::tasks::TaskRegistry;
use crate::store::datastore::{load_record, save_record, Datastore};
use crate::system::executor::{ping, ProcessError, ProcessExecutor, RemoteHost};

const PING_COUNT: u32 = 1;
const PING_TIMEOUT_SECS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostStatus {
    Up,
    Down,
}

impl fmt::Display for HostStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostStatus::Up => write!(f, "up"),
            HostStatus::Down => write!(f, "down"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    /// The action is not valid in the host's current state
    #[error("{0}")]
    Precondition(String),
    #[error("remote shutdown failed: {0}")]
    Process(#[from] ProcessError),
    #[error("wake-on-lan failed: {0}")]
    Wake(anyhow::Error),
}

impl HostError {
    pub fn is_precondition(&self) -> bool {
        matches!(self, HostError::Precondition(_))
    }
}

/// Persisted part of the host state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostCache {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<HostStatus>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub ack: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default)]
    pub ip_expiry: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
    #[serde(default)]
    pub mac_expiry: f64,
    #[serde(default)]
    pub wake_backoff: f64,
}

struct HostState {
    cache: HostCache,
    ip: Option<String>,
    mac: Option<String>,
    wake_locks: BTreeSet<String>,
    wake_in_progress: bool,
    shutdown_in_progress: bool,
}

/// Collaborators shared by every host.
#[derive(Clone)]
pub struct HostDeps {
    pub executor: Arc<dyn ProcessExecutor>,
    pub discovery: Arc<dyn HostDiscovery>,
    pub wol: Arc<dyn WakeSender>,
    pub datastore: Arc<dyn Datastore>,
    pub clock: Arc<dyn Clock>,
    pub tasks: TaskRegistry,
}

struct HostInner {
    config: HostConfig,
    policy: HostsPolicy,
    deps: HostDeps,
    state: Mutex<HostState>,
}

#[derive(Clone)]
pub struct HostService {
    inner: Arc<HostInner>,
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.clone().filter(|v| !v.is_empty())
}

impl HostService {
    pub fn new(config: HostConfig, policy: HostsPolicy, deps: HostDeps) -> Self {
        let cache: HostCache = load_record(deps.datastore.as_ref(), &config.name);

        // Statically configured identity wins over anything cached
        let ip = non_empty(&config.ip).or_else(|| cache.ip.clone());
        let mac = non_empty(&config.mac).or_else(|| cache.mac.clone());

        Self {
            inner: Arc::new(HostInner {
                state: Mutex::new(HostState {
                    cache,
                    ip,
                    mac,
                    wake_locks: BTreeSet::new(),
                    wake_in_progress: false,
                    shutdown_in_progress: false,
                }),
                config,
                policy,
                deps,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn status(&self) -> Option<HostStatus> {
        self.inner.state.lock().cache.status
    }

    #[cfg(test)]
    pub fn acknowledged(&self) -> bool {
        self.inner.state.lock().cache.ack
    }

    pub fn ip(&self) -> Option<String> {
        self.inner.state.lock().ip.clone()
    }

    #[cfg(test)]
    pub fn mac(&self) -> Option<String> {
        self.inner.state.lock().mac.clone()
    }

    #[cfg(test)]
    pub fn wake_locks(&self) -> Vec<String> {
        self.inner.state.lock().wake_locks.iter().cloned().collect()
    }

    #[cfg(test)]
    pub fn action_in_progress(&self) -> bool {
        let st = self.inner.state.lock();
        st.wake_in_progress || st.shutdown_in_progress
    }

    #[cfg(test)]
    pub fn cache(&self) -> HostCache {
        self.inner.state.lock().cache.clone()
    }

    /// Refresh the IP (by hostname) and MAC (by IP), each only once its cached TTL elapsed.
    pub async fn discover(&self) {
        let inner = &self.inner;
        let name = self.name();

        if non_empty(&inner.config.ip).is_none() {
            if let Some(hostname) = non_empty(&inner.config.hostname) {
                let expired = inner.state.lock().cache.ip_expiry <= inner.deps.clock.now();
                if expired {
                    debug!(host = name, "Resolving IP address by hostname \"{}\"", hostname);
                    match inner.deps.discovery.ip_by_hostname(&hostname).await {
                        Ok(ip) => {
                            debug!(host = name, "Found IP address {}", ip);
                            let mut st = inner.state.lock();
                            st.cache.ip = Some(ip);
                            st.cache.ip_expiry = inner.deps.clock.now() + inner.policy.ip_cache_ttl as f64;
                        }
                        Err(e) => error!(host = name, "Failed to resolve IP by hostname \"{}\": {:#}", hostname, e),
                    }
                } else {
                    debug!(host = name, "Using IP address {:?} from cache", inner.state.lock().cache.ip);
                }

                let mut st = inner.state.lock();
                st.ip = st.cache.ip.clone();
            }
        }

        if non_empty(&inner.config.mac).is_none() {
            let ip = inner.state.lock().ip.clone();
            if let Some(ip) = ip {
                let expired = inner.state.lock().cache.mac_expiry <= inner.deps.clock.now();
                if expired {
                    debug!(host = name, "Resolving MAC address by IP {}", ip);
                    match inner.deps.discovery.mac_by_ip(&ip).await {
                        Ok(mac) => {
                            debug!(host = name, "Found MAC address {}", mac);
                            let mut st = inner.state.lock();
                            st.cache.mac = Some(mac);
                            st.cache.mac_expiry = inner.deps.clock.now() + inner.policy.mac_cache_ttl as f64;
                        }
                        Err(e) => error!(host = name, "Failed to resolve MAC by IP {}: {:#}", ip, e),
                    }
                } else {
                    debug!(host = name, "Using MAC address {:?} from cache", inner.state.lock().cache.mac);
                }

                let mut st = inner.state.lock();
                st.mac = st.cache.mac.clone();
            }
        }

        self.persist();

        let st = inner.state.lock();
        debug!(host = name, "Host details: IP={:?}, MAC={:?}", st.ip, st.mac);
    }

    /// Ping the host and wake it when down. Skipped while acknowledged,
    /// unresolved, or while a wake/shutdown is still being confirmed.
    pub async fn check(&self) {
        let name = self.name();
        debug!(host = name, "Checking host...");

        {
            let st = self.inner.state.lock();
            if st.cache.ack {
                debug!(host = name, "Host is acknowledged as down. Skipping check");
                return;
            }
            if st.ip.is_none() || st.mac.is_none() {
                warn!(host = name, "IP or MAC not discovered properly. Skipping check");
                return;
            }
            if st.wake_in_progress || st.shutdown_in_progress {
                debug!(host = name, "Host is currently in wake or shutdown operation. Skipping check");
                return;
            }
        }

        if self.ping_status().await == HostStatus::Up {
            debug!(host = name, "Host is up");
            return;
        }

        info!(host = name, "Host is down. Attempting to wake it up...");
        if let Err(e) = self.wake().await {
            if e.is_precondition() {
                info!(host = name, "Not waking host: {}", e);
            } else {
                error!(host = name, "Could not wake host: {}", e);
            }
        }
    }

    pub async fn wake(&self) -> Result<(), HostError> {
        let inner = &self.inner;
        let name = self.name();

        let mac = {
            let mut st = inner.state.lock();

            if st.wake_in_progress {
                return Err(HostError::Precondition("Wake operation for host is already in progress".into()));
            }
            match st.cache.status {
                Some(HostStatus::Down) => {}
                other => {
                    return Err(HostError::Precondition(format!(
                        "Invalid host status ({}). Skipping wake",
                        status_label(other)
                    )))
                }
            }
            if !st.wake_locks.is_empty() {
                return Err(HostError::Precondition(format!("Host is locked: {:?}", st.wake_locks)));
            }
            if st.cache.wake_backoff > inner.deps.clock.now() {
                return Err(HostError::Precondition("Host is in backoff".into()));
            }
            let Some(mac) = st.mac.clone() else {
                return Err(HostError::Precondition("MAC address is not known".into()));
            };

            st.wake_in_progress = true;
            mac
        };

        info!(host = name, "Waking up host via Wake-on-LAN");

        if let Err(e) = inner.deps.wol.send_magic_packet(&mac).await {
            inner.state.lock().wake_in_progress = false;
            return Err(HostError::Wake(e));
        }
        debug!(host = name, "Wake-on-LAN packet sent to {}", mac);

        let host = self.clone();
        inner.deps.tasks.spawn(async move { host.poll_wake_ack().await });
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<(), HostError> {
        let inner = &self.inner;
        let name = self.name();

        let ip = {
            let mut st = inner.state.lock();

            if st.shutdown_in_progress {
                return Err(HostError::Precondition("Shutdown operation is already in progress".into()));
            }
            match st.cache.status {
                Some(HostStatus::Up) => {}
                other => {
                    return Err(HostError::Precondition(format!(
                        "Invalid host status ({}). Skipping shutdown",
                        status_label(other)
                    )))
                }
            }
            let Some(ip) = st.ip.clone() else {
                return Err(HostError::Precondition("IP address is not known".into()));
            };

            st.shutdown_in_progress = true;
            ip
        };

        info!(host = name, "Shutting down host...");

        let remote = RemoteHost {
            host: ip,
            port: inner.config.ssh_port,
            user: inner.config.ssh_user.clone(),
        };
        if let Err(e) = inner.deps.executor.execute(&["shutdown", "now"], Some(&remote)).await {
            inner.state.lock().shutdown_in_progress = false;
            return Err(e.into());
        }

        let host = self.clone();
        inner.deps.tasks.spawn(async move { host.poll_shutdown_ack().await });
        Ok(())
    }

    pub fn lock_wake(&self, token: &str) {
        self.inner.state.lock().wake_locks.insert(token.to_string());
    }

    pub fn unlock_wake(&self, token: &str) {
        if !self.inner.state.lock().wake_locks.remove(token) {
            debug!(host = self.name(), "Wake lock \"{}\" was not held", token);
        }
    }

    pub fn ack(&self) {
        self.inner.state.lock().cache.ack = true;
        self.persist();
    }

    pub fn clear_ack(&self) {
        {
            let mut st = self.inner.state.lock();
            if !st.cache.ack {
                warn!(host = self.name(), "No acknowledgment found for host to clear");
                return;
            }
            st.cache.ack = false;
        }
        self.persist();
    }

    async fn ping_status(&self) -> HostStatus {
        let Some(ip) = self.ip() else {
            return HostStatus::Down;
        };

        let status = match ping(self.inner.deps.executor.as_ref(), &ip, PING_COUNT, PING_TIMEOUT_SECS).await {
            Ok(()) => HostStatus::Up,
            Err(e) => {
                debug!(host = self.name(), "Ping failed: {}", e);
                HostStatus::Down
            }
        };

        self.inner.state.lock().cache.status = Some(status);
        self.persist();
        status
    }

    /// Ping again until the host reaches `target` or retries run out. Returns whether it did.
    async fn confirm(&self, target: HostStatus) -> bool {
        let interval = Duration::from_secs(self.inner.policy.ack_status_interval);
        for _ in 0..self.inner.policy.ack_status_retry {
            tokio::time::sleep(interval).await;
            if self.ping_status().await == target {
                return true;
            }
        }
        false
    }

    async fn poll_wake_ack(self) {
        let name = self.name();
        debug!(host = name, "Polling host status to ack wake action...");

        let confirmed = self.confirm(HostStatus::Up).await;

        let backoff = self.inner.policy.wake_backoff;
        {
            let mut st = self.inner.state.lock();
            st.wake_in_progress = false;
            if !confirmed {
                st.cache.wake_backoff = self.inner.deps.clock.now() + backoff as f64;
            }
        }

        if confirmed {
            info!(host = name, "Host confirmed up after wake");
        } else {
            self.persist();
            error!(
                host = name,
                "Host did not confirm status after wake action. Considering it still down and backing off for {}s",
                backoff
            );
        }
    }

    async fn poll_shutdown_ack(self) {
        let name = self.name();
        debug!(host = name, "Polling host status to ack shutdown action...");

        let confirmed = self.confirm(HostStatus::Down).await;
        self.inner.state.lock().shutdown_in_progress = false;

        if confirmed {
            info!(host = name, "Host confirmed down after shutdown");
        } else {
            error!(host = name, "Host did not confirm status after shutdown action. Considering it still up");
        }
    }

    fn persist(&self) {
        let cache = self.inner.state.lock().cache.clone();
        match save_record(self.inner.deps.datastore.as_ref(), self.name(), &cache) {
            Ok(()) => debug!(host = self.name(), "Cache data for host persisted"),
            Err(e) => error!(host = self.name(), "Failed to persist host cache: {}", e),
        }
    }
}

fn status_label(status: Option<HostStatus>) -> String {
    status.map(|s| s.to_string()).unwrap_or_else(|| "unknown".into())
}

impl fmt::Display for HostService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The part of a host the UPS orchestrator drives.
#[async_trait]
pub trait ManagedHost: Send + Sync {
    fn name(&self) -> &str;
    fn status(&self) -> Option<HostStatus>;
    async fn shutdown(&self) -> Result<(), HostError>;
    async fn wake(&self) -> Result<(), HostError>;
    fn lock_wake(&self, token: &str);
    fn unlock_wake(&self, token: &str);
}

#[async_trait]
impl ManagedHost for HostService {
    fn name(&self) -> &str {
        HostService::name(self)
    }

    fn status(&self) -> Option<HostStatus> {
        HostService::status(self)
    }

    async fn shutdown(&self) -> Result<(), HostError> {
        HostService::shutdown(self).await
    }

    async fn wake(&self) -> Result<(), HostError> {
        HostService::wake(self).await
    }

    fn lock_wake(&self, token: &str) {
        HostService::lock_wake(self, token)
    }

    fn unlock_wake(&self, token: &str) {
        HostService::unlock_wake(self, token)
    }
}
