//! Per-UPS power orchestration: halts dependent hosts on battery, wakes them once power is stable.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::types::{ThresholdUnit, UpsConfig, UpsUnitsPolicy};
use crate::network::nut::{UpsVariableSource, UpsVariables};
use crate::services::host::{HostStatus, ManagedHost};
use crate::store::datastore::{load_record, save_record, Datastore};

/// Where the UPS draws power from, derived from the `ups.status` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerSource {
    Online,
    OnBattery,
    /// Both `OL` and `OB` reported
    Ambiguous,
    /// Neither flag reported
    Unknown,
}

impl PowerSource {
    pub fn classify(status: &[String]) -> Self {
        let online = status.iter().any(|s| s == "OL");
        let on_battery = status.iter().any(|s| s == "OB");
        match (online, on_battery) {
            (true, false) => PowerSource::Online,
            (false, true) => PowerSource::OnBattery,
            (true, true) => PowerSource::Ambiguous,
            (false, false) => PowerSource::Unknown,
        }
    }
}

impl fmt::Display for PowerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            PowerSource::Online => "online",
            PowerSource::OnBattery => "on battery",
            PowerSource::Ambiguous => "ambiguous",
            PowerSource::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// First reading of an on-battery excursion, used to estimate the drain rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BatterySample {
    pub timestamp: f64,
    pub charge: f64,
}

/// Persisted part of the UPS state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UpsCache {
    #[serde(default)]
    pub hosts_halted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_sample: Option<BatterySample>,
}

enum Cooldown {
    Armed,
    Pending(f64),
    Elapsed,
}

struct UpsState {
    cache: UpsCache,
    /// Not persisted: a restart re-arms it on the next online poll
    wake_cooldown: Option<f64>,
    last_power: Option<PowerSource>,
}

pub struct UpsService {
    config: UpsConfig,
    policy: UpsUnitsPolicy,
    hosts: Vec<Arc<dyn ManagedHost>>,
    source: tokio::sync::Mutex<Box<dyn UpsVariableSource>>,
    datastore: Arc<dyn Datastore>,
    clock: Arc<dyn Clock>,
    state: Mutex<UpsState>,
}

impl UpsService {
    pub fn new(
        config: UpsConfig,
        policy: UpsUnitsPolicy,
        hosts: Vec<Arc<dyn ManagedHost>>,
        source: Box<dyn UpsVariableSource>,
        datastore: Arc<dyn Datastore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let cache: UpsCache = load_record(datastore.as_ref(), &config.name);

        if cache.hosts_halted {
            info!(ups = %config.name, "Hosts were halted before restart. Keeping them locked until power is stable");
            for host in &hosts {
                host.lock_wake(&config.name);
            }
        }

        Self {
            config,
            policy,
            hosts,
            source: tokio::sync::Mutex::new(source),
            datastore,
            clock,
            state: Mutex::new(UpsState {
                cache,
                wake_cooldown: None,
                last_power: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[cfg(test)]
    pub fn hosts_halted(&self) -> bool {
        self.state.lock().cache.hosts_halted
    }

    #[cfg(test)]
    pub fn wake_cooldown(&self) -> Option<f64> {
        self.state.lock().wake_cooldown
    }

    pub async fn poll(&self) {
        let name = self.name();

        let result = {
            let mut source = self.source.lock().await;
            source.get_variables(&self.config.nut_id).await
        };

        let vars = match result {
            Ok(Some(vars)) => vars,
            Ok(None) => {
                debug!(ups = name, "No data from UPS this cycle");
                return;
            }
            Err(e) => {
                error!(ups = name, "Error polling UPS: {}", e);
                return;
            }
        };

        let power = PowerSource::classify(&vars.status);
        self.note_transition(power);

        match power {
            PowerSource::Online => self.handle_online().await,
            PowerSource::OnBattery => self.handle_on_battery(&vars).await,
            PowerSource::Ambiguous => {
                warn!(ups = name, "UPS reports both OL and OB ({:?}). Ignoring this cycle", vars.status);
            }
            PowerSource::Unknown => {
                debug!(ups = name, "UPS reports neither OL nor OB ({:?})", vars.status);
            }
        }
    }

    pub async fn disconnect(&self) {
        self.source.lock().await.disconnect().await;
    }

    fn note_transition(&self, power: PowerSource) {
        if !matches!(power, PowerSource::Online | PowerSource::OnBattery) {
            return;
        }

        let previous = self.state.lock().last_power.replace(power);
        match (previous, power) {
            (Some(prev), now) if prev == now => debug!(ups = self.name(), "UPS is {}", now),
            (Some(_), PowerSource::OnBattery) => warn!(ups = self.name(), "UPS switched to battery"),
            (Some(_), _) => info!(ups = self.name(), "UPS is back on mains power"),
            (None, now) => info!(ups = self.name(), "UPS is {}", now),
        }
    }

    async fn handle_online(&self) {
        let name = self.name();
        let now = self.clock.now();

        let (sample_cleared, cooldown) = {
            let mut st = self.state.lock();
            let sample_cleared = st.cache.battery_sample.take().is_some();
            if !st.cache.hosts_halted {
                (sample_cleared, None)
            } else {
                let deadline = st.wake_cooldown;
                let cooldown = match deadline {
                    None => {
                        let deadline = now + self.policy.wake_cooldown as f64;
                        st.wake_cooldown = Some(deadline);
                        Some(Cooldown::Armed)
                    }
                    Some(deadline) if deadline > now => Some(Cooldown::Pending(deadline - now)),
                    Some(_) => {
                        st.cache.hosts_halted = false;
                        st.wake_cooldown = None;
                        Some(Cooldown::Elapsed)
                    }
                };
                (sample_cleared, cooldown)
            }
        };

        // The elapsed branch persists below anyway
        if sample_cleared && !matches!(cooldown, Some(Cooldown::Elapsed)) {
            self.persist();
        }

        match cooldown {
            None => return,
            Some(Cooldown::Armed) => {
                info!(ups = name, "UPS is back online. Waiting {}s before waking hosts", self.policy.wake_cooldown);
                return;
            }
            Some(Cooldown::Pending(left)) => {
                debug!(ups = name, "UPS is in cooldown period for another {:.0}s", left);
                return;
            }
            Some(Cooldown::Elapsed) => self.persist(),
        }

        info!(ups = name, "UPS is stable. Waking hosts...");

        for host in &self.hosts {
            host.unlock_wake(name);
            if let Err(e) = host.wake().await {
                if e.is_precondition() {
                    info!(ups = name, host = host.name(), "Not waking host: {}", e);
                } else {
                    error!(ups = name, host = host.name(), "Failed to wake host: {}", e);
                }
            }
        }
    }

    async fn handle_on_battery(&self, vars: &UpsVariables) {
        let name = self.name();
        let now = self.clock.now();
        let charge = vars.battery_charge;

        let (crossed, sample_captured) = {
            let mut st = self.state.lock();

            if st.wake_cooldown.take().is_some() {
                info!(ups = name, "UPS is on battery again. Wake cooldown cancelled");
            }
            if st.cache.hosts_halted {
                return;
            }

            self.threshold_crossed(&mut st.cache, charge, now)
        };

        if sample_captured {
            self.persist();
        }
        if !crossed {
            return;
        }

        warn!(
            ups = name,
            "UPS is on battery and below shutdown threshold \"{}\". Initiating shutdown...",
            self.policy.shutdown_threshold
        );

        for host in &self.hosts {
            if host.status() == Some(HostStatus::Down) {
                debug!(ups = name, host = host.name(), "Host is already down");
                continue;
            }

            if let Err(e) = host.shutdown().await {
                error!(ups = name, host = host.name(), "Error shutting down host: {}", e);
            }
            host.lock_wake(name);
        }

        self.state.lock().cache.hosts_halted = true;
        self.persist();
    }

    /// Returns whether the threshold is crossed and whether a new drain sample was captured.
    fn threshold_crossed(&self, cache: &mut UpsCache, charge: f64, now: f64) -> (bool, bool) {
        let threshold = self.policy.shutdown_threshold;

        match threshold.unit {
            ThresholdUnit::Percent => {
                debug!(ups = self.name(), "Battery charge {}% (threshold {}%)", charge, threshold.value);
                (charge <= threshold.value, false)
            }
            ThresholdUnit::Seconds => {
                let captured = cache.battery_sample.is_none();
                let sample = *cache
                    .battery_sample
                    .get_or_insert(BatterySample { timestamp: now, charge });

                let drained = sample.charge - charge;
                let elapsed = now - sample.timestamp;
                if drained <= 0.0 || elapsed <= 0.0 {
                    debug!(ups = self.name(), "Not enough data to estimate runtime yet");
                    return (false, captured);
                }

                let remaining = charge / (drained / elapsed);
                debug!(
                    ups = self.name(),
                    "Estimated runtime {:.0}s (threshold {}s)",
                    remaining,
                    threshold.value
                );
                (remaining <= threshold.value, captured)
            }
        }
    }

    fn persist(&self) {
        let cache = self.state.lock().cache.clone();
        match save_record(self.datastore.as_ref(), self.name(), &cache) {
            Ok(()) => debug!(ups = self.name(), "Cache data for UPS persisted"),
            Err(e) => error!(ups = self.name(), "Failed to persist UPS cache: {}", e),
        }
    }
}
