//! Host identity resolution: hostname to IP, IP to MAC.

use std::net::IpAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;

use crate::system::executor::{ping, ProcessExecutor};
use crate::system::parser::parse_neighbor_mac;

#[async_trait]
pub trait HostDiscovery: Send + Sync {
    async fn ip_by_hostname(&self, hostname: &str) -> Result<String>;
    async fn mac_by_ip(&self, ip: &str) -> Result<String>;
}

/// DNS lookup plus the kernel neighbor table.
pub struct NetworkDiscovery {
    executor: Arc<dyn ProcessExecutor>,
}

impl NetworkDiscovery {
    pub fn new(executor: Arc<dyn ProcessExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl HostDiscovery for NetworkDiscovery {
    async fn ip_by_hostname(&self, hostname: &str) -> Result<String> {
        let addrs: Vec<IpAddr> = tokio::net::lookup_host((hostname, 0))
            .await
            .with_context(|| format!("lookup of {} failed", hostname))?
            .map(|a| a.ip())
            .collect();

        addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .map(|ip| ip.to_string())
            .ok_or_else(|| anyhow!("no address found for {}", hostname))
    }

    async fn mac_by_ip(&self, ip: &str) -> Result<String> {
        // Populate the neighbor table first
        ping(self.executor.as_ref(), ip, 1, 5)
            .await
            .with_context(|| format!("{} did not answer ping", ip))?;

        let output = self
            .executor
            .execute(&["ip", "neighbor", "show", ip], None)
            .await?;

        parse_neighbor_mac(&output)
            .ok_or_else(|| anyhow!("MAC address not found in neighbor table for '{}': {}", ip, output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::executor::testing::{exit_error, FakeExecutor};

    #[tokio::test]
    async fn mac_comes_from_neighbor_table_after_ping() {
        let exec = Arc::new(FakeExecutor::new(|argv| match argv[0].as_str() {
            "ping" => Ok(String::new()),
            "ip" => Ok("10.0.0.9 dev eth0 lladdr de:ad:be:ef:00:01 STALE".into()),
            _ => Err(exit_error()),
        }));
        let discovery = NetworkDiscovery::new(exec.clone());

        assert_eq!(discovery.mac_by_ip("10.0.0.9").await.unwrap(), "DE:AD:BE:EF:00:01");
        let calls = exec.calls.lock();
        assert_eq!(calls[0].0, vec!["ping", "-c", "1", "-W", "5", "10.0.0.9"]);
        assert_eq!(calls[1].0, vec!["ip", "neighbor", "show", "10.0.0.9"]);
    }

    #[tokio::test]
    async fn unreachable_host_has_no_mac() {
        let exec = Arc::new(FakeExecutor::new(|_| Err(exit_error())));
        let discovery = NetworkDiscovery::new(exec.clone());

        assert!(discovery.mac_by_ip("10.0.0.9").await.is_err());
        assert_eq!(exec.calls_to("ip"), 0);
    }

    #[tokio::test]
    async fn resolves_literal_address() {
        let discovery = NetworkDiscovery::new(Arc::new(FakeExecutor::new(|_| Ok(String::new()))));
        assert_eq!(discovery.ip_by_hostname("127.0.0.1").await.unwrap(), "127.0.0.1");
    }
}
