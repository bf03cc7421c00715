//! Wake-on-LAN magic packet sender.

use std::net::{Ipv4Addr, SocketAddrV4};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::net::UdpSocket;
use tracing::debug;

use crate::config::types::WolSettings;

#[async_trait]
pub trait WakeSender: Send + Sync {
    /// Fire a magic packet at `mac`. No delivery confirmation exists.
    async fn send_magic_packet(&self, mac: &str) -> Result<()>;
}

pub fn parse_mac(mac: &str) -> Result<[u8; 6]> {
    let hex: String = mac.chars().filter(|c| !matches!(c, ':' | '-' | '.')).collect();
    if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow!("invalid MAC address '{}'", mac));
    }

    let mut out = [0u8; 6];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)?;
    }
    Ok(out)
}

/// 6 x 0xFF followed by the MAC repeated 16 times.
pub fn magic_packet(mac: [u8; 6]) -> [u8; 102] {
    let mut pkt = [0xFFu8; 102];
    for chunk in pkt[6..].chunks_exact_mut(6) {
        chunk.copy_from_slice(&mac);
    }
    pkt
}

/// Broadcasts magic packets over UDP.
pub struct UdpWakeSender {
    broadcast: Ipv4Addr,
    port: u16,
}

impl UdpWakeSender {
    pub fn new(settings: &WolSettings) -> Result<Self> {
        let broadcast = settings
            .broadcast
            .parse::<Ipv4Addr>()
            .with_context(|| format!("invalid broadcast address '{}'", settings.broadcast))?;

        Ok(Self {
            broadcast,
            port: settings.port,
        })
    }
}

#[async_trait]
impl WakeSender for UdpWakeSender {
    async fn send_magic_packet(&self, mac: &str) -> Result<()> {
        let pkt = magic_packet(parse_mac(mac)?);

        let sock = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .context("bind error")?;
        sock.set_broadcast(true).context("cannot enable broadcast")?;

        let addr = SocketAddrV4::new(self.broadcast, self.port);
        sock.send_to(&pkt, addr)
            .await
            .with_context(|| format!("WOL send error to {}", addr))?;

        debug!("Magic packet for {} sent to {}", mac, addr);
        Ok(())
    }
}
