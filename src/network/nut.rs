//! NUT (Network UPS Tools) client.
//!
//! One lazily opened TCP session per controller. Transport faults tear the session
//! down so the next call reconnects from scratch; timeouts leave it in place because
//! a slow UPS is not a broken link. Only an explicit `ERR` line or a framing
//! violation reaches the caller as an error.

use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NutError {
    /// The server answered `ERR <message>`
    #[error("{0}")]
    Remote(String),
    #[error("unexpected response from UPS: {0}")]
    Framing(String),
}

/// Why a single exchange failed. Never leaves this module.
#[derive(Debug)]
enum Fault {
    Timeout,
    Transport(std::io::Error),
    Decode(std::string::FromUtf8Error),
    Eof,
    Protocol(NutError),
}

#[derive(Debug, Clone, Copy)]
pub struct NutTimeouts {
    pub connect: Duration,
    pub write: Duration,
    pub read: Duration,
}

impl Default for NutTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(2),
            write: Duration::from_secs(2),
            read: Duration::from_secs(2),
        }
    }
}

/// Variables reported by `LIST VAR <ups>`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpsVariables {
    pub raw: HashMap<String, String>,
    /// `ups.status` split into flags, e.g. `["OL", "CHRG"]`
    pub status: Vec<String>,
    pub battery_charge: f64,
    pub battery_voltage: f64,
    pub battery_voltage_high: f64,
    pub battery_voltage_low: f64,
    pub input_voltage: f64,
    pub output_voltage: f64,
}

impl UpsVariables {
    pub fn from_raw(raw: HashMap<String, String>) -> Self {
        let number = |key: &str| -> f64 {
            raw.get(key)
                .and_then(|v| v.trim().parse::<f64>().ok())
                .unwrap_or(0.0)
        };

        Self {
            status: raw
                .get("ups.status")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            battery_charge: number("battery.charge"),
            battery_voltage: number("battery.voltage"),
            battery_voltage_high: number("battery.voltage.high"),
            battery_voltage_low: number("battery.voltage.low"),
            input_voltage: number("input.voltage"),
            output_voltage: number("output.voltage"),
            raw,
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.raw.get(key).map(String::as_str)
    }
}

/// Source of UPS variables, implemented by [`NutClient`] and by test doubles.
#[async_trait]
pub trait UpsVariableSource: Send {
    async fn get_variables(&mut self, ups_id: &str) -> Result<Option<UpsVariables>, NutError>;

    /// Close the session if any. Safe to call repeatedly.
    async fn disconnect(&mut self);
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

pub struct NutClient {
    host: String,
    port: u16,
    timeouts: NutTimeouts,
    session: Option<Session>,
}

impl NutClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self::with_timeouts(host, port, NutTimeouts::default())
    }

    pub fn with_timeouts(host: impl Into<String>, port: u16, timeouts: NutTimeouts) -> Self {
        Self {
            host: host.into(),
            port,
            timeouts,
            session: None,
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    async fn ensure_connected(&mut self) -> bool {
        if self.session.is_some() {
            return true;
        }

        let connect = TcpStream::connect((self.host.as_str(), self.port));
        match timeout(self.timeouts.connect, connect).await {
            Ok(Ok(stream)) => {
                let (read, write) = stream.into_split();
                self.session = Some(Session {
                    reader: BufReader::new(read),
                    writer: write,
                });
                info!("UPS connection at {}:{} established", self.host, self.port);
                true
            }
            Ok(Err(e)) => {
                error!("UPS {}:{}: Failed to connect: {}", self.host, self.port, e);
                false
            }
            Err(_) => {
                error!("UPS {}:{}: Connection timeout", self.host, self.port);
                false
            }
        }
    }

    /// Send one command and collect the payload between `BEGIN <cmd>` and `END <cmd>`.
    /// Returns `Ok(None)` when no data could be obtained.
    pub async fn communicate(&mut self, command: &str) -> Result<Option<String>, NutError> {
        if !self.ensure_connected().await {
            return Ok(None);
        }

        debug!("UPS {}:{} sending command: {}", self.host, self.port, command);

        match self.exchange(command).await {
            Ok(payload) => Ok(Some(payload)),
            Err(Fault::Protocol(e)) => {
                if matches!(e, NutError::Framing(_)) {
                    // Leftover lines would desync the next exchange
                    self.close().await;
                }
                Err(e)
            }
            Err(Fault::Timeout) => {
                warn!("UPS {}:{}: Timeout during polling", self.host, self.port);
                Ok(None)
            }
            Err(Fault::Transport(e)) => {
                warn!("UPS {}:{}: Connection error during poll: {}", self.host, self.port, e);
                self.close().await;
                Ok(None)
            }
            Err(Fault::Decode(e)) => {
                error!("UPS {}:{}: Invalid response encoding: {}", self.host, self.port, e);
                self.close().await;
                Ok(None)
            }
            Err(Fault::Eof) => {
                error!("UPS {}:{}: Connection closed by peer during poll", self.host, self.port);
                self.close().await;
                Ok(None)
            }
        }
    }

    async fn exchange(&mut self, command: &str) -> Result<String, Fault> {
        let timeouts = self.timeouts;
        let session = self.session.as_mut().ok_or(Fault::Eof)?;

        let line = format!("{}\n", command);
        let write = async {
            session.writer.write_all(line.as_bytes()).await?;
            session.writer.flush().await
        };
        timeout(timeouts.write, write)
            .await
            .map_err(|_| Fault::Timeout)?
            .map_err(Fault::Transport)?;

        let first = read_line(&mut session.reader, timeouts.read).await?;

        if let Some(message) = first.strip_prefix("ERR ") {
            return Err(Fault::Protocol(NutError::Remote(message.trim().to_string())));
        }
        if first != format!("BEGIN {}", command) {
            return Err(Fault::Protocol(NutError::Framing(first)));
        }

        let end = format!("END {}", command);
        let mut payload = String::new();
        loop {
            let line = read_line(&mut session.reader, timeouts.read).await?;
            if line == end {
                break;
            }
            payload.push_str(&line);
            payload.push('\n');
        }

        Ok(payload.trim_end().to_string())
    }

    /// `LIST VAR <ups_id>` parsed into [`UpsVariables`].
    pub async fn list_vars(&mut self, ups_id: &str) -> Result<Option<UpsVariables>, NutError> {
        let Some(data) = self.communicate(&format!("LIST VAR {}", ups_id)).await? else {
            warn!("No data received for UPS ID {}", ups_id);
            return Ok(None);
        };

        Ok(Some(UpsVariables::from_raw(parse_var_list(&data, ups_id))))
    }

    pub async fn close(&mut self) {
        let Some(mut session) = self.session.take() else {
            debug!("UPS {}:{}: no open connection to close", self.host, self.port);
            return;
        };

        if let Err(e) = timeout(Duration::from_secs(2), session.writer.shutdown()).await.unwrap_or(Ok(())) {
            debug!("Error during disconnect cleanup: {}", e);
        }

        info!("Closed UPS connection at {}:{}", self.host, self.port);
    }
}

#[async_trait]
impl UpsVariableSource for NutClient {
    async fn get_variables(&mut self, ups_id: &str) -> Result<Option<UpsVariables>, NutError> {
        self.list_vars(ups_id).await
    }

    async fn disconnect(&mut self) {
        self.close().await;
    }
}

async fn read_line(reader: &mut BufReader<OwnedReadHalf>, limit: Duration) -> Result<String, Fault> {
    let mut buf = Vec::new();
    let n = timeout(limit, reader.read_until(b'\n', &mut buf))
        .await
        .map_err(|_| Fault::Timeout)?
        .map_err(Fault::Transport)?;

    if n == 0 {
        return Err(Fault::Eof);
    }

    let line = String::from_utf8(buf).map_err(Fault::Decode)?;
    Ok(line.trim().to_string())
}

fn var_regex() -> &'static Regex {
    static VAR: OnceLock<Regex> = OnceLock::new();
    VAR.get_or_init(|| Regex::new(r#"^VAR (\S+) (\S+) "(.*)"$"#).expect("static VAR pattern"))
}

/// Collect `VAR <ups_id> <key> "<value>"` lines into a key/value map.
pub fn parse_var_list(payload: &str, ups_id: &str) -> HashMap<String, String> {
    payload
        .lines()
        .filter_map(|line| {
            let caps = var_regex().captures(line.trim())?;
            if &caps[1] != ups_id {
                return None;
            }
            Some((caps[2].to_string(), unescape(&caps[3])))
        })
        .collect()
}

/// Undo NUT's backslash escaping of `"` and `\` inside quoted values.
fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                out.push(next);
                continue;
            }
        }
        out.push(c);
    }
    out
}
