//! Ephemeral onion services through Tor's control port.
//!
//! Each call opens its own control connection. Services are created with
//! `Flags=Detach` so they outlive that connection and are removed with
//! `DEL_ONION`.

use std::net::SocketAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::{RendezvousAddress, RendezvousProvider};
use crate::error::{CommError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TorControlConfig {
    #[serde(default = "default_control_addr")]
    pub control_addr: SocketAddr,

    /// Control port password. Without one, cookie or null auth is negotiated.
    #[serde(default)]
    pub password: Option<String>,

    /// Port exposed on the onion address.
    #[serde(default = "default_virtual_port")]
    pub virtual_port: u16,
}

impl Default for TorControlConfig {
    fn default() -> Self {
        Self {
            control_addr: default_control_addr(),
            password: None,
            virtual_port: default_virtual_port(),
        }
    }
}

fn default_control_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9051))
}

fn default_virtual_port() -> u16 {
    80
}

#[derive(Debug, Clone)]
pub struct TorControlRendezvous {
    config: TorControlConfig,
}

impl TorControlRendezvous {
    pub fn new(config: TorControlConfig) -> Self {
        Self { config }
    }

    async fn open(&self) -> Result<ControlConnection> {
        let stream = TcpStream::connect(self.config.control_addr).await.map_err(|e| {
            CommError::ProviderUnavailable(format!("control port {}: {e}", self.config.control_addr))
        })?;
        let mut conn = ControlConnection {
            stream: BufReader::new(stream),
        };
        conn.authenticate(self.config.password.as_deref()).await?;
        Ok(conn)
    }

    async fn delete_onion(&self, service_id: &str) -> Result<()> {
        let mut conn = self.open().await?;
        conn.command(&format!("DEL_ONION {service_id}")).await?;
        Ok(())
    }
}

#[async_trait]
impl RendezvousProvider for TorControlRendezvous {
    async fn publish(&self, local_endpoint: SocketAddr) -> Result<RendezvousAddress> {
        let mut conn = self.open().await?;
        conn.command("SETEVENTS HS_DESC").await?;

        let reply = conn
            .command(&format!(
                "ADD_ONION NEW:ED25519-V3 Flags=Detach,DiscardPK Port={},{}",
                self.config.virtual_port, local_endpoint
            ))
            .await?;
        let service_id = reply
            .lines
            .iter()
            .find_map(|l| l.strip_prefix("ServiceID="))
            .map(str::to_string)
            .ok_or_else(|| CommError::ProviderUnavailable("ADD_ONION reply has no ServiceID".into()))?;
        debug!(%service_id, "onion service created, awaiting descriptor upload");

        // From here on the detached service must not outlive a failed or
        // abandoned wait.
        let guard = PendingOnion::new(self.clone(), service_id.clone());

        // Events that raced the ADD_ONION reply count too.
        let mut events = reply.events;
        loop {
            for event in &events {
                match descriptor_action(event, &service_id) {
                    Some("UPLOADED") => {
                        guard.disarm();
                        let address = format!("{service_id}.onion:{}", self.config.virtual_port);
                        info!(%address, %local_endpoint, "onion service published");
                        return Ok(RendezvousAddress {
                            address,
                            provider_handle: service_id,
                        });
                    }
                    Some("FAILED") => {
                        return Err(CommError::ProviderUnavailable(format!(
                            "descriptor upload failed: {event}"
                        )));
                    }
                    _ => {}
                }
            }
            events = vec![conn.read_line().await?];
        }
    }

    async fn retract(&self, address: &RendezvousAddress) -> Result<()> {
        self.delete_onion(&address.provider_handle).await?;
        info!(address = %address.address, "onion service removed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tor"
    }
}

/// A created but unconfirmed onion service. Dropping it without
/// [`PendingOnion::disarm`] removes the service in the background, which
/// also covers a publish future cancelled by a timeout.
struct PendingOnion {
    provider: Option<TorControlRendezvous>,
    service_id: String,
}

impl PendingOnion {
    fn new(provider: TorControlRendezvous, service_id: String) -> Self {
        Self {
            provider: Some(provider),
            service_id,
        }
    }

    fn disarm(mut self) {
        self.provider = None;
    }
}

impl Drop for PendingOnion {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        let service_id = std::mem::take(&mut self.service_id);
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%service_id, "no runtime left to remove unpublished onion service");
            return;
        };
        runtime.spawn(async move {
            match provider.delete_onion(&service_id).await {
                Ok(()) => info!(%service_id, "unpublished onion service removed"),
                Err(e) => warn!(%service_id, error = %e, "failed to remove unpublished onion service"),
            }
        });
    }
}

/// The action of a `650 HS_DESC <Action> <ServiceID> ...` event about
/// `service_id`.
fn descriptor_action<'a>(event: &'a str, service_id: &str) -> Option<&'a str> {
    let mut parts = event.split_whitespace();
    if parts.next() != Some("650") || parts.next() != Some("HS_DESC") {
        return None;
    }
    let action = parts.next()?;
    (parts.next() == Some(service_id)).then_some(action)
}

#[derive(Debug, Default)]
struct Reply {
    lines: Vec<String>,
    events: Vec<String>,
}

struct ControlConnection {
    stream: BufReader<TcpStream>,
}

impl ControlConnection {
    async fn authenticate(&mut self, password: Option<&str>) -> Result<()> {
        if let Some(password) = password {
            let escaped = password.replace('\\', "\\\\").replace('"', "\\\"");
            self.command(&format!("AUTHENTICATE \"{escaped}\"")).await?;
            return Ok(());
        }

        let info = self.command("PROTOCOLINFO 1").await?;
        let auth_line = info
            .lines
            .iter()
            .find(|l| l.starts_with("AUTH "))
            .cloned()
            .unwrap_or_default();
        let methods = auth_line
            .split_whitespace()
            .find_map(|t| t.strip_prefix("METHODS="))
            .unwrap_or("");

        if methods.split(',').any(|m| m == "NULL") {
            self.command("AUTHENTICATE").await?;
        } else if methods.split(',').any(|m| m == "COOKIE") {
            let cookie_file = parse_cookie_file(&auth_line).ok_or_else(|| {
                CommError::ProviderUnavailable("cookie auth offered without COOKIEFILE".into())
            })?;
            let cookie = tokio::fs::read(&cookie_file).await.map_err(|e| {
                CommError::ProviderUnavailable(format!("reading {}: {e}", cookie_file.display()))
            })?;
            self.command(&format!("AUTHENTICATE {}", hex::encode(cookie))).await?;
        } else {
            return Err(CommError::ProviderUnavailable(format!(
                "no usable control-port auth method in `{methods}`"
            )));
        }
        Ok(())
    }

    /// Send one command and collect its reply. Asynchronous `650` events seen
    /// while waiting are returned separately.
    async fn command(&mut self, command: &str) -> Result<Reply> {
        let stream = self.stream.get_mut();
        stream.write_all(command.as_bytes()).await?;
        stream.write_all(b"\r\n").await?;
        stream.flush().await?;

        let mut reply = Reply::default();
        loop {
            let line = self.read_line().await?;
            if line.starts_with("650") {
                reply.events.push(line);
                continue;
            }
            let (Some(code), Some(sep), Some(body)) = (line.get(..3), line.get(3..4), line.get(4..)) else {
                return Err(CommError::ProviderUnavailable(format!("short control reply `{line}`")));
            };
            if !code.starts_with('2') {
                let verb = command.split_whitespace().next().unwrap_or(command);
                return Err(CommError::ProviderUnavailable(format!("{verb} failed: {line}")));
            }
            match sep {
                " " => {
                    reply.lines.push(body.to_string());
                    return Ok(reply);
                }
                "+" => {
                    reply.lines.push(body.to_string());
                    loop {
                        let data = self.read_line().await?;
                        if data == "." {
                            break;
                        }
                        reply.lines.push(data);
                    }
                }
                _ => reply.lines.push(body.to_string()),
            }
        }
    }

    async fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.stream.read_line(&mut line).await?;
        if n == 0 {
            return Err(CommError::ProviderUnavailable("control connection closed".into()));
        }
        Ok(line.trim_end_matches(['\r', '\n']).to_string())
    }
}

fn parse_cookie_file(auth_line: &str) -> Option<PathBuf> {
    let start = auth_line.find("COOKIEFILE=\"")? + "COOKIEFILE=\"".len();
    let rest = &auth_line[start..];
    let mut path = String::new();
    let mut chars = rest.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => path.push(chars.next()?),
            '"' => return Some(PathBuf::from(path)),
            other => path.push(other),
        }
    }
    None
}
