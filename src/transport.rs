use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::error::{CommError, Result};
use crate::relay_protocol::{encode, read_frame, write_frame, ForwardResponse};

pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;

/// Outbound byte-stream connections to `host:port` addresses.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, address: &str) -> Result<BoxStream>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &str) -> Result<BoxStream> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Reaches `.onion` (or any) addresses through a SOCKS5 proxy such as Tor's.
#[cfg(feature = "tor")]
#[derive(Debug, Clone)]
pub struct Socks5Connector {
    proxy: SocketAddr,
}

#[cfg(feature = "tor")]
impl Socks5Connector {
    pub fn new(proxy: SocketAddr) -> Self {
        Self { proxy }
    }
}

#[cfg(feature = "tor")]
#[async_trait]
impl Connector for Socks5Connector {
    async fn connect(&self, address: &str) -> Result<BoxStream> {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (host, port) = split_host_port(address)?;
        if host.len() > 255 {
            return Err(CommError::forwarding(address, "host name too long for SOCKS5"));
        }

        let mut stream = TcpStream::connect(self.proxy).await?;

        // greeting: version 5, one method, no auth
        stream.write_all(&[0x05, 0x01, 0x00]).await?;
        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice != [0x05, 0x00] {
            return Err(CommError::forwarding(address, "SOCKS5 proxy refused no-auth method"));
        }

        // CONNECT with domain-name address type
        let mut request = Vec::with_capacity(7 + host.len());
        request.extend_from_slice(&[0x05, 0x01, 0x00, 0x03, host.len() as u8]);
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        stream.write_all(&request).await?;

        let mut head = [0u8; 4];
        stream.read_exact(&mut head).await?;
        if head[1] != 0x00 {
            return Err(CommError::forwarding(
                address,
                format!("SOCKS5 CONNECT failed with reply {:#04x}", head[1]),
            ));
        }
        let bound_len = match head[3] {
            0x01 => 4,
            0x04 => 16,
            0x03 => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize
            }
            other => {
                return Err(CommError::forwarding(
                    address,
                    format!("SOCKS5 reply has unknown address type {other:#04x}"),
                ))
            }
        };
        let mut bound = vec![0u8; bound_len + 2];
        stream.read_exact(&mut bound).await?;

        Ok(Box::new(stream))
    }
}

pub fn split_host_port(address: &str) -> Result<(&str, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| CommError::forwarding(address, "address has no port"))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| CommError::forwarding(address, "invalid port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok((host, port))
}

/// Bind a listener with SO_REUSEADDR. Port 0 lets the OS choose.
pub fn bind_listener(addr: SocketAddr) -> Result<TcpListener> {
    let bind_err = |source: std::io::Error| CommError::Bind {
        endpoint: addr.to_string(),
        source,
    };
    let domain = if addr.is_ipv4() {
        socket2::Domain::IPV4
    } else {
        socket2::Domain::IPV6
    };
    let socket = socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
        .map_err(bind_err)?;
    socket.set_reuse_address(true).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;
    socket.bind(&addr.into()).map_err(bind_err)?;
    socket.listen(1024).map_err(bind_err)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(bind_err)
}

/// Turns one request frame into one response frame. Never fails: errors are
/// encoded into the response by the implementation.
#[async_trait]
pub trait FrameHandler: Send + Sync + 'static {
    async fn handle_frame(&self, frame: Vec<u8>) -> Vec<u8>;
}

/// A running accept loop.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled() && !self.task.is_finished()
    }

    /// Close the listener and drop open connections.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            warn!(error = %e, "server task ended abnormally");
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Accept connections until shut down, serving each on its own task.
pub fn spawn_server(listener: TcpListener, handler: Arc<dyn FrameHandler>, name: &str) -> Result<ServerHandle> {
    let local_addr = listener.local_addr()?;
    let cancel = CancellationToken::new();
    let accept_cancel = cancel.clone();
    let name = name.to_string();

    let task = tokio::spawn(
        async move {
            info!(listen = %local_addr, "accepting connections");
            loop {
                tokio::select! {
                    biased;
                    _ = accept_cancel.cancelled() => {
                        debug!("listener closed");
                        return;
                    }
                    accepted = listener.accept() => {
                        let (stream, peer) = match accepted {
                            Ok(pair) => pair,
                            Err(e) => {
                                warn!(error = %e, "accept failed");
                                continue;
                            }
                        };
                        let handler = handler.clone();
                        let conn_cancel = accept_cancel.child_token();
                        tokio::spawn(
                            async move {
                                if let Err(e) = serve_connection(stream, handler, conn_cancel).await {
                                    debug!(error = %e, "connection error");
                                }
                            }
                            .instrument(info_span!("conn", peer = %peer)),
                        );
                    }
                }
            }
        }
        .instrument(info_span!("server", name = %name)),
    );

    Ok(ServerHandle {
        local_addr,
        cancel,
        task,
    })
}

async fn serve_connection(mut stream: TcpStream, handler: Arc<dyn FrameHandler>, cancel: CancellationToken) -> Result<()> {
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            frame = read_frame(&mut stream) => frame,
        };
        let frame = match frame {
            Ok(Some(frame)) => frame,
            Ok(None) => return Ok(()),
            Err(e @ CommError::MalformedEnvelope(_)) => {
                // The stream is out of sync; answer once, then close.
                if let Ok(reply) = encode(&ForwardResponse::error(e.to_string())) {
                    let _ = write_frame(&mut stream, &reply).await;
                }
                return Err(e);
            }
            Err(e) => return Err(e),
        };
        let response = handler.handle_frame(frame).await;
        write_frame(&mut stream, &response).await?;
    }
}

/// Connect, send one request frame and wait for its response frame.
///
/// Connection establishment and the response wait are bounded separately.
pub async fn exchange(
    connector: &dyn Connector,
    address: &str,
    request: &[u8],
    connect_timeout: Duration,
    response_timeout: Duration,
) -> Result<Vec<u8>> {
    let mut stream = tokio::time::timeout(connect_timeout, connector.connect(address))
        .await
        .map_err(|_| CommError::forwarding(address, "connect timed out"))?
        .map_err(|e| CommError::forwarding(address, e))?;

    let round_trip = async {
        write_frame(&mut stream, request).await?;
        read_frame(&mut stream)
            .await?
            .ok_or_else(|| CommError::forwarding(address, "connection closed before response"))
    };
    tokio::time::timeout(response_timeout, round_trip)
        .await
        .map_err(|_| CommError::forwarding(address, "response timed out"))?
        .map_err(|e| match e {
            e @ CommError::ForwardingFailure { .. } => e,
            other => CommError::forwarding(address, other),
        })
}
