use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;

use crate::error::{CommError, Result};
use crate::relay_protocol::write_frame;
use crate::transport::Connector;

/// Where a tail hop hands its processed output.
#[async_trait]
pub trait FinalSink: Send + Sync {
    async fn deliver(&self, destination: &str, data: &[u8]) -> Result<()>;
}

/// Records the delivery in the log and drops the data.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl FinalSink for LogSink {
    async fn deliver(&self, destination: &str, data: &[u8]) -> Result<()> {
        info!(destination, bytes = data.len(), "final delivery");
        Ok(())
    }
}

/// Writes the processed bytes as one frame to `destination`.
pub struct ConnectorSink {
    connector: Arc<dyn Connector>,
    timeout: Duration,
}

impl ConnectorSink {
    pub fn new(connector: Arc<dyn Connector>, timeout: Duration) -> Self {
        Self { connector, timeout }
    }
}

#[async_trait]
impl FinalSink for ConnectorSink {
    async fn deliver(&self, destination: &str, data: &[u8]) -> Result<()> {
        let send = async {
            let mut stream = self.connector.connect(destination).await?;
            write_frame(&mut stream, data).await
        };
        tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| CommError::forwarding(destination, "delivery timed out"))?
    }
}

/// Keeps every delivery in memory.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    deliveries: Arc<Mutex<Vec<(String, Vec<u8>)>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deliveries(&self) -> Vec<(String, Vec<u8>)> {
        self.deliveries.lock().await.clone()
    }
}

#[async_trait]
impl FinalSink for MemorySink {
    async fn deliver(&self, destination: &str, data: &[u8]) -> Result<()> {
        self.deliveries
            .lock()
            .await
            .push((destination.to_string(), data.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay_protocol::read_frame;
    use crate::transport::{bind_listener, TcpConnector};

    #[tokio::test]
    async fn connector_sink_writes_one_frame() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let destination = listener.local_addr().unwrap().to_string();
        let receiver = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            read_frame(&mut stream).await.unwrap()
        });

        let sink = ConnectorSink::new(Arc::new(TcpConnector), Duration::from_secs(2));
        sink.deliver(&destination, b"processed").await.unwrap();
        assert_eq!(receiver.await.unwrap().as_deref(), Some(&b"processed"[..]));
    }

    #[tokio::test]
    async fn connector_sink_reports_unreachable_destination() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap()).unwrap();
        let destination = listener.local_addr().unwrap().to_string();
        drop(listener);

        let sink = ConnectorSink::new(Arc::new(TcpConnector), Duration::from_secs(2));
        assert!(sink.deliver(&destination, b"x").await.is_err());
    }

    #[tokio::test]
    async fn memory_sink_keeps_order() {
        let sink = MemorySink::new();
        sink.deliver("a:1", b"one").await.unwrap();
        sink.deliver("b:2", b"two").await.unwrap();
        let deliveries = sink.deliveries().await;
        assert_eq!(deliveries[0], ("a:1".to_string(), b"one".to_vec()));
        assert_eq!(deliveries[1].0, "b:2");
    }
}
