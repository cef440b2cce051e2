//! Buffered statsd gauge clients
//!
//! One client exists per distinct buffering interval. Gauges are queued as
//! `<key>:<value>|g` lines and flushed over UDP every interval, packed into
//! datagrams no larger than [`MAX_PACKET_SIZE`].

use crate::error::{AgentError, Result};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const MAX_PACKET_SIZE: usize = 1432;

pub struct StatsdClient {
    socket: UdpSocket,
    address: String,
    interval: Duration,
    buffer: Mutex<Vec<String>>,
}

impl StatsdClient {
    /// Bind a local UDP socket sending to `address`. Must be called within a tokio runtime.
    pub fn connect(address: &str, interval: Duration) -> Result<Self> {
        let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: UdpSocket::from_std(socket)?,
            address: address.to_string(),
            interval,
            buffer: Mutex::new(Vec::new()),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Queue an absolute gauge value
    pub fn gauge(&self, key: &str, value: f64) {
        let line = format!("{}:{}|g", key, value);
        self.lock_buffer().push(line);
    }

    pub fn pending(&self) -> usize {
        self.lock_buffer().len()
    }

    /// Send everything queued so far, returning the number of lines sent
    pub async fn flush(&self) -> Result<usize> {
        let lines = std::mem::take(&mut *self.lock_buffer());
        if lines.is_empty() {
            return Ok(0);
        }

        for packet in pack(&lines) {
            self.socket
                .send_to(packet.as_bytes(), self.address.as_str())
                .await
                .map_err(|e| AgentError::transport(format!("statsd {}: {}", self.address, e)))?;
        }
        debug!(address = %self.address, lines = lines.len(), "Flushed statsd gauges");
        Ok(lines.len())
    }

    fn lock_buffer(&self) -> std::sync::MutexGuard<'_, Vec<String>> {
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush_forever(self: Arc<Self>, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Failed to flush statsd gauges");
                    }
                }
                _ = shutdown.cancelled() => {
                    if let Err(e) = self.flush().await {
                        warn!(error = %e, "Failed to flush statsd gauges on shutdown");
                    }
                    break;
                }
            }
        }
    }
}

/// Join lines with `\n` into packets of at most `MAX_PACKET_SIZE` bytes
fn pack(lines: &[String]) -> Vec<String> {
    let mut packets = Vec::new();
    let mut current = String::new();
    for line in lines {
        if !current.is_empty() && current.len() + 1 + line.len() > MAX_PACKET_SIZE {
            packets.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push('\n');
        }
        current.push_str(line);
    }
    if !current.is_empty() {
        packets.push(current);
    }
    packets
}

/// Shared clients keyed by buffering interval
pub struct StatsdRegistry {
    clients: DashMap<Duration, Arc<StatsdClient>>,
    shutdown: CancellationToken,
}

impl StatsdRegistry {
    pub fn new(shutdown: CancellationToken) -> Self {
        Self {
            clients: DashMap::new(),
            shutdown,
        }
    }

    /// Client for `interval`, created on first use.
    ///
    /// The first caller's `address` wins for that interval. When created inside
    /// a runtime, the client gets a background flush loop tied to the registry's
    /// shutdown token.
    pub fn client(&self, interval: Duration, address: &str) -> Result<Arc<StatsdClient>> {
        if interval.is_zero() {
            return Err(AgentError::config("statsd buffer interval must be non-zero"));
        }
        match self.clients.entry(interval) {
            Entry::Occupied(entry) => Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let client = Arc::new(StatsdClient::connect(address, interval)?);
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(Arc::clone(&client).flush_forever(self.shutdown.child_token()));
                }
                debug!(address, interval = ?interval, "Created statsd client");
                entry.insert(Arc::clone(&client));
                Ok(client)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for StatsdRegistry {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_respects_packet_size() {
        let lines: Vec<String> = (0..200).map(|i| format!("host.metric{}:{}|g", i, i)).collect();
        let packets = pack(&lines);
        assert!(packets.len() > 1);
        assert!(packets.iter().all(|p| p.len() <= MAX_PACKET_SIZE));
        assert_eq!(packets.join("\n").lines().count(), 200);
    }

    #[tokio::test]
    async fn test_registry_shares_client_per_interval() {
        let registry = StatsdRegistry::default();
        let a = registry.client(Duration::from_secs(1), "127.0.0.1:8125").unwrap();
        let b = registry.client(Duration::from_secs(1), "127.0.0.1:9999").unwrap();
        let c = registry.client(Duration::from_secs(5), "127.0.0.1:8125").unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(b.address(), "127.0.0.1:8125");
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_flush_sends_gauges() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = receiver.local_addr().unwrap().to_string();

        let client = StatsdClient::connect(&address, Duration::from_secs(60)).unwrap();
        client.gauge("web1.LoadAvg1m", 0.5);
        client.gauge("web1.Count", 3.0);
        assert_eq!(client.pending(), 2);
        assert_eq!(client.flush().await.unwrap(), 2);
        assert_eq!(client.pending(), 0);

        let mut buf = [0u8; 2048];
        let n = receiver.recv(&mut buf).await.unwrap();
        assert_eq!(
            std::str::from_utf8(&buf[..n]).unwrap(),
            "web1.LoadAvg1m:0.5|g\nweb1.Count:3|g"
        );
    }
}
