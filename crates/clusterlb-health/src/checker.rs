//! Probe logic.
//!
//! Each probe answers one question: is the node reachable in its own
//! protocol within the timeout. [`HealthTracker`] turns a stream of
//! probe results into a status with exponential backoff.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use clusterlb_state::{Node, NodeType};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// AJP13 CPING packet sent to the container.
pub const CPING: [u8; 5] = [0x12, 0x34, 0x00, 0x01, 0x0A];
/// Expected AJP13 CPONG reply.
pub const CPONG: [u8; 5] = [0x41, 0x42, 0x00, 0x01, 0x09];

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of a single probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    /// The node answered in protocol.
    Healthy,
    /// The node answered, but not with what was expected.
    Unhealthy,
    /// The probe could not be executed (connect error, timeout).
    Failed,
}

impl ProbeResult {
    pub fn is_healthy(&self) -> bool {
        *self == ProbeResult::Healthy
    }
}

impl From<Result<(), ProbeError>> for ProbeResult {
    fn from(result: Result<(), ProbeError>) -> Self {
        match result {
            Ok(()) => ProbeResult::Healthy,
            Err(ProbeError::Protocol(_)) => ProbeResult::Unhealthy,
            Err(_) => ProbeResult::Failed,
        }
    }
}

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("connect failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected reply: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(String),
}

/// Where and how to probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub node_type: NodeType,
    pub host: String,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(node_type: NodeType, host: impl Into<String>, port: u16) -> Self {
        Self {
            node_type,
            host: host.into(),
            port,
        }
    }

    pub fn from_node(node: &Node) -> Self {
        Self::new(node.node_type, node.host.clone(), node.port)
    }

    /// `host:port`, with IPv6 literals bracketed.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Reachability check used by the control plane and the watchdog.
pub trait NodeProbe: Send + Sync + 'static {
    fn probe<'a>(&'a self, target: &'a ProbeTarget, timeout: Duration) -> BoxFuture<'a, ProbeResult>;
}

/// Probes over the network.
#[derive(Debug, Clone, Copy, Default)]
pub struct LiveProbe;

impl NodeProbe for LiveProbe {
    fn probe<'a>(&'a self, target: &'a ProbeTarget, timeout: Duration) -> BoxFuture<'a, ProbeResult> {
        Box::pin(probe(target, timeout))
    }
}

/// Probe `target` in its protocol.
pub async fn probe(target: &ProbeTarget, timeout: Duration) -> ProbeResult {
    let address = target.address();
    let result = match target.node_type {
        NodeType::Ajp => cping_probe(&address, timeout).await,
        NodeType::Http => http_probe(&address, timeout).await,
        NodeType::Https | NodeType::Ws | NodeType::Wss => tcp_probe(&address, timeout).await,
    };
    if let Err(e) = &result {
        debug!(%address, node_type = %target.node_type, error = %e, "probe failed");
    }
    result.into()
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ProbeError>>,
) -> Result<T, ProbeError> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ProbeError::Timeout(timeout))?
}

/// Send an AJP CPING and wait for the CPONG.
pub async fn cping_probe(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    with_timeout(timeout, async {
        let mut stream = TcpStream::connect(address).await?;
        stream.write_all(&CPING).await?;
        let mut reply = [0u8; 5];
        stream.read_exact(&mut reply).await?;
        if reply == CPONG {
            Ok(())
        } else {
            Err(ProbeError::Protocol(format!("expected CPONG, got {reply:02x?}")))
        }
    })
    .await
}

/// Send `OPTIONS *` and accept any non-5xx answer.
pub async fn http_probe(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    with_timeout(timeout, async {
        let stream = TcpStream::connect(address).await?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        // Drive the connection in the background.
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method(http::Method::OPTIONS)
            .uri("*")
            .header("host", address)
            .header("user-agent", "clusterlb-health/0.1")
            .body(http_body_util::Empty::<bytes::Bytes>::new())
            .map_err(|e| ProbeError::Http(e.to_string()))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| ProbeError::Http(e.to_string()))?;
        if resp.status().is_server_error() {
            Err(ProbeError::Protocol(format!("status {}", resp.status())))
        } else {
            Ok(())
        }
    })
    .await
}

/// Plain TCP connect.
pub async fn tcp_probe(address: &str, timeout: Duration) -> Result<(), ProbeError> {
    with_timeout(timeout, async {
        TcpStream::connect(address).await?;
        Ok::<(), ProbeError>(())
    })
    .await
}

// ── Tracker ───────────────────────────────────────────────────────

/// Health as seen by a tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Unhealthy,
}

/// Tracks consecutive probe results for a single worker.
#[derive(Debug)]
pub struct HealthTracker {
    status: HealthStatus,
    consecutive_failures: u32,
    /// Failures before marking unhealthy.
    unhealthy_threshold: u32,
    current_backoff: Duration,
    base_interval: Duration,
    max_backoff: Duration,
}

impl HealthTracker {
    pub fn new(unhealthy_threshold: u32, interval: Duration) -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            unhealthy_threshold: unhealthy_threshold.max(1),
            current_backoff: interval,
            base_interval: interval,
            max_backoff: Duration::from_secs(60).max(interval),
        }
    }

    /// Record a probe result and return the new status.
    pub fn record(&mut self, result: ProbeResult) -> HealthStatus {
        if result.is_healthy() {
            self.consecutive_failures = 0;
            self.current_backoff = self.base_interval;
            self.status = HealthStatus::Healthy;
            return self.status;
        }

        self.consecutive_failures += 1;
        self.current_backoff = (self.current_backoff * 2).min(self.max_backoff);
        if self.consecutive_failures >= self.unhealthy_threshold {
            if self.status != HealthStatus::Unhealthy {
                warn!(
                    failures = self.consecutive_failures,
                    threshold = self.unhealthy_threshold,
                    "worker marked unhealthy"
                );
            }
            self.status = HealthStatus::Unhealthy;
        }
        self.status
    }

    pub fn status(&self) -> HealthStatus {
        self.status
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Delay before the next probe.
    pub fn next_interval(&self) -> Duration {
        self.current_backoff
    }
}
