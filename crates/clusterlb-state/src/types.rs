//! Record types for the topology store.
//!
//! These mirror the fixed-layout records of the shared tables. All types
//! are serializable so the store image can be persisted.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::live::StatsHandle;
use crate::slots::SlotId;

// ── Node ──────────────────────────────────────────────────────────

/// Protocol spoken to a backend node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeType {
    #[default]
    Ajp,
    Http,
    Https,
    Ws,
    Wss,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Ajp => "ajp",
            NodeType::Http => "http",
            NodeType::Https => "https",
            NodeType::Ws => "ws",
            NodeType::Wss => "wss",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ajp" => Ok(NodeType::Ajp),
            "http" => Ok(NodeType::Http),
            "https" => Ok(NodeType::Https),
            "ws" => Ok(NodeType::Ws),
            "wss" => Ok(NodeType::Wss),
            other => Err(format!("unknown node type \"{other}\"")),
        }
    }
}

/// Packet flushing policy towards the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushPackets {
    #[default]
    Off,
    On,
    Auto,
}

impl FlushPackets {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushPackets::Off => "Off",
            FlushPackets::On => "On",
            FlushPackets::Auto => "Auto",
        }
    }
}

/// A registered backend endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: SlotId,
    /// Slot generation at insert time; pairs with `id` to address the
    /// node's live-status block.
    pub generation: u64,
    pub balancer: String,
    /// JVMRoute, the node's logical name.
    pub route: String,
    /// Load-balancing group.
    pub domain: String,
    pub host: String,
    pub port: u16,
    pub node_type: NodeType,
    pub upgrade: String,
    pub ajp_secret: String,
    pub reversed: bool,
    /// Soft-delete marker.
    pub remove: bool,
    pub flush_packets: FlushPackets,
    pub flush_wait_ms: u32,
    pub ping_secs: u32,
    pub smax: i32,
    pub ttl_secs: u32,
    pub timeout_secs: u32,
    /// Last insert / update / removal mark (epoch millis).
    pub updated_at: u64,
    /// Last lbstatus recompute (epoch millis).
    pub updated_lb_at: u64,
    pub old_elected: u64,
    pub old_read: u64,
    pub num_failure_idle: u32,
    pub last_clean_try: u64,
    pub num_remove_check: u32,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            id: 0,
            generation: 0,
            balancer: String::new(),
            route: String::new(),
            domain: String::new(),
            host: "localhost".to_string(),
            port: 8009,
            node_type: NodeType::Ajp,
            upgrade: String::new(),
            ajp_secret: String::new(),
            reversed: false,
            remove: false,
            flush_packets: FlushPackets::Off,
            flush_wait_ms: 10,
            ping_secs: 10,
            smax: -1,
            ttl_secs: 60,
            timeout_secs: 0,
            updated_at: 0,
            updated_lb_at: 0,
            old_elected: 0,
            old_read: 0,
            num_failure_idle: 0,
            last_clean_try: 0,
            num_remove_check: 0,
        }
    }
}

impl Node {
    /// Address of this node's live-status block.
    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            id: self.id,
            generation: self.generation,
        }
    }

    /// Whether `other` describes the same physical connection: same
    /// host, port, protocol, direction and pool sizing.
    pub fn same_connection(&self, other: &Node) -> bool {
        self.host.eq_ignore_ascii_case(&other.host)
            && self.port == other.port
            && self.node_type == other.node_type
            && self.reversed == other.reversed
            && self.smax == other.smax
            && self.ttl_secs == other.ttl_secs
    }

    /// `scheme://host:port` of the dispatch worker for this node.
    pub fn worker_url(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("{}://[{}]:{}", self.node_type, self.host, self.port)
        } else {
            format!("{}://{}:{}", self.node_type, self.host, self.port)
        }
    }
}

// ── Host ──────────────────────────────────────────────────────────

/// One virtual-host alias bound to a node's vhost group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: SlotId,
    pub alias: String,
    pub vhost: u32,
    pub node: SlotId,
    pub updated_at: u64,
}

// ── Context ───────────────────────────────────────────────────────

/// Lifecycle state of a deployed context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextStatus {
    Enabled,
    Disabled,
    #[default]
    Stopped,
}

impl ContextStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextStatus::Enabled => "ENABLED",
            ContextStatus::Disabled => "DISABLED",
            ContextStatus::Stopped => "STOPPED",
        }
    }

    /// Numeric code used in DUMP output.
    pub fn code(&self) -> u8 {
        match self {
            ContextStatus::Enabled => 1,
            ContextStatus::Disabled => 2,
            ContextStatus::Stopped => 3,
        }
    }
}

/// A deployed web application path on a node's vhost group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Context {
    pub id: SlotId,
    pub path: String,
    pub vhost: u32,
    pub node: SlotId,
    pub status: ContextStatus,
    /// In-flight requests, owned by the dispatch path.
    pub nbrequests: i32,
    pub updated_at: u64,
}

// ── Balancer ──────────────────────────────────────────────────────

/// Named load-balancing policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balancer {
    pub id: SlotId,
    pub name: String,
    pub sticky: bool,
    pub sticky_cookie: String,
    pub sticky_path: String,
    pub sticky_remove: bool,
    pub sticky_force: bool,
    /// Seconds to wait for a worker to free up (`WaitWorker`).
    pub timeout_secs: u32,
    pub max_attempts: u32,
    pub updated_at: u64,
}

impl Default for Balancer {
    fn default() -> Self {
        Self {
            id: 0,
            name: String::new(),
            sticky: true,
            sticky_cookie: "JSESSIONID".to_string(),
            sticky_path: "jsessionid".to_string(),
            sticky_remove: false,
            sticky_force: true,
            timeout_secs: 0,
            max_attempts: 1,
            updated_at: 0,
        }
    }
}

impl Balancer {
    /// Whether two records carry the same policy, ignoring identity and
    /// timestamps.
    pub fn same_policy(&self, other: &Balancer) -> bool {
        self.name == other.name
            && self.sticky == other.sticky
            && self.sticky_cookie == other.sticky_cookie
            && self.sticky_path == other.sticky_path
            && self.sticky_remove == other.sticky_remove
            && self.sticky_force == other.sticky_force
            && self.timeout_secs == other.timeout_secs
            && self.max_attempts == other.max_attempts
    }
}

// ── Domain ────────────────────────────────────────────────────────

/// Last known domain of a `(route, balancer)` pair.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Domain {
    pub id: SlotId,
    pub domain: String,
    pub route: String,
    pub balancer: String,
    pub updated_at: u64,
}

// ── SessionId ─────────────────────────────────────────────────────

/// A live session and the route that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SlotId,
    pub session_id: String,
    pub route: String,
    pub updated_at: u64,
}
