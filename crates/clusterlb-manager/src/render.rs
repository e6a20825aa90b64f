//! DUMP, INFO and VERSION bodies.
//!
//! DUMP prints the raw records of a topology snapshot. INFO prints the
//! live nodes with their worker counters and the hosts and contexts
//! bound to them. Both come in plain text and XML.

use std::fmt::{Display, Write};
use std::sync::atomic::Ordering;

use clusterlb_state::{ClusterStore, LiveStatus, Node, StatsHandle, Topology};

use crate::engine::{Format, Reply};

/// Control protocol revision implemented by the engine.
pub const PROTOCOL_VERSION: &str = "0.2.1";

const XML_HEADER: &str = "<?xml version=\"1.0\" standalone=\"yes\" ?>";

pub fn release() -> String {
    format!("clusterlb/{}", env!("CARGO_PKG_VERSION"))
}

pub fn version(format: Format) -> Reply {
    let body = match format {
        Format::Text => format!("release: {}, protocol: {PROTOCOL_VERSION}", release()),
        Format::Xml => {
            let mut out = String::from(XML_HEADER);
            out.push_str("<version>");
            element(&mut out, "release", release());
            element(&mut out, "protocol", PROTOCOL_VERSION);
            out.push_str("</version>");
            out
        }
    };
    Reply::new(format, body)
}

// ── DUMP ──────────────────────────────────────────────────────────

pub fn dump(topology: &Topology, format: Format) -> Reply {
    let body = match format {
        Format::Text => dump_text(topology),
        Format::Xml => dump_xml(topology),
    };
    Reply::new(format, body)
}

fn dump_text(topology: &Topology) -> String {
    let mut out = String::new();
    for b in topology.balancers.iter() {
        let _ = writeln!(
            out,
            "balancer: [{}] Name: {} Sticky: {} [{}]/[{}] remove: {} force: {} Timeout: {} maxAttempts: {}",
            b.id,
            b.name,
            flag(b.sticky),
            b.sticky_cookie,
            b.sticky_path,
            flag(b.sticky_remove),
            flag(b.sticky_force),
            b.timeout_secs,
            b.max_attempts
        );
    }
    for (n, _) in topology.nodes.iter() {
        let _ = writeln!(
            out,
            "node: [{}:{}],Balancer: {},JVMRoute: {},LBGroup: [{}],Host: {},Port: {},Type: {},flushpackets: {},flushwait: {},ping: {},smax: {},ttl: {},timeout: {},remove: {}",
            n.id,
            n.generation,
            n.balancer,
            n.route,
            n.domain,
            n.host,
            n.port,
            n.node_type,
            n.flush_packets.as_str(),
            n.flush_wait_ms,
            n.ping_secs,
            n.smax,
            n.ttl_secs,
            n.timeout_secs,
            flag(n.remove)
        );
    }
    for h in topology.hosts.iter() {
        let _ = writeln!(
            out,
            "host: {} [{}] vhost: {} node: {}",
            h.id, h.alias, h.vhost, h.node
        );
    }
    for c in topology.contexts.iter() {
        let _ = writeln!(
            out,
            "context: {} [{}] vhost: {} node: {} status: {}",
            c.id,
            c.path,
            c.vhost,
            c.node,
            c.status.code()
        );
    }
    out
}

fn dump_xml(topology: &Topology) -> String {
    let mut out = String::from(XML_HEADER);
    out.push_str("<Dump><Balancers>");
    for b in topology.balancers.iter() {
        let _ = write!(out, "<Balancer id=\"{}\">", b.id);
        element(&mut out, "Name", &b.name);
        element(&mut out, "StickySession", flag(b.sticky));
        element(&mut out, "StickySessionCookie", &b.sticky_cookie);
        element(&mut out, "StickySessionPath", &b.sticky_path);
        element(&mut out, "StickySessionRemove", flag(b.sticky_remove));
        element(&mut out, "StickySessionForce", flag(b.sticky_force));
        element(&mut out, "Timeout", b.timeout_secs);
        element(&mut out, "Maxattempts", b.max_attempts);
        out.push_str("</Balancer>");
    }
    out.push_str("</Balancers><Nodes>");
    for (n, _) in topology.nodes.iter() {
        let _ = write!(out, "<Node id=\"{}\">", n.id);
        node_fields(&mut out, n);
        element(&mut out, "Remove", flag(n.remove));
        out.push_str("</Node>");
    }
    out.push_str("</Nodes>");
    hosts_contexts_xml(&mut out, topology, |_| true);
    out.push_str("</Dump>");
    out
}

// ── INFO ──────────────────────────────────────────────────────────

pub fn info(store: &ClusterStore, format: Format) -> Reply {
    let topology = Topology::build(store);
    let body = match format {
        Format::Text => info_text(store, &topology),
        Format::Xml => info_xml(store, &topology),
    };
    Reply::new(format, body)
}

/// Live counters of one node, zeroed when its block is gone.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Counters {
    elected: u64,
    read: u64,
    transferred: u64,
    busy: u64,
    lbfactor: i32,
}

impl Counters {
    fn of(stats: Option<&LiveStatus>) -> Self {
        stats
            .map(|s| Counters {
                elected: s.elected(),
                read: s.read_bytes(),
                transferred: s.transferred.load(Ordering::Relaxed),
                busy: s.busy(),
                lbfactor: s.lbfactor(),
            })
            .unwrap_or_default()
    }
}

fn live_nodes(topology: &Topology) -> impl Iterator<Item = (&Node, StatsHandle)> {
    topology.nodes.iter().filter(|(n, _)| !n.remove)
}

fn is_live(topology: &Topology, node: u32) -> bool {
    topology.nodes.get(node).is_some_and(|n| !n.remove)
}

fn info_text(store: &ClusterStore, topology: &Topology) -> String {
    let mut out = String::new();
    let sessions = store.sessions().is_enabled();
    for (n, handle) in live_nodes(topology) {
        let c = Counters::of(store.nodes().stats(handle));
        let _ = write!(
            out,
            "Node: [{}],Name: {},Balancer: {},LBGroup: {},Host: {},Port: {},Type: {},Flushpackets: {},Flushwait: {},Ping: {},Smax: {},Ttl: {},Elected: {},Read: {},Transfered: {},Connected: {},Load: {}",
            n.id,
            n.route,
            n.balancer,
            n.domain,
            n.host,
            n.port,
            n.node_type,
            n.flush_packets.as_str(),
            n.flush_wait_ms,
            n.ping_secs,
            n.smax,
            n.ttl_secs,
            c.elected,
            c.read,
            c.transferred,
            c.busy,
            c.lbfactor
        );
        if sessions {
            let _ = write!(out, ",Sessions: {}", store.sessions().count_for_route(&n.route));
        }
        out.push('\n');
    }
    for h in topology.hosts.iter().filter(|h| is_live(topology, h.node)) {
        let _ = writeln!(
            out,
            "Vhost: [{}:{}:{}], Alias: {}",
            h.node, h.vhost, h.id, h.alias
        );
    }
    for c in topology.contexts.iter().filter(|c| is_live(topology, c.node)) {
        let _ = writeln!(
            out,
            "Context: [{}:{}:{}], Context: {}, Status: {}",
            c.node,
            c.vhost,
            c.id,
            c.path,
            c.status.as_str()
        );
    }
    out
}

fn info_xml(store: &ClusterStore, topology: &Topology) -> String {
    let mut out = String::from(XML_HEADER);
    out.push_str("<Info><Nodes>");
    for (n, handle) in live_nodes(topology) {
        let c = Counters::of(store.nodes().stats(handle));
        let _ = write!(out, "<Node id=\"{}\">", n.id);
        node_fields(&mut out, n);
        out.push_str("<Stats>");
        element(&mut out, "Elected", c.elected);
        element(&mut out, "Read", c.read);
        element(&mut out, "Transfered", c.transferred);
        element(&mut out, "Connected", c.busy);
        element(&mut out, "Load", c.lbfactor);
        if store.sessions().is_enabled() {
            element(&mut out, "Sessions", store.sessions().count_for_route(&n.route));
        }
        out.push_str("</Stats></Node>");
    }
    out.push_str("</Nodes>");
    hosts_contexts_xml(&mut out, topology, |id| is_live(topology, id));
    out.push_str("</Info>");
    out
}

// ── XML pieces ────────────────────────────────────────────────────

fn node_fields(out: &mut String, n: &Node) {
    element(out, "Balancer", &n.balancer);
    element(out, "JVMRoute", &n.route);
    element(out, "LBGroup", &n.domain);
    element(out, "Host", &n.host);
    element(out, "Port", n.port);
    element(out, "Type", n.node_type);
    element(out, "Flushpackets", n.flush_packets.as_str());
    element(out, "Flushwait", n.flush_wait_ms);
    element(out, "Ping", n.ping_secs);
    element(out, "Smax", n.smax);
    element(out, "Ttl", n.ttl_secs);
    element(out, "Timeout", n.timeout_secs);
}

fn hosts_contexts_xml(out: &mut String, topology: &Topology, keep: impl Fn(u32) -> bool) {
    out.push_str("<Vhosts>");
    for h in topology.hosts.iter().filter(|h| keep(h.node)) {
        let _ = write!(out, "<Vhost id=\"{}\">", h.id);
        element(out, "Alias", &h.alias);
        element(out, "Vhost", h.vhost);
        element(out, "Node", h.node);
        out.push_str("</Vhost>");
    }
    out.push_str("</Vhosts><Contexts>");
    for c in topology.contexts.iter().filter(|c| keep(c.node)) {
        let _ = write!(out, "<Context id=\"{}\">", c.id);
        element(out, "Path", &c.path);
        element(out, "Vhost", c.vhost);
        element(out, "Node", c.node);
        element(out, "Status", c.status.as_str());
        out.push_str("</Context>");
    }
    out.push_str("</Contexts>");
}

fn element(out: &mut String, name: &str, value: impl Display) {
    let _ = write!(out, "<{name}>{}</{name}>", escape(&value.to_string()));
}

fn escape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

fn flag(value: bool) -> u8 {
    u8::from(value)
}
