//! CONFIG: register or refresh a node together with its balancer and
//! virtual hosts.
//!
//! The whole command is decoded and validated into a [`NodeConfig`]
//! before any table is touched, so a SYNTAX error never leaves partial
//! state behind.

use clusterlb_core::limits::{
    AJPSECRET_SIZE, ALIAS_SIZE, BALANCER_SIZE, CONTEXT_SIZE, COOKIE_NAME_SIZE, DOMAIN_SIZE,
    HOST_SIZE, JVMROUTE_SIZE, PATH_NAME_SIZE, PORT_SIZE, TYPE_SIZE, UPGRADE_SIZE,
};
use clusterlb_core::{Command, McmpError, McmpResult};
use clusterlb_state::{
    Balancer, Context, ContextStatus, EntityTable, FlushPackets, Host, Node, SlotId, StateError,
    epoch_millis,
};
use tracing::{debug, info, warn};

use crate::engine::{ManagerEngine, check_size, number, strip_zone};

/// One virtual-host group: aliases plus the contexts deployed on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VhostGroup {
    pub aliases: Vec<String>,
    pub contexts: Vec<String>,
}

/// A decoded CONFIG command.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeConfig {
    pub balancer: Balancer,
    pub node: Node,
    /// Groups in arrival order; the first one is vhost 1.
    pub vhosts: Vec<VhostGroup>,
}

impl NodeConfig {
    pub fn parse(cmd: &Command, default_balancer: &str) -> McmpResult<Self> {
        let mut balancer = Balancer {
            name: default_balancer.to_string(),
            ..Balancer::default()
        };
        let mut node = Node::default();
        let mut vhosts: Vec<VhostGroup> = Vec::new();

        for (key, value) in cmd.params() {
            match key.to_ascii_lowercase().as_str() {
                "balancer" => {
                    check_size("Balancer", value, BALANCER_SIZE)?;
                    balancer.name = value.clone();
                }
                "stickysession" => balancer.sticky = !is_no(value),
                "stickysessioncookie" => {
                    check_size("StickySessionCookie", value, COOKIE_NAME_SIZE)?;
                    balancer.sticky_cookie = value.clone();
                }
                "stickysessionpath" => {
                    check_size("StickySessionPath", value, PATH_NAME_SIZE)?;
                    balancer.sticky_path = value.clone();
                }
                "stickysessionremove" => balancer.sticky_remove = is_yes(value),
                "stickysessionforce" => balancer.sticky_force = !is_no(value),
                "waitworker" => balancer.timeout_secs = number("WaitWorker", value)?,
                "maxattempts" => balancer.max_attempts = number("Maxattempts", value)?,
                "jvmroute" => {
                    check_size("JVMRoute", value, JVMROUTE_SIZE)?;
                    node.route = value.clone();
                }
                "domain" => {
                    check_size("Domain", value, DOMAIN_SIZE)?;
                    node.domain = value.clone();
                }
                "host" => {
                    check_size("Host", value, HOST_SIZE)?;
                    node.host = strip_zone(value);
                }
                "port" => {
                    check_size("Port", value, PORT_SIZE)?;
                    node.port = number("Port", value)?;
                }
                "type" => {
                    check_size("Type", value, TYPE_SIZE)?;
                    node.node_type = value.parse().map_err(McmpError::syntax)?;
                }
                "reversed" => node.reversed = is_yes(value),
                "flushpackets" => node.flush_packets = flush_packets(value)?,
                "flushwait" => node.flush_wait_ms = number("flushwait", value)?,
                "ping" => node.ping_secs = number("ping", value)?,
                "smax" => node.smax = number("smax", value)?,
                "ttl" => node.ttl_secs = number("ttl", value)?,
                "timeout" => node.timeout_secs = number("Timeout", value)?,
                "ajpsecret" => {
                    check_size("AJPSecret", value, AJPSECRET_SIZE)?;
                    node.ajp_secret = value.clone();
                }
                "upgrade" => {
                    check_size("Upgrade", value, UPGRADE_SIZE)?;
                    node.upgrade = value.clone();
                }
                "alias" => {
                    let aliases = split_list("Alias", value, ALIAS_SIZE)?
                        .into_iter()
                        .map(|a| a.to_ascii_lowercase())
                        .collect();
                    match vhosts.last_mut() {
                        Some(group) if group.aliases.is_empty() => group.aliases = aliases,
                        _ => vhosts.push(VhostGroup {
                            aliases,
                            contexts: Vec::new(),
                        }),
                    }
                }
                "context" => {
                    let contexts = split_list("Context", value, CONTEXT_SIZE)?;
                    match vhosts.last_mut() {
                        Some(group) if group.contexts.is_empty() => group.contexts = contexts,
                        _ => vhosts.push(VhostGroup {
                            aliases: Vec::new(),
                            contexts,
                        }),
                    }
                }
                _ => {
                    return Err(McmpError::syntax(format!(
                        "Invalid field \"{key}\" in message"
                    )));
                }
            }
        }

        if node.route.is_empty() {
            return Err(McmpError::syntax("JVMRoute can't be empty"));
        }
        if vhosts
            .iter()
            .any(|g| g.aliases.is_empty() && !g.contexts.is_empty())
        {
            return Err(McmpError::syntax("Context without Alias"));
        }
        if balancer.name.chars().any(|c| c.is_ascii_uppercase()) {
            warn!(balancer = %balancer.name, "balancer name contains uppercase characters, lower-casing");
            balancer.name = balancer.name.to_ascii_lowercase();
        }
        node.balancer = balancer.name.clone();

        Ok(Self {
            balancer,
            node,
            vhosts,
        })
    }
}

impl ManagerEngine {
    pub(crate) fn process_config(&self, cmd: &Command) -> McmpResult<()> {
        let config = NodeConfig::parse(cmd, &self.config().default_balancer)?;
        let store = self.store();
        let nodes = store.nodes();
        let route = config.node.route.clone();
        let balancer = config.balancer.name.clone();
        let now = epoch_millis();

        let _nodes = store.lock_nodes();
        let _contexts = store.lock_contexts();

        // Another live identity already owns this physical worker.
        if let Some(other) = nodes
            .find_by_host_port(&config.node.host, config.node.port)
            .and_then(|id| nodes.read(id).ok())
            && other.route != route
        {
            return Err(McmpError::mem(format!(
                "Node \"{}\" already registered on {}:{}",
                other.route, config.node.host, config.node.port
            )));
        }

        store
            .balancers()
            .insert_or_update(config.balancer, now)
            .map_err(|e| mem_error(&format!("Can't update or insert balancer \"{balancer}\""), e))?;

        if let Some(existing) = nodes.read_by_route(&route)
            && !existing.same_connection(&config.node)
        {
            nodes
                .mark_removed(existing.id, true, now)
                .map_err(|e| mem_error(&format!("Can't retire node \"{route}\""), e))?;
            let (hosts, contexts) = store.remove_host_context(existing.id);
            store.bump_version();
            info!(%route, id = existing.id, hosts, contexts, "node addressing changed, old record retired");
        }

        let id = nodes
            .insert_or_update(config.node, now)
            .map_err(|e| mem_error(&format!("Can't update or insert node with \"{route}\" JVMRoute"), e))?;
        store.bump_version();
        store.domains().forget(&route, &balancer);
        info!(%route, id, %balancer, "node registered");

        self.store_vhosts(id, &config.vhosts, now)
    }

    /// Upsert the aliases and contexts of each group. A MEM failure here
    /// leaves the node committed without the remaining records.
    fn store_vhosts(&self, node: SlotId, vhosts: &[VhostGroup], now: u64) -> McmpResult<()> {
        let hosts = self.store().hosts();
        let contexts = self.store().contexts();
        for (vhost, group) in (1u32..).zip(vhosts) {
            for alias in &group.aliases {
                hosts
                    .insert_or_update(
                        Host {
                            alias: alias.clone(),
                            vhost,
                            node,
                            ..Host::default()
                        },
                        now,
                    )
                    .map_err(|e| mem_error(&format!("Can't update or insert host \"{alias}\""), e))?;
            }
            for path in &group.contexts {
                if contexts.find(path, vhost, node).is_some() {
                    continue;
                }
                contexts
                    .insert_or_update(
                        Context {
                            path: path.clone(),
                            vhost,
                            node,
                            status: ContextStatus::Stopped,
                            ..Context::default()
                        },
                        now,
                    )
                    .map_err(|e| mem_error(&format!("Can't update or insert context \"{path}\""), e))?;
            }
            debug!(node, vhost, aliases = group.aliases.len(), contexts = group.contexts.len(), "vhost stored");
        }
        Ok(())
    }
}

pub(crate) fn mem_error(message: &str, err: StateError) -> McmpError {
    McmpError::mem(format!("{message}: {err}"))
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

fn is_no(value: &str) -> bool {
    value.eq_ignore_ascii_case("no")
}

fn flush_packets(value: &str) -> McmpResult<FlushPackets> {
    match value.to_ascii_lowercase().as_str() {
        "off" => Ok(FlushPackets::Off),
        "on" => Ok(FlushPackets::On),
        "auto" => Ok(FlushPackets::Auto),
        _ => Err(McmpError::syntax(format!(
            "Invalid flushpackets value \"{value}\""
        ))),
    }
}

/// Split a comma-joined list, checking every element against `size`.
pub(crate) fn split_list(field: &str, value: &str, size: usize) -> McmpResult<Vec<String>> {
    let mut out = Vec::new();
    for item in value.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        check_size(field, item, size)?;
        out.push(item.to_string());
    }
    Ok(out)
}
