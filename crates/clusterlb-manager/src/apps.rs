//! ENABLE-APP, DISABLE-APP, STOP-APP and REMOVE-APP.

use clusterlb_core::limits::{ALIAS_SIZE, CONTEXT_SIZE};
use clusterlb_core::{Command, CommandKind, McmpError, McmpResult};
use clusterlb_state::{Context, ContextStatus, EntityTable, Host, Node, epoch_millis};
use tracing::{debug, info};

use crate::configure::{mem_error, split_list};
use crate::engine::{ManagerEngine, Reply, check_size, required_route};

/// Which nodes a wildcard command reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Range {
    Node,
    Domain,
}

/// What an application command addresses on the node.
#[derive(Debug)]
enum Target<'a> {
    /// Every context of the node (or of its domain).
    All(Range),
    /// One context on the vhost group holding one of the aliases.
    Vhost {
        aliases: Vec<String>,
        alias: &'a str,
        context: &'a str,
    },
}

impl<'a> Target<'a> {
    fn parse(cmd: &'a Command) -> McmpResult<Self> {
        let range = match cmd.get("Range") {
            None => Range::Node,
            Some(r) if r.eq_ignore_ascii_case("NODE") => Range::Node,
            Some(r) if r.eq_ignore_ascii_case("DOMAIN") => Range::Domain,
            Some(other) => {
                return Err(McmpError::syntax(format!("Invalid Range \"{other}\"")));
            }
        };
        if cmd.is_wildcard() {
            return Ok(Target::All(range));
        }
        match (cmd.get("Alias"), cmd.get("Context")) {
            (None, None) => Ok(Target::All(range)),
            (Some(alias), Some(context)) => {
                let aliases = split_list("Alias", alias, ALIAS_SIZE)?
                    .into_iter()
                    .map(|a| a.to_ascii_lowercase())
                    .collect();
                check_size("Context", context, CONTEXT_SIZE)?;
                Ok(Target::Vhost {
                    aliases,
                    alias,
                    context,
                })
            }
            (Some(_), None) => Err(McmpError::syntax("Alias without Context")),
            (None, Some(_)) => Err(McmpError::syntax("Context without Alias")),
        }
    }
}

fn status_for(kind: CommandKind) -> ContextStatus {
    match kind {
        CommandKind::EnableApp => ContextStatus::Enabled,
        CommandKind::DisableApp => ContextStatus::Disabled,
        _ => ContextStatus::Stopped,
    }
}

impl ManagerEngine {
    pub(crate) fn process_app(&self, cmd: &Command) -> McmpResult<Reply> {
        let route = required_route(cmd)?;
        let target = Target::parse(cmd)?;
        let kind = cmd.kind;
        let now = epoch_millis();
        let store = self.store();

        let _nodes = store.lock_nodes();
        let _contexts = store.lock_contexts();

        let node = match self.live_node(route) {
            Ok(node) => node,
            Err(_) if kind == CommandKind::RemoveApp => {
                debug!(%route, "remove for unknown node ignored");
                return Ok(Reply::empty());
            }
            Err(e) => return Err(e),
        };

        match target {
            Target::All(range) => {
                let members = if range == Range::Domain && !node.domain.is_empty() {
                    store
                        .nodes()
                        .records()
                        .into_iter()
                        .filter(|n| !n.remove && n.domain == node.domain)
                        .collect()
                } else {
                    vec![node]
                };
                let mut requests = 0;
                for member in &members {
                    requests += self.apply_to_node(member, kind, now)?;
                }
                if kind == CommandKind::StopApp {
                    return Ok(Reply::text(format!(
                        "Type=STOP-APP-RSP&JVMRoute={route}&Requests={requests}"
                    )));
                }
                Ok(Reply::empty())
            }
            Target::Vhost {
                aliases,
                alias,
                context,
            } => {
                let requests = self.apply_to_vhost(&node, &aliases, context, kind, now)?;
                if kind == CommandKind::StopApp {
                    return Ok(Reply::text(format!(
                        "Type=STOP-APP-RSP&JVMRoute={route}&Alias={alias}&Context={context}&Requests={requests}"
                    )));
                }
                Ok(Reply::empty())
            }
        }
    }

    /// Apply `kind` to every context of `node`; REMOVE also drops its
    /// hosts and marks the node removed. Returns the in-flight requests
    /// of the affected contexts.
    fn apply_to_node(&self, node: &Node, kind: CommandKind, now: u64) -> McmpResult<i32> {
        let store = self.store();
        if kind == CommandKind::RemoveApp {
            let (hosts, contexts) = store.remove_host_context(node.id);
            store
                .nodes()
                .mark_removed(node.id, false, now)
                .map_err(|e| mem_error(&format!("Can't remove node \"{}\"", node.route), e))?;
            store.bump_version();
            info!(route = %node.route, id = node.id, hosts, contexts, "node removed");
            return Ok(0);
        }

        let status = status_for(kind);
        let contexts = store.contexts().contexts_of(node.id, None);
        for context in &contexts {
            store
                .contexts()
                .set_status(context.id, status, now)
                .map_err(|e| mem_error(&format!("Can't update context \"{}\"", context.path), e))?;
        }
        debug!(route = %node.route, status = status.as_str(), contexts = contexts.len(), "node contexts updated");
        Ok(contexts.iter().map(|c| c.nbrequests).sum())
    }

    fn apply_to_vhost(
        &self,
        node: &Node,
        aliases: &[String],
        path: &str,
        kind: CommandKind,
        now: u64,
    ) -> McmpResult<i32> {
        let hosts = self.store().hosts();
        let contexts = self.store().contexts();

        let known = aliases
            .iter()
            .find_map(|alias| hosts.find_alias_of_node(alias, node.id));
        let vhost = match known {
            Some(host) => host.vhost,
            None if kind == CommandKind::RemoveApp => {
                debug!(route = %node.route, %path, "remove for unknown vhost ignored");
                return Ok(0);
            }
            None => hosts.max_vhost(node.id) + 1,
        };

        if kind == CommandKind::RemoveApp {
            if let Some(id) = contexts.find(path, vhost, node.id) {
                contexts
                    .remove(id)
                    .map_err(|e| mem_error(&format!("Can't remove context \"{path}\""), e))?;
            }
            if contexts.contexts_of(node.id, Some(vhost)).is_empty() {
                let removed = hosts.remove_of_node(node.id, Some(vhost));
                debug!(route = %node.route, vhost, hosts = removed, "vhost emptied");
            }
            info!(route = %node.route, %path, vhost, "context removed");
            return Ok(0);
        }

        for alias in aliases {
            hosts
                .insert_or_update(
                    Host {
                        alias: alias.clone(),
                        vhost,
                        node: node.id,
                        ..Host::default()
                    },
                    now,
                )
                .map_err(|e| mem_error(&format!("Can't update or insert host \"{alias}\""), e))?;
        }

        let status = status_for(kind);
        let id = match contexts.find(path, vhost, node.id) {
            Some(id) => {
                contexts
                    .set_status(id, status, now)
                    .map_err(|e| mem_error(&format!("Can't update context \"{path}\""), e))?;
                id
            }
            None => contexts
                .insert_or_update(
                    Context {
                        path: path.to_string(),
                        vhost,
                        node: node.id,
                        status,
                        ..Context::default()
                    },
                    now,
                )
                .map_err(|e| mem_error(&format!("Can't update or insert context \"{path}\""), e))?,
        };
        debug!(route = %node.route, %path, vhost, status = status.as_str(), "context updated");
        Ok(contexts.read(id).map(|c| c.nbrequests).unwrap_or(0))
    }
}
