//! Context and virtual-host resolution.
//!
//! Maps a request path (and, with alias matching, its server name) to
//! the `(node, context)` pairs able to serve it. Only the longest
//! matching context paths survive; their status then decides whether
//! each pair is usable.

use clusterlb_state::{Context, ContextStatus, Node, SlotId, Topology};

/// One node able to serve a request through one of its contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeContext {
    pub node: SlotId,
    pub context: SlotId,
}

/// Path part of a request target: `scheme://authority` of an
/// absolute-form target, query string and `;` parameters removed.
pub fn path_only(uri: &str) -> &str {
    let uri = strip_authority(uri);
    let end = uri.find(['?', ';']).unwrap_or(uri.len());
    &uri[..end]
}

fn strip_authority(uri: &str) -> &str {
    let Some((scheme, rest)) = uri.split_once("://") else {
        return uri;
    };
    let is_scheme = !scheme.is_empty()
        && scheme
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.'));
    if !is_scheme {
        return uri;
    }
    match rest.find(['/', '?', ';']) {
        Some(i) if rest.as_bytes()[i] == b'/' => &rest[i..],
        _ => "/",
    }
}

/// Whether `context` is a prefix of `path` on a segment boundary.
pub fn context_matches(path: &str, context: &str) -> bool {
    path.strip_prefix(context)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with('/') || context == "/")
}

/// Host header without its port.
pub fn server_name(host: &str) -> &str {
    if host.starts_with('[') {
        return host.find(']').map_or(host, |end| &host[..=end]);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}

/// Resolve the usable `(node, context)` pairs for `path`.
///
/// `server_name` restricts candidates to contexts whose vhost carries
/// that alias. `balancer` restricts them to nodes of that balancer.
/// A DISABLED context is usable only when `has_session` vouches for
/// its node; STOPPED contexts never are.
pub fn find_node_context_host(
    topology: &Topology,
    path: &str,
    server_name: Option<&str>,
    balancer: Option<&str>,
    mut has_session: impl FnMut(&Node) -> bool,
) -> Vec<NodeContext> {
    let mut longest = 0;
    let mut matches: Vec<(&Context, &Node)> = Vec::new();

    for context in topology.contexts.iter() {
        let Some(node) = topology.nodes.get(context.node) else {
            continue;
        };
        if node.remove {
            continue;
        }
        if let Some(balancer) = balancer
            && !node.balancer.eq_ignore_ascii_case(balancer)
        {
            continue;
        }
        if let Some(name) = server_name
            && !serves_alias(topology, context, name)
        {
            continue;
        }
        if !context_matches(path, &context.path) {
            continue;
        }
        let len = context.path.len();
        if len > longest {
            longest = len;
            matches.clear();
        }
        if len == longest {
            matches.push((context, node));
        }
    }

    matches
        .into_iter()
        .filter(|(context, node)| match context.status {
            ContextStatus::Enabled => true,
            ContextStatus::Disabled => has_session(node),
            ContextStatus::Stopped => false,
        })
        .map(|(context, node)| NodeContext {
            node: node.id,
            context: context.id,
        })
        .collect()
}

fn serves_alias(topology: &Topology, context: &Context, name: &str) -> bool {
    topology.hosts.iter().any(|h| {
        h.node == context.node && h.vhost == context.vhost && h.alias.eq_ignore_ascii_case(name)
    })
}
