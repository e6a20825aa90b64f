//! Per-request routing decisions.
//!
//! ```text
//! route(request)
//!   ├── sync workers if the store version moved
//!   ├── sticky pass: first balancer whose session route is served
//!   │     └── find_route_worker (non-standby, then standby, redirects)
//!   ├── miss + sticky-force: best worker within the route's domain
//!   └── otherwise: best worker by requests
//!         tiers: domain × {active, standby}, then relaxed domain
//! ```
//!
//! Context resolution is memoized per request so every sub-step sees
//! the same matches.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clusterlb_core::ClusterConfig;
use clusterlb_core::limits::{self, SESSIONID_SIZE};
use clusterlb_state::{
    ClusterStore, Node, SessionRecord, SlotId, StatsHandle, Topology, TopologyCache, epoch_millis,
};
use tracing::{debug, warn};

use crate::context::{self, NodeContext};
use crate::domain::find_node_domain;
use crate::error::{RouteError, RouteResult};
use crate::sticky::{StickySession, find_session};
use crate::worker::{BalancerRuntime, Worker, WorkerRegistry};

/// Sleep step of the wait-for-worker loop.
const WAIT_STEP: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterOptions {
    /// Restrict contexts to vhosts carrying the request's server name.
    pub use_alias: bool,
    pub deterministic_failover: bool,
    pub worker_retry: Duration,
    pub cache_interval: Duration,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self::from_config(&ClusterConfig::default())
    }
}

impl RouterOptions {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            use_alias: config.manager.use_alias,
            deterministic_failover: config.balancer.deterministic_failover,
            worker_retry: config.balancer.worker_retry(),
            cache_interval: config.balancer.cache_interval(),
        }
    }
}

/// The parts of a request the router looks at.
#[derive(Debug, Clone, Copy, Default)]
pub struct RouteRequest<'a> {
    /// `Host` header, port included or not.
    pub host: Option<&'a str>,
    /// Request target, possibly with query string and path parameters.
    pub uri: &'a str,
    /// `Cookie` header.
    pub cookies: Option<&'a str>,
}

/// Outcome of a successful routing decision.
#[derive(Debug, Clone)]
pub struct RouteDecision {
    pub worker: Arc<Worker>,
    pub node: SlotId,
    pub stats: StatsHandle,
    pub route: String,
    pub context: SlotId,
    pub balancer: String,
    pub session: Option<StickySession>,
    /// Whether the request stayed on its sticky route.
    pub sticky_hit: bool,
    /// The request was failed over away from its sticky route and the
    /// balancer asks for the session token to be dropped.
    pub strip_session: bool,
    pub max_attempts: u32,
}

/// Requests in flight through a decision. Dropping it releases the
/// worker's busy count and the context's request count.
#[derive(Debug)]
pub struct InFlight {
    store: ClusterStore,
    stats: StatsHandle,
    context: SlotId,
    /// Generation the request was counted against, `None` when the
    /// context was already gone at [`Router::begin_request`].
    generation: Option<u64>,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if let Some(stats) = self.store.nodes().stats(self.stats) {
            let _ = stats
                .busy
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |b| b.checked_sub(1));
        }
        let Some(generation) = self.generation else {
            return;
        };
        if let Err(e) = self.store.contexts().end_request(self.context, generation) {
            debug!(context = self.context, error = %e, "context gone before request finished");
        }
    }
}

struct Candidate {
    worker: Arc<Worker>,
    pair: NodeContext,
    route: String,
    score: i64,
}

/// Per-request scratch state.
struct Scratch {
    topology: Arc<Topology>,
    path: String,
    server_name: Option<String>,
    /// Resolved pairs by `(balancer, session-aware)`.
    resolved: HashMap<(Option<String>, bool), Vec<NodeContext>>,
}

#[derive(Debug)]
pub struct Router {
    store: ClusterStore,
    registry: Arc<WorkerRegistry>,
    options: RouterOptions,
    cache: Mutex<TopologyCache>,
}

impl Router {
    pub fn new(store: ClusterStore, registry: Arc<WorkerRegistry>, options: RouterOptions) -> Self {
        let cache = Mutex::new(TopologyCache::new(options.cache_interval));
        Self {
            store,
            registry,
            options,
            cache,
        }
    }

    pub fn store(&self) -> &ClusterStore {
        &self.store
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    fn snapshot(&self) -> Arc<Topology> {
        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&self.store)
    }

    // ── Decision ───────────────────────────────────────────────────

    pub fn route(&self, request: &RouteRequest<'_>) -> RouteResult<RouteDecision> {
        self.route_at(request, epoch_millis())
    }

    /// Route `request` with `now` (epoch millis) as the retry clock.
    pub fn route_at(&self, request: &RouteRequest<'_>, now: u64) -> RouteResult<RouteDecision> {
        self.registry.sync_if_stale(&self.store);
        let topology = self.snapshot();
        let mut scratch = Scratch {
            path: context::path_only(request.uri).to_string(),
            server_name: self
                .options
                .use_alias
                .then_some(request.host)
                .flatten()
                .map(|h| context::server_name(h).to_string()),
            topology,
            resolved: HashMap::new(),
        };
        let balancers = self.registry.balancers();

        // Sticky pass: the balancer whose session route is actually served.
        let mut sticky = None;
        for runtime in balancers.iter().filter(|b| b.settings.sticky) {
            let Some(session) = find_session(request.cookies, request.uri, &runtime.settings)
            else {
                continue;
            };
            let Some(route) = session.route() else {
                continue;
            };
            let pairs = self.contexts(&mut scratch, Some(runtime.name()), Some(&session));
            let served = pairs.iter().any(|p| {
                scratch
                    .topology
                    .nodes
                    .get(p.node)
                    .is_some_and(|n| n.route == route)
            });
            if served {
                sticky = Some((runtime, session));
                break;
            }
            debug!(balancer = %runtime.name(), %route, "sticky route not served here");
        }

        let (runtime, session, sticky_route) = match sticky {
            Some((runtime, session)) => {
                let route = session.route().map(str::to_string);
                (runtime, Some(session), route)
            }
            None => {
                let pairs = self.contexts(&mut scratch, None, None);
                let Some(first) = pairs.first() else {
                    debug!(path = %scratch.path, "no context for request");
                    return Err(RouteError::NoContext);
                };
                let name = scratch
                    .topology
                    .nodes
                    .get(first.node)
                    .map(|n| n.balancer.clone())
                    .unwrap_or_default();
                let Some(runtime) = balancers
                    .iter()
                    .find(|b| b.settings.name.eq_ignore_ascii_case(&name))
                else {
                    return Err(RouteError::Unavailable(name));
                };
                let session = runtime
                    .settings
                    .sticky
                    .then(|| find_session(request.cookies, request.uri, &runtime.settings))
                    .flatten();
                (runtime, session, None)
            }
        };

        let pairs = self.contexts(&mut scratch, Some(runtime.name()), session.as_ref());
        if pairs.is_empty() {
            return Err(RouteError::NoContext);
        }
        let topology = Arc::clone(&scratch.topology);
        let settings = &runtime.settings;
        // Ranked failover ignores the session, so DISABLED contexts drop out.
        let ranked = self.contexts(&mut scratch, Some(runtime.name()), None);

        if let Some(route) = sticky_route.as_deref() {
            if let Some((worker, pair)) = self.find_route_worker(runtime, route, &pairs, now) {
                let route = worker.route();
                return Ok(self.elect(runtime, worker, pair, route, session, true, false));
            }
            let domain = find_node_domain(&topology, self.store.domains(), route, settings.name.as_str());
            if ranked.is_empty() {
                return Err(RouteError::NoContext);
            }
            if settings.sticky_force {
                let Some(domain) = domain else {
                    warn!(balancer = %settings.name, %route, "sticky route unavailable and failover forbidden");
                    return Err(RouteError::Unavailable(settings.name.clone()));
                };
                return self
                    .find_best(runtime, Some(&domain), true, &topology, &ranked, session.as_ref(), now)
                    .map(|c| self.elect(runtime, c.worker, c.pair, c.route, session, false, settings.sticky_remove))
                    .ok_or_else(|| RouteError::Unavailable(settings.name.clone()));
            }
            return self
                .find_best(runtime, domain.as_deref(), false, &topology, &ranked, session.as_ref(), now)
                .map(|c| self.elect(runtime, c.worker, c.pair, c.route, session, false, settings.sticky_remove))
                .ok_or_else(|| RouteError::Unavailable(settings.name.clone()));
        }

        if ranked.is_empty() {
            return Err(RouteError::NoContext);
        }
        let failed_over = session.as_ref().is_some_and(|s| s.route().is_some());
        self.find_best(runtime, None, false, &topology, &ranked, session.as_ref(), now)
            .map(|c| {
                let strip = failed_over && settings.sticky_remove;
                self.elect(runtime, c.worker, c.pair, c.route, session, false, strip)
            })
            .ok_or_else(|| RouteError::Unavailable(settings.name.clone()))
    }

    /// [`Router::route`], waiting for a worker to free up when the
    /// balancer sets a wait timeout.
    pub async fn route_waiting(&self, request: &RouteRequest<'_>) -> RouteResult<RouteDecision> {
        let mut result = self.route(request);
        let name = match &result {
            Err(RouteError::Unavailable(name)) => name.clone(),
            _ => return result,
        };
        let timeout = self
            .registry
            .balancer(&name)
            .map_or(0, |b| u64::from(b.settings.timeout_secs));
        let steps = timeout * 1000 / WAIT_STEP.as_millis() as u64;
        for _ in 0..steps {
            tokio::time::sleep(WAIT_STEP).await;
            result = self.route(request);
            if !matches!(result, Err(RouteError::Unavailable(_))) {
                break;
            }
        }
        result
    }

    fn contexts(
        &self,
        scratch: &mut Scratch,
        balancer: Option<&str>,
        session: Option<&StickySession>,
    ) -> Vec<NodeContext> {
        let key = (balancer.map(str::to_ascii_lowercase), session.is_some());
        if let Some(pairs) = scratch.resolved.get(&key) {
            return pairs.clone();
        }
        let pairs = context::find_node_context_host(
            &scratch.topology,
            &scratch.path,
            scratch.server_name.as_deref(),
            balancer,
            |node| self.session_serves(session, node),
        );
        scratch.resolved.insert(key, pairs.clone());
        pairs
    }

    /// Whether `session` is a recognized session of `node`.
    fn session_serves(&self, session: Option<&StickySession>, node: &Node) -> bool {
        let Some(session) = session else {
            return false;
        };
        if session.route() != Some(node.route.as_str()) {
            return false;
        }
        let sessions = self.store.sessions();
        !sessions.is_enabled()
            || sessions.route_of(&session.id).as_deref() == Some(node.route.as_str())
    }

    // ── Worker selection ───────────────────────────────────────────

    /// Worker serving `route`, following redirects. A redirect route
    /// already visited ends the search.
    fn find_route_worker(
        &self,
        runtime: &BalancerRuntime,
        route: &str,
        pairs: &[NodeContext],
        now: u64,
    ) -> Option<(Arc<Worker>, NodeContext)> {
        let mut visited = HashSet::new();
        let mut target = route.to_string();
        loop {
            if !visited.insert(target.clone()) {
                debug!(balancer = %runtime.name(), route = %target, "redirect cycle");
                return None;
            }
            match self.route_candidate(runtime, &target, pairs, now) {
                Ok(found) => return Some(found),
                Err(Some(next)) => {
                    debug!(balancer = %runtime.name(), from = %target, to = %next, "following redirect");
                    target = next;
                }
                Err(None) => return None,
            }
        }
    }

    /// One non-standby pass, then a standby pass if nothing carried the
    /// route. Errs with the redirect of an unusable match, if any.
    fn route_candidate(
        &self,
        runtime: &BalancerRuntime,
        route: &str,
        pairs: &[NodeContext],
        now: u64,
    ) -> Result<(Arc<Worker>, NodeContext), Option<String>> {
        let retry_ms = self.options.worker_retry.as_millis() as u64;
        let mut redirect = None;
        for standby in [false, true] {
            let mut matched = false;
            for worker in &runtime.workers {
                if worker.route() != route {
                    continue;
                }
                let Some(stats) = worker.stats(&self.store) else {
                    continue;
                };
                let lbfactor = stats.lbfactor();
                if lbfactor < 0 || (lbfactor == 0) != standby {
                    continue;
                }
                matched = true;
                if stats.is_usable() || stats.try_retry(now, retry_ms) {
                    if let Some(pair) = pair_of(worker, pairs) {
                        return Ok((Arc::clone(worker), pair));
                    }
                } else if redirect.is_none() {
                    redirect = worker.redirect();
                }
            }
            if matched {
                break;
            }
        }
        Err(redirect)
    }

    /// Least loaded usable worker of `runtime`.
    ///
    /// With a domain, workers of that domain are tried first; unless
    /// `strict`, every worker is tried next. Each tier takes standby
    /// workers only when no active one qualifies.
    #[allow(clippy::too_many_arguments)]
    fn find_best(
        &self,
        runtime: &BalancerRuntime,
        domain: Option<&str>,
        strict: bool,
        topology: &Topology,
        pairs: &[NodeContext],
        session: Option<&StickySession>,
        now: u64,
    ) -> Option<Candidate> {
        let tiers = match domain {
            Some(_) if strict => vec![domain],
            Some(_) => vec![domain, None],
            None => vec![None],
        };
        for tier in tiers {
            for standby in [false, true] {
                let candidates = self.candidates(runtime, tier, standby, topology, pairs, now);
                if !candidates.is_empty() {
                    return Some(self.pick(candidates, session));
                }
            }
        }
        None
    }

    fn candidates(
        &self,
        runtime: &BalancerRuntime,
        domain: Option<&str>,
        standby: bool,
        topology: &Topology,
        pairs: &[NodeContext],
        now: u64,
    ) -> Vec<Candidate> {
        let retry_ms = self.options.worker_retry.as_millis() as u64;
        let mut out = Vec::new();
        for worker in &runtime.workers {
            let Some(handle) = worker.handle() else {
                continue;
            };
            let Some(stats) = self.store.nodes().stats(handle) else {
                continue;
            };
            let Some(node) = topology.nodes.get(handle.id) else {
                continue;
            };
            if node.generation != handle.generation || node.remove {
                continue;
            }
            let lbfactor = stats.lbfactor();
            if lbfactor < 0 || (lbfactor == 0) != standby {
                continue;
            }
            if !(stats.is_usable() || stats.try_retry(now, retry_ms)) {
                continue;
            }
            let Some(pair) = pairs.iter().copied().find(|p| p.node == handle.id) else {
                continue;
            };
            if let Some(domain) = domain
                && node.domain != domain
            {
                continue;
            }
            let recent = stats.elected().saturating_sub(node.old_elected) as i64;
            let score = recent * 1000 / i64::from(lbfactor.max(1)) + stats.lbstatus();
            out.push(Candidate {
                worker: Arc::clone(worker),
                pair,
                route: node.route.clone(),
                score,
            });
        }
        out
    }

    fn pick(&self, mut candidates: Vec<Candidate>, session: Option<&StickySession>) -> Candidate {
        if self.options.deterministic_failover
            && let Some(session) = session.filter(|s| s.route().is_some())
        {
            candidates.sort_by(|a, b| a.route.cmp(&b.route));
            let index = djb2(&session.id) as usize % candidates.len();
            return candidates.swap_remove(index);
        }
        let mut best = 0;
        for (i, c) in candidates.iter().enumerate() {
            if c.score < candidates[best].score {
                best = i;
            }
        }
        candidates.swap_remove(best)
    }

    #[allow(clippy::too_many_arguments)]
    fn elect(
        &self,
        runtime: &BalancerRuntime,
        worker: Arc<Worker>,
        pair: NodeContext,
        route: String,
        session: Option<StickySession>,
        sticky_hit: bool,
        strip_session: bool,
    ) -> RouteDecision {
        let stats = worker.handle().unwrap_or(StatsHandle {
            id: pair.node,
            generation: 0,
        });
        if let Some(live) = self.store.nodes().stats(stats) {
            live.elected.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            balancer = %runtime.name(),
            worker = %worker.key(),
            %route,
            context = pair.context,
            sticky_hit,
            "worker elected"
        );
        RouteDecision {
            worker,
            node: pair.node,
            stats,
            route,
            context: pair.context,
            balancer: runtime.settings.name.clone(),
            session,
            sticky_hit,
            strip_session,
            max_attempts: runtime.settings.max_attempts,
        }
    }

    // ── Request accounting ─────────────────────────────────────────

    /// Mark a request in flight on `decision`'s worker and context.
    pub fn begin_request(&self, decision: &RouteDecision) -> InFlight {
        if let Some(stats) = self.store.nodes().stats(decision.stats) {
            stats.busy.fetch_add(1, Ordering::Relaxed);
        }
        let generation = match self.store.contexts().begin_request(decision.context) {
            Ok(generation) => Some(generation),
            Err(e) => {
                debug!(context = decision.context, error = %e, "request not counted");
                None
            }
        };
        InFlight {
            store: self.store.clone(),
            stats: decision.stats,
            context: decision.context,
            generation,
        }
    }

    pub fn record_transfer(&self, decision: &RouteDecision, read: u64, written: u64) {
        if let Some(stats) = self.store.nodes().stats(decision.stats) {
            stats.read.fetch_add(read, Ordering::Relaxed);
            stats.transferred.fetch_add(written, Ordering::Relaxed);
        }
    }

    /// Remember a backend-issued session id. A no-op while session
    /// tracking is disabled.
    pub fn record_session(&self, session_id: &str, route: &str) -> RouteResult<()> {
        let sessions = self.store.sessions();
        if !sessions.is_enabled() || session_id.is_empty() {
            return Ok(());
        }
        sessions.insert_or_update(
            SessionRecord {
                session_id: limits::truncate(session_id, SESSIONID_SIZE),
                route: route.to_string(),
                ..SessionRecord::default()
            },
            epoch_millis(),
        )?;
        Ok(())
    }

    pub fn count_sessions(&self, route: &str) -> usize {
        self.store.sessions().count_for_route(route)
    }
}

fn pair_of(worker: &Worker, pairs: &[NodeContext]) -> Option<NodeContext> {
    let id = worker.node_id()?;
    pairs.iter().copied().find(|p| p.node == id)
}

fn djb2(value: &str) -> u32 {
    value
        .bytes()
        .fold(5381u32, |hash, b| hash.wrapping_mul(33).wrapping_add(u32::from(b)))
}

#[cfg(test)]
mod tests {
    use clusterlb_core::config::TablesConfig;
    use clusterlb_state::{Balancer, Context, ContextStatus, EntityTable, Host, Node};

    use super::*;

    struct Cluster {
        store: ClusterStore,
        router: Router,
    }

    impl Cluster {
        fn new(sessions: usize) -> Self {
            Self::with_options(sessions, RouterOptions::default())
        }

        fn with_options(sessions: usize, options: RouterOptions) -> Self {
            let store = ClusterStore::new(&TablesConfig {
                sessions,
                ..TablesConfig::default()
            });
            let registry = Arc::new(WorkerRegistry::new("default", 8192));
            let router = Router::new(store.clone(), registry, options);
            Self { store, router }
        }

        fn balancer(&self, balancer: Balancer) {
            self.store.balancers().insert_or_update(balancer, 1).unwrap();
        }

        fn node(&self, route: &str, port: u16, domain: &str, status: ContextStatus) -> SlotId {
            let id = self
                .store
                .nodes()
                .insert_or_update(
                    Node {
                        route: route.to_string(),
                        balancer: "mycluster".to_string(),
                        domain: domain.to_string(),
                        host: "10.0.0.1".to_string(),
                        port,
                        ..Node::default()
                    },
                    1,
                )
                .unwrap();
            self.store
                .hosts()
                .insert_or_update(
                    Host {
                        alias: "www.example.com".to_string(),
                        vhost: 1,
                        node: id,
                        ..Host::default()
                    },
                    1,
                )
                .unwrap();
            self.store
                .contexts()
                .insert_or_update(
                    Context {
                        path: "/app".to_string(),
                        vhost: 1,
                        node: id,
                        status,
                        ..Context::default()
                    },
                    1,
                )
                .unwrap();
            self.store.bump_version();
            id
        }

        fn stats(&self, id: SlotId) -> &clusterlb_state::LiveStatus {
            self.store.nodes().stats_of(id).unwrap()
        }

        fn route(&self, cookies: Option<&str>) -> RouteResult<RouteDecision> {
            self.router.route_at(
                &RouteRequest {
                    host: Some("www.example.com"),
                    uri: "/app/index.html",
                    cookies,
                },
                1_000_000,
            )
        }
    }

    #[test]
    fn routes_to_only_enabled_node() {
        let c = Cluster::new(0);
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        let decision = c.route(None).unwrap();
        assert_eq!(decision.node, id);
        assert_eq!(decision.route, "node1");
        assert!(!decision.sticky_hit);
        assert_eq!(c.stats(id).elected(), 1);
    }

    #[test]
    fn unknown_path_is_no_context() {
        let c = Cluster::new(0);
        c.node("node1", 8009, "", ContextStatus::Enabled);
        let err = c
            .router
            .route(&RouteRequest {
                uri: "/other",
                ..RouteRequest::default()
            })
            .unwrap_err();
        assert!(matches!(err, RouteError::NoContext));
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn sticky_cookie_keeps_route() {
        let c = Cluster::new(0);
        c.node("node1", 8009, "", ContextStatus::Enabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.stats(node2).elected.store(50, Ordering::Relaxed);
        let decision = c.route(Some("JSESSIONID=abc.node2")).unwrap();
        assert_eq!(decision.node, node2);
        assert!(decision.sticky_hit);
    }

    #[test]
    fn disabled_context_keeps_recorded_session() {
        let c = Cluster::new(16);
        let node1 = c.node("node1", 8009, "", ContextStatus::Disabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);

        let fresh = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(fresh.node, node2);

        c.router.record_session("abc.node1", "node1").unwrap();
        assert_eq!(c.router.count_sessions("node1"), 1);
        let sticky = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(sticky.node, node1);
        assert!(sticky.sticky_hit);
    }

    #[test]
    fn equal_scores_pick_first_worker() {
        let c = Cluster::new(0);
        let a = c.node("nodeA", 8009, "", ContextStatus::Enabled);
        let b = c.node("nodeB", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(a).elected.store(10, Ordering::Relaxed);
        c.stats(a).set_lbfactor(100);
        c.stats(b).elected.store(5, Ordering::Relaxed);
        c.stats(b).set_lbfactor(50);
        assert_eq!(c.route(None).unwrap().node, a);
    }

    #[test]
    fn lowest_score_wins() {
        let c = Cluster::new(0);
        let a = c.node("nodeA", 8009, "", ContextStatus::Enabled);
        let b = c.node("nodeB", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(a).elected.store(3, Ordering::Relaxed);
        c.stats(b).elected.store(1, Ordering::Relaxed);
        assert_eq!(c.route(None).unwrap().node, b);
    }

    #[test]
    fn standby_used_only_when_active_gone() {
        let c = Cluster::new(0);
        let active = c.node("node1", 8009, "", ContextStatus::Enabled);
        let standby = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(standby).set_lbfactor(0);
        assert_eq!(c.route(None).unwrap().node, active);
        c.stats(active).mark_error(1_000_000);
        assert_eq!(c.route(None).unwrap().node, standby);
    }

    #[test]
    fn sticky_force_without_domain_is_unavailable() {
        let c = Cluster::new(0);
        let node1 = c.node("node1", 8009, "", ContextStatus::Enabled);
        c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(node1).mark_error(1_000_000);
        let err = c.route(Some("JSESSIONID=abc.node1")).unwrap_err();
        assert!(matches!(err, RouteError::Unavailable(ref b) if b == "mycluster"));
    }

    #[test]
    fn sticky_force_fails_over_within_domain() {
        let c = Cluster::new(0);
        let node1 = c.node("node1", 8009, "dc1", ContextStatus::Enabled);
        c.node("node2", 8010, "dc2", ContextStatus::Enabled);
        let node3 = c.node("node3", 8011, "dc1", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(node1).mark_error(1_000_000);
        let decision = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(decision.node, node3);
        assert!(!decision.sticky_hit);
    }

    #[test]
    fn failover_without_force_strips_session_when_asked() {
        let c = Cluster::new(0);
        c.balancer(Balancer {
            name: "mycluster".to_string(),
            sticky_force: false,
            sticky_remove: true,
            ..Balancer::default()
        });
        let node1 = c.node("node1", 8009, "", ContextStatus::Enabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(node1).mark_error(1_000_000);
        let decision = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(decision.node, node2);
        assert!(decision.strip_session);
    }

    #[test]
    fn errored_worker_is_retried_after_delay() {
        let c = Cluster::new(0);
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(id).mark_error(1_000_000);
        assert!(c.route(None).is_err());
        let later = c.router.route_at(
            &RouteRequest {
                uri: "/app",
                ..RouteRequest::default()
            },
            1_002_000,
        );
        assert_eq!(later.unwrap().node, id);
    }

    #[test]
    fn redirect_is_followed_once_per_route() {
        let c = Cluster::new(0);
        let node1 = c.node("node1", 8009, "", ContextStatus::Enabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        let w1 = c.router.registry().worker_by_route("mycluster", "node1").unwrap();
        let w2 = c.router.registry().worker_by_route("mycluster", "node2").unwrap();
        w1.set_redirect(Some("node2".to_string()));
        w2.set_redirect(Some("node1".to_string()));
        c.stats(node1).mark_error(1_000_000);

        let decision = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(decision.node, node2);
        assert!(decision.sticky_hit);

        c.stats(node2).mark_error(1_000_000);
        assert!(c.route(Some("JSESSIONID=abc.node1")).is_err());
    }

    #[test]
    fn deterministic_failover_hashes_session() {
        let options = RouterOptions {
            deterministic_failover: true,
            ..RouterOptions::default()
        };
        let c = Cluster::with_options(0, options);
        c.balancer(Balancer {
            name: "mycluster".to_string(),
            sticky_force: false,
            ..Balancer::default()
        });
        let gone = c.node("node0", 8008, "", ContextStatus::Enabled);
        c.node("node1", 8009, "", ContextStatus::Enabled);
        c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(gone).mark_error(1_000_000);

        let first = c.route(Some("JSESSIONID=xyz.node0")).unwrap();
        let second = c.route(Some("JSESSIONID=xyz.node0")).unwrap();
        assert_eq!(first.node, second.node);
        let expected = if djb2("xyz.node0") % 2 == 0 { "node1" } else { "node2" };
        assert_eq!(first.route, expected);
    }

    #[test]
    fn in_flight_guard_tracks_busy_and_requests() {
        let c = Cluster::new(0);
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        let decision = c.route(None).unwrap();
        {
            let _guard = c.router.begin_request(&decision);
            assert_eq!(c.stats(id).busy(), 1);
            assert_eq!(c.store.contexts().read(decision.context).unwrap().nbrequests, 1);
            c.router.record_transfer(&decision, 100, 40);
        }
        assert_eq!(c.stats(id).busy(), 0);
        assert_eq!(c.store.contexts().read(decision.context).unwrap().nbrequests, 0);
        assert_eq!(c.stats(id).read_bytes(), 100);
    }

    #[test]
    fn ranked_pairs_ignore_the_session() {
        let c = Cluster::new(16);
        let node1 = c.node("node1", 8009, "", ContextStatus::Disabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.record_session("abc.node1", "node1").unwrap();
        let session = StickySession {
            id: "abc.node1".to_string(),
        };

        let mut scratch = Scratch {
            topology: Arc::new(Topology::build(&c.store)),
            path: "/app".to_string(),
            server_name: None,
            resolved: HashMap::new(),
        };
        let sticky = c.router.contexts(&mut scratch, Some("mycluster"), Some(&session));
        let ranked = c.router.contexts(&mut scratch, Some("mycluster"), None);
        let nodes = |pairs: &[NodeContext]| pairs.iter().map(|p| p.node).collect::<Vec<_>>();
        assert_eq!(nodes(&sticky), vec![node1, node2]);
        assert_eq!(nodes(&ranked), vec![node2]);
    }

    #[test]
    fn failover_from_disabled_sticky_node_skips_it() {
        let c = Cluster::new(16);
        c.balancer(Balancer {
            name: "mycluster".to_string(),
            sticky_force: false,
            ..Balancer::default()
        });
        let node1 = c.node("node1", 8009, "", ContextStatus::Disabled);
        let node2 = c.node("node2", 8010, "", ContextStatus::Enabled);
        c.router.record_session("abc.node1", "node1").unwrap();
        c.router.registry().sync(&c.store);
        c.stats(node1).mark_error(1_000_000);

        let decision = c.route(Some("JSESSIONID=abc.node1")).unwrap();
        assert_eq!(decision.node, node2);
        assert!(!decision.sticky_hit);
    }

    #[test]
    fn absolute_form_target_routes() {
        let c = Cluster::new(0);
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        let decision = c
            .router
            .route(&RouteRequest {
                host: Some("www.example.com"),
                uri: "http://www.example.com/app/index.html",
                cookies: None,
            })
            .unwrap();
        assert_eq!(decision.node, id);
    }

    #[test]
    fn finished_request_leaves_reused_context_alone() {
        let c = Cluster::new(0);
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        let decision = c.route(None).unwrap();
        let guard = c.router.begin_request(&decision);

        c.store.contexts().remove(decision.context).unwrap();
        let reused = c
            .store
            .contexts()
            .insert_or_update(
                Context {
                    path: "/other".to_string(),
                    vhost: 1,
                    node: id,
                    status: ContextStatus::Enabled,
                    ..Context::default()
                },
                2,
            )
            .unwrap();
        assert_eq!(reused, decision.context);
        c.store.contexts().adjust_requests(reused, 1).unwrap();

        drop(guard);
        assert_eq!(c.store.contexts().read(reused).unwrap().nbrequests, 1);
        assert_eq!(c.stats(id).busy(), 0);
    }

    #[tokio::test]
    async fn route_waiting_gives_up_after_timeout() {
        let c = Cluster::new(0);
        c.balancer(Balancer {
            name: "mycluster".to_string(),
            timeout_secs: 0,
            ..Balancer::default()
        });
        let id = c.node("node1", 8009, "", ContextStatus::Enabled);
        c.router.registry().sync(&c.store);
        c.stats(id).mark_error(epoch_millis());
        let request = RouteRequest {
            uri: "/app",
            ..RouteRequest::default()
        };
        assert!(matches!(
            c.router.route_waiting(&request).await,
            Err(RouteError::Unavailable(_))
        ));
    }
}
