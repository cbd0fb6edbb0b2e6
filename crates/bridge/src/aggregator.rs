//! Capability aggregation and namespacing across backends.
//!
//! The aggregator maintains an immutable snapshot of the union view: the
//! namespaced tool/resource/prompt lists, a reverse index from exposed names
//! to owning backends, and the synthesized capability descriptor. Readers
//! grab the current snapshot without blocking; rebuilds publish a new one.
//!
//! On-wire names are `<ns>.<original>` for tools and prompts and
//! `<ns>://<original-uri>` for resources.

use crate::config::{BridgeSettings, ConflictResolution, ServerConfig};
use crate::supervisor::{BackendSet, BackendStatus, CapabilityKind};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;

/// Where an exposed name leads: the owning backend and the original name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteTarget {
    pub server: String,
    pub original: String,
}

/// Immutable union view published by [`Aggregator::rebuild`].
#[derive(Debug, Default)]
pub struct Snapshot {
    pub tools: Vec<Value>,
    pub resources: Vec<Value>,
    pub resource_templates: Vec<Value>,
    pub prompts: Vec<Value>,
    pub capabilities: Value,
    tool_routes: HashMap<String, RouteTarget>,
    resource_routes: HashMap<String, RouteTarget>,
    prompt_routes: HashMap<String, RouteTarget>,
    resource_namespaces: Vec<(String, String)>,
    prompt_namespaces: Vec<(String, String)>,
    priority_order: Vec<String>,
}

impl Snapshot {
    pub fn route_tool(&self, name: &str) -> Option<RouteTarget> {
        self.tool_routes.get(name).cloned()
    }

    /// Resolve an exposed URI. Unlisted URIs (resource templates expand to
    /// these) are resolved by their namespace scheme.
    pub fn route_resource(&self, uri: &str) -> Option<RouteTarget> {
        if let Some(target) = self.resource_routes.get(uri) {
            return Some(target.clone());
        }
        let (ns, rest) = uri.split_once("://")?;
        self.resource_namespaces
            .iter()
            .find(|(namespace, _)| namespace == ns)
            .map(|(_, server)| RouteTarget {
                server: server.clone(),
                original: rest.to_string(),
            })
    }

    pub fn route_prompt(&self, name: &str) -> Option<RouteTarget> {
        if let Some(target) = self.prompt_routes.get(name) {
            return Some(target.clone());
        }
        let (ns, rest) = name.split_once('.')?;
        self.prompt_namespaces
            .iter()
            .find(|(namespace, _)| namespace == ns)
            .map(|(_, server)| RouteTarget {
                server: server.clone(),
                original: rest.to_string(),
            })
    }

    /// Backend names ordered by priority (ties lexicographic), for requests
    /// that carry no recognizable namespace.
    pub fn priority_order(&self) -> &[String] {
        &self.priority_order
    }
}

pub fn rename(original: &str, namespace: &str, kind: CapabilityKind) -> String {
    match kind {
        CapabilityKind::Resources => format!("{namespace}://{original}"),
        _ => format!("{namespace}.{original}"),
    }
}

pub fn unrename(exposed: &str, namespace: &str, kind: CapabilityKind) -> Option<String> {
    match kind {
        CapabilityKind::Resources => exposed
            .strip_prefix(&format!("{namespace}://"))
            .map(str::to_string),
        _ => exposed
            .strip_prefix(&format!("{namespace}."))
            .map(str::to_string),
    }
}

/// The effective namespace of one backend for one capability kind.
pub fn effective_namespace(
    server: &str,
    config: &ServerConfig,
    settings: &BridgeSettings,
    kind: CapabilityKind,
) -> Option<String> {
    let explicit = match kind {
        CapabilityKind::Tools => &config.tool_namespace,
        CapabilityKind::Resources => &config.resource_namespace,
        CapabilityKind::Prompts => &config.prompt_namespace,
    };
    if let Some(ns) = explicit {
        if !ns.trim().is_empty() {
            return Some(ns.clone());
        }
    }
    // The namespace conflict policy forces default namespaces on.
    if settings.default_namespace
        || settings.conflict_resolution == ConflictResolution::Namespace
    {
        return Some(server.to_string());
    }
    None
}

struct Candidate {
    exposed: String,
    server: String,
    original: String,
    priority: i64,
    config_index: usize,
    item: Value,
}

pub struct Aggregator {
    settings: BridgeSettings,
    snapshot: parking_lot::RwLock<Arc<Snapshot>>,
}

impl Aggregator {
    pub fn new(settings: BridgeSettings) -> Self {
        Self {
            settings,
            snapshot: parking_lot::RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    pub fn settings(&self) -> &BridgeSettings {
        &self.settings
    }

    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.snapshot.read().clone()
    }

    /// Re-union capabilities from all connected backends and publish a new
    /// snapshot.
    pub fn rebuild(&self, backends: &BackendSet) {
        let mut next = Snapshot::default();

        let active: Vec<_> = backends
            .iter()
            .enumerate()
            .filter(|(_, b)| b.status() == BackendStatus::Connected)
            .collect();

        let mut order: Vec<(i64, String)> = active
            .iter()
            .map(|(_, b)| (b.config().priority, b.name().to_string()))
            .collect();
        order.sort();
        next.priority_order = order.into_iter().map(|(_, name)| name).collect();

        if self.settings.aggregation.tools {
            let (items, routes) = self.union(&active, CapabilityKind::Tools);
            next.tools = items;
            next.tool_routes = routes;
        }
        if self.settings.aggregation.resources {
            let (items, routes) = self.union(&active, CapabilityKind::Resources);
            next.resources = items;
            next.resource_routes = routes;
            next.resource_templates = self.union_templates(&active);
            next.resource_namespaces = active
                .iter()
                .filter_map(|(_, b)| {
                    effective_namespace(
                        b.name(),
                        b.config(),
                        &self.settings,
                        CapabilityKind::Resources,
                    )
                    .map(|ns| (ns, b.name().to_string()))
                })
                .collect();
        }
        if self.settings.aggregation.prompts {
            let (items, routes) = self.union(&active, CapabilityKind::Prompts);
            next.prompts = items;
            next.prompt_routes = routes;
            next.prompt_namespaces = active
                .iter()
                .filter_map(|(_, b)| {
                    effective_namespace(
                        b.name(),
                        b.config(),
                        &self.settings,
                        CapabilityKind::Prompts,
                    )
                    .map(|ns| (ns, b.name().to_string()))
                })
                .collect();
        }

        next.capabilities = synthesize_capabilities(&active);

        tracing::debug!(
            tools = next.tools.len(),
            resources = next.resources.len(),
            prompts = next.prompts.len(),
            backends = active.len(),
            "aggregate registry rebuilt"
        );
        *self.snapshot.write() = Arc::new(next);
    }

    fn union(
        &self,
        active: &[(usize, &Arc<crate::supervisor::ManagedBackend>)],
        kind: CapabilityKind,
    ) -> (Vec<Value>, HashMap<String, RouteTarget>) {
        let (items_of, name_key): (fn(&crate::supervisor::CapabilityCache) -> &Vec<Value>, &str) =
            match kind {
                CapabilityKind::Tools => (|c| &c.tools, "name"),
                CapabilityKind::Resources => (|c| &c.resources, "uri"),
                CapabilityKind::Prompts => (|c| &c.prompts, "name"),
            };

        let mut candidates: Vec<Candidate> = Vec::new();
        for (config_index, backend) in active {
            let caps = backend.capabilities();
            let ns = effective_namespace(backend.name(), backend.config(), &self.settings, kind);
            for item in items_of(&caps) {
                let Some(original) = item.get(name_key).and_then(Value::as_str) else {
                    continue;
                };
                let exposed = match &ns {
                    Some(ns) => rename(original, ns, kind),
                    None => original.to_string(),
                };
                let mut item = item.clone();
                item[name_key] = json!(exposed);
                candidates.push(Candidate {
                    exposed,
                    server: backend.name().to_string(),
                    original: original.to_string(),
                    priority: backend.config().priority,
                    config_index: *config_index,
                    item,
                });
            }
        }

        self.resolve(candidates, kind)
    }

    /// Apply the conflict policy and produce the final list plus routes.
    fn resolve(
        &self,
        candidates: Vec<Candidate>,
        kind: CapabilityKind,
    ) -> (Vec<Value>, HashMap<String, RouteTarget>) {
        let mut groups: HashMap<&str, Vec<usize>> = HashMap::new();
        for (i, c) in candidates.iter().enumerate() {
            groups.entry(&c.exposed).or_default().push(i);
        }

        // Decide a winner per exposed name. `namespace` resolves almost all
        // conflicts by construction; residual collisions fall through to
        // priority.
        let mut winner: HashMap<&str, Option<usize>> = HashMap::new();
        for (&exposed, indices) in &groups {
            if indices.len() == 1 {
                winner.insert(exposed, Some(indices[0]));
                continue;
            }
            let policy = match self.settings.conflict_resolution {
                ConflictResolution::Namespace => ConflictResolution::Priority,
                other => other,
            };
            let chosen = match policy {
                ConflictResolution::Priority => indices.iter().copied().min_by_key(|&i| {
                    (candidates[i].priority, candidates[i].server.clone())
                }),
                ConflictResolution::First => {
                    indices.iter().copied().min_by_key(|&i| candidates[i].config_index)
                }
                ConflictResolution::Error => {
                    let owners: Vec<_> =
                        indices.iter().map(|&i| candidates[i].server.as_str()).collect();
                    tracing::error!(
                        name = %exposed,
                        kind = ?kind,
                        owners = ?owners,
                        "aggregated name conflict with conflictResolution=error; excluding all"
                    );
                    None
                }
                ConflictResolution::Namespace => unreachable!(),
            };
            winner.insert(exposed, chosen);
        }

        let mut items = Vec::new();
        let mut routes = HashMap::new();
        for (i, candidate) in candidates.iter().enumerate() {
            if winner.get(candidate.exposed.as_str()) != Some(&Some(i)) {
                continue;
            }
            items.push(candidate.item.clone());
            routes.insert(
                candidate.exposed.clone(),
                RouteTarget {
                    server: candidate.server.clone(),
                    original: candidate.original.clone(),
                },
            );
        }
        (items, routes)
    }

    fn union_templates(
        &self,
        active: &[(usize, &Arc<crate::supervisor::ManagedBackend>)],
    ) -> Vec<Value> {
        let mut out = Vec::new();
        for (_, backend) in active {
            let caps = backend.capabilities();
            let ns = effective_namespace(
                backend.name(),
                backend.config(),
                &self.settings,
                CapabilityKind::Resources,
            );
            for template in &caps.resource_templates {
                let mut template = template.clone();
                let uri = template
                    .get("uriTemplate")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                if let (Some(ns), Some(uri)) = (&ns, uri) {
                    template["uriTemplate"] =
                        json!(rename(&uri, ns, CapabilityKind::Resources));
                }
                out.push(template);
            }
        }
        out
    }
}

fn synthesize_capabilities(
    active: &[(usize, &Arc<crate::supervisor::ManagedBackend>)],
) -> Value {
    let mut has_tools = false;
    let mut has_resources = false;
    let mut has_prompts = false;
    let mut has_logging = false;
    let mut subscribe = false;

    for (_, backend) in active {
        let caps = backend.capabilities();
        let server_caps = &caps.server_capabilities;
        has_tools |= server_caps.get("tools").is_some();
        has_prompts |= server_caps.get("prompts").is_some();
        has_logging |= server_caps.get("logging").is_some();
        if let Some(resources) = server_caps.get("resources") {
            has_resources = true;
            subscribe |= resources
                .get("subscribe")
                .and_then(Value::as_bool)
                .unwrap_or(false);
        }
    }

    let mut caps = serde_json::Map::new();
    if has_tools {
        caps.insert("tools".to_string(), json!({ "listChanged": true }));
    }
    if has_resources {
        caps.insert(
            "resources".to_string(),
            json!({ "listChanged": true, "subscribe": subscribe }),
        );
    }
    if has_prompts {
        caps.insert("prompts".to_string(), json!({ "listChanged": true }));
    }
    if has_logging {
        caps.insert("logging".to_string(), json!({}));
    }
    Value::Object(caps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AggregationConfig, FailoverConfig};
    use crate::session::ClientSession;
    use crate::supervisor::{BackendEvent, BackendSettings, CapabilityCache, ManagedBackend};
    use crate::transport::duplex;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    fn settings(resolution: ConflictResolution, default_namespace: bool) -> BridgeSettings {
        BridgeSettings {
            conflict_resolution: resolution,
            default_namespace,
            aggregation: AggregationConfig::default(),
            failover: FailoverConfig::default(),
        }
    }

    fn tool(name: &str) -> Value {
        json!({ "name": name, "description": format!("tool {name}"), "inputSchema": {"type": "object"} })
    }

    fn backend_with(
        name: &str,
        priority: i64,
        tools: Vec<Value>,
        resources: Vec<Value>,
    ) -> (
        Arc<ManagedBackend>,
        mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut config =
            crate::config::ServerConfig::stdio("cmd".to_string(), vec![], StdHashMap::new());
        config.priority = priority;
        let backend = ManagedBackend::new(
            name.to_string(),
            config,
            BackendSettings::default(),
            tx,
        );
        let (near, _far) = duplex::pair();
        let session = ClientSession::new(name.to_string(), Arc::new(near));
        backend.install_for_tests(
            session,
            CapabilityCache {
                server_info: json!({"name": name, "version": "0"}),
                server_capabilities: json!({"tools": {}, "resources": {}}),
                tools,
                resources,
                resource_templates: vec![],
                prompts: vec![],
            },
        );
        (backend, rx)
    }

    fn set_of(backends: Vec<Arc<ManagedBackend>>) -> Arc<BackendSet> {
        // BackendSet::new builds its own backends, so assemble through the
        // test constructor below instead.
        BackendSet::for_tests(backends)
    }

    #[tokio::test]
    async fn default_namespacing_unions_with_prefixes() {
        let (a, _ra) = backend_with("a", 100, vec![tool("search")], vec![]);
        let (b, _rb) = backend_with("b", 100, vec![tool("search")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::Namespace, true));
        agg.rebuild(&set);
        let snap = agg.snapshot();

        let names: Vec<_> = snap
            .tools
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["a.search", "b.search"]);

        let target = snap.route_tool("a.search").unwrap();
        assert_eq!(target.server, "a");
        assert_eq!(target.original, "search");
        assert!(snap.route_tool("search").is_none());
    }

    #[tokio::test]
    async fn priority_policy_picks_lower_priority_value() {
        let (a, _ra) = backend_with("a", 20, vec![tool("search")], vec![]);
        let (b, _rb) = backend_with("b", 10, vec![tool("search")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::Priority, false));
        agg.rebuild(&set);
        let snap = agg.snapshot();

        assert_eq!(snap.tools.len(), 1);
        assert_eq!(snap.route_tool("search").unwrap().server, "b");
    }

    #[tokio::test]
    async fn priority_ties_break_lexicographically() {
        let (a, _ra) = backend_with("zeta", 10, vec![tool("search")], vec![]);
        let (b, _rb) = backend_with("alpha", 10, vec![tool("search")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::Priority, false));
        agg.rebuild(&set);
        assert_eq!(
            agg.snapshot().route_tool("search").unwrap().server,
            "alpha"
        );
    }

    #[tokio::test]
    async fn first_policy_keeps_config_order_winner() {
        let (a, _ra) = backend_with("second-by-name", 100, vec![tool("search")], vec![]);
        let (b, _rb) = backend_with("a-first-by-name", 100, vec![tool("search")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::First, false));
        agg.rebuild(&set);
        assert_eq!(
            agg.snapshot().route_tool("search").unwrap().server,
            "second-by-name"
        );
    }

    #[tokio::test]
    async fn error_policy_excludes_both_sides() {
        let (a, _ra) = backend_with("a", 100, vec![tool("search"), tool("only-a")], vec![]);
        let (b, _rb) = backend_with("b", 100, vec![tool("search")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::Error, false));
        agg.rebuild(&set);
        let snap = agg.snapshot();
        assert!(snap.route_tool("search").is_none());
        assert_eq!(snap.route_tool("only-a").unwrap().server, "a");
    }

    #[tokio::test]
    async fn resource_uris_round_trip_through_namespace() {
        let uri = "file:///tmp/data.txt";
        let (a, _ra) = backend_with(
            "fs",
            100,
            vec![],
            vec![json!({ "uri": uri, "name": "data" })],
        );
        let set = set_of(vec![a]);

        let agg = Aggregator::new(settings(ConflictResolution::Namespace, true));
        agg.rebuild(&set);
        let snap = agg.snapshot();

        let exposed = rename(uri, "fs", CapabilityKind::Resources);
        assert_eq!(snap.resources[0]["uri"], json!(exposed.clone()));
        assert_eq!(unrename(&exposed, "fs", CapabilityKind::Resources).unwrap(), uri);

        let target = snap.route_resource(&exposed).unwrap();
        assert_eq!(target.server, "fs");
        assert_eq!(target.original, uri);

        // Unlisted URIs under the namespace still resolve by scheme.
        let other = snap.route_resource("fs://file:///tmp/other.txt").unwrap();
        assert_eq!(other.server, "fs");
        assert_eq!(other.original, "file:///tmp/other.txt");
    }

    #[tokio::test]
    async fn union_is_permutation_of_renamed_inputs() {
        let (a, _ra) = backend_with("a", 100, vec![tool("t1"), tool("t2")], vec![]);
        let (b, _rb) = backend_with("b", 100, vec![tool("t2"), tool("t3")], vec![]);
        let set = set_of(vec![a, b]);

        let agg = Aggregator::new(settings(ConflictResolution::Namespace, true));
        agg.rebuild(&set);
        let mut names: Vec<_> = agg
            .snapshot()
            .tools
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["a.t1", "a.t2", "b.t2", "b.t3"]);
    }

    #[tokio::test]
    async fn capability_descriptor_reflects_backend_union() {
        let (a, _ra) = backend_with("a", 100, vec![tool("t")], vec![]);
        let set = set_of(vec![a]);
        let agg = Aggregator::new(settings(ConflictResolution::Namespace, true));
        agg.rebuild(&set);
        let caps = agg.snapshot().capabilities.clone();
        assert!(caps.get("tools").is_some());
        assert!(caps.get("resources").is_some());
        assert!(caps.get("prompts").is_none());
        assert!(caps.get("logging").is_none());
    }
}
