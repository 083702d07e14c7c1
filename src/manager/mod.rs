//! Provider registry, health-aware routing, and circuit breaking.
//!
//! [`ProviderManager`] owns every provider instance plus the routing
//! table, fallback chain, health cache, and per-provider circuit state.
//! All mutation goes through its operations; callers hold only ids.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::{BreakerConfig, Config, HealthCheckConfig, ProviderEntry};
use crate::failover::FailoverReason;
use crate::providers::{build_provider, Action, Provider};

// ---------------------------------------------------------------------------
// Selection options / outcomes
// ---------------------------------------------------------------------------

/// Options for [`ProviderManager::select_best`].
#[derive(Debug, Clone, Default)]
pub struct SelectOptions<'a> {
    /// Pin selection to a configured tier ("fast" / "quality") first.
    pub tier: Option<&'a str>,
    /// Skip providers that cannot join tool-call loops.
    pub require_tools: bool,
}

/// Result of [`ProviderManager::register_discovered_provider`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveredRegistration {
    /// False when an existing registration was replaced.
    pub created: bool,
}

// ---------------------------------------------------------------------------
// Internal state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
struct CircuitState {
    consecutive_failures: u32,
    cooldown_until: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct HealthEntry {
    ok: bool,
    checked_at: i64,
}

struct Inner {
    providers: HashMap<String, Arc<dyn Provider>>,
    routing: HashMap<String, String>,
    default_provider: Option<String>,
    fallback_chain: Vec<String>,
    tiers: HashMap<String, String>,
    fallback_from_fast: bool,
    /// Ids registered through the discovery path; lowest priority
    /// group regardless of id prefix.
    discovered: HashSet<String>,
    health_cache: HashMap<String, HealthEntry>,
    circuit: HashMap<String, CircuitState>,
}

impl Inner {
    fn is_cooling(&self, id: &str, now: i64) -> bool {
        self.circuit
            .get(id)
            .and_then(|c| c.cooldown_until)
            .is_some_and(|until| until > now)
    }

    fn failures(&self, id: &str) -> u32 {
        self.circuit
            .get(id)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0)
    }

    /// Priority group for the general candidate sweep:
    /// local (0) > configured (1) > discovered (2).
    fn priority_group(&self, id: &str) -> u8 {
        if self.discovered.contains(id) || id.starts_with("backup:") || id.starts_with("discovered:")
        {
            2
        } else if id.starts_with("local:") {
            0
        } else {
            1
        }
    }
}

// ---------------------------------------------------------------------------
// ProviderManager
// ---------------------------------------------------------------------------

/// Registry of providers with health-cached, priority-ordered
/// selection and circuit-breaker cooldowns.
pub struct ProviderManager {
    inner: RwLock<Inner>,
    breaker: BreakerConfig,
    health: HealthCheckConfig,
}

impl ProviderManager {
    /// Create an empty manager with the given breaker/health settings.
    pub fn new(breaker: BreakerConfig, health: HealthCheckConfig) -> Self {
        Self {
            inner: RwLock::new(Inner {
                providers: HashMap::new(),
                routing: HashMap::new(),
                default_provider: None,
                fallback_chain: Vec::new(),
                tiers: HashMap::new(),
                fallback_from_fast: true,
                discovered: HashSet::new(),
                health_cache: HashMap::new(),
                circuit: HashMap::new(),
            }),
            breaker,
            health,
        }
    }

    /// Build a manager from loaded configuration, registering every
    /// configured provider. Providers that fail to construct are
    /// skipped with a warning so one bad entry cannot block startup.
    pub async fn from_config(cfg: &Config) -> Self {
        let manager = Self::new(cfg.breaker.clone(), cfg.health_check.clone());
        {
            let mut inner = manager.inner.write().await;
            inner.routing = cfg.routing.actions.clone();
            inner.default_provider = cfg.routing.default_provider.clone();
            inner.fallback_chain = cfg.routing.fallback_chain.clone();
            inner.tiers = cfg.routing.tiers.clone();
            inner.fallback_from_fast = cfg.routing.fallback_from_fast;
        }
        for (id, entry) in &cfg.providers {
            if let Err(e) = manager.register(id, entry).await {
                warn!(provider_id = %id, error = %e, "skipping misconfigured provider");
            }
        }
        manager
    }

    // -- registration -------------------------------------------------------

    /// Construct and insert the provider for `id`. Re-registering
    /// replaces the previous instance and clears its cached state.
    pub async fn register(&self, id: &str, entry: &ProviderEntry) -> anyhow::Result<()> {
        let provider = build_provider(id, entry)?;
        let mut inner = self.inner.write().await;
        inner.providers.insert(id.to_string(), provider);
        inner.health_cache.remove(id);
        inner.circuit.remove(id);
        debug!(provider_id = %id, "provider registered");
        Ok(())
    }

    /// Insert an already-built provider instance under `id`. Useful
    /// for embedding custom backends; config-driven callers use
    /// [`register`](Self::register).
    pub async fn register_instance(&self, id: &str, provider: Arc<dyn Provider>) {
        let mut inner = self.inner.write().await;
        inner.providers.insert(id.to_string(), provider);
        inner.health_cache.remove(id);
        inner.circuit.remove(id);
        debug!(provider_id = %id, "provider instance registered");
    }

    /// Register a provider found by discovery. Discovered providers
    /// sit in the lowest priority group; when `ensure_fallback_chain`
    /// is set the id is also appended to the chain if absent.
    pub async fn register_discovered_provider(
        &self,
        id: &str,
        entry: &ProviderEntry,
        ensure_fallback_chain: bool,
    ) -> anyhow::Result<DiscoveredRegistration> {
        let provider = build_provider(id, entry)?;
        let mut inner = self.inner.write().await;
        let created = !inner.providers.contains_key(id);
        inner.providers.insert(id.to_string(), provider);
        inner.discovered.insert(id.to_string());
        inner.health_cache.remove(id);
        inner.circuit.remove(id);
        if ensure_fallback_chain && !inner.fallback_chain.iter().any(|c| c == id) {
            inner.fallback_chain.push(id.to_string());
        }
        debug!(provider_id = %id, created, "discovered provider registered");
        Ok(DiscoveredRegistration { created })
    }

    /// Remove a provider and every trace of it: health cache, circuit
    /// state, fallback chain membership. Returns whether an entry
    /// existed.
    pub async fn unregister(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        let existed = inner.providers.remove(id).is_some();
        inner.health_cache.remove(id);
        inner.circuit.remove(id);
        inner.discovered.remove(id);
        inner.fallback_chain.retain(|c| c != id);
        if existed {
            debug!(provider_id = %id, "provider unregistered");
        }
        existed
    }

    /// Ids currently registered, in no particular order.
    pub async fn registered_ids(&self) -> Vec<String> {
        self.inner.read().await.providers.keys().cloned().collect()
    }

    /// Current fallback chain (for tests and the discovery service).
    pub async fn fallback_chain(&self) -> Vec<String> {
        self.inner.read().await.fallback_chain.clone()
    }

    // -- resolution ---------------------------------------------------------

    /// Resolve the routed provider for an action without health
    /// probing: `routing[action]` else the default provider, else the
    /// first non-cooling fallback. Fails with `no_provider` when the
    /// chain exhausts.
    pub async fn get_provider(&self, action: Action) -> anyhow::Result<Arc<dyn Provider>> {
        let inner = self.inner.read().await;
        let now = crate::utils::now_ms();

        let routed = inner
            .routing
            .get(action.as_str())
            .or(inner.default_provider.as_ref());
        if let Some(id) = routed {
            if let Some(p) = inner.providers.get(id) {
                if !inner.is_cooling(id, now) {
                    return Ok(p.clone());
                }
            }
        }
        for id in &inner.fallback_chain {
            if let Some(p) = inner.providers.get(id) {
                if !inner.is_cooling(id, now) {
                    return Ok(p.clone());
                }
            }
        }
        anyhow::bail!("no_provider for action {action}")
    }

    /// Ordered candidate ids for `select_best`, deduplicated.
    async fn candidate_order(&self, action: Action, opts: &SelectOptions<'_>) -> Vec<String> {
        let inner = self.inner.read().await;
        let now = crate::utils::now_ms();

        let mut seen: HashSet<String> = HashSet::new();
        let mut order: Vec<String> = Vec::new();
        let push = |id: &str, seen: &mut HashSet<String>, order: &mut Vec<String>| {
            if inner.providers.contains_key(id) && seen.insert(id.to_string()) {
                order.push(id.to_string());
            }
        };

        // 1. Tier pin.
        if let Some(tier) = opts.tier {
            if let Some(id) = inner.tiers.get(tier) {
                push(id, &mut seen, &mut order);
            }
        }
        // 2. Routed provider.
        if let Some(id) = inner
            .routing
            .get(action.as_str())
            .or(inner.default_provider.as_ref())
        {
            push(id, &mut seen, &mut order);
        }
        // 3. Quality escalation from the fast tier.
        if opts.tier == Some("fast") && inner.fallback_from_fast {
            if let Some(id) = inner.tiers.get("quality") {
                push(id, &mut seen, &mut order);
            }
        }
        // 4. Fallback chain.
        for id in &inner.fallback_chain {
            push(id, &mut seen, &mut order);
        }
        // 5. Everything else: local > configured > discovered, then
        //    (cooling asc, failures asc, id lex).
        let mut rest: Vec<&String> = inner
            .providers
            .keys()
            .filter(|id| !seen.contains(*id))
            .collect();
        rest.sort_by(|a, b| {
            let ga = inner.priority_group(a);
            let gb = inner.priority_group(b);
            ga.cmp(&gb)
                .then_with(|| {
                    inner
                        .is_cooling(a, now)
                        .cmp(&inner.is_cooling(b, now))
                })
                .then_with(|| inner.failures(a).cmp(&inner.failures(b)))
                .then_with(|| a.cmp(b))
        });
        for id in rest {
            order.push(id.clone());
        }
        order
    }

    /// Walk the candidate list and return the first healthy provider.
    ///
    /// Cooling providers are skipped, as are non-tool-capable ones when
    /// `require_tools` is set. Health comes from the cache when fresh,
    /// otherwise from a probe bounded by `health_check.timeout_ms`;
    /// probe results are cached for `health_check.cache_ttl_ms`. Probe
    /// exceptions count as unhealthy and never propagate.
    pub async fn select_best(
        &self,
        action: Action,
        opts: SelectOptions<'_>,
    ) -> anyhow::Result<Arc<dyn Provider>> {
        let order = self.candidate_order(action, &opts).await;

        for id in &order {
            let (provider, cached) = {
                let inner = self.inner.read().await;
                let now = crate::utils::now_ms();
                let Some(provider) = inner.providers.get(id) else {
                    continue;
                };
                if inner.is_cooling(id, now) {
                    debug!(provider_id = %id, "skipping cooling provider");
                    continue;
                }
                if opts.require_tools && !provider.supports_tools() {
                    debug!(provider_id = %id, "skipping non-tool-capable provider");
                    continue;
                }
                let cached = inner
                    .health_cache
                    .get(id)
                    .filter(|h| now - h.checked_at < self.health.cache_ttl_ms)
                    .map(|h| h.ok);
                (provider.clone(), cached)
            };

            let healthy = match cached {
                Some(ok) => ok,
                None => {
                    let probe = tokio::time::timeout(
                        Duration::from_millis(self.health.timeout_ms),
                        provider.health(),
                    )
                    .await;
                    let ok = probe.unwrap_or(false);
                    let mut inner = self.inner.write().await;
                    inner.health_cache.insert(
                        id.clone(),
                        HealthEntry {
                            ok,
                            checked_at: crate::utils::now_ms(),
                        },
                    );
                    ok
                }
            };

            if healthy {
                return Ok(provider);
            }
        }

        anyhow::bail!("no_healthy_provider for action {action}")
    }

    /// Whether any provider is selectable for chat right now.
    pub async fn has_healthy_provider(&self) -> bool {
        self.select_best(Action::Chat, SelectOptions::default())
            .await
            .is_ok()
    }

    // -- circuit breaker ----------------------------------------------------

    /// Record a failure for `id`. Returns `true` when this call opened
    /// the breaker (first transition into cooldown).
    pub async fn record_failure(&self, id: &str, reason: Option<FailoverReason>) -> bool {
        let mut inner = self.inner.write().await;
        let now = crate::utils::now_ms();
        let was_cooling = inner.is_cooling(id, now);

        let state = inner.circuit.entry(id.to_string()).or_default();
        state.consecutive_failures += 1;
        let attempts = state.consecutive_failures;
        let cooldown = (self.breaker.base_ms.saturating_mul(1_i64 << (attempts - 1).min(31)))
            .min(self.breaker.cap_ms);
        state.cooldown_until = Some(now + cooldown);

        let opened = !was_cooling;
        warn!(
            provider_id = %id,
            reason = reason.map(|r| r.as_str()).unwrap_or("unknown"),
            consecutive_failures = attempts,
            cooldown_ms = cooldown,
            opened,
            "provider failure recorded"
        );
        opened
    }

    /// Record a success for `id`, clearing cooldown and failure count.
    /// Returns `true` when the provider was recovering (had state).
    pub async fn record_success(&self, id: &str) -> bool {
        let mut inner = self.inner.write().await;
        match inner.circuit.remove(id) {
            Some(state) => {
                let recovering =
                    state.consecutive_failures > 0 || state.cooldown_until.is_some();
                if recovering {
                    info!(provider_id = %id, "provider recovered");
                }
                recovering
            }
            None => false,
        }
    }

    /// Whether `id` is currently inside a cooldown window.
    pub async fn is_cooling(&self, id: &str) -> bool {
        let inner = self.inner.read().await;
        inner.is_cooling(id, crate::utils::now_ms())
    }

    /// Consecutive failure count for `id`.
    pub async fn failure_count(&self, id: &str) -> u32 {
        self.inner.read().await.failures(id)
    }

    // -- hot reload ---------------------------------------------------------

    /// Replace the routing table atomically. Clears the health cache so
    /// stale health cannot keep a demoted provider alive. In-flight
    /// calls keep the provider instance they already resolved.
    pub async fn update_routing(&self, next: HashMap<String, String>) {
        let mut inner = self.inner.write().await;
        inner.routing = next;
        inner.health_cache.clear();
        info!("routing table updated");
    }

    /// Replace the fallback chain atomically; same cache semantics as
    /// [`update_routing`](Self::update_routing).
    pub async fn update_fallback_chain(&self, next: Vec<String>) {
        let mut inner = self.inner.write().await;
        if inner.fallback_chain == next {
            return;
        }
        inner.fallback_chain = next;
        inner.health_cache.clear();
        info!(len = inner.fallback_chain.len(), "fallback chain updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{ChatMessage, ChatOptions, ChatResponse};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// In-memory provider with settable health and tool support.
    struct FakeProvider {
        id: String,
        healthy: AtomicBool,
        tools: bool,
        probes: AtomicU32,
    }

    impl FakeProvider {
        fn new(id: &str, healthy: bool, tools: bool) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                healthy: AtomicBool::new(healthy),
                tools,
                probes: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Provider for FakeProvider {
        fn id(&self) -> &str {
            &self.id
        }
        fn model(&self) -> &str {
            "fake"
        }
        fn supports_tools(&self) -> bool {
            self.tools
        }
        async fn chat(
            &self,
            _messages: &[ChatMessage],
            _options: &ChatOptions,
        ) -> anyhow::Result<ChatResponse> {
            Ok(ChatResponse {
                content: "ok".into(),
                ..ChatResponse::default()
            })
        }
        async fn health(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst);
            self.healthy.load(Ordering::SeqCst)
        }
    }

    async fn manager_with(providers: Vec<Arc<FakeProvider>>) -> ProviderManager {
        let m = ProviderManager::new(BreakerConfig::default(), HealthCheckConfig::default());
        {
            let mut inner = m.inner.write().await;
            for p in providers {
                inner.providers.insert(p.id.clone(), p);
            }
        }
        m
    }

    #[tokio::test]
    async fn select_best_skips_non_tool_capable() {
        // Spec scenario: routing pins chat to a CLI provider; asking
        // for tools must fall through to the HTTP one.
        let lmstudio = FakeProvider::new("lmstudio", true, true);
        let cli = FakeProvider::new("cli", true, false);
        let m = manager_with(vec![lmstudio, cli.clone()]).await;
        m.update_routing(HashMap::from([("chat".to_string(), "cli".to_string())]))
            .await;

        let picked = m
            .select_best(
                Action::Chat,
                SelectOptions {
                    require_tools: true,
                    ..SelectOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(picked.id(), "lmstudio");
    }

    #[tokio::test]
    async fn health_results_are_cached() {
        let p = FakeProvider::new("a", true, true);
        let m = manager_with(vec![p.clone()]).await;

        m.select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap();
        m.select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(p.probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn breaker_opens_and_skips_provider() {
        let a = FakeProvider::new("a", true, true);
        let b = FakeProvider::new("b", true, true);
        let m = manager_with(vec![a, b]).await;
        m.update_routing(HashMap::from([("chat".to_string(), "a".to_string())]))
            .await;

        assert!(m.record_failure("a", Some(FailoverReason::RateLimit)).await);
        // Further failures extend the cooldown without re-opening.
        assert!(!m.record_failure("a", None).await);
        assert!(m.is_cooling("a").await);
        assert_eq!(m.failure_count("a").await, 2);

        let picked = m
            .select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(picked.id(), "b");

        assert!(m.record_success("a").await);
        assert!(!m.is_cooling("a").await);
        assert_eq!(m.failure_count("a").await, 0);
    }

    #[tokio::test]
    async fn exhausted_chain_reports_no_healthy_provider() {
        let a = FakeProvider::new("a", false, true);
        let m = manager_with(vec![a]).await;
        let err = m
            .select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no_healthy_provider"));
    }

    #[tokio::test]
    async fn unregister_clears_all_traces() {
        let a = FakeProvider::new("a", true, true);
        let m = manager_with(vec![a]).await;
        m.update_fallback_chain(vec!["a".into()]).await;
        m.record_failure("a", None).await;
        m.select_best(Action::Chat, SelectOptions::default())
            .await
            .ok();

        assert!(m.unregister("a").await);
        assert!(!m.unregister("a").await);
        let inner = m.inner.read().await;
        assert!(inner.providers.is_empty());
        assert!(inner.health_cache.is_empty());
        assert!(inner.circuit.is_empty());
        assert!(inner.fallback_chain.is_empty());
    }

    #[tokio::test]
    async fn candidate_order_prefers_local_over_discovered() {
        let local = FakeProvider::new("local:llama", true, true);
        let configured = FakeProvider::new("hosted", true, true);
        let backup = FakeProvider::new("backup:spare", true, true);
        let m = manager_with(vec![backup, configured, local]).await;

        let order = m
            .candidate_order(Action::Chat, &SelectOptions::default())
            .await;
        assert_eq!(order, vec!["local:llama", "hosted", "backup:spare"]);
    }

    #[tokio::test]
    async fn fast_tier_escalates_to_quality() {
        let fast = FakeProvider::new("fast-p", false, true);
        let quality = FakeProvider::new("quality-p", true, true);
        let m = manager_with(vec![fast, quality]).await;
        {
            let mut inner = m.inner.write().await;
            inner.tiers =
                HashMap::from([("fast".into(), "fast-p".into()), ("quality".into(), "quality-p".into())]);
        }

        let picked = m
            .select_best(
                Action::Chat,
                SelectOptions {
                    tier: Some("fast"),
                    ..SelectOptions::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(picked.id(), "quality-p");
    }

    #[tokio::test]
    async fn updating_fallback_chain_is_idempotent() {
        let a = FakeProvider::new("a", true, true);
        let m = manager_with(vec![a.clone()]).await;
        m.update_fallback_chain(vec!["a".into()]).await;
        // Prime the cache, then reapply the same chain: cache survives.
        m.select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap();
        m.update_fallback_chain(vec!["a".into()]).await;
        m.select_best(Action::Chat, SelectOptions::default())
            .await
            .unwrap();
        assert_eq!(a.probes.load(Ordering::SeqCst), 1);
        assert_eq!(m.fallback_chain().await, vec!["a".to_string()]);
    }
}
