//! Provider discovery and the overlay health loop.
//!
//! Discovery probes candidate provider configs with a canned chat
//! request, scores them, and persists the survivors as an overlay
//! (`providers.json`). Applying the overlay registers the discovered
//! providers with the [`ProviderManager`] and rebuilds the fallback
//! chain as configured chain + discovered providers ordered by
//! locality and reliability.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, ProviderEntry, ProviderKind};
use crate::manager::ProviderManager;
use crate::providers::{build_provider, ChatMessage, ChatOptions};

/// Canned probe prompt; any non-empty reply within the deadline
/// counts.
const PROBE_PROMPT: &str = "Reply with a single word: PONG.";

/// Kill-switch honored by both discovery and the health loop.
const DISCOVERY_KILL_SWITCH: &str = "ANT_DISABLE_PROVIDER_DISCOVERY";

/// Current overlay schema version.
const OVERLAY_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Overlay records
// ---------------------------------------------------------------------------

/// Where a discovered provider runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlayKind {
    Local,
    Remote,
}

/// Outcome of the most recent probe of a discovered provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub ok: bool,
    pub checked_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One discovered provider in the overlay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderRecord {
    pub id: String,
    pub kind: OverlayKind,
    pub config: ProviderEntry,
    /// 0 when the last check failed, else
    /// `clamp(10, round(100 − latency_ms/100), 100)`.
    pub reliability_score: u8,
    pub consecutive_failures: u32,
    pub last_result: ProbeResult,
    /// Fields written by other (possibly newer) versions survive
    /// load/save untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Persisted snapshot of discovered providers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvidersOverlay {
    pub version: u32,
    pub generated_at: i64,
    pub providers: BTreeMap<String, ProviderRecord>,
}

impl Default for ProvidersOverlay {
    fn default() -> Self {
        Self {
            version: OVERLAY_VERSION,
            generated_at: crate::utils::now_ms(),
            providers: BTreeMap::new(),
        }
    }
}

/// Reliability score from probe outcome.
pub fn reliability_score(ok: bool, latency_ms: Option<i64>) -> u8 {
    if !ok {
        return 0;
    }
    let latency = latency_ms.unwrap_or(0) as f64;
    let raw = (100.0 - latency / 100.0).round();
    raw.clamp(10.0, 100.0) as u8
}

/// Locality of a candidate config for overlay bookkeeping.
fn record_kind(entry: &ProviderEntry) -> OverlayKind {
    match entry.kind {
        ProviderKind::Local | ProviderKind::Cli => OverlayKind::Local,
        ProviderKind::Openai => {
            let base = entry.base_url.as_deref().unwrap_or("");
            if base.contains("127.0.0.1") || base.contains("localhost") {
                OverlayKind::Local
            } else {
                OverlayKind::Remote
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Discovery mode: `Scheduled` probes the configured candidate set;
/// `Emergency` widens it with the known local endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryMode {
    Scheduled,
    Emergency,
}

/// Outcome of one discovery or health pass.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub ok: bool,
    pub error: Option<String>,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Total discovered providers after the pass.
    pub total: usize,
}

impl DiscoveryOutcome {
    fn disabled() -> Self {
        Self {
            ok: false,
            error: Some("provider_discovery_disabled".into()),
            ..Self::default()
        }
    }
}

/// Probes candidates, maintains the overlay file, and applies it to
/// the [`ProviderManager`].
pub struct ProviderDiscoveryService {
    cfg: DiscoveryConfig,
    overlay_path: PathBuf,
    manager: Arc<ProviderManager>,
    /// Configured fallback chain before any overlay contribution.
    base_chain: Vec<String>,
}

impl ProviderDiscoveryService {
    pub fn new(
        cfg: DiscoveryConfig,
        overlay_path: PathBuf,
        manager: Arc<ProviderManager>,
        base_chain: Vec<String>,
    ) -> Self {
        Self {
            cfg,
            overlay_path,
            manager,
            base_chain,
        }
    }

    /// True when discovery must not run: test environment, the
    /// kill-switch, or config.
    pub fn is_disabled(&self) -> bool {
        crate::utils::is_test_env()
            || crate::utils::env_flag(DISCOVERY_KILL_SWITCH)
            || !self.cfg.enabled
    }

    // -- overlay persistence ------------------------------------------------

    /// Load the overlay, dropping schema-invalid records.
    pub async fn load_overlay(&self) -> ProvidersOverlay {
        let raw = match fs::read_to_string(&self.overlay_path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return ProvidersOverlay::default()
            }
            Err(e) => {
                warn!(error = %e, "overlay unreadable, starting empty");
                return ProvidersOverlay::default();
            }
        };

        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "overlay is not valid JSON, starting empty");
                return ProvidersOverlay::default();
            }
        };

        let mut overlay = ProvidersOverlay {
            version: value["version"].as_u64().unwrap_or(OVERLAY_VERSION as u64) as u32,
            generated_at: value["generatedAt"]
                .as_i64()
                .unwrap_or_else(crate::utils::now_ms),
            providers: BTreeMap::new(),
        };
        if let Some(map) = value["providers"].as_object() {
            for (id, raw_record) in map {
                match serde_json::from_value::<ProviderRecord>(raw_record.clone()) {
                    Ok(record) => {
                        overlay.providers.insert(id.clone(), record);
                    }
                    Err(e) => {
                        warn!(provider_id = %id, error = %e, "dropping schema-invalid overlay record");
                    }
                }
            }
        }
        overlay
    }

    /// Persist the overlay atomically: write a temp file, copy the
    /// previous overlay to `.bak`, rename over the target.
    pub async fn save_overlay(&self, overlay: &ProvidersOverlay) -> anyhow::Result<()> {
        if let Some(parent) = self.overlay_path.parent() {
            fs::create_dir_all(parent).await.ok();
        }
        let tmp = self.overlay_path.with_extension("json.tmp");
        let bak = self.overlay_path.with_extension("json.bak");

        let json = serde_json::to_string_pretty(overlay).context("serialize overlay")?;
        fs::write(&tmp, json)
            .await
            .with_context(|| format!("write {}", tmp.display()))?;
        if fs::try_exists(&self.overlay_path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&self.overlay_path, &bak).await {
                warn!(error = %e, "overlay backup copy failed");
            }
        }
        fs::rename(&tmp, &self.overlay_path)
            .await
            .with_context(|| format!("rename {} into place", tmp.display()))?;
        Ok(())
    }

    // -- probing ------------------------------------------------------------

    /// Run the canned chat probe against one candidate config.
    pub async fn probe(&self, id: &str, entry: &ProviderEntry) -> ProbeResult {
        let started = std::time::Instant::now();
        let checked_at = crate::utils::now_ms();

        let provider = match build_provider(id, entry) {
            Ok(p) => p,
            Err(e) => {
                return ProbeResult {
                    ok: false,
                    checked_at,
                    latency_ms: None,
                    error: Some(e.to_string()),
                }
            }
        };

        let options = ChatOptions {
            temperature: Some(0.0),
            max_tokens: Some(10),
            timeout: Some(Duration::from_millis(self.cfg.probe_timeout_ms)),
            ..ChatOptions::default()
        };
        let messages = [ChatMessage::new("user", PROBE_PROMPT)];

        let outcome = tokio::time::timeout(
            Duration::from_millis(self.cfg.probe_timeout_ms),
            provider.chat(&messages, &options),
        )
        .await;

        let latency_ms = started.elapsed().as_millis() as i64;
        match outcome {
            Ok(Ok(resp)) if !resp.content.trim().is_empty() => ProbeResult {
                ok: true,
                checked_at,
                latency_ms: Some(latency_ms),
                error: None,
            },
            Ok(Ok(_)) => ProbeResult {
                ok: false,
                checked_at,
                latency_ms: Some(latency_ms),
                error: Some("empty probe reply".into()),
            },
            Ok(Err(e)) => ProbeResult {
                ok: false,
                checked_at,
                latency_ms: Some(latency_ms),
                error: Some(e.to_string()),
            },
            Err(_) => ProbeResult {
                ok: false,
                checked_at,
                latency_ms: None,
                error: Some("probe timeout".into()),
            },
        }
    }

    // -- discovery ----------------------------------------------------------

    /// Probe the candidate set and rewrite the overlay.
    ///
    /// Candidates that pass stay (or join) with fresh scores; known
    /// providers that fail accumulate `consecutive_failures` and drop
    /// out at the configured limit; unknown candidates that fail are
    /// not admitted.
    pub async fn run_discovery(&self, mode: DiscoveryMode) -> anyhow::Result<DiscoveryOutcome> {
        if self.is_disabled() {
            return Ok(DiscoveryOutcome::disabled());
        }
        info!(mode = ?mode, "provider discovery starting");

        let mut candidates: Vec<(String, ProviderEntry)> = self
            .cfg
            .candidates
            .iter()
            .map(|(id, e)| (id.clone(), e.clone()))
            .collect();
        if mode == DiscoveryMode::Emergency {
            for (id, entry) in &self.cfg.emergency_candidates {
                if !candidates.iter().any(|(c, _)| c == id) {
                    candidates.push((id.clone(), entry.clone()));
                }
            }
        }
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        let prev = self.load_overlay().await;
        let mut next = ProvidersOverlay {
            version: OVERLAY_VERSION,
            generated_at: crate::utils::now_ms(),
            providers: BTreeMap::new(),
        };

        for (id, entry) in candidates {
            let result = self.probe(&id, &entry).await;
            let prior_failures = prev
                .providers
                .get(&id)
                .map(|r| r.consecutive_failures)
                .unwrap_or(0);

            if result.ok {
                next.providers.insert(
                    id.clone(),
                    ProviderRecord {
                        id: id.clone(),
                        kind: record_kind(&entry),
                        reliability_score: reliability_score(true, result.latency_ms),
                        consecutive_failures: 0,
                        last_result: result,
                        config: entry,
                        extra: prev
                            .providers
                            .get(&id)
                            .map(|r| r.extra.clone())
                            .unwrap_or_default(),
                    },
                );
            } else if prev.providers.contains_key(&id) {
                let failures = prior_failures + 1;
                if failures < self.cfg.max_consecutive_failures {
                    let mut record = prev.providers[&id].clone();
                    record.consecutive_failures = failures;
                    record.reliability_score = 0;
                    record.last_result = result;
                    next.providers.insert(id.clone(), record);
                } else {
                    debug!(provider_id = %id, failures, "discovered provider dropped");
                }
            } else {
                debug!(provider_id = %id, "candidate failed probe, not admitted");
            }
        }

        let added: Vec<String> = next
            .providers
            .keys()
            .filter(|id| !prev.providers.contains_key(*id))
            .cloned()
            .collect();
        let removed: Vec<String> = prev
            .providers
            .keys()
            .filter(|id| !next.providers.contains_key(*id))
            .cloned()
            .collect();

        if let Err(e) = self.save_overlay(&next).await {
            // In-memory application still proceeds.
            warn!(error = %e, "overlay write failed");
        }
        self.apply_overlay(&prev, &next).await;

        info!(
            added = added.len(),
            removed = removed.len(),
            total = next.providers.len(),
            "provider discovery finished"
        );
        Ok(DiscoveryOutcome {
            ok: true,
            error: None,
            added,
            removed,
            total: next.providers.len(),
        })
    }

    /// Re-verify every overlay record; drop records at the failure
    /// limit; rewrite and reapply.
    pub async fn run_health_check(&self) -> anyhow::Result<DiscoveryOutcome> {
        if self.is_disabled() {
            return Ok(DiscoveryOutcome::disabled());
        }
        debug!("overlay health check starting");

        let prev = self.load_overlay().await;
        let mut next = ProvidersOverlay {
            version: OVERLAY_VERSION,
            generated_at: crate::utils::now_ms(),
            providers: BTreeMap::new(),
        };
        let mut removed = Vec::new();

        for (id, record) in &prev.providers {
            let result = self.probe(id, &record.config).await;
            if result.ok {
                let mut fresh = record.clone();
                fresh.consecutive_failures = 0;
                fresh.reliability_score = reliability_score(true, result.latency_ms);
                fresh.last_result = result;
                next.providers.insert(id.clone(), fresh);
            } else {
                let failures = record.consecutive_failures + 1;
                if failures >= self.cfg.max_consecutive_failures {
                    info!(provider_id = %id, failures, "removing unhealthy discovered provider");
                    removed.push(id.clone());
                } else {
                    let mut fresh = record.clone();
                    fresh.consecutive_failures = failures;
                    fresh.reliability_score = 0;
                    fresh.last_result = result;
                    next.providers.insert(id.clone(), fresh);
                }
            }
        }

        if let Err(e) = self.save_overlay(&next).await {
            warn!(error = %e, "overlay write failed");
        }
        self.apply_overlay(&prev, &next).await;

        Ok(DiscoveryOutcome {
            ok: true,
            error: None,
            added: Vec::new(),
            removed,
            total: next.providers.len(),
        })
    }

    // -- application --------------------------------------------------------

    /// Sync the manager with an overlay transition: unregister ids
    /// that disappeared, register the rest, rebuild the fallback
    /// chain.
    pub async fn apply_overlay(&self, prev: &ProvidersOverlay, next: &ProvidersOverlay) {
        for id in prev.providers.keys() {
            if !next.providers.contains_key(id) {
                self.manager.unregister(id).await;
            }
        }

        for (id, record) in &next.providers {
            if let Err(e) = self
                .manager
                .register_discovered_provider(id, &record.config, false)
                .await
            {
                warn!(provider_id = %id, error = %e, "discovered provider rejected");
            }
        }

        // Chain = configured base (overlay ids stripped) followed by
        // discovered providers, local first, most reliable first.
        let mut chain: Vec<String> = self
            .base_chain
            .iter()
            .filter(|id| !next.providers.contains_key(*id))
            .cloned()
            .collect();
        let mut discovered: Vec<&ProviderRecord> = next.providers.values().collect();
        discovered.sort_by(|a, b| {
            a.kind
                .cmp(&b.kind)
                .then_with(|| b.reliability_score.cmp(&a.reliability_score))
                .then_with(|| a.id.cmp(&b.id))
        });
        for record in discovered {
            if !chain.iter().any(|c| c == &record.id) {
                chain.push(record.id.clone());
            }
        }
        self.manager.update_fallback_chain(chain).await;
    }
}
