//! Discovery and overlay health-loop behavior against live HTTP mocks.

use std::sync::Arc;

use antd::config::{BreakerConfig, DiscoveryConfig, HealthCheckConfig, ProviderEntry};
use antd::discovery::{DiscoveryMode, ProviderDiscoveryService};
use antd::manager::ProviderManager;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn entry(base_url: &str) -> ProviderEntry {
    serde_yaml_ng::from_str(&format!(
        "type: openai\nbase_url: {base_url}\nmodel: probe-model\n"
    ))
    .unwrap()
}

async fn pong_server() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "PONG"}}]
        })))
        .mount(&server)
        .await;
    server
}

fn manager() -> Arc<ProviderManager> {
    Arc::new(ProviderManager::new(
        BreakerConfig::default(),
        HealthCheckConfig::default(),
    ))
}

#[tokio::test]
async fn discovery_admits_responding_candidates_and_builds_chain() {
    let server = pong_server().await;
    let dir = tempfile::TempDir::new().unwrap();

    let mut cfg = DiscoveryConfig {
        probe_timeout_ms: 2_000,
        ..DiscoveryConfig::default()
    };
    cfg.candidates.insert(
        "backup:mock".into(),
        entry(&format!("{}/v1", server.uri())),
    );
    cfg.candidates
        .insert("backup:dead".into(), entry("http://127.0.0.1:1/v1"));

    let manager = manager();
    let svc = ProviderDiscoveryService::new(
        cfg,
        dir.path().join("providers.json"),
        manager.clone(),
        vec!["primary".into()],
    );

    let outcome = svc.run_discovery(DiscoveryMode::Scheduled).await.unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.added, vec!["backup:mock".to_string()]);
    assert_eq!(outcome.total, 1);

    // The live candidate is registered and chained after the
    // configured base.
    assert!(manager.registered_ids().await.contains(&"backup:mock".to_string()));
    assert_eq!(
        manager.fallback_chain().await,
        vec!["primary".to_string(), "backup:mock".to_string()]
    );

    // The overlay records a positive, scored probe.
    let overlay = svc.load_overlay().await;
    let record = &overlay.providers["backup:mock"];
    assert!(record.last_result.ok);
    assert!(record.reliability_score >= 10);
    assert_eq!(record.consecutive_failures, 0);
}

#[tokio::test]
async fn emergency_mode_widens_the_candidate_set() {
    let server = pong_server().await;
    let dir = tempfile::TempDir::new().unwrap();

    let mut cfg = DiscoveryConfig {
        probe_timeout_ms: 2_000,
        ..DiscoveryConfig::default()
    };
    cfg.emergency_candidates.insert(
        "local:fallback".into(),
        entry(&format!("{}/v1", server.uri())),
    );

    let manager = manager();
    let svc = ProviderDiscoveryService::new(
        cfg,
        dir.path().join("providers.json"),
        manager.clone(),
        Vec::new(),
    );

    // Scheduled mode sees nothing.
    let outcome = svc.run_discovery(DiscoveryMode::Scheduled).await.unwrap();
    assert_eq!(outcome.total, 0);

    // Emergency mode reaches the local endpoint.
    let outcome = svc.run_discovery(DiscoveryMode::Emergency).await.unwrap();
    assert_eq!(outcome.added, vec!["local:fallback".to_string()]);
    assert!(manager
        .registered_ids()
        .await
        .contains(&"local:fallback".to_string()));
}

#[tokio::test]
async fn failing_provider_is_removed_at_the_limit() {
    // A discovered provider two strikes from removal fails its next
    // probe: dropped from overlay, manager, and chain.
    let dir = tempfile::TempDir::new().unwrap();
    let mut cfg = DiscoveryConfig {
        max_consecutive_failures: 3,
        probe_timeout_ms: 300,
        ..DiscoveryConfig::default()
    };
    cfg.candidates
        .insert("ollama:local".into(), entry("http://127.0.0.1:1/v1"));

    let manager = manager();
    let svc = ProviderDiscoveryService::new(
        cfg,
        dir.path().join("providers.json"),
        manager.clone(),
        Vec::new(),
    );

    // Seed an overlay where the provider is already on two failures.
    let raw = serde_json::json!({
        "version": 1,
        "generatedAt": 1,
        "providers": {
            "ollama:local": {
                "id": "ollama:local",
                "kind": "local",
                "config": {"type": "openai", "base_url": "http://127.0.0.1:1/v1", "model": "m"},
                "reliabilityScore": 40,
                "consecutiveFailures": 2,
                "lastResult": {"ok": false, "checkedAt": 1}
            }
        }
    });
    tokio::fs::write(
        dir.path().join("providers.json"),
        serde_json::to_string_pretty(&raw).unwrap(),
    )
    .await
    .unwrap();
    manager
        .register_discovered_provider("ollama:local", &entry("http://127.0.0.1:1/v1"), true)
        .await
        .unwrap();
    assert!(manager.fallback_chain().await.contains(&"ollama:local".to_string()));

    let outcome = svc.run_health_check().await.unwrap();
    assert!(outcome.ok);
    assert_eq!(outcome.removed, vec!["ollama:local".to_string()]);

    assert!(!manager
        .registered_ids()
        .await
        .contains(&"ollama:local".to_string()));
    assert!(!manager.fallback_chain().await.contains(&"ollama:local".to_string()));
    assert!(svc.load_overlay().await.providers.is_empty());
}

#[tokio::test]
async fn overlay_is_replaced_atomically_with_backup() {
    let server = pong_server().await;
    let dir = tempfile::TempDir::new().unwrap();
    let overlay_path = dir.path().join("providers.json");

    let mut cfg = DiscoveryConfig {
        probe_timeout_ms: 2_000,
        ..DiscoveryConfig::default()
    };
    cfg.candidates
        .insert("backup:mock".into(), entry(&format!("{}/v1", server.uri())));

    let svc = ProviderDiscoveryService::new(cfg, overlay_path.clone(), manager(), Vec::new());

    svc.run_discovery(DiscoveryMode::Scheduled).await.unwrap();
    svc.run_discovery(DiscoveryMode::Scheduled).await.unwrap();

    // Both generations parse fully: the reader never observes a
    // partial file.
    let current: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&overlay_path).unwrap()).unwrap();
    assert_eq!(current["version"], 1);
    let backup: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.path().join("providers.json.bak")).unwrap(),
    )
    .unwrap();
    assert_eq!(backup["version"], 1);
    assert!(!dir.path().join("providers.json.tmp").exists());
}
