//! antd entrypoint: wire the execution core and run until ctrl-c.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use antd::config::Config;
use antd::discovery::ProviderDiscoveryService;
use antd::engine::{AgentEngine, EngineRequest, StaticPromptBuilder, ToolRegistry};
use antd::events::MonitorBus;
use antd::manager::ProviderManager;
use antd::router::{Handler, MessageRouter};
use antd::supervisor::{MainAgent, RouterNotificationSink};
use antd::tasks::{TaskQueue, TaskStore, TimeoutMonitor};

#[derive(Parser)]
#[command(name = "antd", about = "Ant assistant execution core", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the execution core.
    Run {
        /// Config file path. Defaults to `<ant home>/config.yaml`.
        #[arg(long)]
        config: Option<PathBuf>,
        /// Tracing filter when RUST_LOG is unset.
        #[arg(long, default_value = "info")]
        log_filter: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { config, log_filter } => run(config, &log_filter).await,
    }
}

async fn run(config_path: Option<PathBuf>, log_filter: &str) -> anyhow::Result<()> {
    let home = antd::ant_home();
    tokio::fs::create_dir_all(&home)
        .await
        .with_context(|| format!("create {}", home.display()))?;

    let config_path = config_path.unwrap_or_else(|| home.join("config.yaml"));
    let cfg = if config_path.exists() {
        Config::load(&config_path)?
    } else {
        warn!(path = %config_path.display(), "no config file, using defaults");
        Config::default()
    };

    let log_path = cfg.resolve_path(&cfg.supervisor.log_path);
    antd::logs::init_tracing(&log_path, log_filter)?;
    info!(home = %home.display(), "antd starting");

    let cancel = CancellationToken::new();
    let bus = MonitorBus::new();

    // Core singletons, created once and passed explicitly.
    let manager = Arc::new(ProviderManager::from_config(&cfg).await);
    let store = Arc::new(TaskStore::open(&cfg.resolve_path(&cfg.tasks.dir), cfg.tasks.cache_ttl_ms).await?);
    let queue = TaskQueue::new(store.clone(), bus.clone(), cfg.tasks.clone());
    let monitor = TimeoutMonitor::new(
        store.clone(),
        bus.clone(),
        cfg.tasks.monitor_interval_ms,
        cfg.tasks.warning_threshold_ms,
    );
    let _monitor_handle = monitor.spawn(cancel.clone());

    let router = MessageRouter::new(cfg.router.clone(), bus.clone());
    router.spawn_maintenance(cancel.clone());

    let engine = Arc::new(AgentEngine::new(
        manager.clone(),
        ToolRegistry::new(),
        cfg.engine.clone(),
        &home.join("sessions"),
        Arc::new(StaticPromptBuilder(
            "You are Ant, an autonomous multi-channel assistant.".into(),
        )),
    ));

    // Inbound messages run one agent turn and reply in place.
    {
        let engine = engine.clone();
        let router_for_handler = router.clone();
        let handler: Handler = Arc::new(move |message| {
            let engine = engine.clone();
            let router = router_for_handler.clone();
            Box::pin(async move {
                let response = engine
                    .execute(EngineRequest {
                        session_key: message.context.session_key.clone(),
                        query: message.content.clone(),
                        channel: message.channel.clone(),
                        chat_id: message.context.chat_id.clone(),
                        audience: None,
                    })
                    .await?;
                router
                    .send_to_session(&message.context.session_key, &response.response, Vec::new())
                    .await
            })
        });
        router.set_default_handler(handler).await;
    }

    let discovery = Arc::new(ProviderDiscoveryService::new(
        cfg.discovery.clone(),
        cfg.resolve_path(&cfg.discovery.overlay_path),
        manager.clone(),
        cfg.routing.fallback_chain.clone(),
    ));

    let main_agent = MainAgent::new(
        cfg.supervisor.clone(),
        manager,
        engine,
        discovery,
        store,
        queue,
        bus,
        Arc::new(RouterNotificationSink(router)),
        log_path,
    );
    main_agent.start(cancel.clone()).await;

    tokio::signal::ctrl_c().await.context("wait for ctrl-c")?;
    info!("shutdown signal received");
    cancel.cancel();
    // Give in-flight loops a moment to observe cancellation.
    tokio::time::sleep(Duration::from_millis(500)).await;
    info!("antd stopped");
    Ok(())
}
