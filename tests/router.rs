//! Message router: priority queues, drops, serial dispatch, session
//! recovery, and typing lifecycle.

use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use antd::config::RouterConfig;
use antd::events::{MonitorBus, MonitorEvent};
use antd::router::{
    ChannelAdapter, Handler, MessageContext, MessageRouter, NormalizedMessage, OutboundMessage,
    Priority,
};
use async_trait::async_trait;
use tokio::sync::Notify;

// ---------------------------------------------------------------------------
// Test adapter
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RecordingAdapter {
    sent: StdMutex<Vec<(String, String)>>,
    typing_events: StdMutex<Vec<(String, bool)>>,
}

#[async_trait]
impl ChannelAdapter for RecordingAdapter {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        self.sent.lock().unwrap().push((
            message.context.session_key.clone(),
            message.content.clone(),
        ));
        Ok(())
    }

    async fn typing(&self, chat_id: &str, active: bool) -> anyhow::Result<()> {
        self.typing_events
            .lock()
            .unwrap()
            .push((chat_id.to_string(), active));
        Ok(())
    }
}

fn message(session_key: &str, content: &str, priority: Priority) -> NormalizedMessage {
    NormalizedMessage {
        id: antd::utils::generate_nonce(),
        channel: "telegram".into(),
        sender: "user-1".into(),
        content: content.into(),
        media: Vec::new(),
        context: MessageContext {
            session_key: session_key.into(),
            chat_id: Some("12345".into()),
            thread_id: None,
        },
        timestamp: antd::utils::now_ms(),
        priority,
    }
}

fn cfg(max_queue: usize) -> RouterConfig {
    RouterConfig {
        max_queue_size: max_queue,
        session_queue_timeout_ms: 10_000,
        max_concurrent_sessions: 10,
        session_ordering_enabled: true,
        ..RouterConfig::default()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn priority_insertion_and_overflow_eviction() {
    let bus = MonitorBus::new();
    let mut rx = bus.subscribe();
    let router = MessageRouter::new(cfg(2), bus);
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;

    let processed: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    let gate = Arc::new(Notify::new());
    {
        let processed = processed.clone();
        let gate = gate.clone();
        let handler: Handler = Arc::new(move |msg: NormalizedMessage| {
            let processed = processed.clone();
            let gate = gate.clone();
            Box::pin(async move {
                if msg.content == "blocker" {
                    gate.notified().await;
                }
                processed.lock().unwrap().push(msg.content);
                Ok(())
            })
        });
        router.set_default_handler(handler).await;
    }

    let key = "telegram:dm:12345";
    // First message occupies the session's single in-flight slot.
    router.handle_incoming(message(key, "blocker", Priority::Normal)).await;
    tokio::time::sleep(Duration::from_millis(30)).await;

    // Queue fills to [normal, low]; the high arrival evicts low.
    router.handle_incoming(message(key, "normal", Priority::Normal)).await;
    router.handle_incoming(message(key, "low", Priority::Low)).await;
    router.handle_incoming(message(key, "high", Priority::High)).await;

    gate.notify_one();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        *processed.lock().unwrap(),
        vec!["blocker", "high", "normal"],
        "high preempts at enqueue time; low was evicted"
    );

    // The evicted sender got the canned queue-full notice.
    let sent = adapter.sent.lock().unwrap();
    assert!(sent.iter().any(|(_, text)| text.contains("queue is full")));

    let mut dropped = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        if let MonitorEvent::MessageDropped { reason, .. } = ev {
            dropped.push(reason);
        }
    }
    assert_eq!(dropped, vec!["queue_full".to_string()]);
}

#[tokio::test]
async fn sessions_are_strictly_serial_but_overlap_across_sessions() {
    let router = MessageRouter::new(cfg(50), MonitorBus::new());
    router.register_adapter(Arc::new(RecordingAdapter::default())).await;

    let log: Arc<StdMutex<Vec<(String, &'static str)>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let log = log.clone();
        let handler: Handler = Arc::new(move |msg: NormalizedMessage| {
            let log = log.clone();
            Box::pin(async move {
                log.lock().unwrap().push((msg.content.clone(), "start"));
                tokio::time::sleep(Duration::from_millis(40)).await;
                log.lock().unwrap().push((msg.content, "end"));
                Ok(())
            })
        });
        router.set_default_handler(handler).await;
    }

    for i in 0..3 {
        router
            .handle_incoming(message("telegram:dm:a", &format!("a{i}"), Priority::Normal))
            .await;
        router
            .handle_incoming(message("telegram:dm:b", &format!("b{i}"), Priority::Normal))
            .await;
    }
    tokio::time::sleep(Duration::from_millis(500)).await;

    let log = log.lock().unwrap();
    // Within one session, each message ends before the next starts.
    for session in ["a", "b"] {
        let events: Vec<&(String, &str)> =
            log.iter().filter(|(c, _)| c.starts_with(session)).collect();
        assert_eq!(events.len(), 6);
        for pair in events.chunks(2) {
            assert_eq!(pair[0].1, "start");
            assert_eq!(pair[1].1, "end");
            assert_eq!(pair[0].0, pair[1].0);
        }
        let order: Vec<&str> = events
            .iter()
            .filter(|(_, phase)| *phase == "start")
            .map(|(c, _)| c.as_str())
            .collect();
        assert_eq!(order, vec![format!("{session}0"), format!("{session}1"), format!("{session}2")]);
    }
}

#[tokio::test]
async fn session_recovery_from_key_shape() {
    let bus = MonitorBus::new();
    let mut rx = bus.subscribe();
    let router = MessageRouter::new(cfg(10), bus);
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;

    // Unknown session, parseable key, adapter present: synthesize and
    // deliver.
    router
        .send_to_session("telegram:dm:12345", "hello", Vec::new())
        .await
        .unwrap();
    assert_eq!(
        *adapter.sent.lock().unwrap(),
        vec![("telegram:dm:12345".to_string(), "hello".to_string())]
    );
    let session = router.session("telegram:dm:12345").await.unwrap();
    assert_eq!(session.channel, "telegram");
    assert_eq!(session.chat_id.as_deref(), Some("12345"));

    // No adapter for the embedded channel: structured failure.
    let err = router
        .send_to_session("whatsapp:dm:9", "hi", Vec::new())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("session_not_found"));
    let mut saw_error_event = false;
    while let Ok(ev) = rx.try_recv() {
        if let MonitorEvent::ErrorOccurred { error_type, .. } = ev {
            assert_eq!(error_type, "session_not_found");
            saw_error_event = true;
        }
    }
    assert!(saw_error_event);
}

#[tokio::test]
async fn middleware_can_rewrite_and_drop() {
    let bus = MonitorBus::new();
    let router = MessageRouter::new(cfg(10), bus);
    router.register_adapter(Arc::new(RecordingAdapter::default())).await;

    router
        .use_middleware(Arc::new(|mut msg: NormalizedMessage| {
            Box::pin(async move {
                if msg.content.contains("secret") {
                    return Ok(None);
                }
                msg.content = msg.content.to_uppercase();
                Ok(Some(msg))
            })
        }))
        .await;

    let processed: Arc<StdMutex<Vec<String>>> = Arc::new(StdMutex::new(Vec::new()));
    {
        let processed = processed.clone();
        let handler: Handler = Arc::new(move |msg: NormalizedMessage| {
            let processed = processed.clone();
            Box::pin(async move {
                processed.lock().unwrap().push(msg.content);
                Ok(())
            })
        });
        router.set_default_handler(handler).await;
    }

    router
        .handle_incoming(message("telegram:dm:1", "hello", Priority::Normal))
        .await;
    router
        .handle_incoming(message("telegram:dm:1", "a secret thing", Priority::Normal))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(*processed.lock().unwrap(), vec!["HELLO"]);
}

#[tokio::test]
async fn typing_indicator_wraps_processing() {
    let router = MessageRouter::new(cfg(10), MonitorBus::new());
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;

    let handler: Handler = Arc::new(|_msg: NormalizedMessage| {
        Box::pin(async move {
            tokio::time::sleep(Duration::from_millis(80)).await;
            Ok(())
        })
    });
    router.set_default_handler(handler).await;

    router
        .handle_incoming(message("telegram:dm:7", "work", Priority::Normal))
        .await;
    tokio::time::sleep(Duration::from_millis(250)).await;

    let events = adapter.typing_events.lock().unwrap();
    assert!(events.first().is_some_and(|(chat, active)| chat == "12345" && *active));
    assert!(events.last().is_some_and(|(_, active)| !active));
}

#[tokio::test]
async fn handler_errors_notify_the_sender() {
    let router = MessageRouter::new(cfg(10), MonitorBus::new());
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;

    let handler: Handler = Arc::new(|_msg: NormalizedMessage| {
        Box::pin(async move { anyhow::bail!("exploded while replying") })
    });
    router.set_default_handler(handler).await;

    router
        .handle_incoming(message("telegram:dm:2", "do it", Priority::Normal))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = adapter.sent.lock().unwrap();
    assert!(sent
        .iter()
        .any(|(_, text)| text.contains("Something went wrong") && text.contains("exploded")));
}

#[tokio::test]
async fn no_handler_notifies_configuration_gap() {
    let router = MessageRouter::new(cfg(10), MonitorBus::new());
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;

    router
        .handle_incoming(message("telegram:dm:3", "anyone?", Priority::Normal))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let sent = adapter.sent.lock().unwrap();
    assert!(sent.iter().any(|(_, text)| text.contains("No handler")));
}

#[tokio::test]
async fn idle_sessions_are_pruned() {
    let mut config = cfg(10);
    config.session_timeout_ms = 1; // everything is instantly idle
    let router = MessageRouter::new(config, MonitorBus::new());
    let adapter = Arc::new(RecordingAdapter::default());
    router.register_adapter(adapter.clone()).await;
    router
        .set_default_handler(Arc::new(|_m| Box::pin(async { Ok(()) })))
        .await;

    router
        .handle_incoming(message("telegram:dm:4", "hi", Priority::Normal))
        .await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(router.session("telegram:dm:4").await.is_some());

    router.prune_sessions().await;
    assert!(router.session("telegram:dm:4").await.is_none());
    assert_eq!(router.stats().await.sessions, 0);
}
