//! Cross-channel message router.
//!
//! Inbound messages arrive normalized from channel adapters, pass a
//! middleware pipeline, and land in bounded per-session (or
//! per-channel) queues with priority insertion. Dispatch is strictly
//! serial within a session, bounded in total, raced against a
//! processing deadline, and wrapped in a typing-indicator lifecycle.
//! Outbound delivery goes through the adapter registered for the
//! target channel.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::RouterConfig;
use crate::events::{MonitorBus, MonitorEvent};

/// Typing-indicator refresh cadence.
const TYPING_REFRESH: Duration = Duration::from_secs(3);

/// Session prune cadence.
const PRUNE_INTERVAL: Duration = Duration::from_secs(10);

// ---------------------------------------------------------------------------
// Message model
// ---------------------------------------------------------------------------

/// Message priority. Higher sorts earlier at enqueue time; nothing is
/// preempted in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

/// Routing coordinates attached to every message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageContext {
    /// Canonical routing identity, `channel:type:rest`.
    pub session_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
}

/// A channel-agnostic inbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub channel: String,
    pub sender: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub media: Vec<String>,
    pub context: MessageContext,
    /// Unix-epoch milliseconds.
    pub timestamp: i64,
    #[serde(default)]
    pub priority: Priority,
}

/// Outbound payload handed to a channel adapter.
#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub context: MessageContext,
    pub content: String,
    pub media: Vec<String>,
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    message: NormalizedMessage,
    enqueued_at: i64,
}

/// Cross-channel logical conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_key: String,
    pub channel: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub created_at: i64,
    pub last_activity: i64,
    pub message_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

// ---------------------------------------------------------------------------
// Adapters, middleware, handlers
// ---------------------------------------------------------------------------

/// Outbound transport for one channel. Adapters own normalization and
/// delivery; they never mutate router state directly.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name this adapter serves (`"telegram"`, `"whatsapp"`,
    /// `"cli"`, …).
    fn name(&self) -> &str;

    /// Deliver an outbound message.
    async fn send(&self, message: &OutboundMessage) -> anyhow::Result<()>;

    /// Update the typing indicator for a chat. Optional.
    async fn typing(&self, _chat_id: &str, _active: bool) -> anyhow::Result<()> {
        Ok(())
    }
}

/// One middleware stage: returns the (possibly rewritten) message, or
/// `None` to drop it and stop the chain.
pub type Middleware = Arc<
    dyn Fn(
            NormalizedMessage,
        ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<NormalizedMessage>>> + Send>>
        + Send
        + Sync,
>;

/// Terminal message handler.
pub type Handler = Arc<
    dyn Fn(NormalizedMessage) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send>>
        + Send
        + Sync,
>;

/// A routing rule. All present constraints must match; rules are
/// consulted in descending `priority` order.
pub struct Route {
    pub name: String,
    pub priority: i32,
    pub channel: Option<String>,
    /// Glob over the session key; `*` matches any run of characters.
    pub session_key_pattern: Option<String>,
    /// Required message priority.
    pub message_priority: Option<Priority>,
    pub handler: Handler,
}

impl Route {
    fn matches(&self, message: &NormalizedMessage) -> bool {
        if let Some(ref channel) = self.channel {
            if *channel != message.channel {
                return false;
            }
        }
        if let Some(ref pattern) = self.session_key_pattern {
            if !glob_match(pattern, &message.context.session_key) {
                return false;
            }
        }
        if let Some(required) = self.message_priority {
            if required != message.priority {
                return false;
            }
        }
        true
    }
}

/// Minimal `*` glob.
fn glob_match(pattern: &str, value: &str) -> bool {
    fn inner(p: &[u8], v: &[u8]) -> bool {
        match (p.first(), v.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], v) || (!v.is_empty() && inner(p, &v[1..]))
            }
            (Some(pc), Some(vc)) if pc == vc => inner(&p[1..], &v[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), value.as_bytes())
}

// ---------------------------------------------------------------------------
// MessageRouter
// ---------------------------------------------------------------------------

struct RouterInner {
    sessions: HashMap<String, Session>,
    /// Keyed by session key (default) or channel (ordering disabled).
    queues: HashMap<String, VecDeque<QueuedMessage>>,
    in_flight: HashMap<String, usize>,
    total_in_flight: usize,
}

/// Router stats snapshot for the duty-cycle report.
#[derive(Debug, Clone, Serialize)]
pub struct RouterStats {
    pub sessions: usize,
    pub queued: usize,
    pub in_flight: usize,
}

/// Per-session ordered dispatcher with bounded queues.
pub struct MessageRouter {
    cfg: RouterConfig,
    bus: MonitorBus,
    inner: Mutex<RouterInner>,
    adapters: RwLock<HashMap<String, Arc<dyn ChannelAdapter>>>,
    middleware: RwLock<Vec<Middleware>>,
    routes: RwLock<Vec<Route>>,
    default_handler: RwLock<Option<Handler>>,
    typing: Mutex<HashMap<(String, String), CancellationToken>>,
}

impl MessageRouter {
    pub fn new(cfg: RouterConfig, bus: MonitorBus) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            bus,
            inner: Mutex::new(RouterInner {
                sessions: HashMap::new(),
                queues: HashMap::new(),
                in_flight: HashMap::new(),
                total_in_flight: 0,
            }),
            adapters: RwLock::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            routes: RwLock::new(Vec::new()),
            default_handler: RwLock::new(None),
            typing: Mutex::new(HashMap::new()),
        })
    }

    // -- registration -------------------------------------------------------

    /// Register an adapter; replaces any previous one for the same
    /// channel name.
    pub async fn register_adapter(&self, adapter: Arc<dyn ChannelAdapter>) {
        let name = adapter.name().to_string();
        self.adapters.write().await.insert(name, adapter);
    }

    /// Append a middleware stage to the pipeline.
    pub async fn use_middleware(&self, mw: Middleware) {
        self.middleware.write().await.push(mw);
    }

    /// Add a route; kept sorted by descending priority.
    pub async fn add_route(&self, route: Route) {
        let mut routes = self.routes.write().await;
        routes.push(route);
        routes.sort_by_key(|r| std::cmp::Reverse(r.priority));
    }

    /// Install the handler used when no route matches.
    pub async fn set_default_handler(&self, handler: Handler) {
        *self.default_handler.write().await = Some(handler);
    }

    /// Spawn the session prune loop.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) {
        let router = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => router.prune_sessions().await,
                }
            }
        });
    }

    // -- inbound ------------------------------------------------------------

    /// Entry point for channel adapters: route one inbound message.
    pub async fn handle_incoming(self: &Arc<Self>, message: NormalizedMessage) {
        self.bus.emit(MonitorEvent::MessageReceived {
            session_key: message.context.session_key.clone(),
            channel: message.channel.clone(),
        });

        let message = match self.run_middleware(message).await {
            Some(m) => m,
            None => return,
        };

        self.touch_session(&message).await;

        let queue_key = if self.cfg.session_ordering_enabled {
            message.context.session_key.clone()
        } else {
            message.channel.clone()
        };

        if let Some(evicted) = self.insert_queued(&queue_key, message).await {
            // Either the newcomer or a lower-priority resident lost
            // the capacity fight.
            self.bus.emit(MonitorEvent::MessageDropped {
                session_key: evicted.context.session_key.clone(),
                reason: "queue_full".into(),
            });
            self.notify_sender(&evicted, "Message queue is full; your message was dropped.")
                .await;
            // The evicted message may have been the incoming one; in
            // either case the queue is unchanged beyond this point.
        }

        self.drive(queue_key).await;
    }

    /// Run the middleware pipeline. `None` means the message was
    /// dropped by a stage (or a stage failed).
    async fn run_middleware(&self, message: NormalizedMessage) -> Option<NormalizedMessage> {
        let stages = self.middleware.read().await.clone();
        let mut current = message;
        for stage in stages {
            match stage(current).await {
                Ok(Some(next)) => current = next,
                Ok(None) => return None,
                Err(e) => {
                    warn!(error = %e, "middleware stage failed, message dropped");
                    return None;
                }
            }
        }
        Some(current)
    }

    /// Create or touch the session for an inbound message.
    async fn touch_session(&self, message: &NormalizedMessage) {
        let now = crate::utils::now_ms();
        let mut inner = self.inner.lock().await;
        let session = inner
            .sessions
            .entry(message.context.session_key.clone())
            .or_insert_with(|| Session {
                session_key: message.context.session_key.clone(),
                channel: message.channel.clone(),
                chat_id: message.context.chat_id.clone(),
                thread_id: message.context.thread_id.clone(),
                created_at: now,
                last_activity: now,
                message_count: 0,
                user: Some(message.sender.clone()),
            });
        session.last_activity = now;
        session.message_count += 1;
    }

    /// Priority-insert into the target queue.
    ///
    /// Returns the message that lost the capacity fight when the queue
    /// is full: the incoming one, or the lowest-priority resident when
    /// the incoming message outranks it.
    async fn insert_queued(
        &self,
        queue_key: &str,
        message: NormalizedMessage,
    ) -> Option<NormalizedMessage> {
        let mut inner = self.inner.lock().await;
        let queue = inner.queues.entry(queue_key.to_string()).or_default();

        let mut evicted = None;
        if queue.len() >= self.cfg.max_queue_size {
            // Queues are non-increasing in priority, so the tail is the
            // weakest resident.
            let tail_priority = queue.back().map(|q| q.message.priority);
            match tail_priority {
                Some(tail) if message.priority > tail => {
                    evicted = queue.pop_back().map(|q| q.message);
                }
                _ => return Some(message),
            }
        }

        let item = QueuedMessage {
            enqueued_at: crate::utils::now_ms(),
            message,
        };
        // First slot with strictly lower priority; ties keep FIFO.
        let at = queue
            .iter()
            .position(|q| q.message.priority < item.message.priority)
            .unwrap_or(queue.len());
        let session_key = item.message.context.session_key.clone();
        queue.insert(at, item);
        let queue_len = queue.len();
        drop(inner);

        self.bus.emit(MonitorEvent::MessageQueued {
            session_key,
            queue_len,
        });
        evicted
    }

    /// Dispatch as much ready work as limits allow for one queue key.
    fn drive(self: &Arc<Self>, queue_key: String) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        loop {
            let item = {
                let mut inner = self.inner.lock().await;
                if self.cfg.session_ordering_enabled {
                    if inner.total_in_flight >= self.cfg.max_concurrent_sessions {
                        return;
                    }
                    // Strict serial per session.
                    if inner.in_flight.get(&queue_key).copied().unwrap_or(0) > 0 {
                        return;
                    }
                } else {
                    let busy = inner.in_flight.get(&queue_key).copied().unwrap_or(0);
                    if busy >= self.cfg.channel_concurrency {
                        return;
                    }
                }

                let now = crate::utils::now_ms();
                let queue = inner.queues.entry(queue_key.clone()).or_default();
                let mut next = None;
                let mut expired = Vec::new();
                while let Some(candidate) = queue.pop_front() {
                    if now - candidate.enqueued_at > self.cfg.session_queue_timeout_ms {
                        expired.push(candidate.message);
                        continue;
                    }
                    next = Some(candidate);
                    break;
                }
                if next.is_some() {
                    *inner.in_flight.entry(queue_key.clone()).or_insert(0) += 1;
                    inner.total_in_flight += 1;
                }
                drop(inner);

                for stale in expired {
                    self.bus.emit(MonitorEvent::MessageDropped {
                        session_key: stale.context.session_key.clone(),
                        reason: "queue_timeout".into(),
                    });
                }
                match next {
                    Some(item) => item,
                    None => return,
                }
            };

            let router = self.clone();
            let key = queue_key.clone();
            tokio::spawn(async move {
                router.process_one(item.message).await;
                {
                    let mut inner = router.inner.lock().await;
                    if let Some(count) = inner.in_flight.get_mut(&key) {
                        *count = count.saturating_sub(1);
                    }
                    inner.total_in_flight = inner.total_in_flight.saturating_sub(1);
                }
                // A freed slot may unblock any waiting queue, not just
                // this one.
                router.drive_all().await;
            });

            if self.cfg.session_ordering_enabled {
                // One in flight per session; the respawn happens when
                // it settles.
                return;
            }
        }
        })
    }

    /// Re-drive every queue with pending work.
    fn drive_all(self: &Arc<Self>) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
        let keys: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .queues
                .iter()
                .filter(|(_, q)| !q.is_empty())
                .map(|(k, _)| k.clone())
                .collect()
        };
        for key in keys {
            self.drive(key).await;
        }
        })
    }

    /// Process one dispatched message: typing lifecycle, route
    /// selection, deadline race, error notices.
    async fn process_one(self: &Arc<Self>, message: NormalizedMessage) {
        let started = crate::utils::now_ms();
        self.bus.emit(MonitorEvent::MessageProcessing {
            session_key: message.context.session_key.clone(),
            message_id: message.id.clone(),
        });

        let typing_key = message
            .context
            .chat_id
            .as_ref()
            .map(|chat_id| (message.channel.clone(), chat_id.clone()));
        if let Some(ref key) = typing_key {
            self.start_typing(key.clone()).await;
        }

        let handler = self.resolve_handler(&message).await;
        let success = match handler {
            Some(handler) => {
                let deadline = Duration::from_millis(self.cfg.session_queue_timeout_ms.max(0) as u64);
                let outcome = tokio::time::timeout(deadline, handler(message.clone())).await;
                match outcome {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        warn!(
                            session_key = %message.context.session_key,
                            error = %e,
                            "handler failed"
                        );
                        let excerpt = crate::utils::truncate_str(&e.to_string(), 200);
                        self.notify_sender(&message, &format!("Something went wrong: {excerpt}"))
                            .await;
                        false
                    }
                    Err(_) => {
                        let secs = self.cfg.session_queue_timeout_ms / 1_000;
                        warn!(
                            session_key = %message.context.session_key,
                            "message processing timed out"
                        );
                        self.notify_sender(
                            &message,
                            &format!("Timeout: Message processing took longer than {secs}s"),
                        )
                        .await;
                        false
                    }
                }
            }
            None => {
                self.bus.emit(MonitorEvent::MessageDropped {
                    session_key: message.context.session_key.clone(),
                    reason: "no_handler".into(),
                });
                self.notify_sender(&message, "No handler is configured for this channel.")
                    .await;
                false
            }
        };

        if let Some(key) = typing_key {
            self.stop_typing(&key).await;
        }
        self.bus.emit(MonitorEvent::MessageProcessed {
            session_key: message.context.session_key.clone(),
            duration_ms: crate::utils::now_ms() - started,
            success,
        });
    }

    /// Highest-priority matching route, else the default handler.
    async fn resolve_handler(&self, message: &NormalizedMessage) -> Option<Handler> {
        let routes = self.routes.read().await;
        for route in routes.iter() {
            if route.matches(message) {
                debug!(route = %route.name, session_key = %message.context.session_key, "route matched");
                return Some(route.handler.clone());
            }
        }
        drop(routes);
        self.default_handler.read().await.clone()
    }

    /// Canned notice back to the message's sender. Best-effort.
    async fn notify_sender(&self, message: &NormalizedMessage, text: &str) {
        let outbound = OutboundMessage {
            channel: message.channel.clone(),
            context: message.context.clone(),
            content: text.to_string(),
            media: Vec::new(),
        };
        if let Err(e) = self.send_message(&outbound).await {
            debug!(channel = %message.channel, error = %e, "sender notice undeliverable");
        }
    }

    // -- typing indicators --------------------------------------------------

    /// Start the refresh task for `(channel, chat_id)`. No-op when one
    /// already exists.
    async fn start_typing(&self, key: (String, String)) {
        let mut typing = self.typing.lock().await;
        if typing.contains_key(&key) {
            return;
        }
        let cancel = CancellationToken::new();
        typing.insert(key.clone(), cancel.clone());
        drop(typing);

        let adapters = self.adapters.read().await;
        let Some(adapter) = adapters.get(&key.0).cloned() else {
            return;
        };
        drop(adapters);

        tokio::spawn(async move {
            let (_, chat_id) = key;
            let _ = adapter.typing(&chat_id, true).await;
            let mut ticker = tokio::time::interval(TYPING_REFRESH);
            ticker.tick().await; // immediate tick consumed
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = adapter.typing(&chat_id, false).await;
                        break;
                    }
                    _ = ticker.tick() => {
                        let _ = adapter.typing(&chat_id, true).await;
                    }
                }
            }
        });
    }

    /// Cancel the refresh task; idempotent.
    async fn stop_typing(&self, key: &(String, String)) {
        if let Some(cancel) = self.typing.lock().await.remove(key) {
            cancel.cancel();
        }
    }

    // -- outbound -----------------------------------------------------------

    /// Deliver through the adapter registered for the message's
    /// channel.
    pub async fn send_message(&self, message: &OutboundMessage) -> anyhow::Result<()> {
        let adapter = {
            let adapters = self.adapters.read().await;
            adapters.get(&message.channel).cloned()
        };
        match adapter {
            Some(adapter) => adapter.send(message).await,
            None => anyhow::bail!("no adapter registered for channel {}", message.channel),
        }
    }

    /// Deliver to a session by key, reconstructing the session from
    /// the key's `channel:type:rest` shape when it is unknown.
    pub async fn send_to_session(
        &self,
        session_key: &str,
        content: &str,
        media: Vec<String>,
    ) -> anyhow::Result<()> {
        let session = {
            let inner = self.inner.lock().await;
            inner.sessions.get(session_key).cloned()
        };

        let session = match session {
            Some(s) => s,
            None => match parse_session_key(session_key) {
                Some((channel, _kind, chat_id)) => {
                    let has_adapter = self.adapters.read().await.contains_key(&channel);
                    if !has_adapter {
                        self.bus.emit(MonitorEvent::ErrorOccurred {
                            error_type: "session_not_found".into(),
                            severity: "error".into(),
                            message: format!("no session or adapter for {session_key}"),
                            context: None,
                        });
                        anyhow::bail!("session_not_found: {session_key}");
                    }
                    // Recovery path: synthesize and persist a minimal
                    // session for the embedded coordinates.
                    let now = crate::utils::now_ms();
                    let session = Session {
                        session_key: session_key.to_string(),
                        channel,
                        chat_id: Some(chat_id),
                        thread_id: None,
                        created_at: now,
                        last_activity: now,
                        message_count: 0,
                        user: None,
                    };
                    self.inner
                        .lock()
                        .await
                        .sessions
                        .insert(session_key.to_string(), session.clone());
                    session
                }
                None => {
                    self.bus.emit(MonitorEvent::ErrorOccurred {
                        error_type: "session_not_found".into(),
                        severity: "error".into(),
                        message: format!("unparseable session key {session_key}"),
                        context: None,
                    });
                    anyhow::bail!("session_not_found: {session_key}");
                }
            },
        };

        let outbound = OutboundMessage {
            channel: session.channel.clone(),
            context: MessageContext {
                session_key: session.session_key.clone(),
                chat_id: session.chat_id.clone(),
                thread_id: session.thread_id.clone(),
            },
            content: content.to_string(),
            media,
        };
        self.send_message(&outbound).await
    }

    // -- sessions -----------------------------------------------------------

    /// Fetch a session snapshot.
    pub async fn session(&self, session_key: &str) -> Option<Session> {
        self.inner.lock().await.sessions.get(session_key).cloned()
    }

    /// Drop idle sessions past `session_timeout_ms`, then LRU-evict
    /// down to `max_sessions`.
    pub async fn prune_sessions(&self) {
        let now = crate::utils::now_ms();
        let mut inner = self.inner.lock().await;

        let expired: Vec<String> = inner
            .sessions
            .values()
            .filter(|s| now - s.last_activity > self.cfg.session_timeout_ms)
            .map(|s| s.session_key.clone())
            .collect();
        for key in &expired {
            inner.sessions.remove(key);
            inner.queues.remove(key);
        }

        if inner.sessions.len() > self.cfg.max_sessions {
            let mut by_activity: Vec<(String, i64)> = inner
                .sessions
                .values()
                .map(|s| (s.session_key.clone(), s.last_activity))
                .collect();
            by_activity.sort_by_key(|(_, at)| *at);
            let excess = inner.sessions.len() - self.cfg.max_sessions;
            for (key, _) in by_activity.into_iter().take(excess) {
                inner.sessions.remove(&key);
                inner.queues.remove(&key);
            }
        }

        if !expired.is_empty() {
            debug!(pruned = expired.len(), "idle sessions pruned");
        }
    }

    /// Snapshot of queue/session/in-flight counts.
    pub async fn stats(&self) -> RouterStats {
        let inner = self.inner.lock().await;
        RouterStats {
            sessions: inner.sessions.len(),
            queued: inner.queues.values().map(|q| q.len()).sum(),
            in_flight: inner.total_in_flight,
        }
    }
}

/// Split a `channel:type:rest` session key. The rest segment may
/// itself contain colons.
fn parse_session_key(key: &str) -> Option<(String, String, String)> {
    let mut parts = key.splitn(3, ':');
    let channel = parts.next()?.to_string();
    let kind = parts.next()?.to_string();
    let rest = parts.next()?.to_string();
    if channel.is_empty() || kind.is_empty() || rest.is_empty() {
        return None;
    }
    Some((channel, kind, rest))
}
