//! Topic event bus and the typed events the orchestrator publishes on it.
//!
//! Handlers subscribe with a glob over topics (`agent.*`, `*`). Delivery is
//! best-effort: each handler runs under its own timeout and a failing or slow
//! handler never holds up the others. Every event is also forwarded to a
//! broadcast stream for observers that prefer to pull.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::FutureExt;
use futures::future::BoxFuture;
use futures::future::join_all;
use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::HealthState;
use switchyard_protocol::ResponseStatus;
use tokio::sync::RwLock;
use tokio::sync::broadcast;
use wildmatch::WildMatch;

use crate::circuit::CircuitState;
use crate::session::UsageLevel;

const STREAM_CAPACITY: usize = 256;

pub const TOPIC_HEALTH: &str = "agent.health";
pub const TOPIC_CIRCUIT: &str = "agent.circuit";
pub const TOPIC_FAILOVER: &str = "session.failover";
pub const TOPIC_ATTEMPT: &str = "task.attempt";
pub const TOPIC_COMPLETED: &str = "task.completed";
pub const TOPIC_CONTEXT: &str = "context.shared";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventMsg {
    HealthChanged {
        agent_id: String,
        from: HealthState,
        to: HealthState,
    },
    CircuitChanged {
        agent_id: String,
        from: CircuitState,
        to: CircuitState,
    },
    /// The session monitor wants traffic moved off `agent_id`.
    FailoverRequired {
        agent_id: String,
        level: UsageLevel,
        reason: String,
    },
    AttemptFailed {
        task_id: String,
        agent_id: String,
        attempt: u32,
        class: ErrorClass,
    },
    TaskCompleted {
        task_id: String,
        agent_id: Option<String>,
        status: ResponseStatus,
        attempts: usize,
    },
    ContextShared {
        context_id: String,
        source: String,
        target: String,
    },
    /// Application-defined payload on an arbitrary topic.
    Custom {
        topic: String,
        payload: serde_json::Value,
    },
}

impl EventMsg {
    pub fn topic(&self) -> &str {
        match self {
            EventMsg::HealthChanged { .. } => TOPIC_HEALTH,
            EventMsg::CircuitChanged { .. } => TOPIC_CIRCUIT,
            EventMsg::FailoverRequired { .. } => TOPIC_FAILOVER,
            EventMsg::AttemptFailed { .. } => TOPIC_ATTEMPT,
            EventMsg::TaskCompleted { .. } => TOPIC_COMPLETED,
            EventMsg::ContextShared { .. } => TOPIC_CONTEXT,
            EventMsg::Custom { topic, .. } => topic,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub msg: EventMsg,
}

impl Event {
    pub fn new(msg: EventMsg) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            msg,
        }
    }

    pub fn topic(&self) -> &str {
        self.msg.topic()
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

type HandlerFn = dyn Fn(Event) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync;

struct FnHandler(Box<HandlerFn>);

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wraps an async closure as an [`EventHandler`].
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(Box::new(move |event| Box::pin(f(event)))))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: WildMatch,
    handler: Arc<dyn EventHandler>,
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub failed: usize,
    pub timed_out: usize,
}

#[derive(Clone)]
pub struct EventBus {
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    next_id: Arc<AtomicU64>,
    stream: broadcast::Sender<Event>,
    handler_timeout: Duration,
}

impl EventBus {
    pub fn new(handler_timeout: Duration) -> Self {
        let (stream, _) = broadcast::channel(STREAM_CAPACITY);
        Self {
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            stream,
            handler_timeout,
        }
    }

    pub async fn subscribe(&self, topic: &str, handler: Arc<dyn EventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions.write().await.push(Subscription {
            id,
            pattern: WildMatch::new(topic),
            handler,
        });
        id
    }

    /// Returns whether the subscription existed.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.write().await;
        let before = subscriptions.len();
        subscriptions.retain(|subscription| subscription.id != id);
        subscriptions.len() != before
    }

    /// Every event published from now on.
    pub fn stream(&self) -> broadcast::Receiver<Event> {
        self.stream.subscribe()
    }

    /// Delivers `event` to every matching handler concurrently and waits for
    /// all of them (each bounded by the handler timeout).
    pub async fn publish(&self, event: Event) -> DeliveryReport {
        // No receivers is fine.
        let _ = self.stream.send(event.clone());
        self.fan_out(&event).await
    }

    /// Publishes without waiting for handlers. Stream observers see the event
    /// before this returns.
    pub fn publish_detached(&self, event: Event) {
        let _ = self.stream.send(event.clone());
        let bus = self.clone();
        tokio::spawn(async move {
            bus.fan_out(&event).await;
        });
    }

    async fn fan_out(&self, event: &Event) -> DeliveryReport {
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let subscriptions = self.subscriptions.read().await;
            subscriptions
                .iter()
                .filter(|subscription| subscription.pattern.matches(event.topic()))
                .map(|subscription| Arc::clone(&subscription.handler))
                .collect()
        };
        if handlers.is_empty() {
            return DeliveryReport::default();
        }

        let timeout = self.handler_timeout;
        let outcomes = join_all(handlers.iter().map(|handler| async move {
            let delivery = AssertUnwindSafe(handler.handle(event)).catch_unwind();
            tokio::time::timeout(timeout, delivery).await
        }))
        .await;

        let mut report = DeliveryReport::default();
        for outcome in outcomes {
            match outcome {
                Ok(Ok(Ok(()))) => report.delivered += 1,
                Ok(Ok(Err(err))) => {
                    report.failed += 1;
                    tracing::warn!(topic = event.topic(), error = %err, "event handler failed");
                }
                Ok(Err(_panic)) => {
                    report.failed += 1;
                    tracing::error!(topic = event.topic(), "event handler panicked");
                }
                Err(_) => {
                    report.timed_out += 1;
                    tracing::warn!(
                        topic = event.topic(),
                        timeout_ms = timeout.as_millis() as u64,
                        "event handler timed out"
                    );
                }
            }
        }
        report
    }
}

/// Builds and publishes the orchestrator's own events.
#[derive(Clone)]
pub struct EventEmitter {
    bus: EventBus,
}

impl EventEmitter {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn emit(&self, msg: EventMsg) {
        self.bus.publish_detached(Event::new(msg));
    }

    pub fn health_changed(&self, agent_id: &str, from: HealthState, to: HealthState) {
        tracing::info!(agent_id = %agent_id, ?from, ?to, "agent health changed");
        self.emit(EventMsg::HealthChanged {
            agent_id: agent_id.to_string(),
            from,
            to,
        });
    }

    pub fn circuit_changed(&self, agent_id: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(agent_id = %agent_id, %from, %to, "circuit state changed");
        self.emit(EventMsg::CircuitChanged {
            agent_id: agent_id.to_string(),
            from,
            to,
        });
    }

    pub fn failover_required(&self, agent_id: &str, level: UsageLevel, reason: String) {
        tracing::warn!(agent_id = %agent_id, ?level, %reason, "failover required");
        self.emit(EventMsg::FailoverRequired {
            agent_id: agent_id.to_string(),
            level,
            reason,
        });
    }

    pub fn attempt_failed(&self, task_id: &str, agent_id: &str, attempt: u32, class: ErrorClass) {
        self.emit(EventMsg::AttemptFailed {
            task_id: task_id.to_string(),
            agent_id: agent_id.to_string(),
            attempt,
            class,
        });
    }

    pub fn task_completed(
        &self,
        task_id: &str,
        agent_id: Option<&str>,
        status: ResponseStatus,
        attempts: usize,
    ) {
        self.emit(EventMsg::TaskCompleted {
            task_id: task_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            status,
            attempts,
        });
    }

    pub fn context_shared(&self, context_id: &str, source: &str, target: &str) {
        self.emit(EventMsg::ContextShared {
            context_id: context_id.to_string(),
            source: source.to_string(),
            target: target.to_string(),
        });
    }
}
