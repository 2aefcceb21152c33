//! Direct and broadcast signals between agents.
//!
//! An agent that registered a handler with [`SignalProtocol::receive`] gets
//! signals pushed to it. Signals for an agent without a handler wait in a
//! bounded mailbox until [`SignalProtocol::take_pending`] drains it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use futures::future::join_all;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::sync::RwLock;

pub const CONTEXT_SHARED: &str = "context_shared";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub id: String,
    pub from: String,
    /// `None` for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    pub name: String,
    #[serde(default)]
    pub data: serde_json::Value,
    pub sent_at: DateTime<Utc>,
}

#[async_trait]
pub trait SignalHandler: Send + Sync {
    async fn on_signal(&self, signal: &Signal) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalDelivery {
    Delivered,
    /// No handler registered; stored in the target's mailbox.
    Queued,
    /// The handler errored or timed out. The signal is not retried.
    HandlerFailed,
}

pub struct SignalProtocol {
    handlers: RwLock<HashMap<String, Arc<dyn SignalHandler>>>,
    mailboxes: Mutex<HashMap<String, VecDeque<Signal>>>,
    mailbox_capacity: usize,
    handler_timeout: Duration,
}

impl SignalProtocol {
    pub fn new(mailbox_capacity: usize, handler_timeout: Duration) -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
            mailboxes: Mutex::new(HashMap::new()),
            mailbox_capacity: mailbox_capacity.max(1),
            handler_timeout,
        }
    }

    /// Registers `handler` for signals addressed to `agent_id`, replacing any
    /// previous one.
    pub async fn receive(&self, agent_id: &str, handler: Arc<dyn SignalHandler>) {
        self.handlers
            .write()
            .await
            .insert(agent_id.to_string(), handler);
    }

    pub async fn stop_receiving(&self, agent_id: &str) -> bool {
        self.handlers.write().await.remove(agent_id).is_some()
    }

    pub async fn send(
        &self,
        from: &str,
        target: &str,
        name: &str,
        data: serde_json::Value,
    ) -> SignalDelivery {
        let signal = Signal {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: Some(target.to_string()),
            name: name.to_string(),
            data,
            sent_at: Utc::now(),
        };
        self.deliver(target, signal).await
    }

    /// Sends to every agent with a handler or a mailbox, except the sender.
    /// Returns how many recipients the signal reached.
    pub async fn broadcast(&self, from: &str, name: &str, data: serde_json::Value) -> usize {
        let mut recipients: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        for agent_id in self.mailboxes.lock().await.keys() {
            if !recipients.contains(agent_id) {
                recipients.push(agent_id.clone());
            }
        }
        recipients.retain(|agent_id| agent_id != from);

        let signal = Signal {
            id: uuid::Uuid::new_v4().to_string(),
            from: from.to_string(),
            to: None,
            name: name.to_string(),
            data,
            sent_at: Utc::now(),
        };
        let deliveries = join_all(
            recipients
                .iter()
                .map(|agent_id| self.deliver(agent_id, signal.clone())),
        )
        .await;
        deliveries
            .into_iter()
            .filter(|delivery| *delivery != SignalDelivery::HandlerFailed)
            .count()
    }

    /// Drains the mailbox of `agent_id`, oldest first.
    pub async fn take_pending(&self, agent_id: &str) -> Vec<Signal> {
        self.mailboxes
            .lock()
            .await
            .remove(agent_id)
            .map(Vec::from)
            .unwrap_or_default()
    }

    async fn deliver(&self, target: &str, signal: Signal) -> SignalDelivery {
        let handler = self.handlers.read().await.get(target).cloned();
        let Some(handler) = handler else {
            self.enqueue(target, signal).await;
            return SignalDelivery::Queued;
        };

        match tokio::time::timeout(self.handler_timeout, handler.on_signal(&signal)).await {
            Ok(Ok(())) => SignalDelivery::Delivered,
            Ok(Err(err)) => {
                tracing::warn!(agent_id = %target, signal = %signal.name, error = %err, "signal handler failed");
                SignalDelivery::HandlerFailed
            }
            Err(_) => {
                tracing::warn!(agent_id = %target, signal = %signal.name, "signal handler timed out");
                SignalDelivery::HandlerFailed
            }
        }
    }

    async fn enqueue(&self, target: &str, signal: Signal) {
        let mut mailboxes = self.mailboxes.lock().await;
        let mailbox = mailboxes.entry(target.to_string()).or_default();
        if mailbox.len() >= self.mailbox_capacity
            && let Some(dropped) = mailbox.pop_front()
        {
            tracing::debug!(agent_id = %target, signal = %dropped.name, "mailbox full, dropping oldest signal");
        }
        mailbox.push_back(signal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Signal>>,
    }

    #[async_trait]
    impl SignalHandler for Recorder {
        async fn on_signal(&self, signal: &Signal) -> anyhow::Result<()> {
            self.seen.lock().await.push(signal.clone());
            Ok(())
        }
    }

    struct Sleeper;

    #[async_trait]
    impl SignalHandler for Sleeper {
        async fn on_signal(&self, _signal: &Signal) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    fn protocol() -> SignalProtocol {
        SignalProtocol::new(2, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn direct_signal_reaches_registered_handler() {
        let signals = protocol();
        let recorder = Arc::new(Recorder::default());
        signals.receive("b", recorder.clone()).await;

        let delivery = signals
            .send("a", "b", "ping", serde_json::json!({"x": 1}))
            .await;

        assert_eq!(delivery, SignalDelivery::Delivered);
        let seen = recorder.seen.lock().await;
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].from, "a");
        assert_eq!(seen[0].to.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn unhandled_signals_queue_with_bounded_mailbox() {
        let signals = protocol();
        for name in ["one", "two", "three"] {
            let delivery = signals.send("a", "b", name, serde_json::Value::Null).await;
            assert_eq!(delivery, SignalDelivery::Queued);
        }

        let pending = signals.take_pending("b").await;
        let names: Vec<&str> = pending.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["two", "three"]);
        assert!(signals.take_pending("b").await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn broadcast_skips_sender_and_survives_slow_handler() {
        let signals = protocol();
        let fast = Arc::new(Recorder::default());
        signals.receive("fast", fast.clone()).await;
        signals.receive("slow", Arc::new(Sleeper)).await;
        signals.receive("sender", Arc::new(Recorder::default())).await;

        let reached = signals
            .broadcast("sender", "shutdown", serde_json::Value::Null)
            .await;

        assert_eq!(reached, 1);
        assert_eq!(fast.seen.lock().await[0].to, None);
    }

    #[tokio::test]
    async fn stopped_receiver_falls_back_to_mailbox() {
        let signals = protocol();
        signals.receive("b", Arc::new(Recorder::default())).await;

        assert!(signals.stop_receiving("b").await);
        assert!(!signals.stop_receiving("b").await);
        let delivery = signals.send("a", "b", "ping", serde_json::Value::Null).await;

        assert_eq!(delivery, SignalDelivery::Queued);
        assert_eq!(signals.take_pending("b").await.len(), 1);
    }
}
