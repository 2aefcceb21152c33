//! Batch coordinator.
//!
//! Messages for the same agent that arrive within a short window are flushed
//! together through [`CommunicationChannel::dispatch_all`]. Each caller still
//! gets exactly the reply its own message produced, so batching is invisible
//! apart from the window delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use futures::future::join_all;
use serde::Serialize;
use switchyard_protocol::Message;
use switchyard_protocol::Response;
use tokio::sync::Mutex;
use tokio::sync::oneshot;
use tokio_util::task::TaskTracker;

use crate::channel::CommunicationChannel;
use crate::config::BatchConfig;
use crate::error::OrchestratorErr;
use crate::error::Result;

struct Pending {
    message: Message,
    reply: oneshot::Sender<Result<Response>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchStats {
    pub batches: u64,
    pub batched_messages: u64,
    pub single_dispatches: u64,
}

pub struct BatchCoordinator {
    channel: Arc<CommunicationChannel>,
    config: BatchConfig,
    pending: Mutex<HashMap<String, Vec<Pending>>>,
    tracker: TaskTracker,
    batches: AtomicU64,
    batched_messages: AtomicU64,
    single_dispatches: AtomicU64,
}

impl BatchCoordinator {
    pub fn new(channel: Arc<CommunicationChannel>, config: BatchConfig, tracker: TaskTracker) -> Self {
        Self {
            channel,
            config,
            pending: Mutex::new(HashMap::new()),
            tracker,
            batches: AtomicU64::new(0),
            batched_messages: AtomicU64::new(0),
            single_dispatches: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> &Arc<CommunicationChannel> {
        &self.channel
    }

    /// Sends `message`, possibly alongside other messages for the same agent.
    pub async fn dispatch(self: &Arc<Self>, message: Message) -> Result<Response> {
        if !self.config.enabled {
            self.single_dispatches.fetch_add(1, Ordering::Relaxed);
            return self.channel.send_message(message).await;
        }

        let agent_id = message.agent_id.clone();
        let (reply, receiver) = oneshot::channel();
        let full = {
            let mut pending = self.pending.lock().await;
            let queue = pending.entry(agent_id.clone()).or_default();
            queue.push(Pending { message, reply });
            if queue.len() == 1 {
                let this = Arc::clone(self);
                let agent_id = agent_id.clone();
                self.tracker.spawn(async move {
                    tokio::time::sleep(this.config.window()).await;
                    this.flush(&agent_id).await;
                });
            }
            queue.len() >= self.config.max_batch
        };
        if full {
            let this = Arc::clone(self);
            self.tracker.spawn(async move { this.flush(&agent_id).await });
        }

        receiver.await.unwrap_or(Err(OrchestratorErr::Shutdown))
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            batches: self.batches.load(Ordering::Relaxed),
            batched_messages: self.batched_messages.load(Ordering::Relaxed),
            single_dispatches: self.single_dispatches.load(Ordering::Relaxed),
        }
    }

    async fn flush(&self, agent_id: &str) {
        let queued = self
            .pending
            .lock()
            .await
            .remove(agent_id)
            .unwrap_or_default();
        // Callers that gave up while waiting (cancelled tasks) must not reach
        // the backend.
        let (live, abandoned): (Vec<Pending>, Vec<Pending>) = queued
            .into_iter()
            .partition(|pending| !pending.reply.is_closed());
        if !abandoned.is_empty() {
            tracing::debug!(agent_id, dropped = abandoned.len(), "skipping abandoned messages");
        }
        if live.is_empty() {
            return;
        }
        let (messages, replies): (Vec<Message>, Vec<_>) = live
            .into_iter()
            .map(|pending| (pending.message, pending.reply))
            .unzip();

        let size = messages.len() as u64;
        let results = if messages.len() >= self.config.min_batch {
            tracing::debug!(agent_id, size, "flushing batch");
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.batched_messages.fetch_add(size, Ordering::Relaxed);
            self.channel.dispatch_all(messages).await
        } else {
            self.single_dispatches.fetch_add(size, Ordering::Relaxed);
            join_all(
                messages
                    .into_iter()
                    .map(|message| self.channel.send_message(message)),
            )
            .await
        };

        for (reply, result) in replies.into_iter().zip(results) {
            // The caller may have been cancelled while waiting.
            let _ = reply.send(result);
        }
    }
}
