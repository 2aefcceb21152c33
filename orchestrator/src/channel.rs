//! Communication channel between the router and agent executors.
//!
//! Every message is validated, version-stamped and dispatched under its own
//! deadline. A reply that misses the deadline is dropped along with the
//! dispatch future, so it can never be applied.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use futures::future::join_all;
use switchyard_protocol::Message;
use switchyard_protocol::ProtocolVersion;
use switchyard_protocol::Response;
use tokio::sync::RwLock;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::ChannelConfig;
use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::registry::AgentRegistry;
use crate::validation::ChannelMetrics;
use crate::validation::MetricsAggregator;
use crate::validation::apply_requirements;
use crate::validation::validate_message;
use crate::validation::validate_response;

type AttemptKey = (String, u32);

/// Removes an attempt from the in-flight set when the dispatch ends, however
/// it ends.
struct InFlight {
    set: Arc<Mutex<HashSet<AttemptKey>>>,
    key: AttemptKey,
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.set
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

pub struct CommunicationChannel {
    registry: Arc<AgentRegistry>,
    config: ChannelConfig,
    in_flight: Arc<Mutex<HashSet<AttemptKey>>>,
    negotiated: RwLock<HashMap<String, ProtocolVersion>>,
    permits: Semaphore,
    metrics: RwLock<MetricsAggregator>,
}

impl CommunicationChannel {
    pub fn new(registry: Arc<AgentRegistry>, config: ChannelConfig) -> Self {
        Self {
            registry,
            permits: Semaphore::new(config.max_concurrent_dispatches),
            config,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            negotiated: RwLock::new(HashMap::new()),
            metrics: RwLock::new(MetricsAggregator::new()),
        }
    }

    /// Sends one message and waits for its reply. Timeouts and agent-side
    /// failures come back as a failure [`Response`]; `Err` means the message
    /// never reached a usable reply (malformed, unknown agent, version or
    /// identity mismatch).
    pub async fn send_message(&self, message: Message) -> Result<Response> {
        validate_message(&message, self.config.max_timeout_ms)?;

        let agent_id = message.agent_id.clone();
        let (descriptor, executor) = match (
            self.registry.get(&agent_id).await,
            self.registry.executor(&agent_id).await,
        ) {
            (Some(descriptor), Some(executor)) => (descriptor, executor),
            _ => {
                return Err(OrchestratorErr::AgentUnavailable(format!(
                    "agent `{agent_id}` is not registered"
                )));
            }
        };
        let version = self
            .negotiate(&descriptor.agent_type, &descriptor.supported_versions)
            .await?;
        let message = message.with_protocol_version(version);

        let _in_flight = self.claim(&message)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| OrchestratorErr::Shutdown)?;

        let deadline = Duration::from_millis(message.metadata.timeout_ms);
        let started = Instant::now();
        tracing::debug!(
            task_id = %message.task_id,
            agent_id = %agent_id,
            attempt = message.metadata.retry_count,
            timeout_ms = message.metadata.timeout_ms,
            "dispatching message"
        );
        let mut reply = match tokio::time::timeout(deadline, executor.invoke(message.clone(), deadline)).await {
            Ok(reply) => {
                validate_response(&message, &reply)?;
                apply_requirements(reply, &message.requirements)
            }
            Err(_) => {
                tracing::warn!(
                    task_id = %message.task_id,
                    agent_id = %agent_id,
                    timeout_ms = message.metadata.timeout_ms,
                    "dispatch deadline exceeded"
                );
                executor
                    .cancel(&message.metadata.correlation_id, message.metadata.retry_count)
                    .await;
                Response::timeout(&message)
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if reply.metrics.processing_time_ms == 0 {
            reply.metrics.processing_time_ms = elapsed_ms;
        }
        self.metrics.write().await.add(&message, &reply, elapsed_ms);
        Ok(reply)
    }

    /// Sends every message and returns one reply per input, in input order.
    /// A message that cannot be sent yields a failure reply of its own.
    pub async fn send_batch(&self, messages: Vec<Message>) -> Vec<Response> {
        let requests = messages.clone();
        self.dispatch_all(messages)
            .await
            .into_iter()
            .zip(requests)
            .map(|(result, request)| result.unwrap_or_else(|err| failure_reply(&request, &err)))
            .collect()
    }

    /// Groups messages by agent and dispatches the groups concurrently.
    pub(crate) async fn dispatch_all(&self, messages: Vec<Message>) -> Vec<Result<Response>> {
        let total = messages.len();
        let mut groups: BTreeMap<String, Vec<(usize, Message)>> = BTreeMap::new();
        for (index, message) in messages.into_iter().enumerate() {
            groups
                .entry(message.agent_id.clone())
                .or_default()
                .push((index, message));
        }
        tracing::debug!(total, groups = groups.len(), "dispatching batch");

        let dispatched = join_all(groups.into_values().map(|group| async move {
            join_all(group.into_iter().map(|(index, message)| async move {
                (index, self.send_message(message).await)
            }))
            .await
        }))
        .await;

        let mut slots: Vec<Option<Result<Response>>> = (0..total).map(|_| None).collect();
        for (index, result) in dispatched.into_iter().flatten() {
            slots[index] = Some(result);
        }
        slots
            .into_iter()
            .map(|slot| {
                slot.unwrap_or_else(|| Err(OrchestratorErr::Protocol("batch slot left empty".to_string())))
            })
            .collect()
    }

    /// Highest version both sides speak. Cached per agent type.
    pub async fn negotiate(&self, agent_type: &str, supported: &[ProtocolVersion]) -> Result<ProtocolVersion> {
        if let Some(cached) = self.negotiated.read().await.get(agent_type)
            && supported.contains(cached)
        {
            return Ok(*cached);
        }
        let version = ProtocolVersion::highest_common(&self.config.protocol_versions, supported)
            .ok_or_else(|| {
                OrchestratorErr::Protocol(format!(
                    "no common protocol version with `{agent_type}` (ours {:?}, theirs {supported:?})",
                    self.config.protocol_versions
                ))
            })?;
        tracing::debug!(agent_type, %version, "protocol version negotiated");
        self.negotiated
            .write()
            .await
            .insert(agent_type.to_string(), version);
        Ok(version)
    }

    /// Tells the backend an abandoned attempt is no longer wanted.
    pub async fn cancel_attempt(&self, message: &Message) {
        if let Some(executor) = self.registry.executor(&message.agent_id).await {
            executor
                .cancel(&message.metadata.correlation_id, message.metadata.retry_count)
                .await;
        }
    }

    pub async fn metrics(&self) -> ChannelMetrics {
        self.metrics.read().await.summary()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn claim(&self, message: &Message) -> Result<InFlight> {
        let key = (
            message.metadata.correlation_id.clone(),
            message.metadata.retry_count,
        );
        let mut set = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !set.insert(key.clone()) {
            return Err(OrchestratorErr::Protocol(format!(
                "attempt {} of correlation `{}` is already in flight",
                key.1, key.0
            )));
        }
        Ok(InFlight {
            set: Arc::clone(&self.in_flight),
            key,
        })
    }
}

/// Turns a local dispatch error into the reply the caller would have seen.
pub(crate) fn failure_reply(request: &Message, err: &OrchestratorErr) -> Response {
    let reply = Response::failure(request, err.class(), err.to_string());
    if err.is_retryable() {
        reply
    } else {
        reply.non_retryable()
    }
}
