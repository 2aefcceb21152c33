//! Fallback-chain construction and the sequential walk over it.
//!
//! A chain is every capable agent ranked by
//! `w1·health + w2·(1/cost) + w3·success_rate + w4·capability_fit`, with the
//! configured terminal agent appended last. Tripped agents are left out until
//! their cooldown elapses. The walk tries one entry at a time with the task's
//! correlation id and a growing retry count, and stops at the first
//! successful reply or the first non-retryable failure.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::AgentDescriptor;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::HealthState;
use switchyard_protocol::Message;
use switchyard_protocol::Response;
use switchyard_protocol::ResponseStatus;
use switchyard_protocol::Task;
use switchyard_protocol::TaskType;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::batch::BatchCoordinator;
use crate::channel::failure_reply;
use crate::classifier::Classification;
use crate::config::RouterConfig;
use crate::events::EventEmitter;
use crate::mode::ChainTier;
use crate::mode::RoutingMode;
use crate::registry::AgentRegistry;
use crate::session::SessionMonitor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChainEntry {
    pub agent_id: String,
    pub tier: ChainTier,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FallbackChain {
    pub entries: Vec<ChainEntry>,
}

impl FallbackChain {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn agent_ids(&self) -> Vec<&str> {
        self.entries
            .iter()
            .map(|entry| entry.agent_id.as_str())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Partial,
    Failed,
}

/// One entry of a task's attempt log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub agent_id: String,
    pub tier: ChainTier,
    pub retry_count: u32,
    pub status: AttemptStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorClass>,
    pub elapsed_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl AttemptRecord {
    pub fn is_success(&self) -> bool {
        self.status != AttemptStatus::Failed
    }
}

/// Final reply plus how it was reached.
#[derive(Debug, Clone)]
pub struct RouteOutcome {
    pub response: Response,
    pub attempts: Vec<AttemptRecord>,
    pub chain: FallbackChain,
}

pub struct Router {
    registry: Arc<AgentRegistry>,
    batch: Arc<BatchCoordinator>,
    session: Arc<SessionMonitor>,
    events: EventEmitter,
    config: RouterConfig,
}

impl Router {
    pub fn new(
        registry: Arc<AgentRegistry>,
        batch: Arc<BatchCoordinator>,
        session: Arc<SessionMonitor>,
        events: EventEmitter,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            batch,
            session,
            events,
            config,
        }
    }

    /// Ranked chain for `task`, restricted to the tiers `mode` permits.
    pub async fn build_chain(&self, classification: &Classification, mode: RoutingMode) -> FallbackChain {
        let task_type = classification.task_type;
        let terminal = self.config.terminal_agent.as_deref();
        let weights = self.config.weights;

        let mut ranked = Vec::new();
        for agent in self.registry.list_by_capability(task_type).await {
            if Some(agent.id.as_str()) == terminal {
                continue;
            }
            if agent.health == HealthState::Tripped && !self.registry.probe_due(&agent.id).await {
                continue;
            }
            let success_rate = self.registry.success_rate(&agent.id).await;
            let fit = capability_fit(&agent, task_type, classification.confidence);
            let score = weights.health * agent.health.score()
                + weights.cost * agent.cost.inverse()
                + weights.success_rate * success_rate
                + weights.capability_fit * fit;
            ranked.push((agent.id, score));
        }
        // Stable: equal scores keep registration order.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut entries: Vec<ChainEntry> = ranked
            .into_iter()
            .enumerate()
            .map(|(rank, (agent_id, score))| ChainEntry {
                agent_id,
                tier: if rank == 0 {
                    ChainTier::Primary
                } else {
                    ChainTier::Fallback
                },
                score,
            })
            .filter(|entry| mode.permits(entry.tier))
            .collect();

        if let Some(terminal) = terminal {
            if self.registry.get(terminal).await.is_some() {
                entries.push(ChainEntry {
                    agent_id: terminal.to_string(),
                    tier: ChainTier::Terminal,
                    score: 0.0,
                });
            } else {
                tracing::warn!(agent_id = terminal, "terminal agent is not registered");
            }
        }
        FallbackChain { entries }
    }

    /// Walks the chain until a reply ends the task. Always yields a reply.
    pub async fn route(
        &self,
        task: &Task,
        classification: &Classification,
        mode: RoutingMode,
        cancel: &CancellationToken,
    ) -> RouteOutcome {
        let chain = self.build_chain(classification, mode).await;
        let timeout_ms = task.timeout_ms.unwrap_or(self.config.default_timeout_ms);
        let session_id = task.session_id.as_deref();
        let mut context = task.context.clone();
        let mut attempts: Vec<AttemptRecord> = Vec::new();
        let mut last: Option<Response> = None;

        tracing::debug!(
            task_id = %task.id,
            task_type = %classification.task_type,
            %mode,
            chain = ?chain.agent_ids(),
            "fallback chain built"
        );

        let entries = chain.entries.clone();
        for (index, entry) in entries.iter().enumerate() {
            let retry_count = index as u32;
            let message = Message::for_task(task, &entry.agent_id, classification.task_type, retry_count, timeout_ms)
                .with_context(context.clone());

            if cancel.is_cancelled() {
                return finish(cancelled_reply(&message), attempts, chain);
            }
            if entry.tier != ChainTier::Terminal && !self.registry.allow(&entry.agent_id).await {
                tracing::debug!(task_id = %task.id, agent_id = %entry.agent_id, "circuit open, skipping");
                attempts.push(record(
                    entry,
                    retry_count,
                    AttemptStatus::Failed,
                    Some(ErrorClass::AgentUnavailable),
                    0,
                    Some("circuit open".to_string()),
                ));
                last = Some(Response::failure(&message, ErrorClass::AgentUnavailable, "circuit open"));
                continue;
            }

            let started = Instant::now();
            let dispatched = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.batch.dispatch(message.clone()) => Some(result),
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;
            let Some(result) = dispatched else {
                self.batch.channel().cancel_attempt(&message).await;
                self.registry.release_probe(&entry.agent_id).await;
                return finish(cancelled_reply(&message), attempts, chain);
            };

            let (reply, local_error) = match result {
                Ok(reply) => (reply, false),
                Err(err) => (failure_reply(&message, &err), true),
            };
            let quota = if local_error {
                None
            } else {
                self.session.observe_response(&reply, session_id).await
            };

            if reply.is_success() {
                self.registry.record_outcome(&entry.agent_id, true, elapsed_ms).await;
                let status = if reply.status == ResponseStatus::Partial {
                    AttemptStatus::Partial
                } else {
                    AttemptStatus::Success
                };
                attempts.push(record(entry, retry_count, status, None, elapsed_ms, None));
                tracing::info!(
                    task_id = %task.id,
                    agent_id = %entry.agent_id,
                    attempt = retry_count,
                    elapsed_ms,
                    "task answered"
                );
                return finish(reply, attempts, chain);
            }

            let class = if quota.is_some() {
                ErrorClass::QuotaExceeded
            } else {
                reply.error_class().unwrap_or(ErrorClass::RemoteError)
            };
            let text = reply
                .error
                .as_ref()
                .map_or_else(|| class.to_string(), |error| error.message.clone());

            // A quota trip already opened the circuit.
            if quota.is_none() && class.counts_against_agent() {
                self.registry.record_outcome(&entry.agent_id, false, elapsed_ms).await;
            } else {
                self.registry.release_probe(&entry.agent_id).await;
            }
            self.events
                .attempt_failed(&task.id, &entry.agent_id, retry_count, class);
            attempts.push(record(
                entry,
                retry_count,
                AttemptStatus::Failed,
                Some(class),
                elapsed_ms,
                Some(text.clone()),
            ));
            tracing::warn!(
                task_id = %task.id,
                agent_id = %entry.agent_id,
                attempt = retry_count,
                elapsed_ms,
                error = %class,
                "attempt failed"
            );

            let retryable = quota.is_some() || reply.is_retryable();
            last = Some(reply);
            if !retryable {
                break;
            }
            context.push_episode(entry.agent_id.clone(), format!("{class}: {text}"));
        }

        let response = match last {
            Some(reply) => reply,
            None => {
                let message = Message::for_task(task, "", classification.task_type, 0, timeout_ms);
                Response::failure(
                    &message,
                    ErrorClass::AgentUnavailable,
                    format!("no eligible agent for `{}` tasks in {mode} mode", classification.task_type),
                )
            }
        };
        let mut details = serde_json::json!({ "attempts": attempts });
        if let Some(agent_details) = response.error.as_ref().and_then(|error| error.details.clone()) {
            details["agent"] = agent_details;
        }
        finish(response.with_details(details), attempts, chain)
    }
}

fn finish(response: Response, attempts: Vec<AttemptRecord>, chain: FallbackChain) -> RouteOutcome {
    RouteOutcome {
        response,
        attempts,
        chain,
    }
}

/// How well an agent's capabilities match the classified type. Concrete types
/// carry the classifier's confidence; `auto` prefers generalists.
fn capability_fit(agent: &AgentDescriptor, task_type: TaskType, confidence: f64) -> f64 {
    if task_type == TaskType::Auto {
        let covered = TaskType::CONCRETE
            .iter()
            .filter(|concrete| agent.capabilities.contains(concrete))
            .count();
        covered as f64 / TaskType::CONCRETE.len() as f64
    } else {
        confidence
    }
}

fn record(
    entry: &ChainEntry,
    retry_count: u32,
    status: AttemptStatus,
    error: Option<ErrorClass>,
    elapsed_ms: u64,
    message: Option<String>,
) -> AttemptRecord {
    AttemptRecord {
        agent_id: entry.agent_id.clone(),
        tier: entry.tier,
        retry_count,
        status,
        error,
        elapsed_ms,
        message,
    }
}

fn cancelled_reply(message: &Message) -> Response {
    Response::failure(message, ErrorClass::Cancelled, "task cancelled").non_retryable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::CommunicationChannel;
    use crate::config::BatchConfig;
    use crate::config::ChannelConfig;
    use crate::config::HealthConfig;
    use crate::config::SessionConfig;
    use crate::events::EventBus;
    use pretty_assertions::assert_eq;
    use std::time::Duration;
    use switchyard_protocol::AgentExecutor;
    use switchyard_protocol::CostProfile;
    use switchyard_test_support::Behavior;
    use switchyard_test_support::ScriptedExecutor;
    use tokio_util::task::TaskTracker;

    struct Fixture {
        router: Router,
        registry: Arc<AgentRegistry>,
    }

    async fn fixture(agents: Vec<(AgentDescriptor, Arc<dyn AgentExecutor>)>, terminal: Option<&str>) -> Fixture {
        let events = EventEmitter::new(EventBus::new(Duration::from_secs(1)));
        let registry = Arc::new(AgentRegistry::new(HealthConfig::default(), events.clone()));
        for (descriptor, executor) in agents {
            registry.register(descriptor, executor).await.unwrap();
        }
        let channel = Arc::new(CommunicationChannel::new(Arc::clone(&registry), ChannelConfig::default()));
        let batch = Arc::new(BatchCoordinator::new(
            channel,
            BatchConfig {
                enabled: false,
                ..Default::default()
            },
            TaskTracker::new(),
        ));
        let session = Arc::new(SessionMonitor::new(
            SessionConfig::default(),
            Arc::clone(&registry),
            events.clone(),
        ));
        let config = RouterConfig {
            terminal_agent: terminal.map(str::to_string),
            default_timeout_ms: 1_000,
            ..Default::default()
        };
        Fixture {
            router: Router::new(Arc::clone(&registry), batch, session, events, config),
            registry,
        }
    }

    fn code_agent(id: &str) -> AgentDescriptor {
        AgentDescriptor::new(id, [TaskType::Code])
    }

    fn code_task() -> (Task, Classification) {
        (
            Task::new(TaskType::Code, "implement X"),
            Classification::explicit(TaskType::Code),
        )
    }

    #[tokio::test]
    async fn chain_ranks_by_score_and_appends_terminal() {
        let fixture = fixture(
            vec![
                (
                    code_agent("pricey").with_cost(CostProfile::per_unit(4.0)),
                    ScriptedExecutor::succeeding("ok").shared(),
                ),
                (code_agent("cheap"), ScriptedExecutor::succeeding("ok").shared()),
                (
                    AgentDescriptor::new("thinker", [TaskType::Reasoning]),
                    ScriptedExecutor::succeeding("ok").shared(),
                ),
                (
                    AgentDescriptor::new("last", [TaskType::Reasoning]),
                    ScriptedExecutor::succeeding("ok").shared(),
                ),
            ],
            Some("last"),
        )
        .await;
        let (_, classification) = code_task();

        let chain = fixture.router.build_chain(&classification, RoutingMode::All).await;

        assert_eq!(chain.agent_ids(), vec!["cheap", "pricey", "last"]);
        let tiers: Vec<ChainTier> = chain.entries.iter().map(|entry| entry.tier).collect();
        assert_eq!(tiers, vec![ChainTier::Primary, ChainTier::Fallback, ChainTier::Terminal]);

        let primary_only = fixture
            .router
            .build_chain(&classification, RoutingMode::PrimaryOnly)
            .await;
        assert_eq!(primary_only.agent_ids(), vec!["cheap", "last"]);
        let fallback_only = fixture
            .router
            .build_chain(&classification, RoutingMode::FallbackOnly)
            .await;
        assert_eq!(fallback_only.agent_ids(), vec!["pricey", "last"]);
    }

    #[tokio::test]
    async fn tripped_agents_are_left_out() {
        let fixture = fixture(
            vec![
                (code_agent("a"), ScriptedExecutor::succeeding("ok").shared()),
                (code_agent("b"), ScriptedExecutor::succeeding("ok").shared()),
            ],
            None,
        )
        .await;
        fixture.registry.trip("a", None).await;
        let (_, classification) = code_task();

        let chain = fixture.router.build_chain(&classification, RoutingMode::All).await;

        assert_eq!(chain.agent_ids(), vec!["b"]);
    }

    #[tokio::test]
    async fn failures_advance_with_episodes_for_the_next_agent() {
        let c = ScriptedExecutor::succeeding("done").shared();
        let fixture = fixture(
            vec![
                (code_agent("a"), ScriptedExecutor::failing("upstream 500").shared()),
                (code_agent("b"), ScriptedExecutor::failing("crashed").shared()),
                (code_agent("c"), c.clone()),
            ],
            None,
        )
        .await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        assert_eq!(outcome.response.agent_id, "c");
        let log: Vec<(&str, AttemptStatus)> = outcome
            .attempts
            .iter()
            .map(|attempt| (attempt.agent_id.as_str(), attempt.status))
            .collect();
        assert_eq!(
            log,
            vec![
                ("a", AttemptStatus::Failed),
                ("b", AttemptStatus::Failed),
                ("c", AttemptStatus::Success),
            ]
        );
        let seen = c.calls().await;
        assert_eq!(seen[0].metadata.retry_count, 2);
        assert_eq!(seen[0].metadata.correlation_id, task.correlation_id);
        let episodes = &seen[0].context.episodic.as_ref().unwrap().episodes;
        let authors: Vec<&str> = episodes.iter().map(|episode| episode.agent_id.as_str()).collect();
        assert_eq!(authors, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_the_walk() {
        let b = ScriptedExecutor::succeeding("ok").shared();
        let fixture = fixture(
            vec![
                (
                    code_agent("a"),
                    ScriptedExecutor::always(Behavior::fail_permanently("malformed prompt")).shared(),
                ),
                (code_agent("b"), b.clone()),
            ],
            None,
        )
        .await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        assert_eq!(outcome.response.status, ResponseStatus::Failure);
        assert_eq!(outcome.attempts.len(), 1);
        assert_eq!(b.call_count().await, 0);
        let details = outcome.response.error.unwrap().details.unwrap();
        assert_eq!(details["attempts"][0]["agent_id"], "a");
    }

    #[tokio::test]
    async fn quota_text_forces_failover_and_trips_agent() {
        let fixture = fixture(
            vec![
                (
                    code_agent("a"),
                    ScriptedExecutor::always(Behavior::FailWithText(
                        "You've hit your usage limit. Try again in 3 hours.".to_string(),
                    ))
                    .shared(),
                ),
                (code_agent("b"), ScriptedExecutor::succeeding("ok").shared()),
            ],
            None,
        )
        .await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        assert!(outcome.response.is_success());
        assert_eq!(outcome.attempts[0].error, Some(ErrorClass::QuotaExceeded));
        assert_eq!(
            fixture.registry.get("a").await.unwrap().health,
            HealthState::Tripped
        );
    }

    #[tokio::test]
    async fn unrepresentable_reset_time_still_fails_over() {
        let fixture = fixture(
            vec![
                (
                    code_agent("a"),
                    ScriptedExecutor::always(Behavior::FailWithText(
                        "429 rate limit; Retry-After: 10000000000000".to_string(),
                    ))
                    .shared(),
                ),
                (code_agent("term"), ScriptedExecutor::succeeding("covered").shared()),
            ],
            Some("term"),
        )
        .await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        assert_eq!(outcome.response.status, ResponseStatus::Success);
        assert_eq!(outcome.response.agent_id, "term");
        assert_eq!(outcome.attempts.len(), 2);
        assert_eq!(outcome.attempts[0].error, Some(ErrorClass::QuotaExceeded));
    }

    #[tokio::test]
    async fn terminal_failure_keeps_agent_details() {
        let fixture = fixture(
            vec![(
                code_agent("a"),
                ScriptedExecutor::always(Behavior::custom(|message| {
                    Response::failure(message, ErrorClass::RemoteError, "tool crashed")
                        .non_retryable()
                        .with_details(serde_json::json!({ "exit_code": 2 }))
                }))
                .shared(),
            )],
            None,
        )
        .await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        let details = outcome.response.error.unwrap().details.unwrap();
        assert_eq!(details["agent"]["exit_code"], 2);
        assert_eq!(details["attempts"][0]["agent_id"], "a");
        assert_eq!(details["attempts"][0]["message"], "tool crashed");
    }

    #[tokio::test]
    async fn empty_chain_reports_agent_unavailable() {
        let fixture = fixture(Vec::new(), None).await;
        let (task, classification) = code_task();

        let outcome = fixture
            .router
            .route(&task, &classification, RoutingMode::All, &CancellationToken::new())
            .await;

        assert_eq!(outcome.response.error_class(), Some(ErrorClass::AgentUnavailable));
        assert!(outcome.attempts.is_empty());
    }
}
