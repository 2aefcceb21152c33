//! Agent registry. Owns every agent's descriptor, executor and circuit
//! breaker; the only writer of health state.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::AgentDescriptor;
use switchyard_protocol::AgentExecutor;
use switchyard_protocol::HealthState;
use switchyard_protocol::TaskType;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::circuit::CircuitBreaker;
use crate::circuit::CircuitSnapshot;
use crate::circuit::CircuitState;
use crate::config::HealthConfig;
use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::events::EventEmitter;

struct AgentEntry {
    descriptor: AgentDescriptor,
    executor: Arc<dyn AgentExecutor>,
    circuit: CircuitBreaker,
    outcomes: VecDeque<bool>,
    demoted: bool,
    calls: u64,
    total_latency_ms: u64,
}

impl AgentEntry {
    fn health(&self, degraded_after: u32) -> HealthState {
        if self.circuit.state() != CircuitState::Closed {
            HealthState::Tripped
        } else if self.demoted || self.circuit.consecutive_failures() >= degraded_after {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }

    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 1.0;
        }
        let successes = self.outcomes.iter().filter(|ok| **ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn descriptor(&self, degraded_after: u32) -> AgentDescriptor {
        AgentDescriptor {
            health: self.health(degraded_after),
            consecutive_failures: self.circuit.consecutive_failures(),
            ..self.descriptor.clone()
        }
    }
}

/// Read-only health view of one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent_id: String,
    pub health: HealthState,
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    pub circuit: CircuitSnapshot,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub demoted: bool,
}

/// An agent the health monitor should probe now.
pub struct ProbeTarget {
    pub agent_id: String,
    pub executor: Arc<dyn AgentExecutor>,
    /// The probe holds the agent's single half-open slot.
    pub half_open: bool,
}

#[derive(Default)]
struct Agents {
    order: Vec<String>,
    entries: HashMap<String, AgentEntry>,
}

pub struct AgentRegistry {
    agents: RwLock<Agents>,
    config: HealthConfig,
    events: EventEmitter,
}

impl AgentRegistry {
    pub fn new(config: HealthConfig, events: EventEmitter) -> Self {
        Self {
            agents: RwLock::new(Agents::default()),
            config,
            events,
        }
    }

    pub async fn register(
        &self,
        descriptor: AgentDescriptor,
        executor: Arc<dyn AgentExecutor>,
    ) -> Result<()> {
        if descriptor.id.trim().is_empty() {
            return Err(OrchestratorErr::Validation("agent id must not be empty".to_string()));
        }
        let mut agents = self.agents.write().await;
        if agents.entries.contains_key(&descriptor.id) {
            return Err(OrchestratorErr::Validation(format!(
                "agent `{}` is already registered",
                descriptor.id
            )));
        }
        tracing::info!(
            agent_id = %descriptor.id,
            agent_type = %descriptor.agent_type,
            capabilities = ?descriptor.capabilities,
            "agent registered"
        );
        let id = descriptor.id.clone();
        agents.order.push(id.clone());
        agents.entries.insert(
            id,
            AgentEntry {
                descriptor,
                executor,
                circuit: CircuitBreaker::new(&self.config),
                outcomes: VecDeque::new(),
                demoted: false,
                calls: 0,
                total_latency_ms: 0,
            },
        );
        Ok(())
    }

    pub async fn get(&self, agent_id: &str) -> Option<AgentDescriptor> {
        let agents = self.agents.read().await;
        agents
            .entries
            .get(agent_id)
            .map(|entry| entry.descriptor(self.config.degraded_after))
    }

    pub async fn executor(&self, agent_id: &str) -> Option<Arc<dyn AgentExecutor>> {
        let agents = self.agents.read().await;
        agents
            .entries
            .get(agent_id)
            .map(|entry| Arc::clone(&entry.executor))
    }

    /// Agents able to run `task_type`, in registration order.
    pub async fn list_by_capability(&self, task_type: TaskType) -> Vec<AgentDescriptor> {
        let agents = self.agents.read().await;
        agents
            .order
            .iter()
            .filter_map(|id| agents.entries.get(id))
            .filter(|entry| entry.descriptor.supports(task_type))
            .map(|entry| entry.descriptor(self.config.degraded_after))
            .collect()
    }

    pub async fn list(&self) -> Vec<AgentDescriptor> {
        self.list_by_capability(TaskType::Auto).await
    }

    /// Success share of the agent's recent outcomes; 1.0 with no history.
    pub async fn success_rate(&self, agent_id: &str) -> f64 {
        let agents = self.agents.read().await;
        agents
            .entries
            .get(agent_id)
            .map_or(1.0, AgentEntry::success_rate)
    }

    /// Circuit gate consulted before every dispatch.
    pub async fn allow(&self, agent_id: &str) -> bool {
        self.mutate(agent_id, |entry| entry.circuit.allow(Instant::now()))
            .await
            .unwrap_or(false)
    }

    /// Whether a tripped agent's cooldown has elapsed, so the next dispatch
    /// may serve as its half-open trial.
    pub async fn probe_due(&self, agent_id: &str) -> bool {
        let agents = self.agents.read().await;
        agents
            .entries
            .get(agent_id)
            .is_some_and(|entry| entry.circuit.probe_due(Instant::now()))
    }

    /// Returns an admitted half-open slot that produced no outcome.
    pub async fn release_probe(&self, agent_id: &str) {
        self.mutate(agent_id, |entry| entry.circuit.release_probe())
            .await;
    }

    pub async fn record_outcome(&self, agent_id: &str, success: bool, latency_ms: u64) {
        let window = self.config.success_window;
        self.mutate(agent_id, |entry| {
            entry.calls += 1;
            entry.total_latency_ms += latency_ms;
            entry.outcomes.push_back(success);
            while entry.outcomes.len() > window {
                entry.outcomes.pop_front();
            }
            if success {
                entry.circuit.record_success();
            } else {
                entry.circuit.record_failure(Instant::now());
            }
        })
        .await;
        tracing::debug!(agent_id, success, latency_ms, "outcome recorded");
    }

    /// Ranks the agent lower without excluding it.
    pub async fn demote(&self, agent_id: &str) {
        self.mutate(agent_id, |entry| entry.demoted = true).await;
    }

    pub async fn clear_demotion(&self, agent_id: &str) {
        self.mutate(agent_id, |entry| entry.demoted = false).await;
    }

    /// Opens the agent's circuit now, held open for at least `hold`.
    pub async fn trip(&self, agent_id: &str, hold: Option<Duration>) {
        self.mutate(agent_id, |entry| entry.circuit.trip(Instant::now(), hold))
            .await;
    }

    pub async fn mark_probed(&self, agent_id: &str, at: DateTime<Utc>) {
        self.mutate(agent_id, |entry| entry.descriptor.last_probe_at = Some(at))
            .await;
    }

    /// Agents due for a health probe. Open circuits whose cooldown elapsed
    /// are moved to half-open here, claiming their single probe slot.
    pub async fn probe_targets(&self) -> Vec<ProbeTarget> {
        let ids = self.agents.read().await.order.clone();
        let mut targets = Vec::new();
        for id in ids {
            let target = self
                .mutate(&id, |entry| {
                    let now = Instant::now();
                    let half_open = match entry.circuit.state() {
                        CircuitState::Closed => false,
                        CircuitState::Open if entry.circuit.probe_due(now) => {
                            entry.circuit.allow(now)
                        }
                        CircuitState::Open | CircuitState::HalfOpen => return None,
                    };
                    Some(ProbeTarget {
                        agent_id: entry.descriptor.id.clone(),
                        executor: Arc::clone(&entry.executor),
                        half_open,
                    })
                })
                .await
                .flatten();
            targets.extend(target);
        }
        targets
    }

    pub async fn snapshot(&self) -> Vec<AgentHealth> {
        let agents = self.agents.read().await;
        agents
            .order
            .iter()
            .filter_map(|id| agents.entries.get(id))
            .map(|entry| AgentHealth {
                agent_id: entry.descriptor.id.clone(),
                health: entry.health(self.config.degraded_after),
                consecutive_failures: entry.circuit.consecutive_failures(),
                last_probe_at: entry.descriptor.last_probe_at,
                circuit: entry.circuit.snapshot(),
                success_rate: entry.success_rate(),
                avg_latency_ms: if entry.calls == 0 {
                    0.0
                } else {
                    entry.total_latency_ms as f64 / entry.calls as f64
                },
                demoted: entry.demoted,
            })
            .collect()
    }

    /// Applies `change` to one agent and publishes any resulting health or
    /// circuit transition. `None` if the agent is unknown.
    async fn mutate<T>(&self, agent_id: &str, change: impl FnOnce(&mut AgentEntry) -> T) -> Option<T> {
        let degraded_after = self.config.degraded_after;
        let mut agents = self.agents.write().await;
        let entry = agents.entries.get_mut(agent_id)?;

        let health_before = entry.health(degraded_after);
        let circuit_before = entry.circuit.state();
        let result = change(entry);
        let health_after = entry.health(degraded_after);
        let circuit_after = entry.circuit.state();
        drop(agents);

        if circuit_before != circuit_after {
            self.events
                .circuit_changed(agent_id, circuit_before, circuit_after);
        }
        if health_before != health_after {
            self.events
                .health_changed(agent_id, health_before, health_after);
        }
        Some(result)
    }
}
