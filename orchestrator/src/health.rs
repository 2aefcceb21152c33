//! Periodic health probes.
//!
//! Closed agents are probed to catch silent breakage; open agents are probed
//! once their cooldown has elapsed, which is their half-open trial. Agents
//! whose executor cannot probe are left to traffic-driven half-open trials.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use switchyard_protocol::ProbeOutcome;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::registry::AgentRegistry;
use crate::registry::ProbeTarget;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeRound {
    pub healthy: usize,
    pub unhealthy: usize,
    pub unsupported: usize,
}

pub struct HealthMonitor {
    registry: Arc<AgentRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(registry: Arc<AgentRegistry>, interval: Duration) -> Self {
        Self { registry, interval }
    }

    /// Runs probe rounds every interval until `cancel` fires.
    pub fn spawn(self, tracker: &TaskTracker, cancel: CancellationToken) {
        tracker.spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let round = self.probe_once().await;
                        tracing::trace!(?round, "health probe round finished");
                    }
                }
            }
            tracing::debug!("health monitor stopped");
        });
    }

    pub async fn probe_once(&self) -> ProbeRound {
        let targets = self.registry.probe_targets().await;
        // A probe may not outlive the round it belongs to.
        let deadline = self.interval;
        let outcomes = join_all(targets.into_iter().map(|target| async move {
            let outcome = tokio::time::timeout(deadline, target.executor.probe())
                .await
                .unwrap_or_else(|_| ProbeOutcome::Unhealthy("probe timed out".to_string()));
            (target, outcome)
        }))
        .await;

        let mut round = ProbeRound::default();
        for (target, outcome) in outcomes {
            self.apply(&target, &outcome).await;
            match outcome {
                ProbeOutcome::Healthy => round.healthy += 1,
                ProbeOutcome::Unhealthy(_) => round.unhealthy += 1,
                ProbeOutcome::Unsupported => round.unsupported += 1,
            }
        }
        round
    }

    async fn apply(&self, target: &ProbeTarget, outcome: &ProbeOutcome) {
        let ProbeTarget {
            agent_id,
            half_open,
            ..
        } = target;
        match outcome {
            ProbeOutcome::Unsupported => {
                if *half_open {
                    self.registry.release_probe(agent_id).await;
                }
                return;
            }
            ProbeOutcome::Healthy => {
                if *half_open {
                    self.registry.record_outcome(agent_id, true, 0).await;
                }
            }
            ProbeOutcome::Unhealthy(reason) => {
                tracing::warn!(agent_id = %agent_id, %reason, "health probe failed");
                self.registry.record_outcome(agent_id, false, 0).await;
            }
        }
        self.registry.mark_probed(agent_id, Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HealthConfig;
    use crate::events::EventBus;
    use crate::events::EventEmitter;
    use pretty_assertions::assert_eq;
    use switchyard_protocol::AgentDescriptor;
    use switchyard_protocol::HealthState;
    use switchyard_protocol::TaskType;
    use switchyard_test_support::ScriptedExecutor;

    async fn setup() -> (Arc<AgentRegistry>, Arc<ScriptedExecutor>) {
        let registry = Arc::new(AgentRegistry::new(
            HealthConfig {
                cooldown_ms: 1_000,
                ..Default::default()
            },
            EventEmitter::new(EventBus::new(Duration::from_secs(1))),
        ));
        let executor = ScriptedExecutor::succeeding("ok").shared();
        registry
            .register(AgentDescriptor::new("a", [TaskType::Code]), executor.clone())
            .await
            .unwrap();
        (registry, executor)
    }

    #[tokio::test(start_paused = true)]
    async fn successful_probe_closes_open_circuit_after_cooldown() {
        let (registry, executor) = setup().await;
        executor.set_probe(ProbeOutcome::Healthy).await;
        registry.trip("a", None).await;
        let monitor = HealthMonitor::new(Arc::clone(&registry), Duration::from_millis(500));

        assert_eq!(monitor.probe_once().await, ProbeRound::default());
        assert_eq!(registry.get("a").await.unwrap().health, HealthState::Tripped);

        tokio::time::advance(Duration::from_secs(1)).await;
        let round = monitor.probe_once().await;

        assert_eq!(round.healthy, 1);
        let agent = registry.get("a").await.unwrap();
        assert_eq!(agent.health, HealthState::Healthy);
        assert!(agent.last_probe_at.is_some());
    }

    #[tokio::test]
    async fn unsupported_probes_leave_agent_untouched() {
        let (registry, _executor) = setup().await;
        let monitor = HealthMonitor::new(Arc::clone(&registry), Duration::from_millis(500));

        let round = monitor.probe_once().await;

        assert_eq!(round.unsupported, 1);
        assert_eq!(registry.get("a").await.unwrap().last_probe_at, None);
    }

    #[tokio::test]
    async fn unhealthy_probe_counts_as_failure() {
        let (registry, executor) = setup().await;
        executor
            .set_probe(ProbeOutcome::Unhealthy("auth expired".to_string()))
            .await;
        let monitor = HealthMonitor::new(Arc::clone(&registry), Duration::from_millis(500));

        for _ in 0..3 {
            monitor.probe_once().await;
        }

        assert_eq!(registry.get("a").await.unwrap().health, HealthState::Tripped);
    }
}
