//! Usage accounting and quota-driven failover.
//!
//! Consumption per agent is compared with its configured limit. Crossing the
//! critical threshold demotes the agent; crossing the emergency threshold or
//! an explicit "quota exceeded" reply trips it until the reset time. This
//! runs alongside the circuit breaker's own failure counting.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::Response;
use switchyard_protocol::ResponseStatus;
use tokio::sync::RwLock;

use crate::config::SessionConfig;
use crate::events::EventEmitter;
use crate::quota::QuotaDetector;
use crate::quota::QuotaSignal;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageLevel {
    #[default]
    Normal,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AgentUsage {
    pub used: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    pub level: UsageLevel,
    /// When counters and demotions for this agent are cleared.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    /// Held open by an explicit quota signal.
    pub quota_hold: bool,
}

#[derive(Default)]
struct Usage {
    agents: HashMap<String, AgentUsage>,
    sessions: HashMap<String, u64>,
}

pub struct SessionMonitor {
    config: SessionConfig,
    detector: QuotaDetector,
    usage: RwLock<Usage>,
    registry: Arc<AgentRegistry>,
    events: EventEmitter,
}

impl SessionMonitor {
    pub fn new(config: SessionConfig, registry: Arc<AgentRegistry>, events: EventEmitter) -> Self {
        Self {
            detector: QuotaDetector::new(config.default_reset_hours),
            config,
            usage: RwLock::new(Usage::default()),
            registry,
            events,
        }
    }

    pub fn detector(&self) -> &QuotaDetector {
        &self.detector
    }

    /// Adds consumption and acts on any threshold crossed. Returns the
    /// agent's level afterwards.
    pub async fn record_usage(&self, agent_id: &str, session_id: Option<&str>, units: u64) -> UsageLevel {
        let now = Utc::now();
        let (previous, current, used, limit, reset_at) = {
            let mut usage = self.usage.write().await;
            if let Some(session_id) = session_id {
                *usage.sessions.entry(session_id.to_string()).or_default() += units;
            }
            let limit = self.config.limit_for(agent_id);
            let record = usage.agents.entry(agent_id.to_string()).or_default();
            record.used = record.used.saturating_add(units);
            record.limit = limit;
            let previous = record.level;
            let current = self.level_for(record.used, limit).max(previous);
            record.level = current;
            if current > UsageLevel::Normal && record.reset_at.is_none() {
                record.reset_at = chrono::Duration::try_hours(self.config.default_reset_hours)
                    .and_then(|hold| now.checked_add_signed(hold));
            }
            (previous, current, record.used, limit, record.reset_at)
        };

        if current > previous {
            let reason = format!(
                "usage {used}/{} crossed {current:?}",
                limit.unwrap_or_default()
            );
            match current {
                UsageLevel::Normal => {}
                UsageLevel::Warning => {
                    tracing::warn!(agent_id, used, ?limit, "usage warning threshold crossed");
                }
                UsageLevel::Critical => {
                    self.registry.demote(agent_id).await;
                    self.events.failover_required(agent_id, current, reason);
                }
                UsageLevel::Emergency => {
                    // Held until the usage window resets, like an explicit quota.
                    let hold = reset_at.and_then(|at| (at - now).to_std().ok());
                    self.registry.trip(agent_id, hold).await;
                    self.events.failover_required(agent_id, current, reason);
                }
            }
        }
        current
    }

    /// Accounts a reply and checks it for a quota condition, structured
    /// fields first, then the error text. A detected condition trips the
    /// agent until the reset time and is returned.
    pub async fn observe_response(&self, response: &Response, session_id: Option<&str>) -> Option<QuotaSignal> {
        if response.metrics.units_consumed > 0 {
            self.record_usage(&response.agent_id, session_id, response.metrics.units_consumed)
                .await;
        }

        let now = Utc::now();
        let signal = response
            .quota
            .as_ref()
            .and_then(|quota| self.detector.from_snapshot(quota, now))
            .or_else(|| {
                if response.status != ResponseStatus::Failure {
                    return None;
                }
                let text = response.error.as_ref()?.message.as_str();
                self.detector.detect(text, now)
            })?;

        self.apply_quota(&response.agent_id, &signal, now).await;
        Some(signal)
    }

    /// Clears counters and demotions for agents whose reset time passed.
    /// Returns the recovered agent ids.
    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<String> {
        let recovered: Vec<String> = {
            let mut usage = self.usage.write().await;
            let due: Vec<String> = usage
                .agents
                .iter()
                .filter(|(_, record)| record.reset_at.is_some_and(|at| at <= now))
                .map(|(agent_id, _)| agent_id.clone())
                .collect();
            for agent_id in &due {
                usage.agents.remove(agent_id);
            }
            due
        };
        for agent_id in &recovered {
            self.registry.clear_demotion(agent_id).await;
            tracing::info!(agent_id = %agent_id, "usage window reset");
        }
        recovered
    }

    pub async fn usage(&self, agent_id: &str) -> Option<AgentUsage> {
        self.usage.read().await.agents.get(agent_id).cloned()
    }

    pub async fn session_usage(&self, session_id: &str) -> u64 {
        self.usage
            .read()
            .await
            .sessions
            .get(session_id)
            .copied()
            .unwrap_or_default()
    }

    async fn apply_quota(&self, agent_id: &str, signal: &QuotaSignal, now: DateTime<Utc>) {
        {
            let mut usage = self.usage.write().await;
            let record = usage.agents.entry(agent_id.to_string()).or_default();
            record.level = UsageLevel::Emergency;
            record.reset_at = Some(signal.reset_at);
            record.quota_hold = true;
        }
        let hold = (signal.reset_at - now).to_std().ok();
        self.registry.trip(agent_id, hold).await;
        self.events.failover_required(
            agent_id,
            UsageLevel::Emergency,
            format!("{} (resets {})", signal.matched, signal.reset_at.to_rfc3339()),
        );
    }

    fn level_for(&self, used: u64, limit: Option<u64>) -> UsageLevel {
        let Some(limit) = limit.filter(|limit| *limit > 0) else {
            return UsageLevel::Normal;
        };
        let ratio = used as f64 / limit as f64;
        if ratio >= self.config.emergency {
            UsageLevel::Emergency
        } else if ratio >= self.config.critical {
            UsageLevel::Critical
        } else if ratio >= self.config.warning {
            UsageLevel::Warning
        } else {
            UsageLevel::Normal
        }
    }
}
