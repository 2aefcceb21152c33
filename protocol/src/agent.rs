//! Agent metadata kept by the registry.

use std::collections::BTreeSet;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::task::TaskType;
use crate::version::ProtocolVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    #[default]
    Healthy,
    /// Still eligible, ranked lower.
    Degraded,
    /// Excluded from selection until a probe succeeds.
    Tripped,
}

impl HealthState {
    /// Health term of the routing score.
    pub fn score(self) -> f64 {
        match self {
            HealthState::Healthy => 1.0,
            HealthState::Degraded => 0.5,
            HealthState::Tripped => 0.0,
        }
    }
}

/// Relative price of using an agent. Units are whatever the agent reports in
/// [`crate::ResponseMetrics::units_consumed`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CostProfile {
    pub cost_per_unit: f64,
    /// Fixed overhead per dispatch, in the same currency.
    #[serde(default)]
    pub per_call: f64,
}

impl CostProfile {
    pub fn free() -> Self {
        Self {
            cost_per_unit: 0.0,
            per_call: 0.0,
        }
    }

    pub fn per_unit(cost_per_unit: f64) -> Self {
        Self {
            cost_per_unit,
            per_call: 0.0,
        }
    }

    /// `1 / cost`, shifted so free agents score 1.0 instead of dividing by zero.
    pub fn inverse(&self) -> f64 {
        1.0 / (1.0 + self.cost_per_unit.max(0.0) + self.per_call.max(0.0))
    }
}

impl Default for CostProfile {
    fn default() -> Self {
        Self::free()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    pub id: String,
    /// Free-form kind used for version negotiation, e.g. `cli` or `api`.
    #[serde(default = "default_agent_type")]
    pub agent_type: String,
    pub capabilities: BTreeSet<TaskType>,
    #[serde(default)]
    pub cost: CostProfile,
    #[serde(default)]
    pub health: HealthState,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_probe_at: Option<DateTime<Utc>>,
    #[serde(default = "default_versions")]
    pub supported_versions: Vec<ProtocolVersion>,
}

fn default_agent_type() -> String {
    "generic".to_string()
}

fn default_versions() -> Vec<ProtocolVersion> {
    vec![ProtocolVersion::CURRENT]
}

impl AgentDescriptor {
    pub fn new(id: impl Into<String>, capabilities: impl IntoIterator<Item = TaskType>) -> Self {
        Self {
            id: id.into(),
            agent_type: default_agent_type(),
            capabilities: capabilities.into_iter().collect(),
            cost: CostProfile::default(),
            health: HealthState::Healthy,
            consecutive_failures: 0,
            last_probe_at: None,
            supported_versions: default_versions(),
        }
    }

    pub fn with_cost(mut self, cost: CostProfile) -> Self {
        self.cost = cost;
        self
    }

    pub fn with_agent_type(mut self, agent_type: impl Into<String>) -> Self {
        self.agent_type = agent_type.into();
        self
    }

    pub fn with_versions(mut self, versions: Vec<ProtocolVersion>) -> Self {
        self.supported_versions = versions;
        self
    }

    /// `Auto` matches every agent; concrete types need the capability.
    pub fn supports(&self, task_type: TaskType) -> bool {
        task_type == TaskType::Auto || self.capabilities.contains(&task_type)
    }
}
