//! Orchestrator configuration, read from TOML.
//!
//! Every field has a default, so an empty file is a valid configuration.
//! Named `[profiles.<name>]` tables bundle routing options that can be
//! switched as a unit with the top-level `profile` key.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::ProtocolVersion;

use crate::error::OrchestratorErr;
use crate::error::Result;
use crate::mode::RoutingMode;
use crate::quota::MAX_RESET_HOURS;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Key into `profiles` applied on top of `[router]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    pub health: HealthConfig,
    pub router: RouterConfig,
    pub classifier: ClassifierConfig,
    pub channel: ChannelConfig,
    pub store: StoreConfig,
    pub session: SessionConfig,
    pub batch: BatchConfig,
    pub profiles: HashMap<String, RoutingProfile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive failures before an agent is ranked as degraded.
    pub degraded_after: u32,
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures inside `window_ms` that open the circuit, consecutive or not.
    pub window_failures: u32,
    pub window_ms: u64,
    pub cooldown_ms: u64,
    pub max_cooldown_ms: u64,
    pub probe_interval_ms: u64,
    /// Outcomes remembered for the recent success rate.
    pub success_window: usize,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            failure_threshold: 5,
            window_failures: 5,
            window_ms: 60_000,
            cooldown_ms: 30_000,
            max_cooldown_ms: 600_000,
            probe_interval_ms: 15_000,
            success_window: 20,
        }
    }
}

impl HealthConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn max_cooldown(&self) -> Duration {
        Duration::from_millis(self.max_cooldown_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

/// Weights of the routing score terms.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterWeights {
    pub health: f64,
    pub cost: f64,
    pub success_rate: f64,
    pub capability_fit: f64,
}

impl Default for RouterWeights {
    fn default() -> Self {
        Self {
            health: 0.35,
            cost: 0.15,
            success_rate: 0.30,
            capability_fit: 0.20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Agent appended to every chain as the fallback of last resort.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal_agent: Option<String>,
    pub mode: RoutingMode,
    pub weights: RouterWeights,
    pub default_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            terminal_agent: None,
            mode: RoutingMode::All,
            weights: RouterWeights::default(),
            default_timeout_ms: 60_000,
        }
    }
}

/// Routing options a user can switch as a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingProfile {
    pub mode: Option<RoutingMode>,
    pub terminal_agent: Option<String>,
    pub weights: Option<RouterWeights>,
    pub default_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Normalized score gap under which the classifier answers `auto`.
    pub epsilon: f64,
    /// Payload length (chars) treated as a large-context signal.
    pub large_context_chars: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.10,
            large_context_chars: 8_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub protocol_versions: Vec<ProtocolVersion>,
    pub max_timeout_ms: u64,
    pub max_concurrent_dispatches: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            protocol_versions: vec![ProtocolVersion::V1_0, ProtocolVersion::V1_1],
            max_timeout_ms: 3_600_000,
            max_concurrent_dispatches: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub default_context_ttl_ms: u64,
    pub lock_lease_ms: u64,
    /// Upper bound for a single event or signal handler.
    pub handler_timeout_ms: u64,
    /// Size a compressed context package is reduced to.
    pub compress_budget_bytes: usize,
    /// Undelivered signals kept per agent.
    pub mailbox_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            default_context_ttl_ms: 3_600_000,
            lock_lease_ms: 30_000,
            handler_timeout_ms: 2_000,
            compress_budget_bytes: 16_384,
            mailbox_capacity: 256,
        }
    }
}

impl StoreConfig {
    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn lock_lease(&self) -> Duration {
        Duration::from_millis(self.lock_lease_ms)
    }

    pub fn default_context_ttl(&self) -> Duration {
        Duration::from_millis(self.default_context_ttl_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub warning: f64,
    pub critical: f64,
    pub emergency: f64,
    /// Units per agent when `limits` has no entry. `None` means unmetered.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_limit: Option<u64>,
    pub limits: HashMap<String, u64>,
    /// Hold applied when a limit is hit without a usable reset time.
    pub default_reset_hours: i64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            warning: 0.70,
            critical: 0.85,
            emergency: 0.95,
            default_limit: None,
            limits: HashMap::new(),
            default_reset_hours: 24,
        }
    }
}

impl SessionConfig {
    pub fn limit_for(&self, agent_id: &str) -> Option<u64> {
        self.limits.get(agent_id).copied().or(self.default_limit)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub enabled: bool,
    pub window_ms: u64,
    /// Smallest group sent through `send_batch`; smaller groups go one by one.
    pub min_batch: usize,
    pub max_batch: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 5,
            min_batch: 2,
            max_batch: 16,
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

impl OrchestratorConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: OrchestratorConfig = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// `[router]` with the selected profile applied on top.
    pub fn effective_router(&self) -> Result<RouterConfig> {
        let mut router = self.router.clone();
        let Some(name) = self.profile.as_deref() else {
            return Ok(router);
        };
        let profile = self
            .profiles
            .get(name)
            .ok_or_else(|| OrchestratorErr::Config(format!("unknown profile `{name}`")))?;
        if let Some(mode) = profile.mode {
            router.mode = mode;
        }
        if let Some(terminal) = profile.terminal_agent.clone() {
            router.terminal_agent = Some(terminal);
        }
        if let Some(weights) = profile.weights {
            router.weights = weights;
        }
        if let Some(timeout) = profile.default_timeout_ms {
            router.default_timeout_ms = timeout;
        }
        Ok(router)
    }

    pub fn validate(&self) -> Result<()> {
        let router = self.effective_router()?;
        let weights = router.weights;
        let terms = [
            weights.health,
            weights.cost,
            weights.success_rate,
            weights.capability_fit,
        ];
        if terms.iter().any(|w| *w < 0.0) || terms.iter().sum::<f64>() <= 0.0 {
            return Err(invalid("router weights must be non-negative with a positive sum"));
        }
        if router.default_timeout_ms == 0 || router.default_timeout_ms > self.channel.max_timeout_ms {
            return Err(invalid("router.default_timeout_ms must be in 1..=channel.max_timeout_ms"));
        }

        let health = &self.health;
        if health.failure_threshold == 0 || health.window_failures == 0 || health.degraded_after == 0 {
            return Err(invalid("health failure thresholds must be at least 1"));
        }
        if health.window_ms == 0 || health.cooldown_ms == 0 || health.probe_interval_ms == 0 {
            return Err(invalid("health windows and intervals must be non-zero"));
        }
        if health.max_cooldown_ms < health.cooldown_ms {
            return Err(invalid("health.max_cooldown_ms must be >= health.cooldown_ms"));
        }
        if health.success_window == 0 {
            return Err(invalid("health.success_window must be at least 1"));
        }

        if !(0.0..1.0).contains(&self.classifier.epsilon) {
            return Err(invalid("classifier.epsilon must be in [0, 1)"));
        }

        if self.channel.protocol_versions.is_empty() {
            return Err(invalid("channel.protocol_versions must not be empty"));
        }
        if self.channel.max_concurrent_dispatches == 0 {
            return Err(invalid("channel.max_concurrent_dispatches must be at least 1"));
        }

        let session = &self.session;
        let ordered = 0.0 < session.warning
            && session.warning < session.critical
            && session.critical < session.emergency
            && session.emergency <= 1.0;
        if !ordered {
            return Err(invalid(
                "session thresholds must satisfy 0 < warning < critical < emergency <= 1",
            ));
        }
        if !(1..=MAX_RESET_HOURS).contains(&session.default_reset_hours) {
            return Err(OrchestratorErr::Config(format!(
                "session.default_reset_hours must be in 1..={MAX_RESET_HOURS}"
            )));
        }

        if self.batch.min_batch == 0 || self.batch.max_batch < self.batch.min_batch {
            return Err(invalid("batch sizes must satisfy 1 <= min_batch <= max_batch"));
        }
        if self.store.handler_timeout_ms == 0 || self.store.lock_lease_ms == 0 {
            return Err(invalid("store timeouts must be non-zero"));
        }
        Ok(())
    }
}

fn invalid(message: &str) -> OrchestratorErr {
    OrchestratorErr::Config(message.to_string())
}
