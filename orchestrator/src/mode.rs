//! Administrative control over which fallback-chain tiers the router uses.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::RwLock;

/// Position of an agent in a fallback chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainTier {
    /// Highest-ranked agent.
    Primary,
    /// Every other ranked agent.
    Fallback,
    /// Configured agent of last resort.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    #[default]
    All,
    PrimaryOnly,
    FallbackOnly,
    TerminalOnly,
}

impl RoutingMode {
    pub fn permits(self, tier: ChainTier) -> bool {
        match self {
            RoutingMode::All => true,
            RoutingMode::PrimaryOnly => matches!(tier, ChainTier::Primary | ChainTier::Terminal),
            RoutingMode::FallbackOnly => matches!(tier, ChainTier::Fallback | ChainTier::Terminal),
            RoutingMode::TerminalOnly => tier == ChainTier::Terminal,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RoutingMode::All => "all",
            RoutingMode::PrimaryOnly => "primary-only",
            RoutingMode::FallbackOnly => "fallback-only",
            RoutingMode::TerminalOnly => "terminal-only",
        }
    }
}

impl std::fmt::Display for RoutingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RoutingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "all" => Ok(RoutingMode::All),
            "primary-only" => Ok(RoutingMode::PrimaryOnly),
            "fallback-only" => Ok(RoutingMode::FallbackOnly),
            "terminal-only" => Ok(RoutingMode::TerminalOnly),
            other => Err(format!("unknown routing mode `{other}`")),
        }
    }
}

/// Shared, switchable routing mode. Submissions read it once, so a change
/// never affects tasks already in flight.
#[derive(Debug, Clone, Default)]
pub struct ModeControl {
    current: Arc<RwLock<RoutingMode>>,
}

impl ModeControl {
    pub fn new(initial: RoutingMode) -> Self {
        Self {
            current: Arc::new(RwLock::new(initial)),
        }
    }

    pub async fn current(&self) -> RoutingMode {
        *self.current.read().await
    }

    /// Returns the previous mode.
    pub async fn set(&self, mode: RoutingMode) -> RoutingMode {
        let mut current = self.current.write().await;
        let previous = *current;
        *current = mode;
        if previous != mode {
            tracing::info!(from = %previous, to = %mode, "routing mode changed");
        }
        previous
    }
}
