//! Task router for a pool of heterogeneous agents.
//!
//! Tasks are classified, ranked against the registered agents and walked down
//! a fallback chain until one agent answers. Per-agent circuit breakers,
//! usage thresholds and explicit quota replies decide who is eligible. Agents
//! share context laterally through the coordination store.

pub mod batch;
pub mod channel;
pub mod circuit;
pub mod classifier;
pub mod config;
pub mod error;
pub mod events;
pub mod health;
pub mod mode;
pub mod quota;
pub mod registry;
pub mod router;
pub mod runtime;
pub mod session;
pub mod signal;
pub mod store;
pub mod truncation;
pub mod validation;

pub use classifier::Classification;
pub use classifier::TaskClassifier;
pub use config::OrchestratorConfig;
pub use error::OrchestratorErr;
pub use error::Result;
pub use mode::RoutingMode;
pub use router::AttemptRecord;
pub use router::AttemptStatus;
pub use runtime::Orchestrator;
pub use runtime::TaskHandle;
pub use runtime::TaskOutcome;
