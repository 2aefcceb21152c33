//! Wire types shared by the switchyard router and the agents it drives.
//!
//! Everything here is plain serde data plus the [`AgentExecutor`] trait, the
//! single seam through which the orchestrator reaches a backend.

pub mod agent;
pub mod context;
pub mod error;
pub mod executor;
pub mod message;
pub mod task;
pub mod version;

pub use agent::AgentDescriptor;
pub use agent::CostProfile;
pub use agent::HealthState;
pub use context::ContextPackage;
pub use context::ContextTier;
pub use error::ErrorClass;
pub use executor::AgentExecutor;
pub use executor::ProbeOutcome;
pub use message::Message;
pub use message::MessageMetadata;
pub use message::QuotaSnapshot;
pub use message::Response;
pub use message::ResponseError;
pub use message::ResponseMetrics;
pub use message::ResponseStatus;
pub use task::ExpectedOutput;
pub use task::OutputFormat;
pub use task::Priority;
pub use task::Requirement;
pub use task::RequirementKind;
pub use task::Task;
pub use task::TaskType;
pub use version::ProtocolVersion;
