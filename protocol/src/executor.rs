//! Backend seam. Concrete executors (CLI subprocesses, HTTP model APIs) live
//! outside this workspace and implement [`AgentExecutor`].

use std::time::Duration;

use async_trait::async_trait;

use crate::message::Message;
use crate::message::Response;

/// Result of a health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Healthy,
    Unhealthy(String),
    /// The executor has no cheap way to check itself.
    Unsupported,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync {
    /// Runs one attempt. Backend failures are reported as a failure
    /// [`Response`], never as a panic. The caller enforces `timeout` too, so
    /// an implementation may ignore it.
    async fn invoke(&self, message: Message, timeout: Duration) -> Response;

    async fn probe(&self) -> ProbeOutcome {
        ProbeOutcome::Unsupported
    }

    /// Best-effort notice that the attempt identified by `correlation_id` and
    /// `retry_count` was abandoned, so the backend can stop work.
    async fn cancel(&self, _correlation_id: &str, _retry_count: u32) {}
}
