//! Request and reply envelopes exchanged with agents.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::context::ContextPackage;
use crate::error::ErrorClass;
use crate::task::ExpectedOutput;
use crate::task::Requirement;
use crate::task::Task;
use crate::task::TaskType;
use crate::version::ProtocolVersion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub timestamp: DateTime<Utc>,
    pub protocol_version: ProtocolVersion,
    pub correlation_id: String,
    /// Zero for the chain head, incremented on every fallback.
    pub retry_count: u32,
    pub timeout_ms: u64,
}

/// Request envelope for one attempt of one task on one agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub task_id: String,
    pub agent_id: String,
    pub task_type: TaskType,
    pub payload: String,
    #[serde(default)]
    pub context: ContextPackage,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub expected_output: ExpectedOutput,
    pub metadata: MessageMetadata,
}

impl Message {
    /// Builds the envelope for attempt number `retry_count` of `task`.
    pub fn for_task(
        task: &Task,
        agent_id: impl Into<String>,
        task_type: TaskType,
        retry_count: u32,
        timeout_ms: u64,
    ) -> Self {
        Self {
            task_id: task.id.clone(),
            agent_id: agent_id.into(),
            task_type,
            payload: task.payload.clone(),
            context: task.context.clone(),
            requirements: task.requirements.clone(),
            expected_output: task.expected_output.clone(),
            metadata: MessageMetadata {
                timestamp: Utc::now(),
                protocol_version: ProtocolVersion::CURRENT,
                correlation_id: task.correlation_id.clone(),
                retry_count,
                timeout_ms,
            },
        }
    }

    pub fn with_context(mut self, context: ContextPackage) -> Self {
        self.context = context;
        self
    }

    pub fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.metadata.protocol_version = version;
        self
    }

    /// Payload plus context, as counted for transfer metrics.
    pub fn size_bytes(&self) -> usize {
        self.payload.len() + self.context.size_bytes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Failure,
    /// The agent produced something, but not everything that was asked.
    Partial,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseError {
    pub code: ErrorClass,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Set to `false` by an agent that knows a retry elsewhere is pointless.
    #[serde(default = "default_retryable")]
    pub retryable: bool,
}

fn default_retryable() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ResponseMetrics {
    pub processing_time_ms: u64,
    pub units_consumed: u64,
    pub context_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality_score: Option<f64>,
}

/// Structured quota fields some backends report alongside a reply.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QuotaSnapshot {
    pub used: u64,
    pub limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reset_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exceeded: bool,
}

impl QuotaSnapshot {
    pub fn is_exhausted(&self) -> bool {
        self.exceeded || self.remaining == Some(0) || (self.limit > 0 && self.used >= self.limit)
    }
}

/// Reply envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub task_id: String,
    pub agent_id: String,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub metrics: ResponseMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<QuotaSnapshot>,
    pub metadata: MessageMetadata,
}

impl Response {
    pub fn success(message: &Message, result: impl Into<String>) -> Self {
        Self {
            task_id: message.task_id.clone(),
            agent_id: message.agent_id.clone(),
            status: ResponseStatus::Success,
            result: Some(result.into()),
            error: None,
            metrics: ResponseMetrics {
                context_size_bytes: message.context.size_bytes() as u64,
                ..Default::default()
            },
            quota: None,
            metadata: reply_metadata(message),
        }
    }

    pub fn failure(message: &Message, code: ErrorClass, text: impl Into<String>) -> Self {
        Self {
            task_id: message.task_id.clone(),
            agent_id: message.agent_id.clone(),
            status: ResponseStatus::Failure,
            result: None,
            error: Some(ResponseError {
                code,
                message: text.into(),
                details: None,
                retryable: code.is_retryable(),
            }),
            metrics: ResponseMetrics::default(),
            quota: None,
            metadata: reply_metadata(message),
        }
    }

    pub fn timeout(message: &Message) -> Self {
        let mut response = Self::failure(
            message,
            ErrorClass::Timeout,
            format!("no reply within {}ms", message.metadata.timeout_ms),
        );
        response.status = ResponseStatus::Timeout;
        response
    }

    pub fn with_units(mut self, units: u64) -> Self {
        self.metrics.units_consumed = units;
        self
    }

    pub fn with_quota(mut self, quota: QuotaSnapshot) -> Self {
        self.quota = Some(quota);
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.details = Some(details);
        }
        self
    }

    pub fn non_retryable(mut self) -> Self {
        if let Some(error) = self.error.as_mut() {
            error.retryable = false;
        }
        self
    }

    /// `Success` and `Partial` both end the fallback walk.
    pub fn is_success(&self) -> bool {
        matches!(self.status, ResponseStatus::Success | ResponseStatus::Partial)
    }

    /// Error class of a non-successful reply.
    pub fn error_class(&self) -> Option<ErrorClass> {
        match self.status {
            ResponseStatus::Success | ResponseStatus::Partial => None,
            ResponseStatus::Timeout => Some(ErrorClass::Timeout),
            ResponseStatus::Failure => Some(
                self.error
                    .as_ref()
                    .map_or(ErrorClass::RemoteError, |error| error.code),
            ),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self.status {
            ResponseStatus::Success | ResponseStatus::Partial => false,
            ResponseStatus::Timeout => true,
            ResponseStatus::Failure => self
                .error
                .as_ref()
                .is_none_or(|error| error.retryable && error.code.is_retryable()),
        }
    }
}

fn reply_metadata(message: &Message) -> MessageMetadata {
    MessageMetadata {
        timestamp: Utc::now(),
        ..message.metadata.clone()
    }
}
