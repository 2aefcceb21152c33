//! Envelope validation, requirement checks and channel metrics aggregation.

use std::collections::HashSet;

use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::ErrorClass;
use switchyard_protocol::Message;
use switchyard_protocol::Requirement;
use switchyard_protocol::Response;
use switchyard_protocol::ResponseError;
use switchyard_protocol::ResponseStatus;

use crate::error::OrchestratorErr;
use crate::error::Result;

/// Structural checks run before a message leaves the process.
pub fn validate_message(message: &Message, max_timeout_ms: u64) -> Result<()> {
    let invalid = |reason: String| Err(OrchestratorErr::Validation(reason));
    if message.task_id.trim().is_empty() {
        return invalid("task id must not be empty".to_string());
    }
    if message.agent_id.trim().is_empty() {
        return invalid(format!("task `{}` has no target agent", message.task_id));
    }
    if message.metadata.correlation_id.trim().is_empty() {
        return invalid(format!("task `{}` has no correlation id", message.task_id));
    }
    if message.payload.trim().is_empty() {
        return invalid(format!("task `{}` has an empty payload", message.task_id));
    }
    let timeout_ms = message.metadata.timeout_ms;
    if timeout_ms == 0 || timeout_ms > max_timeout_ms {
        return invalid(format!(
            "timeout {timeout_ms}ms is outside 1..={max_timeout_ms}ms"
        ));
    }

    let mut seen = HashSet::new();
    for requirement in &message.requirements {
        if requirement.id.trim().is_empty() {
            return invalid("requirement id must not be empty".to_string());
        }
        if !seen.insert(requirement.id.as_str()) {
            return invalid(format!("duplicate requirement id `{}`", requirement.id));
        }
    }

    if let Some(schema) = &message.expected_output.schema
        && !schema.is_object()
    {
        return invalid("expected output schema must be a JSON object".to_string());
    }
    Ok(())
}

/// A reply must answer the exact attempt it was sent for.
pub fn validate_response(request: &Message, reply: &Response) -> Result<()> {
    let mismatch = |field: &str, expected: &str, got: &str| {
        Err(OrchestratorErr::Protocol(format!(
            "reply {field} `{got}` does not match request `{expected}`"
        )))
    };
    if reply.task_id != request.task_id {
        return mismatch("task id", &request.task_id, &reply.task_id);
    }
    if reply.agent_id != request.agent_id {
        return mismatch("agent id", &request.agent_id, &reply.agent_id);
    }
    if reply.metadata.correlation_id != request.metadata.correlation_id {
        return mismatch(
            "correlation id",
            &request.metadata.correlation_id,
            &reply.metadata.correlation_id,
        );
    }
    if reply.metadata.retry_count != request.metadata.retry_count {
        return mismatch(
            "retry count",
            &request.metadata.retry_count.to_string(),
            &reply.metadata.retry_count.to_string(),
        );
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Met,
    Unmet,
    /// No validator, or one this build does not know.
    Unevaluated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementCheck {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
    pub status: CheckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of checking a reply against a task's requirements.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequirementReport {
    pub all_met: bool,
    pub met_count: usize,
    pub evaluated_count: usize,
    pub total_count: usize,
    pub checks: Vec<RequirementCheck>,
}

impl RequirementReport {
    pub fn success_rate(&self) -> f64 {
        if self.evaluated_count == 0 {
            return 1.0;
        }
        self.met_count as f64 / self.evaluated_count as f64
    }

    pub fn unmet(&self) -> impl Iterator<Item = &RequirementCheck> {
        self.checks
            .iter()
            .filter(|check| check.status == CheckStatus::Unmet)
    }
}

/// Runs every requirement's validator against `result`.
pub fn validate_requirements(requirements: &[Requirement], result: &str) -> RequirementReport {
    let checks: Vec<RequirementCheck> = requirements
        .iter()
        .map(|requirement| {
            let (status, detail) = match requirement.validator.as_deref() {
                Some(rule) => check_rule(rule, result),
                None => (CheckStatus::Unevaluated, None),
            };
            RequirementCheck {
                id: requirement.id.clone(),
                validator: requirement.validator.clone(),
                status,
                detail,
            }
        })
        .collect();

    let met_count = checks
        .iter()
        .filter(|check| check.status == CheckStatus::Met)
        .count();
    let evaluated_count = checks
        .iter()
        .filter(|check| check.status != CheckStatus::Unevaluated)
        .count();

    RequirementReport {
        all_met: met_count == evaluated_count,
        met_count,
        evaluated_count,
        total_count: checks.len(),
        checks,
    }
}

fn check_rule(rule: &str, result: &str) -> (CheckStatus, Option<String>) {
    let verdict = |ok: bool, why: String| {
        if ok {
            (CheckStatus::Met, None)
        } else {
            (CheckStatus::Unmet, Some(why))
        }
    };
    let (name, argument) = match rule.split_once(':') {
        Some((name, argument)) => (name.trim(), Some(argument)),
        None => (rule.trim(), None),
    };
    match (name, argument) {
        ("non_empty", None) => verdict(!result.trim().is_empty(), "result is empty".to_string()),
        ("json", None) => verdict(
            serde_json::from_str::<serde_json::Value>(result).is_ok(),
            "result is not valid JSON".to_string(),
        ),
        ("contains", Some(needle)) => verdict(
            result.contains(needle),
            format!("result does not contain `{needle}`"),
        ),
        ("max_len", Some(limit)) => match limit.trim().parse::<usize>() {
            Ok(limit) => {
                let len = result.chars().count();
                verdict(len <= limit, format!("result has {len} chars, limit {limit}"))
            }
            Err(_) => (
                CheckStatus::Unevaluated,
                Some(format!("bad max_len argument `{limit}`")),
            ),
        },
        _ => (
            CheckStatus::Unevaluated,
            Some(format!("unknown validator `{rule}`")),
        ),
    }
}

/// Downgrades a successful reply to `partial` when a requirement is unmet.
/// The report travels in `error.details`.
pub fn apply_requirements(mut response: Response, requirements: &[Requirement]) -> Response {
    if response.status != ResponseStatus::Success || requirements.is_empty() {
        return response;
    }
    let report = validate_requirements(requirements, response.result.as_deref().unwrap_or_default());
    if report.all_met {
        return response;
    }
    let unmet: Vec<&str> = report.unmet().map(|check| check.id.as_str()).collect();
    tracing::debug!(
        task_id = %response.task_id,
        agent_id = %response.agent_id,
        ?unmet,
        "requirements unmet, reply downgraded to partial"
    );
    response.status = ResponseStatus::Partial;
    response.error = Some(ResponseError {
        code: ErrorClass::Validation,
        message: format!("unmet requirements: {}", unmet.join(", ")),
        details: serde_json::to_value(&report).ok(),
        retryable: false,
    });
    response
}

/// Running totals over every reply that went through the channel.
#[derive(Debug, Default)]
pub struct MetricsAggregator {
    total_messages: u64,
    successful: u64,
    total_response_ms: u64,
    bytes_transferred: u64,
}

impl MetricsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, request: &Message, reply: &Response, elapsed_ms: u64) {
        self.total_messages += 1;
        if reply.is_success() {
            self.successful += 1;
        }
        self.total_response_ms += elapsed_ms;
        let reply_bytes = reply.result.as_ref().map_or(0, String::len);
        self.bytes_transferred += (request.size_bytes() + reply_bytes) as u64;
    }

    pub fn summary(&self) -> ChannelMetrics {
        ChannelMetrics {
            total_messages: self.total_messages,
            success_rate: if self.total_messages == 0 {
                1.0
            } else {
                self.successful as f64 / self.total_messages as f64
            },
            avg_response_time_ms: if self.total_messages == 0 {
                0.0
            } else {
                self.total_response_ms as f64 / self.total_messages as f64
            },
            bytes_transferred: self.bytes_transferred,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub total_messages: u64,
    pub success_rate: f64,
    pub avg_response_time_ms: f64,
    pub bytes_transferred: u64,
}
