//! Task and requirement models submitted by callers.

use serde::Deserialize;
use serde::Serialize;

use crate::context::ContextPackage;

/// Broad category of work a task asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Reasoning,
    Context,
    /// Let the router decide by capability fit.
    Auto,
}

impl TaskType {
    /// Concrete categories, i.e. everything except [`TaskType::Auto`].
    pub const CONCRETE: [TaskType; 3] = [TaskType::Code, TaskType::Reasoning, TaskType::Context];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Reasoning => "reasoning",
            TaskType::Context => "context",
            TaskType::Auto => "auto",
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "code" => Ok(TaskType::Code),
            "reasoning" => Ok(TaskType::Reasoning),
            "context" => Ok(TaskType::Context),
            "auto" => Ok(TaskType::Auto),
            other => Err(format!("unknown task type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementKind {
    Functional,
    Technical,
    Performance,
    Security,
    Compliance,
}

/// A condition the result of a task must meet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Requirement {
    pub id: String,
    pub kind: RequirementKind,
    pub description: String,
    #[serde(default)]
    pub priority: Priority,
    /// Named rule checked against a successful result, e.g. `non_empty`,
    /// `json`, `contains:<text>` or `max_len:<n>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validator: Option<String>,
}

impl Requirement {
    pub fn new(id: impl Into<String>, kind: RequirementKind, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            priority: Priority::Normal,
            validator: None,
        }
    }

    pub fn with_validator(mut self, validator: impl Into<String>) -> Self {
        self.validator = Some(validator.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    #[default]
    Text,
    Code,
    Json,
    Markdown,
}

/// Shape the caller expects the result to take.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExpectedOutput {
    #[serde(default)]
    pub format: OutputFormat,
    /// Optional JSON schema the agent should follow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,
}

/// A unit of work submitted to the router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// The work itself, usually natural-language instructions.
    pub payload: String,
    #[serde(default)]
    pub requirements: Vec<Requirement>,
    #[serde(default)]
    pub expected_output: ExpectedOutput,
    #[serde(default)]
    pub priority: Priority,
    /// Links every attempt and reply for this task across the fallback chain.
    pub correlation_id: String,
    /// Context handed in by the caller, forwarded to whichever agent runs it.
    #[serde(default, skip_serializing_if = "ContextPackage::is_empty")]
    pub context: ContextPackage,
    /// Per-attempt deadline override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    /// Usage-accounting session this task belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Task {
    pub fn new(task_type: TaskType, payload: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            task_type,
            payload: payload.into(),
            requirements: Vec::new(),
            expected_output: ExpectedOutput::default(),
            priority: Priority::Normal,
            correlation_id: uuid::Uuid::new_v4().to_string(),
            context: ContextPackage::default(),
            timeout_ms: None,
            session_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_requirement(mut self, requirement: Requirement) -> Self {
        self.requirements.push(requirement);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_expected_output(mut self, expected_output: ExpectedOutput) -> Self {
        self.expected_output = expected_output;
        self
    }

    pub fn with_context(mut self, context: ContextPackage) -> Self {
        self.context = context;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}
