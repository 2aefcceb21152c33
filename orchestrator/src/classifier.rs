//! Keyword classifier that tags raw task text with a [`TaskType`].
//!
//! Each category collects weighted signals (verbs, phrases, fenced code, sheer
//! payload size). The category with the largest share of the total wins; when
//! the two leaders are within `epsilon` of each other the answer is `auto` and
//! the router falls back to capability fit. Classification never fails and is
//! a pure function of its input.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde::Deserialize;
use serde::Serialize;
use switchyard_protocol::TaskType;

use crate::config::ClassifierConfig;

const FENCED_CODE_WEIGHT: f64 = 3.0;
const LARGE_CONTEXT_WEIGHT: f64 = 4.0;

const CODE_SIGNALS: &[(&str, f64)] = &[
    ("implement", 3.0),
    ("write a function", 3.0),
    ("refactor", 3.0),
    ("fix", 2.0),
    ("bug", 2.0),
    ("debug", 2.0),
    ("compile", 2.0),
    ("code", 2.0),
    ("script", 2.0),
    ("function", 2.0),
    ("unit test", 2.0),
    ("stack trace", 2.0),
    ("class", 1.0),
    ("method", 1.0),
    ("endpoint", 1.0),
    ("build", 1.0),
    ("rust", 1.0),
    ("python", 1.0),
    ("typescript", 1.0),
    ("sql", 1.0),
];

const REASONING_SIGNALS: &[(&str, f64)] = &[
    ("explain", 3.0),
    ("analyze", 3.0),
    ("analyse", 3.0),
    ("pros and cons", 3.0),
    ("why", 2.0),
    ("compare", 2.0),
    ("design", 2.0),
    ("architecture", 2.0),
    ("trade-off", 2.0),
    ("tradeoff", 2.0),
    ("evaluate", 2.0),
    ("reason", 2.0),
    ("strategy", 2.0),
    ("should i", 2.0),
    ("plan", 1.0),
    ("review", 1.0),
    ("prove", 1.0),
];

const CONTEXT_SIGNALS: &[(&str, f64)] = &[
    ("summarize", 3.0),
    ("summarise", 3.0),
    ("entire codebase", 3.0),
    ("whole repository", 3.0),
    ("across all files", 3.0),
    ("codebase", 2.0),
    ("all files", 2.0),
    ("find all", 2.0),
    ("read through", 2.0),
    ("overview", 2.0),
    ("transcript", 2.0),
    ("document", 1.0),
    ("repository", 1.0),
    ("search", 1.0),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub task_type: TaskType,
    /// Winner's share of the total score, or 1.0 for an explicit hint.
    pub confidence: f64,
    pub reasoning: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub scores: BTreeMap<TaskType, f64>,
}

impl Classification {
    pub fn explicit(task_type: TaskType) -> Self {
        Self {
            task_type,
            confidence: 1.0,
            reasoning: format!("explicit {task_type} type"),
            scores: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskClassifier {
    config: ClassifierConfig,
}

impl TaskClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, text: &str, hint: Option<TaskType>) -> Classification {
        if let Some(hint) = hint.filter(|hint| *hint != TaskType::Auto) {
            return Classification::explicit(hint);
        }

        let lower = text.to_lowercase();
        let words: BTreeSet<&str> = lower
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|word| !word.is_empty())
            .collect();

        let mut scores = BTreeMap::new();
        let mut evidence = Vec::new();
        for (task_type, signals) in [
            (TaskType::Code, CODE_SIGNALS),
            (TaskType::Reasoning, REASONING_SIGNALS),
            (TaskType::Context, CONTEXT_SIGNALS),
        ] {
            let mut score = 0.0;
            for (signal, weight) in signals {
                let hit = if signal.contains(' ') {
                    lower.contains(signal)
                } else {
                    words.contains(signal)
                };
                if hit {
                    score += weight;
                    evidence.push(format!("{task_type}:{signal}"));
                }
            }
            scores.insert(task_type, score);
        }

        if text.contains("```") {
            *scores.entry(TaskType::Code).or_default() += FENCED_CODE_WEIGHT;
            evidence.push("code:fenced block".to_string());
        }
        if text.chars().count() > self.config.large_context_chars {
            *scores.entry(TaskType::Context).or_default() += LARGE_CONTEXT_WEIGHT;
            evidence.push("context:large payload".to_string());
        }

        let total: f64 = scores.values().sum();
        if total <= 0.0 {
            return Classification {
                task_type: TaskType::Auto,
                confidence: 0.0,
                reasoning: "no category signals".to_string(),
                scores,
            };
        }

        let mut ranked: Vec<(TaskType, f64)> = scores
            .iter()
            .map(|(task_type, score)| (*task_type, score / total))
            .collect();
        // Stable sort keeps Code, Reasoning, Context order on ties.
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1));
        let (leader, top) = ranked[0];
        let runner_up = ranked.get(1).map_or(0.0, |(_, share)| *share);
        let evidence = evidence.join(", ");

        if top - runner_up < self.config.epsilon {
            return Classification {
                task_type: TaskType::Auto,
                confidence: top,
                reasoning: format!(
                    "ambiguous: {leader} leads by {:.2} (< {:.2}); signals {evidence}",
                    top - runner_up,
                    self.config.epsilon
                ),
                scores,
            };
        }

        Classification {
            task_type: leader,
            confidence: top,
            reasoning: format!("{leader} share {top:.2}; signals {evidence}"),
            scores,
        }
    }
}
