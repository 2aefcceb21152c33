//! Operator commands for inspecting routing decisions without running any
//! agent.

use std::path::PathBuf;

use anyhow::Context;
use chrono::DateTime;
use chrono::Utc;
use clap::Parser;
use clap::Subcommand;
use serde::Serialize;
use switchyard_orchestrator::OrchestratorConfig;
use switchyard_orchestrator::TaskClassifier;
use switchyard_orchestrator::quota::QuotaDetector;
use switchyard_orchestrator::quota::QuotaSignal;
use switchyard_protocol::TaskType;

#[derive(Debug, Parser)]
#[command(name = "switchyard")]
#[command(version, about = "Capability-aware task router for AI agents", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Classify a task description and print the result as JSON
    Classify {
        /// Task text to classify
        text: String,

        /// Explicit task type (code, reasoning, context, auto)
        #[arg(long)]
        hint: Option<TaskType>,

        /// Read classifier settings from this config file
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Validate a config file and print the effective settings
    Config {
        /// Path to a TOML config file
        path: PathBuf,
    },

    /// Look for a quota condition in agent output and print when it resets
    Quota {
        /// Error text reported by an agent
        text: String,

        /// Reference time (RFC 3339); defaults to now
        #[arg(long)]
        now: Option<DateTime<Utc>>,

        /// Hold applied when the text names no reset time
        #[arg(long, default_value_t = 24)]
        default_reset_hours: i64,
    },
}

#[derive(Debug, Serialize)]
struct QuotaReport {
    detected: bool,
    #[serde(flatten)]
    signal: Option<QuotaSignal>,
}

/// Runs one command and returns what should be printed on stdout.
pub fn run(cli: Cli) -> anyhow::Result<String> {
    match cli.command {
        Command::Classify { text, hint, config } => {
            let config = match config {
                Some(path) => load_config(&path)?,
                None => OrchestratorConfig::default(),
            };
            let classification = TaskClassifier::new(config.classifier).classify(&text, hint);
            tracing::debug!(
                task_type = %classification.task_type,
                confidence = classification.confidence,
                "classified"
            );
            Ok(serde_json::to_string_pretty(&classification)?)
        }
        Command::Config { path } => {
            let mut config = load_config(&path)?;
            config.router = config.effective_router()?;
            tracing::info!(path = %path.display(), profile = ?config.profile, "config is valid");
            Ok(serde_json::to_string_pretty(&config)?)
        }
        Command::Quota {
            text,
            now,
            default_reset_hours,
        } => {
            let now = now.unwrap_or_else(Utc::now);
            let signal = QuotaDetector::new(default_reset_hours).detect(&text, now);
            if let Some(signal) = &signal {
                tracing::info!(matched = %signal.matched, reset_at = %signal.reset_at, "quota condition found");
            }
            let report = QuotaReport {
                detected: signal.is_some(),
                signal,
            };
            Ok(serde_json::to_string_pretty(&report)?)
        }
    }
}

fn load_config(path: &std::path::Path) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::load(path).with_context(|| format!("failed to load config from {}", path.display()))
}
