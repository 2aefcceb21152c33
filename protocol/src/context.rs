//! Tiered context handed between agents.
//!
//! A [`ContextPackage`] has four independent tiers. Each one is optional so a
//! producer only ships what it actually knows.

use std::collections::BTreeMap;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextTier {
    Semantic,
    Procedural,
    Episodic,
    Environmental,
}

/// What the work is about: summary, key concepts, established facts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SemanticContext {
    pub summary: String,
    #[serde(default)]
    pub concepts: Vec<String>,
    #[serde(default)]
    pub facts: BTreeMap<String, String>,
}

/// How far along the work is.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ProceduralContext {
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub completed_steps: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_action: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Episode {
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub summary: String,
}

/// What already happened, oldest first.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EpisodicContext {
    #[serde(default)]
    pub episodes: Vec<Episode>,
}

/// Where the work happens.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct EnvironmentalContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContextPackage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semantic: Option<SemanticContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub procedural: Option<ProceduralContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub episodic: Option<EpisodicContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environmental: Option<EnvironmentalContext>,
}

impl ContextPackage {
    pub fn is_empty(&self) -> bool {
        self.semantic.is_none()
            && self.procedural.is_none()
            && self.episodic.is_none()
            && self.environmental.is_none()
    }

    /// Tiers that are present, in canonical order.
    pub fn tiers(&self) -> Vec<ContextTier> {
        let mut tiers = Vec::new();
        if self.semantic.is_some() {
            tiers.push(ContextTier::Semantic);
        }
        if self.procedural.is_some() {
            tiers.push(ContextTier::Procedural);
        }
        if self.episodic.is_some() {
            tiers.push(ContextTier::Episodic);
        }
        if self.environmental.is_some() {
            tiers.push(ContextTier::Environmental);
        }
        tiers
    }

    /// Drops every tier not listed in `keep`.
    pub fn retain_tiers(&mut self, keep: &[ContextTier]) {
        if !keep.contains(&ContextTier::Semantic) {
            self.semantic = None;
        }
        if !keep.contains(&ContextTier::Procedural) {
            self.procedural = None;
        }
        if !keep.contains(&ContextTier::Episodic) {
            self.episodic = None;
        }
        if !keep.contains(&ContextTier::Environmental) {
            self.environmental = None;
        }
    }

    /// Appends an episode, creating the episodic tier if needed.
    pub fn push_episode(&mut self, agent_id: impl Into<String>, summary: impl Into<String>) {
        self.episodic
            .get_or_insert_with(EpisodicContext::default)
            .episodes
            .push(Episode {
                timestamp: Utc::now(),
                agent_id: agent_id.into(),
                summary: summary.into(),
            });
    }

    /// Serialized size in bytes, as it would travel on the wire.
    pub fn size_bytes(&self) -> usize {
        serde_json::to_vec(self).map(|bytes| bytes.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn retain_tiers_drops_unlisted_tiers() {
        let mut package = ContextPackage {
            semantic: Some(SemanticContext {
                summary: "parser rewrite".to_string(),
                ..Default::default()
            }),
            procedural: Some(ProceduralContext::default()),
            episodic: None,
            environmental: Some(EnvironmentalContext::default()),
        };

        package.retain_tiers(&[ContextTier::Semantic, ContextTier::Episodic]);

        assert_eq!(package.tiers(), vec![ContextTier::Semantic]);
    }

    #[test]
    fn push_episode_creates_tier() {
        let mut package = ContextPackage::default();
        assert!(package.is_empty());
        package.push_episode("agent-a", "timed out");
        assert_eq!(package.tiers(), vec![ContextTier::Episodic]);
        assert!(package.size_bytes() > 0);
    }
}
