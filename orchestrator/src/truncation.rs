//! Shrinks context packages to a byte budget before they are shared.

use switchyard_protocol::ContextPackage;

pub const TRUNCATION_MARKER: &str = "[truncated]";

/// Byte budget shared across a sequence of text fields. Whole lines are kept
/// while they fit; a single line that does not fit is cut at a char boundary.
#[derive(Debug)]
pub struct TextBudget {
    limit: usize,
    used: usize,
}

impl TextBudget {
    pub fn new(limit: usize) -> Self {
        Self { limit, used: 0 }
    }

    /// Returns the (possibly shortened) text and whether it was cut.
    pub fn take(&mut self, content: &str) -> (String, bool) {
        if self.used + content.len() <= self.limit {
            self.used += content.len();
            return (content.to_string(), false);
        }

        let remaining = self.limit.saturating_sub(self.used);
        self.used = self.limit;
        if remaining == 0 {
            return (TRUNCATION_MARKER.to_string(), true);
        }

        let mut kept = String::new();
        for line in content.lines() {
            let needed = line.len() + usize::from(!kept.is_empty());
            if kept.len() + needed > remaining {
                break;
            }
            if !kept.is_empty() {
                kept.push('\n');
            }
            kept.push_str(line);
        }
        if kept.is_empty() {
            kept = prefix_within(content, remaining).to_string();
        }

        kept.push_str(if kept.is_empty() { "" } else { "\n" });
        kept.push_str(TRUNCATION_MARKER);
        (kept, true)
    }

    pub fn remaining(&self) -> usize {
        self.limit.saturating_sub(self.used)
    }
}

fn prefix_within(text: &str, max_bytes: usize) -> &str {
    let mut end = max_bytes.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Outcome of [`ContextCompressor::compress`].
#[derive(Debug, Clone, PartialEq)]
pub struct Compressed {
    pub package: ContextPackage,
    pub dropped_episodes: usize,
    pub truncated_fields: usize,
    pub size_bytes: usize,
}

impl Compressed {
    pub fn changed(&self) -> bool {
        self.dropped_episodes > 0 || self.truncated_fields > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextCompressor {
    budget_bytes: usize,
}

impl ContextCompressor {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// Drops the oldest episodes first (keeping the newest), then cuts long
    /// text fields. Best effort: a package made mostly of keys can stay over
    /// budget.
    pub fn compress(&self, package: &ContextPackage) -> Compressed {
        let mut package = package.clone();
        let mut dropped_episodes = 0;

        while package.size_bytes() > self.budget_bytes {
            let Some(episodic) = package.episodic.as_mut() else {
                break;
            };
            if episodic.episodes.len() <= 1 {
                break;
            }
            episodic.episodes.remove(0);
            dropped_episodes += 1;
        }

        let mut truncated_fields = 0;
        if package.size_bytes() > self.budget_bytes {
            // Half the budget for text leaves room for keys and JSON framing.
            let mut budget = TextBudget::new(self.budget_bytes / 2);
            let mut cut = |text: &mut String| {
                let (kept, was_cut) = budget.take(text);
                if was_cut {
                    *text = kept;
                    truncated_fields += 1;
                }
            };
            if let Some(semantic) = package.semantic.as_mut() {
                cut(&mut semantic.summary);
                for value in semantic.facts.values_mut() {
                    cut(value);
                }
            }
            if let Some(procedural) = package.procedural.as_mut() {
                for step in &mut procedural.steps {
                    cut(step);
                }
            }
            if let Some(episodic) = package.episodic.as_mut() {
                for episode in episodic.episodes.iter_mut().rev() {
                    cut(&mut episode.summary);
                }
            }
        }

        let size_bytes = package.size_bytes();
        Compressed {
            package,
            dropped_episodes,
            truncated_fields,
            size_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use switchyard_protocol::context::SemanticContext;

    #[test]
    fn text_within_budget_is_untouched() {
        let mut budget = TextBudget::new(100);
        let (text, cut) = budget.take("Hello, world!");
        assert_eq!(text, "Hello, world!");
        assert!(!cut);
        assert_eq!(budget.remaining(), 87);
    }

    #[test]
    fn keeps_whole_lines_that_fit() {
        let mut budget = TextBudget::new(12);
        let (text, cut) = budget.take("first\nsecond\nthird");
        assert!(cut);
        assert_eq!(text, format!("first\nsecond\n{TRUNCATION_MARKER}"));
    }

    #[test]
    fn long_single_line_is_cut_on_char_boundary() {
        let mut budget = TextBudget::new(5);
        let (text, cut) = budget.take("ééééé");
        assert!(cut);
        assert_eq!(text, format!("éé\n{TRUNCATION_MARKER}"));
    }

    #[test]
    fn budget_is_shared_across_calls() {
        let mut budget = TextBudget::new(20);
        assert!(!budget.take(&"a".repeat(10)).1);
        assert!(!budget.take(&"b".repeat(10)).1);
        let (text, cut) = budget.take("c");
        assert!(cut);
        assert_eq!(text, TRUNCATION_MARKER);
    }

    #[test]
    fn compression_drops_oldest_episodes_first() {
        let mut package = ContextPackage::default();
        for i in 0..50 {
            package.push_episode(format!("agent-{i}"), "timed out after 30s");
        }
        let budget = package.size_bytes() / 4;

        let compressed = ContextCompressor::new(budget).compress(&package);

        assert!(compressed.dropped_episodes > 0);
        assert!(compressed.size_bytes <= budget);
        let episodes = &compressed.package.episodic.as_ref().unwrap().episodes;
        assert_eq!(episodes.last().unwrap().agent_id, "agent-49");
    }

    #[test]
    fn compression_truncates_long_summary() {
        let package = ContextPackage {
            semantic: Some(SemanticContext {
                summary: "x".repeat(10_000),
                ..Default::default()
            }),
            ..Default::default()
        };

        let compressed = ContextCompressor::new(1_000).compress(&package);

        assert!(compressed.changed());
        assert!(compressed.size_bytes <= 1_000);
        let summary = &compressed.package.semantic.unwrap().summary;
        assert!(summary.ends_with(TRUNCATION_MARKER));
    }
}
