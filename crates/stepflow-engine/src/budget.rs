//! Priority-aware history selection.
//!
//! Every step receives a bounded slice of the run's prior step outputs.
//! Items are classified into priority tiers, ordered by tier and then
//! chronologically, clipped to a per-item cap and admitted until the total
//! character budget is spent.

use std::collections::{BTreeMap, HashMap, HashSet};

use regex::{Regex, RegexBuilder};
use tracing::{debug, warn};

use stepflow_core::config::{AppConfig, PriorityConfig};
use stepflow_core::error::{Result, StepflowError};
use stepflow_core::types::{ContextBudget, HistoryItem, Priority, SelectedItem, TruncationReport};

/// Ends every clipped item. It counts toward the item's cap.
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Assigns a priority tier to a history item.
#[derive(Debug, Clone)]
pub struct PriorityClassifier {
    default_tier: Priority,
    roles: HashMap<String, Priority>,
    /// Highest tier first.
    patterns: Vec<(Priority, Regex)>,
}

impl PriorityClassifier {
    /// A classifier with no role map and no keyword patterns.
    pub fn new(default_tier: Priority) -> Self {
        Self {
            default_tier,
            roles: HashMap::new(),
            patterns: vec![],
        }
    }

    pub fn from_config(config: &PriorityConfig) -> Result<Self> {
        let mut classifier = Self::new(config.default_tier);
        classifier.roles = config
            .roles
            .iter()
            .map(|(role, tier)| (role.to_lowercase(), *tier))
            .collect();
        for tier in Priority::DESCENDING {
            for pattern in config.keywords.get(&tier).into_iter().flatten() {
                classifier = classifier.with_keyword(tier, pattern)?;
            }
        }
        Ok(classifier)
    }

    pub fn with_role(mut self, role: impl Into<String>, tier: Priority) -> Self {
        self.roles.insert(role.into().to_lowercase(), tier);
        self
    }

    /// Add a case-insensitive pattern matched against role names.
    pub fn with_keyword(mut self, tier: Priority, pattern: &str) -> Result<Self> {
        let regex = RegexBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| {
                StepflowError::Config(format!("priority pattern '{}': {}", pattern, e))
            })?;
        self.patterns.push((tier, regex));
        self.patterns.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(self)
    }

    pub fn classify(&self, item: &HistoryItem) -> Priority {
        item.priority.unwrap_or_else(|| self.classify_role(&item.role))
    }

    pub fn classify_role(&self, role: &str) -> Priority {
        if let Some(tier) = self.roles.get(&role.to_lowercase()) {
            return *tier;
        }
        self.patterns
            .iter()
            .find(|(_, re)| re.is_match(role))
            .map(|(tier, _)| *tier)
            .unwrap_or(self.default_tier)
    }
}

/// Selects the history delivered to a step.
#[derive(Debug, Clone)]
pub struct ContextBudgetManager {
    classifier: PriorityClassifier,
    min_chars: usize,
    max_chars: usize,
}

impl ContextBudgetManager {
    pub fn new(classifier: PriorityClassifier, min_chars: usize, max_chars: usize) -> Self {
        Self {
            classifier,
            min_chars,
            max_chars,
        }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(
            PriorityClassifier::from_config(&config.priority)?,
            config.budget.min_chars,
            config.budget.max_chars,
        ))
    }

    pub fn classifier(&self) -> &PriorityClassifier {
        &self.classifier
    }

    /// Force budget values into the sane range. Every adjustment is
    /// reported as a warning.
    pub fn clamp(&self, budget: ContextBudget) -> (ContextBudget, Vec<String>) {
        let mut warnings = Vec::new();
        let mut bound = |name: &str, value: usize, ceiling: usize| {
            let clamped = value.clamp(self.min_chars, ceiling.max(self.min_chars));
            if clamped != value {
                let msg = format!("{} budget {} clamped to {}", name, value, clamped);
                warn!(budget = name, value, clamped, "Budget out of range");
                warnings.push(msg);
            }
            clamped
        };
        let total = bound("total", budget.total, self.max_chars);
        let recent = bound("recent", budget.recent, total);
        let older = bound("older", budget.older, total);
        (ContextBudget::new(total, recent, older), warnings)
    }

    /// Choose which history items a step sees.
    ///
    /// The most recent item is capped at `recent`, every other item at
    /// `older`. A clipped item ends in [`TRUNCATION_MARKER`] and is exactly
    /// its cap long, marker included. Selection stops at the first item that
    /// no longer fits under `total`.
    pub fn select(
        &self,
        history: &[HistoryItem],
        budget: ContextBudget,
    ) -> (Vec<SelectedItem>, TruncationReport) {
        let (budget, mut warnings) = self.clamp(budget);

        let mut seen = HashSet::new();
        let mut omitted = Vec::new();
        let mut valid: Vec<(Priority, &HistoryItem)> = Vec::with_capacity(history.len());
        for item in history {
            if item.node_id.trim().is_empty() {
                warn!(sequence = item.sequence, "History item without a node id excluded");
                warnings.push(format!("item {} has no node id", item.sequence));
                omitted.push(item.sequence);
                continue;
            }
            if !seen.insert(item.sequence) {
                warn!(sequence = item.sequence, "Duplicate history sequence excluded");
                warnings.push(format!("item {} repeats an earlier sequence", item.sequence));
                omitted.push(item.sequence);
                continue;
            }
            valid.push((self.classifier.classify(item), item));
        }

        let most_recent = valid.iter().map(|(_, item)| item.sequence).max();
        valid.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.sequence.cmp(&b.1.sequence)));

        let marker_len = TRUNCATION_MARKER.chars().count();
        let mut selected = Vec::new();
        let mut clipped = Vec::new();
        let mut tiers: BTreeMap<Priority, usize> = BTreeMap::new();
        let mut used = 0usize;
        let mut exhausted = false;

        for (priority, item) in valid {
            if exhausted {
                omitted.push(item.sequence);
                continue;
            }
            let cap = if Some(item.sequence) == most_recent {
                budget.recent
            } else {
                budget.older
            };
            let original_chars = item.char_len();
            let (content, delivered, was_clipped) = if original_chars > cap {
                (clip(&item.content, cap, marker_len), cap, true)
            } else {
                (item.content.clone(), original_chars, false)
            };

            if used + delivered > budget.total {
                exhausted = true;
                omitted.push(item.sequence);
                continue;
            }

            used += delivered;
            if was_clipped {
                clipped.push(item.sequence);
            }
            *tiers.entry(priority).or_default() += 1;
            selected.push(SelectedItem {
                sequence: item.sequence,
                node_id: item.node_id.clone(),
                role: item.role.clone(),
                priority,
                content,
                original_chars,
                clipped: was_clipped,
            });
        }

        omitted.sort_unstable();
        let truncated = !omitted.is_empty() || !clipped.is_empty();
        let note = describe(selected.len(), history.len(), used, &budget, &tiers);
        debug!(
            included = selected.len(),
            total = history.len(),
            chars = used,
            truncated,
            "History selected"
        );

        let report = TruncationReport {
            steps_included: selected.len(),
            steps_total: history.len(),
            chars_used: used,
            budget: Some(budget),
            truncated,
            clipped,
            omitted,
            tiers,
            note,
            warnings,
        };
        (selected, report)
    }
}

fn describe(
    included: usize,
    total: usize,
    used: usize,
    budget: &ContextBudget,
    tiers: &BTreeMap<Priority, usize>,
) -> String {
    if total == 0 {
        return "no prior steps".to_string();
    }
    let breakdown: Vec<String> = Priority::DESCENDING
        .iter()
        .filter_map(|tier| tiers.get(tier).map(|n| format!("{}={}", tier, n)))
        .collect();
    format!(
        "{} of {} prior steps included, {} of {} chars [{}]",
        included,
        total,
        used,
        budget.total,
        breakdown.join(" ")
    )
}

/// First chars of `content` plus the marker, `cap` chars in all. Caps too
/// small for the marker get bare text.
fn clip(content: &str, cap: usize, marker_len: usize) -> String {
    if cap <= marker_len {
        return content.chars().take(cap).collect();
    }
    let mut text: String = content.chars().take(cap - marker_len).collect();
    text.push_str(TRUNCATION_MARKER);
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> ContextBudgetManager {
        ContextBudgetManager::from_config(&AppConfig::default()).unwrap()
    }

    fn item(seq: u64, role: &str, chars: usize) -> HistoryItem {
        HistoryItem::new(seq, format!("n{}", seq), role, "x".repeat(chars))
    }

    #[test]
    fn test_classifier_precedence() {
        let classifier = PriorityClassifier::new(Priority::Medium)
            .with_role("Scribe", Priority::Low)
            .with_keyword(Priority::High, "critic")
            .unwrap()
            .with_keyword(Priority::Critical, "requirement")
            .unwrap();

        assert_eq!(classifier.classify_role("scribe"), Priority::Low);
        assert_eq!(classifier.classify_role("Code-Critic"), Priority::High);
        assert_eq!(classifier.classify_role("requirement-critic"), Priority::Critical);
        assert_eq!(classifier.classify_role("author"), Priority::Medium);

        let pinned = HistoryItem::new(1, "n", "critic", "x").with_priority(Priority::Low);
        assert_eq!(classifier.classify(&pinned), Priority::Low);
    }

    #[test]
    fn test_invalid_keyword_is_config_error() {
        let err = PriorityClassifier::new(Priority::Medium)
            .with_keyword(Priority::High, "(unclosed")
            .unwrap_err();
        assert!(matches!(err, StepflowError::Config(_)));
    }

    #[test]
    fn test_critical_item_survives_tight_budget() {
        let history = vec![
            item(1, "author", 700),
            item(2, "author", 300),
            item(3, "author", 650).with_priority(Priority::Critical),
        ];
        let (selected, report) = manager().select(&history, ContextBudget::new(1000, 600, 200));

        assert_eq!(report.steps_total, 3);
        assert!(report.truncated);
        assert_eq!(selected[0].sequence, 3);
        assert_eq!(selected[0].priority, Priority::Critical);
        assert!(selected[0].clipped);
        assert!(selected[0].content.ends_with(TRUNCATION_MARKER));
        assert_eq!(selected[0].content.chars().count(), 600);
        assert_eq!(selected[1].sequence, 1);
        assert!(report.chars_used <= 1000);

        // One char less and the last older item no longer fits.
        let (selected, report) = manager().select(&history, ContextBudget::new(999, 600, 200));
        assert_eq!(selected.len(), 2);
        assert_eq!(report.omitted, vec![2]);
        assert_eq!(report.chars_used, 800);
    }

    #[test]
    fn test_clipped_items_respect_their_cap() {
        let history = vec![item(1, "author", 650)];
        let (selected, report) = manager().select(&history, ContextBudget::new(1000, 600, 200));
        assert_eq!(selected[0].content.chars().count(), 600);
        assert_eq!(selected[0].original_chars, 650);
        assert_eq!(report.chars_used, 600);
        assert_eq!(report.clipped, vec![1]);

        assert_eq!(clip("abcdef", 4, TRUNCATION_MARKER.chars().count()), "abcd");
    }

    #[test]
    fn test_everything_fits() {
        let history = vec![item(1, "author", 50), item(2, "critic", 80)];
        let (selected, report) = manager().select(&history, ContextBudget::new(1000, 600, 200));
        assert_eq!(selected.len(), 2);
        assert!(!report.truncated);
        assert_eq!(report.chars_used, 130);
        // critic matches the default high-tier keywords
        assert_eq!(selected[0].sequence, 2);
        assert_eq!(report.tiers.get(&Priority::High), Some(&1));
    }

    #[test]
    fn test_equal_priority_keeps_chronological_order() {
        let history = vec![
            item(5, "author", 10),
            item(2, "author", 10),
            item(9, "author", 10),
        ];
        let (selected, _) = manager().select(&history, ContextBudget::new(1000, 600, 200));
        let seqs: Vec<u64> = selected.iter().map(|s| s.sequence).collect();
        assert_eq!(seqs, vec![2, 5, 9]);
    }

    #[test]
    fn test_selection_independent_of_input_order() {
        let base = vec![
            item(1, "author", 300),
            item(2, "critic", 250),
            item(3, "debug-log", 400),
            item(4, "requirements", 500),
        ];
        let budget = ContextBudget::new(1000, 600, 200);
        let (expected, _) = manager().select(&base, budget);

        let mut reversed = base.clone();
        reversed.reverse();
        let mut rotated = base.clone();
        rotated.rotate_left(2);
        for shuffled in [reversed, rotated] {
            let (got, _) = manager().select(&shuffled, budget);
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn test_malformed_items_excluded() {
        let history = vec![
            item(1, "author", 10),
            HistoryItem::new(2, "  ", "author", "orphan"),
            item(1, "author", 10),
        ];
        let (selected, report) = manager().select(&history, ContextBudget::new(1000, 600, 200));
        assert_eq!(selected.len(), 1);
        assert_eq!(report.steps_total, 3);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.truncated);
    }

    #[test]
    fn test_out_of_range_budget_is_clamped() {
        let (budget, warnings) = manager().clamp(ContextBudget::new(10, 5_000, 1));
        assert_eq!(budget.total, 100);
        assert_eq!(budget.recent, 100);
        assert_eq!(budget.older, 100);
        assert_eq!(warnings.len(), 3);

        let (_, report) = manager().select(&[], ContextBudget::new(10, 5, 5));
        assert_eq!(report.warnings.len(), 3);
        assert_eq!(report.note, "no prior steps");
    }

    #[test]
    fn test_empty_history() {
        let (selected, report) = manager().select(&[], ContextBudget::new(1000, 600, 200));
        assert!(selected.is_empty());
        assert_eq!(report.steps_total, 0);
        assert!(!report.truncated);
    }
}
