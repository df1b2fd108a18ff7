//! Affinity rules and label selectors.
//!
//! Selectors follow the conjunction model: every `match_labels` pair and every
//! `match_expressions` entry must hold for the selector to match. Rules are
//! grouped into agent-affinity, agent-anti-affinity, and node-affinity lists
//! on [`AgentAffinity`]; hard rules filter, soft rules score.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Default weight contributed by a matching soft rule with no explicit weight.
pub const DEFAULT_SOFT_WEIGHT: u32 = 10;

/// Operator of a single match expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum SelectorOperator {
    /// Label present and its value is one of `values`.
    In,
    /// Label absent, or its value is not one of `values`.
    NotIn,
    /// Label present with any value.
    Exists,
    /// Label absent.
    DoesNotExist,
}

/// One expression of a label selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchExpression {
    pub key: String,
    pub operator: SelectorOperator,
    #[serde(default)]
    pub values: Vec<String>,
}

impl MatchExpression {
    fn matches(&self, labels: &HashMap<String, String>) -> bool {
        match self.operator {
            SelectorOperator::In => labels
                .get(&self.key)
                .is_some_and(|v| self.values.contains(v)),
            SelectorOperator::NotIn => labels
                .get(&self.key)
                .is_none_or(|v| !self.values.contains(v)),
            SelectorOperator::Exists => labels.contains_key(&self.key),
            SelectorOperator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

/// A conjunction of exact-match labels and match expressions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector {
    #[serde(default)]
    pub match_labels: HashMap<String, String>,
    #[serde(default)]
    pub match_expressions: Vec<MatchExpression>,
}

impl LabelSelector {
    /// Exact key=value selector over a single pair.
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut match_labels = HashMap::new();
        match_labels.insert(key.into(), value.into());
        Self {
            match_labels,
            match_expressions: Vec::new(),
        }
    }

    /// True iff every equality and every expression holds against `labels`.
    pub fn matches(&self, labels: &HashMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|e| e.matches(labels))
    }
}

/// Hard rules filter candidates; soft rules add weight to the score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleStrength {
    Hard,
    Soft,
}

/// A single affinity or anti-affinity rule.
///
/// A rule carries exactly one of `agent_selector` (matched against placed
/// agents) or `node_selector` (matched against node labels). `topology_key`
/// widens an agent rule from the target node to all nodes sharing the target's
/// value of that label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffinityRule {
    pub strength: RuleStrength,
    /// Weight 1–100 for soft rules; `None` means [`DEFAULT_SOFT_WEIGHT`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topology_key: Option<String>,
}

impl AffinityRule {
    /// A hard node-affinity rule over exact labels.
    pub fn hard_node(selector: LabelSelector) -> Self {
        Self {
            strength: RuleStrength::Hard,
            weight: None,
            agent_selector: None,
            node_selector: Some(selector),
            topology_key: None,
        }
    }

    /// A soft node-affinity rule with the given weight.
    pub fn soft_node(selector: LabelSelector, weight: u32) -> Self {
        Self {
            strength: RuleStrength::Soft,
            weight: Some(weight),
            agent_selector: None,
            node_selector: Some(selector),
            topology_key: None,
        }
    }

    /// A hard agent rule, optionally widened by a topology key.
    pub fn hard_agent(selector: LabelSelector, topology_key: Option<String>) -> Self {
        Self {
            strength: RuleStrength::Hard,
            weight: None,
            agent_selector: Some(selector),
            node_selector: None,
            topology_key,
        }
    }

    /// The weight a matching soft rule contributes.
    pub fn weight_value(&self) -> u32 {
        self.weight.unwrap_or(DEFAULT_SOFT_WEIGHT)
    }

    fn validate(&self) -> Result<(), String> {
        if self.agent_selector.is_some() && self.node_selector.is_some() {
            return Err("rule may carry an agent selector or a node selector, not both".to_string());
        }
        if self.topology_key.is_some() && self.agent_selector.is_none() {
            return Err("topology key requires an agent selector".to_string());
        }
        if self.strength == RuleStrength::Soft {
            if let Some(w) = self.weight {
                if !(1..=100).contains(&w) {
                    return Err(format!("soft rule weight must be 1-100, got {w}"));
                }
            }
        }
        Ok(())
    }
}

/// Affinity rule groups carried by a scheduling request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentAffinity {
    #[serde(default)]
    pub agent_affinity: Vec<AffinityRule>,
    #[serde(default)]
    pub agent_anti_affinity: Vec<AffinityRule>,
    #[serde(default)]
    pub node_affinity: Vec<AffinityRule>,
}

impl AgentAffinity {
    /// Reject malformed rule shapes before any state is touched.
    pub fn validate(&self) -> Result<(), String> {
        for rule in self
            .agent_affinity
            .iter()
            .chain(&self.agent_anti_affinity)
            .chain(&self.node_affinity)
        {
            rule.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect()
    }

    #[test]
    fn test_match_labels_conjunction() {
        let selector = LabelSelector {
            match_labels: labels(&[("zone", "a"), ("tier", "gpu")]),
            match_expressions: Vec::new(),
        };
        assert!(selector.matches(&labels(&[("zone", "a"), ("tier", "gpu"), ("extra", "x")])));
        assert!(!selector.matches(&labels(&[("zone", "a")])));
    }

    #[test]
    fn test_operator_in() {
        let expr = MatchExpression {
            key: "zone".to_string(),
            operator: SelectorOperator::In,
            values: vec!["a".to_string(), "b".to_string()],
        };
        assert!(expr.matches(&labels(&[("zone", "a")])));
        assert!(!expr.matches(&labels(&[("zone", "c")])));
        assert!(!expr.matches(&labels(&[])));
    }

    #[test]
    fn test_operator_not_in_absent_label_matches() {
        let expr = MatchExpression {
            key: "zone".to_string(),
            operator: SelectorOperator::NotIn,
            values: vec!["a".to_string()],
        };
        assert!(expr.matches(&labels(&[])));
        assert!(expr.matches(&labels(&[("zone", "b")])));
        assert!(!expr.matches(&labels(&[("zone", "a")])));
    }

    #[test]
    fn test_operator_exists_and_does_not_exist() {
        let exists = MatchExpression {
            key: "gpu".to_string(),
            operator: SelectorOperator::Exists,
            values: Vec::new(),
        };
        let absent = MatchExpression {
            key: "gpu".to_string(),
            operator: SelectorOperator::DoesNotExist,
            values: Vec::new(),
        };
        assert!(exists.matches(&labels(&[("gpu", "a100")])));
        assert!(!exists.matches(&labels(&[])));
        assert!(absent.matches(&labels(&[])));
        assert!(!absent.matches(&labels(&[("gpu", "a100")])));
    }

    #[test]
    fn test_validate_rejects_both_selectors() {
        let rule = AffinityRule {
            strength: RuleStrength::Hard,
            weight: None,
            agent_selector: Some(LabelSelector::label("a", "b")),
            node_selector: Some(LabelSelector::label("c", "d")),
            topology_key: None,
        };
        let affinity = AgentAffinity {
            agent_affinity: vec![rule],
            ..AgentAffinity::default()
        };
        assert!(affinity.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_topology_without_agent_selector() {
        let rule = AffinityRule {
            strength: RuleStrength::Hard,
            weight: None,
            agent_selector: None,
            node_selector: Some(LabelSelector::label("zone", "a")),
            topology_key: Some("zone".to_string()),
        };
        let affinity = AgentAffinity {
            node_affinity: vec![rule],
            ..AgentAffinity::default()
        };
        assert!(affinity.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_weight() {
        let mut rule = AffinityRule::soft_node(LabelSelector::label("zone", "a"), 101);
        let affinity = AgentAffinity {
            node_affinity: vec![rule.clone()],
            ..AgentAffinity::default()
        };
        assert!(affinity.validate().is_err());

        rule.weight = Some(0);
        let affinity = AgentAffinity {
            node_affinity: vec![rule],
            ..AgentAffinity::default()
        };
        assert!(affinity.validate().is_err());
    }

    #[test]
    fn test_weight_value_defaults() {
        let rule = AffinityRule::hard_node(LabelSelector::label("zone", "a"));
        assert_eq!(rule.weight_value(), DEFAULT_SOFT_WEIGHT);
        let rule = AffinityRule::soft_node(LabelSelector::label("zone", "a"), 30);
        assert_eq!(rule.weight_value(), 30);
    }
}
