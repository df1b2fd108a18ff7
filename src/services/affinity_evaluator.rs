//! Affinity scoring and ranking over node snapshots.
//!
//! Pure evaluation: hard rules gate candidacy, soft rules move a neutral
//! score of 50 within `[0, 100]`. Agent rules look at agents placed on the
//! target node, widened to the topology domain when the rule names a
//! topology key; node rules look at node labels.

use std::collections::HashMap;

use crate::domain::models::{AffinityRule, AgentAffinity, Node, RuleStrength};

/// Neutral starting score before soft rules apply.
const NEUTRAL_SCORE: f64 = 50.0;

/// Which rule group a per-rule result came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleGroup {
    AgentAffinity,
    AgentAntiAffinity,
    NodeAffinity,
}

/// Outcome of one rule against one node.
#[derive(Debug, Clone)]
pub struct RuleResult {
    pub group: RuleGroup,
    pub rule_index: usize,
    pub matched: bool,
    pub strength: RuleStrength,
    /// Weight added to the score; zero for hard or unmatched rules.
    pub weight_applied: u32,
}

/// Full evaluation of an affinity spec against one node.
#[derive(Debug, Clone)]
pub struct AffinityEvaluation {
    /// Final score in `[0, 100]`.
    pub total_score: f64,
    pub rule_results: Vec<RuleResult>,
    pub hard_constraints_satisfied: bool,
}

impl AffinityEvaluation {
    fn neutral() -> Self {
        Self {
            total_score: NEUTRAL_SCORE,
            rule_results: Vec::new(),
            hard_constraints_satisfied: true,
        }
    }
}

/// A ranked candidate node with its affinity score.
#[derive(Debug, Clone)]
pub struct RankedNode {
    pub node: Node,
    pub score: f64,
}

/// Stateless affinity evaluator.
pub struct AffinityEvaluator;

impl AffinityEvaluator {
    /// Score `affinity` for placing an agent with `agent_labels` on `target`.
    /// `all_nodes` supplies the topology domains for widened agent rules.
    pub fn evaluate(
        agent_labels: &HashMap<String, String>,
        target: &Node,
        all_nodes: &[Node],
        affinity: &AgentAffinity,
    ) -> AffinityEvaluation {
        let _ = agent_labels; // the requesting agent's own labels only matter to other agents' rules
        let mut score = NEUTRAL_SCORE;
        let mut hard_ok = true;
        let mut rule_results = Vec::new();

        let groups = [
            (RuleGroup::AgentAffinity, &affinity.agent_affinity),
            (RuleGroup::AgentAntiAffinity, &affinity.agent_anti_affinity),
            (RuleGroup::NodeAffinity, &affinity.node_affinity),
        ];

        for (group, rules) in groups {
            for (rule_index, rule) in rules.iter().enumerate() {
                let matched = match group {
                    RuleGroup::NodeAffinity => Self::node_rule_matches(rule, target),
                    RuleGroup::AgentAffinity => {
                        Self::agent_selector_hits(rule, target, all_nodes)
                    }
                    RuleGroup::AgentAntiAffinity => {
                        // Anti-affinity matches when no conflicting agent exists.
                        !Self::agent_selector_hits(rule, target, all_nodes)
                    }
                };

                let mut weight_applied = 0;
                match rule.strength {
                    RuleStrength::Hard => {
                        if !matched {
                            hard_ok = false;
                        }
                    }
                    RuleStrength::Soft => {
                        if matched {
                            weight_applied = rule.weight_value();
                            score += f64::from(weight_applied);
                        }
                    }
                }
                rule_results.push(RuleResult {
                    group,
                    rule_index,
                    matched,
                    strength: rule.strength,
                    weight_applied,
                });
            }
        }

        AffinityEvaluation {
            total_score: score.clamp(0.0, 100.0),
            rule_results,
            hard_constraints_satisfied: hard_ok,
        }
    }

    /// Rank `nodes` for an agent: only nodes satisfying every hard constraint
    /// survive, sorted by score descending, stable on ties.
    pub fn rank(
        agent_labels: &HashMap<String, String>,
        nodes: &[Node],
        affinity: Option<&AgentAffinity>,
    ) -> Vec<RankedNode> {
        let mut ranked: Vec<RankedNode> = nodes
            .iter()
            .filter_map(|node| {
                let evaluation = affinity.map_or_else(AffinityEvaluation::neutral, |spec| {
                    Self::evaluate(agent_labels, node, nodes, spec)
                });
                evaluation.hard_constraints_satisfied.then(|| RankedNode {
                    node: node.clone(),
                    score: evaluation.total_score,
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        ranked
    }

    /// True iff the node rule's selector matches the node's labels.
    /// A rule without a selector places no constraint.
    fn node_rule_matches(rule: &AffinityRule, target: &Node) -> bool {
        rule.node_selector
            .as_ref()
            .is_none_or(|selector| selector.matches(&target.labels))
    }

    /// True iff any agent in the rule's domain matches its agent selector.
    ///
    /// Without a topology key the domain is the target node. With one, the
    /// domain is every node sharing the target's value of that label; a target
    /// lacking the label forms a domain of itself alone.
    fn agent_selector_hits(rule: &AffinityRule, target: &Node, all_nodes: &[Node]) -> bool {
        let Some(selector) = rule.agent_selector.as_ref() else {
            return true;
        };

        match rule
            .topology_key
            .as_ref()
            .and_then(|key| target.labels.get(key).map(|value| (key, value)))
        {
            Some((key, value)) => all_nodes
                .iter()
                .filter(|node| node.labels.get(key) == Some(value))
                .flat_map(|node| node.agents.values())
                .any(|agent| selector.matches(&agent.labels)),
            None => target
                .agents
                .values()
                .any(|agent| selector.matches(&agent.labels)),
        }
    }
}
