//! Deterministic node selection
//!
//! Selection is the one place the engine chooses between alternatives, so
//! it must be deterministic across restarts: filter by availability, pick
//! the highest priority, break ties by the lexicographically smallest node
//! id. A tied group that arrived over parallel edges is selected whole and
//! executed concurrently.

use crate::eligible::{CandidateNode, EligibleSpace};
use cpg_core::trace::DecisionSnapshot;

/// Outcome of node selection for one step
#[derive(Debug, Clone)]
pub enum SelectionDecision {
    /// Nothing is selectable; the instance waits
    Wait,
    /// Execute the selected candidates this step
    Execute {
        /// Selected candidates, in node-id order
        nodes: Vec<CandidateNode>,
        /// Criterion that picked them
        criterion: String,
        /// Available candidates passed over
        alternatives: Vec<String>,
    },
}

impl SelectionDecision {
    /// Trace snapshot of this decision
    pub fn snapshot(&self) -> DecisionSnapshot {
        match self {
            Self::Wait => DecisionSnapshot {
                selected: Vec::new(),
                criterion: "wait".to_string(),
                alternatives: Vec::new(),
            },
            Self::Execute {
                nodes,
                criterion,
                alternatives,
            } => DecisionSnapshot {
                selected: nodes.iter().map(|n| n.node_id.clone()).collect(),
                criterion: criterion.clone(),
                alternatives: alternatives.clone(),
            },
        }
    }
}

/// Select the node(s) to execute from the eligible space
pub fn select(space: &EligibleSpace) -> SelectionDecision {
    let mut available: Vec<&CandidateNode> = space
        .candidates
        .iter()
        .filter(|c| c.evaluation.available)
        .collect();

    if available.is_empty() {
        return SelectionDecision::Wait;
    }

    available.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    let top_priority = available[0].priority;
    let tied: Vec<&CandidateNode> = available
        .iter()
        .copied()
        .take_while(|c| c.priority == top_priority)
        .collect();

    // a tied parallel group executes whole and concurrently
    if tied.len() > 1 && tied.iter().all(|c| c.parallel) {
        let alternatives = available
            .iter()
            .filter(|c| c.priority != top_priority)
            .map(|c| c.node_id.clone())
            .collect();
        return SelectionDecision::Execute {
            nodes: tied.into_iter().cloned().collect(),
            criterion: "parallel-group".to_string(),
            alternatives,
        };
    }

    let selected = tied[0].clone();
    let alternatives = available
        .iter()
        .skip(1)
        .map(|c| c.node_id.clone())
        .collect();
    let criterion = if tied.len() > 1 {
        "highest-priority,lexicographic".to_string()
    } else {
        "highest-priority".to_string()
    };

    SelectionDecision::Execute {
        nodes: vec![selected],
        criterion,
        alternatives,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligible::CandidateOrigin;
    use cpg_core::eval::NodeEvaluation;
    use serde_json::Map;
    use std::collections::HashMap;

    fn candidate(node_id: &str, priority: i64, available: bool, parallel: bool) -> CandidateNode {
        CandidateNode {
            node_id: node_id.to_string(),
            priority,
            origin: CandidateOrigin::EdgeTraversal,
            parallel,
            evaluation: NodeEvaluation {
                node_id: node_id.to_string(),
                available,
                block: None,
                rule_outputs: Map::new(),
                policy_outcomes: HashMap::new(),
            },
        }
    }

    fn space(candidates: Vec<CandidateNode>) -> EligibleSpace {
        EligibleSpace { candidates }
    }

    #[test]
    fn empty_space_waits() {
        assert!(matches!(select(&space(vec![])), SelectionDecision::Wait));
        assert!(matches!(
            select(&space(vec![candidate("a", 5, false, false)])),
            SelectionDecision::Wait
        ));
    }

    #[test]
    fn highest_priority_wins() {
        let decision = select(&space(vec![
            candidate("low", 1, true, false),
            candidate("high", 9, true, false),
        ]));
        match decision {
            SelectionDecision::Execute {
                nodes, alternatives, ..
            } => {
                assert_eq!(nodes[0].node_id, "high");
                assert_eq!(alternatives, vec!["low".to_string()]);
            }
            SelectionDecision::Wait => panic!("expected execution"),
        }
    }

    #[test]
    fn ties_break_lexicographically() {
        let decision = select(&space(vec![
            candidate("zeta", 3, true, false),
            candidate("alpha", 3, true, false),
        ]));
        match decision {
            SelectionDecision::Execute { nodes, criterion, .. } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].node_id, "alpha");
                assert_eq!(criterion, "highest-priority,lexicographic");
            }
            SelectionDecision::Wait => panic!("expected execution"),
        }
    }

    #[test]
    fn parallel_tied_group_selected_whole() {
        let decision = select(&space(vec![
            candidate("b", 2, true, true),
            candidate("c", 2, true, true),
            candidate("d", 1, true, false),
        ]));
        match decision {
            SelectionDecision::Execute {
                nodes,
                criterion,
                alternatives,
            } => {
                let ids: Vec<&str> = nodes.iter().map(|n| n.node_id.as_str()).collect();
                assert_eq!(ids, vec!["b", "c"]);
                assert_eq!(criterion, "parallel-group");
                assert_eq!(alternatives, vec!["d".to_string()]);
            }
            SelectionDecision::Wait => panic!("expected execution"),
        }
    }

    #[test]
    fn mixed_tie_falls_back_to_single_selection() {
        let decision = select(&space(vec![
            candidate("par", 2, true, true),
            candidate("seq", 2, true, false),
        ]));
        match decision {
            SelectionDecision::Execute { nodes, .. } => {
                assert_eq!(nodes.len(), 1);
                assert_eq!(nodes[0].node_id, "par");
            }
            SelectionDecision::Wait => panic!("expected execution"),
        }
    }

    #[test]
    fn selection_is_deterministic() {
        let build = || {
            space(vec![
                candidate("n2", 4, true, false),
                candidate("n1", 4, true, false),
                candidate("n3", 2, true, false),
            ])
        };
        let first = select(&build()).snapshot();
        let second = select(&build()).snapshot();
        assert_eq!(first, second);
        assert_eq!(first.selected, vec!["n1".to_string()]);
    }
}
