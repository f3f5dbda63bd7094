// src/learner/types.rs — Learning chain type definitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;

use crate::infra::errors::PipelineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    /// Head of the scene's chain; fed to the next refinement.
    Active,
    /// Replaced by a newer learning of the same scene.
    Superseded,
    /// Chain closed: the scene reached a terminal state.
    Archived,
}

impl LearningStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LearningStatus::Active => "active",
            LearningStatus::Superseded => "superseded",
            LearningStatus::Archived => "archived",
        }
    }
}

impl FromStr for LearningStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(LearningStatus::Active),
            "superseded" => Ok(LearningStatus::Superseded),
            "archived" => Ok(LearningStatus::Archived),
            other => Err(PipelineError::Integrity(format!(
                "unknown learning status '{other}'"
            ))),
        }
    }
}

/// A term and how many variants reported it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermCount {
    pub term: String,
    pub count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub count: u32,
}

impl ScoreDistribution {
    pub fn from_scores(scores: &[f64]) -> Self {
        if scores.is_empty() {
            return Self {
                min: 0.0,
                max: 0.0,
                mean: 0.0,
                count: 0,
            };
        }
        let min = scores.iter().copied().fold(f64::INFINITY, f64::min);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = scores.iter().sum::<f64>() / scores.len() as f64;
        Self {
            min,
            max,
            mean,
            count: scores.len() as u32,
        }
    }
}

/// Aggregated reasons a prompt version failed, cumulative along the chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailurePatterns {
    pub failed_terms: Vec<TermCount>,
    pub common_artifacts: Vec<TermCount>,
    pub style_violations: Vec<TermCount>,
    pub score_distribution: ScoreDistribution,
}

impl FailurePatterns {
    pub fn is_empty(&self) -> bool {
        self.failed_terms.is_empty()
            && self.common_artifacts.is_empty()
            && self.style_violations.is_empty()
    }
}

/// Immutable node of a scene's learning chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub scene_id: String,
    pub prompt_version_id: String,
    pub parent_learning_id: Option<String>,
    pub patterns: FailurePatterns,
    pub status: LearningStatus,
    pub extra: BTreeMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Arena of one scene's learnings, indexed by id, with the active head.
#[derive(Debug, Clone, Default)]
pub struct LearningChain {
    nodes: HashMap<String, Learning>,
    head: Option<String>,
}

impl LearningChain {
    /// Build from rows. The head is the active node, or the node nothing points
    /// back to when the chain was archived.
    pub fn from_learnings(learnings: Vec<Learning>) -> Result<Self, PipelineError> {
        let parents: HashSet<&str> = learnings
            .iter()
            .filter_map(|l| l.parent_learning_id.as_deref())
            .collect();
        let head = learnings
            .iter()
            .find(|l| l.status == LearningStatus::Active)
            .or_else(|| learnings.iter().find(|l| !parents.contains(l.id.as_str())))
            .map(|l| l.id.clone());
        let nodes = learnings.into_iter().map(|l| (l.id.clone(), l)).collect();
        let chain = Self { nodes, head };
        chain.check_acyclic()?;
        Ok(chain)
    }

    pub fn head(&self) -> Option<&Learning> {
        self.head.as_ref().and_then(|id| self.nodes.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Learning> {
        self.nodes.get(id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Head first, following parent links to the root.
    pub fn walk(&self) -> Vec<&Learning> {
        let mut out = Vec::new();
        let mut cursor = self.head.as_deref();
        while let Some(id) = cursor {
            let Some(node) = self.nodes.get(id) else {
                break;
            };
            out.push(node);
            cursor = node.parent_learning_id.as_deref();
            if out.len() > self.nodes.len() {
                break;
            }
        }
        out
    }

    fn check_acyclic(&self) -> Result<(), PipelineError> {
        for start in self.nodes.keys() {
            let mut seen = HashSet::new();
            let mut cursor = Some(start.as_str());
            while let Some(id) = cursor {
                if !seen.insert(id) {
                    return Err(PipelineError::Integrity(format!(
                        "learning chain cycle through {id}"
                    )));
                }
                cursor = self
                    .nodes
                    .get(id)
                    .and_then(|n| n.parent_learning_id.as_deref());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: &str, parent: Option<&str>, status: LearningStatus) -> Learning {
        Learning {
            id: id.into(),
            scene_id: "scene".into(),
            prompt_version_id: format!("pv-{id}"),
            parent_learning_id: parent.map(String::from),
            patterns: FailurePatterns {
                failed_terms: vec![],
                common_artifacts: vec![],
                style_violations: vec![],
                score_distribution: ScoreDistribution::from_scores(&[]),
            },
            status,
            extra: BTreeMap::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "superseded".parse::<LearningStatus>().unwrap(),
            LearningStatus::Superseded
        );
        assert!("gone".parse::<LearningStatus>().is_err());
    }

    #[test]
    fn test_score_distribution() {
        let d = ScoreDistribution::from_scores(&[0.2, 0.6, 0.4]);
        assert!((d.min - 0.2).abs() < 1e-9);
        assert!((d.max - 0.6).abs() < 1e-9);
        assert!((d.mean - 0.4).abs() < 1e-9);
        assert_eq!(d.count, 3);
        assert_eq!(ScoreDistribution::from_scores(&[]).count, 0);
    }

    #[test]
    fn test_chain_walk_from_active_head() {
        let chain = LearningChain::from_learnings(vec![
            node("a", None, LearningStatus::Superseded),
            node("b", Some("a"), LearningStatus::Superseded),
            node("c", Some("b"), LearningStatus::Active),
        ])
        .unwrap();
        let ids: Vec<_> = chain.walk().iter().map(|l| l.id.as_str()).collect();
        assert_eq!(ids, vec!["c", "b", "a"]);
        assert_eq!(chain.head().unwrap().id, "c");
    }

    #[test]
    fn test_chain_rejects_cycle() {
        let result = LearningChain::from_learnings(vec![
            node("a", Some("b"), LearningStatus::Superseded),
            node("b", Some("a"), LearningStatus::Active),
        ]);
        assert!(matches!(result, Err(PipelineError::Integrity(_))));
    }

    #[test]
    fn test_empty_chain() {
        let chain = LearningChain::from_learnings(vec![]).unwrap();
        assert!(chain.is_empty());
        assert!(chain.head().is_none());
        assert!(chain.walk().is_empty());
    }
}
