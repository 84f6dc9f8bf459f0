//! Gradient-boosted / bagged decision tree ensembles

use crate::models::scorer::{sigmoid, Scorer};
use serde::{Deserialize, Serialize};

/// Node of a flattened decision tree.
///
/// Rows with `x[feature] <= threshold` go left.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TreeNode {
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
    Leaf {
        value: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

impl Tree {
    fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("tree has no nodes".to_string());
        }
        for (idx, node) in self.nodes.iter().enumerate() {
            match node {
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    if *feature >= n_features {
                        return Err(format!("node {} splits on feature {} of {}", idx, feature, n_features));
                    }
                    if !threshold.is_finite() {
                        return Err(format!("node {} has a non-finite threshold", idx));
                    }
                    // Children after their parent rule out cycles
                    for child in [left, right] {
                        if *child <= idx || *child >= self.nodes.len() {
                            return Err(format!("node {} has invalid child index {}", idx, child));
                        }
                    }
                }
                TreeNode::Leaf { value } => {
                    if !value.is_finite() {
                        return Err(format!("leaf {} has a non-finite value", idx));
                    }
                }
            }
        }
        Ok(())
    }

    fn evaluate(&self, features: &[f64]) -> anyhow::Result<f64> {
        let mut idx = 0;
        loop {
            match self.nodes.get(idx) {
                Some(TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                }) => {
                    let x = features
                        .get(*feature)
                        .ok_or_else(|| anyhow::anyhow!("feature {} missing from row", feature))?;
                    idx = if *x <= *threshold { *left } else { *right };
                }
                Some(TreeNode::Leaf { value }) => return Ok(*value),
                None => anyhow::bail!("node {} out of range", idx),
            }
        }
    }
}

/// How leaf outputs combine into a probability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TreeAggregation {
    /// Boosting: sigmoid(base_score + sum of leaves)
    LogitSum,
    /// Bagging: mean of leaf probabilities
    MeanProbability,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TreeEnsembleScorer {
    pub aggregation: TreeAggregation,
    #[serde(default)]
    pub base_score: f64,
    pub trees: Vec<Tree>,
}

impl TreeEnsembleScorer {
    pub(crate) fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.trees.is_empty() {
            return Err("tree ensemble has no trees".to_string());
        }
        if !self.base_score.is_finite() {
            return Err("tree ensemble base_score is not finite".to_string());
        }
        for (i, tree) in self.trees.iter().enumerate() {
            tree.validate(n_features).map_err(|e| format!("tree {}: {}", i, e))?;
            if self.aggregation == TreeAggregation::MeanProbability {
                let outside = tree.nodes.iter().any(|n| matches!(n, TreeNode::Leaf { value } if !(0.0..=1.0).contains(value)));
                if outside {
                    return Err(format!("tree {}: leaf probability outside [0, 1]", i));
                }
            }
        }
        Ok(())
    }
}

impl Scorer for TreeEnsembleScorer {
    fn kind(&self) -> &'static str {
        "tree_ensemble"
    }

    fn score(&self, features: &[f64]) -> anyhow::Result<f64> {
        let mut sum = 0.0;
        for tree in &self.trees {
            sum += tree.evaluate(features)?;
        }
        Ok(match self.aggregation {
            TreeAggregation::LogitSum => sigmoid(self.base_score + sum),
            TreeAggregation::MeanProbability => sum / self.trees.len() as f64,
        })
    }
}
