//! On-disk JSON layout of a compiled ensemble.

use serde::{Deserialize, Serialize};
use treeport_core::{DataTransform, Postprocessor};

fn default_num_class() -> usize {
    1
}

fn default_sigmoid_alpha() -> f32 {
    1.0
}

fn default_input_name() -> String {
    "data".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnsembleFile {
    pub num_feature: usize,
    #[serde(default = "default_num_class")]
    pub num_class: usize,
    #[serde(default)]
    pub base_score: f32,
    #[serde(default)]
    pub postprocessor: Postprocessor,
    #[serde(default = "default_sigmoid_alpha")]
    pub sigmoid_alpha: f32,
    /// Divide each class score by the number of trees feeding it.
    #[serde(default)]
    pub average_tree_output: bool,
    #[serde(default = "default_input_name")]
    pub input_name: String,
    pub trees: Vec<TreeFile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_transform: Option<DataTransform>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeFile {
    #[serde(default)]
    pub class_id: usize,
    pub nodes: Vec<NodeFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NodeFile {
    Leaf {
        leaf_value: f32,
    },
    Split {
        split_feature_id: usize,
        threshold: f32,
        #[serde(default)]
        comparison_op: ComparisonOp,
        #[serde(default)]
        default_left: bool,
        left_child: usize,
        right_child: usize,
    },
}

/// Test applied as `feature <op> threshold`; true goes left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ComparisonOp {
    #[default]
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "==")]
    Eq,
}

impl ComparisonOp {
    #[inline]
    pub fn goes_left(self, value: f32, threshold: f32) -> bool {
        match self {
            ComparisonOp::Lt => value < threshold,
            ComparisonOp::Le => value <= threshold,
            ComparisonOp::Gt => value > threshold,
            ComparisonOp::Ge => value >= threshold,
            ComparisonOp::Eq => value == threshold,
        }
    }
}
