//! Validated, traversal-ready form of an [`EnsembleFile`].

use rayon::prelude::*;
use treeport_core::{Error, Postprocessor, Result};

use crate::format::{ComparisonOp, EnsembleFile, NodeFile};

/// Batches at least this large are scored on the rayon pool.
const PARALLEL_ROWS: usize = 256;

#[derive(Debug, Clone, Copy)]
enum Node {
    Leaf(f32),
    Split {
        feature: usize,
        threshold: f32,
        op: ComparisonOp,
        default_left: bool,
        left: u32,
        right: u32,
    },
}

#[derive(Debug, Clone)]
struct Tree {
    class_id: usize,
    nodes: Vec<Node>,
}

impl Tree {
    fn leaf_value(&self, features: &[f32]) -> f32 {
        let mut idx = 0usize;
        loop {
            match self.nodes[idx] {
                Node::Leaf(value) => return value,
                Node::Split {
                    feature,
                    threshold,
                    op,
                    default_left,
                    left,
                    right,
                } => {
                    let fvalue = features[feature];
                    let go_left = if fvalue.is_nan() {
                        default_left
                    } else {
                        op.goes_left(fvalue, threshold)
                    };
                    let next = if go_left { left } else { right };
                    idx = next as usize;
                }
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Ensemble {
    num_feature: usize,
    num_class: usize,
    base_score: f32,
    postprocessor: Postprocessor,
    sigmoid_alpha: f32,
    average_tree_output: bool,
    trees: Vec<Tree>,
    trees_per_class: Vec<usize>,
}

impl Ensemble {
    pub fn compile(file: EnsembleFile) -> Result<Self> {
        if file.num_feature == 0 {
            return Err(Error::load("ensemble declares zero features"));
        }
        if file.num_class == 0 {
            return Err(Error::load("ensemble declares zero classes"));
        }
        if file.postprocessor == Postprocessor::Softmax && file.num_class < 2 {
            return Err(Error::load("softmax postprocessor needs num_class > 1"));
        }

        let mut trees_per_class = vec![0usize; file.num_class];
        let mut trees = Vec::with_capacity(file.trees.len());
        for (tree_idx, tree) in file.trees.into_iter().enumerate() {
            if tree.class_id >= file.num_class {
                return Err(Error::load(format!(
                    "tree {tree_idx} has class_id {} but num_class is {}",
                    tree.class_id, file.num_class
                )));
            }
            trees_per_class[tree.class_id] += 1;
            let nodes = compile_nodes(tree_idx, &tree.nodes, file.num_feature)?;
            trees.push(Tree {
                class_id: tree.class_id,
                nodes,
            });
        }

        Ok(Self {
            num_feature: file.num_feature,
            num_class: file.num_class,
            base_score: file.base_score,
            postprocessor: file.postprocessor,
            sigmoid_alpha: file.sigmoid_alpha,
            average_tree_output: file.average_tree_output,
            trees,
            trees_per_class,
        })
    }

    pub fn num_feature(&self) -> usize {
        self.num_feature
    }

    pub fn num_class(&self) -> usize {
        self.num_class
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// Score row-major `features` into `out` (`rows * num_class` values).
    pub fn predict(&self, features: &[f32], out: &mut [f32], margin: bool) {
        debug_assert_eq!(
            features.len() / self.num_feature,
            out.len() / self.num_class
        );

        let rows = out.len() / self.num_class;
        if rows >= PARALLEL_ROWS {
            out.par_chunks_mut(self.num_class)
                .zip(features.par_chunks(self.num_feature))
                .for_each(|(row_out, row)| self.predict_row(row, row_out));
        } else {
            out.chunks_mut(self.num_class)
                .zip(features.chunks(self.num_feature))
                .for_each(|(row_out, row)| self.predict_row(row, row_out));
        }

        if !margin {
            self.postprocessor
                .transform_inplace(out, self.num_class, self.sigmoid_alpha);
        }
    }

    fn predict_row(&self, features: &[f32], out: &mut [f32]) {
        out.fill(0.0);
        for tree in &self.trees {
            out[tree.class_id] += tree.leaf_value(features);
        }
        for (class, score) in out.iter_mut().enumerate() {
            if self.average_tree_output && self.trees_per_class[class] > 0 {
                *score /= self.trees_per_class[class] as f32;
            }
            *score += self.base_score;
        }
    }
}

fn compile_nodes(tree_idx: usize, nodes: &[NodeFile], num_feature: usize) -> Result<Vec<Node>> {
    if nodes.is_empty() {
        return Err(Error::load(format!("tree {tree_idx} has no nodes")));
    }

    // Every node but the root may have at most one parent, which rules out
    // cycles reachable from the root.
    let mut has_parent = vec![false; nodes.len()];
    let mut out = Vec::with_capacity(nodes.len());

    for (node_idx, node) in nodes.iter().enumerate() {
        let node = match *node {
            NodeFile::Leaf { leaf_value } => Node::Leaf(leaf_value),
            NodeFile::Split {
                split_feature_id,
                threshold,
                comparison_op,
                default_left,
                left_child,
                right_child,
            } => {
                if split_feature_id >= num_feature {
                    return Err(Error::load(format!(
                        "tree {tree_idx} node {node_idx} splits on feature {split_feature_id} of {num_feature}"
                    )));
                }
                for child in [left_child, right_child] {
                    if child == 0 || child >= nodes.len() || has_parent[child] {
                        return Err(Error::load(format!(
                            "tree {tree_idx} node {node_idx} has invalid child {child}"
                        )));
                    }
                    has_parent[child] = true;
                }
                Node::Split {
                    feature: split_feature_id,
                    threshold,
                    op: comparison_op,
                    default_left,
                    left: left_child as u32,
                    right: right_child as u32,
                }
            }
        };
        out.push(node);
    }

    Ok(out)
}
