//! Hierarchical weighted progress tree (§4.2).
//!
//! A tree of nodes: leaves carry `cur_step`/`total_steps`, internal nodes
//! carry normalized per-child weights. Any mutation propagates toward the
//! root, which emits progress in `[0, 1]` to a caller-supplied callback —
//! but only when progress advanced by at least `step` (default `0.01`) or
//! just reached `1.0`, so a UI isn't flooded with updates.

use std::cell::RefCell;
use std::rc::Rc;

/// Default minimum progress delta, in `[0, 1]`, before the root callback
/// fires again.
pub const DEFAULT_STEP: f64 = 0.01;

enum NodeKind {
    Leaf { cur_step: u64, total_steps: u64 },
    Branch { children: Vec<(Rc<RefCell<Node>>, f64)> },
}

struct Node {
    kind: NodeKind,
}

impl Node {
    fn progress(&self) -> f64 {
        match &self.kind {
            NodeKind::Leaf {
                cur_step,
                total_steps,
            } => {
                if *total_steps == 0 {
                    0.0
                } else {
                    (*cur_step as f64 / *total_steps as f64).min(1.0)
                }
            }
            NodeKind::Branch { children } => children
                .iter()
                .map(|(child, weight)| child.borrow().progress() * weight)
                .sum(),
        }
    }
}

type Callback = Box<dyn FnMut(f64)>;

/// A single node in the progress tree. Clone is cheap (shared `Rc`); every
/// clone refers to the same underlying node.
#[derive(Clone)]
pub struct ProgressNode {
    node: Rc<RefCell<Node>>,
    root: Rc<RefCell<RootState>>,
}

struct RootState {
    callback: Option<Callback>,
    last_reported: f64,
    step: f64,
    root_node: Rc<RefCell<Node>>,
}

impl ProgressNode {
    /// Create a new root progress node with no children yet (a leaf with
    /// zero total steps until [`ProgressNode::set_total`] or
    /// [`ProgressNode::add_children`] is called).
    pub fn new_root() -> Self {
        Self::new_root_with_step(DEFAULT_STEP)
    }

    pub fn new_root_with_step(step: f64) -> Self {
        let node = Rc::new(RefCell::new(Node {
            kind: NodeKind::Leaf {
                cur_step: 0,
                total_steps: 0,
            },
        }));
        let root = Rc::new(RefCell::new(RootState {
            callback: None,
            last_reported: 0.0,
            step,
            root_node: node.clone(),
        }));
        Self { node, root }
    }

    /// Register the callback invoked on the root whenever progress
    /// advances past the configured step, or reaches `1.0`.
    pub fn on_progress(&self, callback: impl FnMut(f64) + 'static) {
        self.root.borrow_mut().callback = Some(Box::new(callback));
    }

    /// Turn this node into a leaf with `total` steps.
    pub fn set_total(&self, total: u64) {
        self.node.borrow_mut().kind = NodeKind::Leaf {
            cur_step: 0,
            total_steps: total,
        };
        self.notify();
    }

    /// Add weighted children, turning this node into a branch. Weights
    /// are absolute-valued and normalized; an all-zero weight set
    /// becomes uniform.
    pub fn add_children(&self, weights: &[f64]) -> Vec<ProgressNode> {
        let abs: Vec<f64> = weights.iter().map(|w| w.abs()).collect();
        let sum: f64 = abs.iter().sum();
        let normalized: Vec<f64> = if sum == 0.0 {
            let n = abs.len().max(1) as f64;
            abs.iter().map(|_| 1.0 / n).collect()
        } else {
            abs.iter().map(|w| w / sum).collect()
        };

        let mut children = Vec::with_capacity(weights.len());
        let mut out = Vec::with_capacity(weights.len());
        for w in normalized {
            let child_node = Rc::new(RefCell::new(Node {
                kind: NodeKind::Leaf {
                    cur_step: 0,
                    total_steps: 0,
                },
            }));
            children.push((child_node.clone(), w));
            out.push(ProgressNode {
                node: child_node,
                root: self.root.clone(),
            });
        }

        self.node.borrow_mut().kind = NodeKind::Branch { children };
        self.notify();
        out
    }

    /// Advance a leaf node by `n` steps. Errors (returns `false`) if this
    /// node is not a leaf.
    pub fn advance(&self, n: u64) -> bool {
        let ok = {
            let mut node = self.node.borrow_mut();
            match &mut node.kind {
                NodeKind::Leaf { cur_step, .. } => {
                    *cur_step += n;
                    true
                }
                NodeKind::Branch { .. } => false,
            }
        };
        if ok {
            self.notify();
        }
        ok
    }

    /// Current progress of this node, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        self.node.borrow().progress()
    }

    fn notify(&self) {
        let mut root = self.root.borrow_mut();
        let progress = root.root_node.borrow().progress();
        let should_fire = progress >= root.last_reported + root.step || (progress >= 1.0 && root.last_reported < 1.0);
        if should_fire {
            root.last_reported = progress;
            if let Some(cb) = root.callback.as_mut() {
                cb(progress);
            }
        }
    }
}

/// A no-op progress node for callers that don't care about progress
/// reporting. Every long operation in this crate accepts `Option<&ProgressNode>`.
pub fn no_op() -> ProgressNode {
    ProgressNode::new_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc as StdRc;

    #[test]
    fn advancing_a_branch_is_a_noop_error() {
        let root = ProgressNode::new_root();
        root.add_children(&[1.0, 1.0]);
        assert!(!root.advance(1));
    }

    #[test]
    fn leaf_progress_is_clamped() {
        let root = ProgressNode::new_root();
        root.set_total(4);
        root.advance(10);
        assert_eq!(root.progress(), 1.0);
    }

    #[test]
    fn weights_normalize_and_zero_sum_is_uniform() {
        let root = ProgressNode::new_root();
        let children = root.add_children(&[0.0, 0.0]);
        children[0].set_total(1);
        children[0].advance(1);
        // one of two equal-weight children fully done -> 0.5
        assert!((root.progress() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn callback_fires_on_step_threshold_and_on_completion() {
        let root = ProgressNode::new_root_with_step(0.5);
        let calls: StdRc<Cell<u32>> = StdRc::new(Cell::new(0));
        let calls_clone = calls.clone();
        root.on_progress(move |_p| calls_clone.set(calls_clone.get() + 1));

        root.set_total(10);
        for _ in 0..4 {
            root.advance(1); // 0.1, 0.2, 0.3, 0.4 -- all below step
        }
        assert_eq!(calls.get(), 0);

        root.advance(2); // 0.6 -- crosses 0.5
        assert_eq!(calls.get(), 1);

        root.advance(4); // reaches 1.0 exactly
        assert_eq!(calls.get(), 2);
    }
}
