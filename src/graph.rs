//! Backbone traits for walking a dependency graph.
//!
//! Goals:
//! - One view shape (predecessors + roots) shared by every traversal in the crate.
//! - Iterative algorithms only, so deep networks never blow the call stack.
//! - Deterministic output: predecessors are always visited in the order the view yields them.
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

/// A directed graph seen from the consumer side: every node knows its inputs.
pub trait DirectedGraph {
    type NodeId: Copy + Eq + Hash + Debug;

    /// Direct inputs of `node`, in input index order.
    fn predecessors(&self, node: &Self::NodeId) -> Vec<Self::NodeId>;

    /// Designated entry points of the graph.
    fn roots(&self) -> &[Self::NodeId];
}

/// Dependency-first traversal over the transitive closure of `roots`.
///
/// Every reachable node is emitted exactly once, after all of its predecessors
/// (back edges of a cycle are skipped, since their target is already on the stack).
pub fn post_order_traversal<G: DirectedGraph>(graph: &G, roots: &[G::NodeId]) -> Vec<G::NodeId> {
    let mut result = Vec::new();
    let mut visited = HashSet::new();
    // (node, its predecessors, index of the next predecessor to visit)
    let mut stack: Vec<(G::NodeId, Vec<G::NodeId>, usize)> = Vec::new();

    for root in roots {
        if !visited.insert(*root) {
            continue;
        }
        stack.push((*root, graph.predecessors(root), 0));
        while let Some((node, preds, next)) = stack.last_mut() {
            if *next < preds.len() {
                let pred = preds[*next];
                *next += 1;
                if visited.insert(pred) {
                    let pred_preds = graph.predecessors(&pred);
                    stack.push((pred, pred_preds, 0));
                }
            } else {
                result.push(*node);
                stack.pop();
            }
        }
    }
    result
}

/// Strongly-connected components of the closure of `roots` (Tarjan, explicit stack).
///
/// Components are returned in completion order; members of a component are
/// listed in the order they were first discovered.
pub fn strongly_connected_components<G: DirectedGraph>(
    graph: &G,
    roots: &[G::NodeId],
) -> Vec<Vec<G::NodeId>> {
    struct Frame<N> {
        node: N,
        preds: Vec<N>,
        next: usize,
    }

    let mut index_of: HashMap<G::NodeId, usize> = HashMap::new();
    let mut low_link: HashMap<G::NodeId, usize> = HashMap::new();
    let mut on_stack: HashSet<G::NodeId> = HashSet::new();
    let mut component_stack: Vec<G::NodeId> = Vec::new();
    let mut components = Vec::new();
    let mut next_index = 0;

    for root in roots {
        if index_of.contains_key(root) {
            continue;
        }
        let mut call_stack: Vec<Frame<G::NodeId>> = Vec::new();
        index_of.insert(*root, next_index);
        low_link.insert(*root, next_index);
        next_index += 1;
        component_stack.push(*root);
        on_stack.insert(*root);
        call_stack.push(Frame {
            node: *root,
            preds: graph.predecessors(root),
            next: 0,
        });

        while let Some(frame) = call_stack.last_mut() {
            if frame.next < frame.preds.len() {
                let pred = frame.preds[frame.next];
                frame.next += 1;
                if let Some(pred_index) = index_of.get(&pred) {
                    if on_stack.contains(&pred) {
                        let node = frame.node;
                        let low = low_link[&node].min(*pred_index);
                        low_link.insert(node, low);
                    }
                } else {
                    index_of.insert(pred, next_index);
                    low_link.insert(pred, next_index);
                    next_index += 1;
                    component_stack.push(pred);
                    on_stack.insert(pred);
                    let preds = graph.predecessors(&pred);
                    call_stack.push(Frame {
                        node: pred,
                        preds,
                        next: 0,
                    });
                }
            } else {
                let node = frame.node;
                call_stack.pop();
                if let Some(parent) = call_stack.last() {
                    let low = low_link[&parent.node].min(low_link[&node]);
                    low_link.insert(parent.node, low);
                }
                if low_link[&node] == index_of[&node] {
                    let mut component = Vec::new();
                    while let Some(member) = component_stack.pop() {
                        on_stack.remove(&member);
                        component.push(member);
                        if member == node {
                            break;
                        }
                    }
                    component.reverse();
                    components.push(component);
                }
            }
        }
    }
    components
}

/// True if `node` lists itself among its own predecessors.
pub fn has_self_edge<G: DirectedGraph>(graph: &G, node: &G::NodeId) -> bool {
    graph.predecessors(node).contains(node)
}
