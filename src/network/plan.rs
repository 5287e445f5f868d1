use crate::graph::post_order_traversal;
use crate::network::topology::ExecutionGraph;
use crate::network::{ComputationNetwork, LoopId, NetworkError, NodeId};
use log::{error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One entry of an execution order: a plain node, or a whole loop unit in place of its members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum PlanStep {
    Node(NodeId),
    Loop(LoopId),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct PlanEntry {
    order: Vec<PlanStep>,
    input_nodes: Vec<NodeId>,
    parameter_nodes: Vec<NodeId>,
}

/// Execution orders memoized per root; `None` is the whole graph.
///
/// Every per-root order is filtered out of the global order rather than sorted
/// on its own, so any set of roots executes in one consistent order.
#[derive(Debug, Clone, Default)]
pub struct PlanCache {
    global: Vec<PlanStep>,
    entries: HashMap<Option<NodeId>, PlanEntry>,
}

impl PlanCache {
    pub(crate) fn set_global(&mut self, order: Vec<PlanStep>) {
        self.global = order;
        self.entries.clear();
    }

    pub(crate) fn clear(&mut self) {
        self.global.clear();
        self.entries.clear();
    }

    pub fn global(&self) -> &[PlanStep] {
        &self.global
    }

    pub fn contains(&self, root: Option<NodeId>) -> bool {
        self.entries.contains_key(&root)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn root_label(root: Option<NodeId>, network: &ComputationNetwork) -> String {
    match root {
        Some(id) => network.node_name(id),
        None => "the whole graph".to_string(),
    }
}

impl ComputationNetwork {
    /// Computes and memoizes the order for `root`. Forming an order twice is
    /// harmless but suspicious, so it is logged and recomputed.
    pub fn form_order(&mut self, root: Option<NodeId>) -> Result<(), NetworkError> {
        self.require_compiled()?;
        if self.plan_cache.contains(root) {
            warn!(
                "form_order: order for {} already formed; recomputing",
                root_label(root, self)
            );
        }
        let entry = self.build_plan_entry(root)?;
        self.plan_cache.entries.insert(root, entry);
        Ok(())
    }

    /// Forms the order for `root` unless it is already cached.
    pub(crate) fn ensure_order(&mut self, root: Option<NodeId>) -> Result<(), NetworkError> {
        if self.plan_cache.contains(root) {
            return Ok(());
        }
        self.form_order(root)
    }

    fn build_plan_entry(&self, root: Option<NodeId>) -> Result<PlanEntry, NetworkError> {
        let order: Vec<PlanStep> = match root {
            None => self.plan_cache.global.clone(),
            Some(id) => {
                self.node(id)?;
                let closure = self.closure_of(&[id]);
                self.filter_global(&closure)
            }
        };
        let mut input_nodes = Vec::new();
        let mut parameter_nodes = Vec::new();
        for step in &order {
            for member in self.step_members(*step) {
                let node = self.node(member)?;
                if node.is_input() {
                    input_nodes.push(member);
                } else if node.is_learnable() {
                    parameter_nodes.push(member);
                }
            }
        }
        Ok(PlanEntry {
            order,
            input_nodes,
            parameter_nodes,
        })
    }

    pub(crate) fn closure_of(&self, roots: &[NodeId]) -> HashSet<NodeId> {
        let graph = ExecutionGraph::new(self, roots.to_vec());
        post_order_traversal(&graph, roots).into_iter().collect()
    }

    /// Global steps that contain at least one node of `nodes`.
    fn filter_global(&self, nodes: &HashSet<NodeId>) -> Vec<PlanStep> {
        self.plan_cache
            .global
            .iter()
            .filter(|step| match step {
                PlanStep::Node(id) => nodes.contains(id),
                PlanStep::Loop(id) => self
                    .loops
                    .get(id.0)
                    .is_some_and(|x| x.members().iter().any(|m| nodes.contains(m))),
            })
            .copied()
            .collect()
    }

    fn entry(&self, root: Option<NodeId>) -> Result<&PlanEntry, NetworkError> {
        self.plan_cache.entries.get(&root).ok_or_else(|| {
            let label = root_label(root, self);
            error!("get_order: no order formed for {label}");
            NetworkError::OrderNotFormed(label)
        })
    }

    /// Cached order for `root`; fails if `form_order(root)` was never called.
    pub fn get_order(&self, root: Option<NodeId>) -> Result<&[PlanStep], NetworkError> {
        self.require_compiled()?;
        Ok(&self.entry(root)?.order)
    }

    /// Cached order for `root` with every loop expanded into its members.
    pub fn get_flat_order(&self, root: Option<NodeId>) -> Result<Vec<NodeId>, NetworkError> {
        Ok(self
            .get_order(root)?
            .iter()
            .flat_map(|x| self.step_members(*x))
            .collect())
    }

    /// Dependency-first order covering the closure of `roots`, or the whole graph
    /// when `roots` is empty. Always a subsequence of the whole-graph order.
    pub fn compute_order(&self, roots: &[NodeId]) -> Result<Vec<PlanStep>, NetworkError> {
        self.require_compiled()?;
        if roots.is_empty() {
            return Ok(self.plan_cache.global.clone());
        }
        for root in roots {
            self.node(*root)?;
        }
        Ok(self.filter_global(&self.closure_of(roots)))
    }

    /// Union of the cached orders of `roots`, in global order.
    pub(crate) fn merged_order(&mut self, roots: &[NodeId]) -> Result<Vec<PlanStep>, NetworkError> {
        let mut steps = HashSet::new();
        for root in roots {
            self.ensure_order(Some(*root))?;
            steps.extend(self.entry(Some(*root))?.order.iter().copied());
        }
        Ok(self
            .plan_cache
            .global
            .iter()
            .filter(|x| steps.contains(x))
            .copied()
            .collect())
    }

    /// `subset` rearranged into whole-graph order. Unknown or unordered nodes are dropped.
    pub fn sort_by_global_order(&self, subset: &[NodeId]) -> Result<Vec<NodeId>, NetworkError> {
        let flat = self.get_flat_order(None)?;
        let wanted: HashSet<NodeId> = subset.iter().copied().collect();
        Ok(flat.into_iter().filter(|x| wanted.contains(x)).collect())
    }

    /// Externally fed nodes reachable from `root`.
    pub fn input_nodes(&self, root: Option<NodeId>) -> Result<&[NodeId], NetworkError> {
        self.require_compiled()?;
        Ok(&self.entry(root)?.input_nodes)
    }

    /// Learnable parameters reachable from `root`.
    pub fn learnable_parameter_nodes(&self, root: Option<NodeId>) -> Result<&[NodeId], NetworkError> {
        self.require_compiled()?;
        Ok(&self.entry(root)?.parameter_nodes)
    }

    /// Input nodes needed to evaluate the named outputs, in global order.
    pub fn input_nodes_for_outputs(&mut self, names: &[&str]) -> Result<Vec<NodeId>, NetworkError> {
        let mut inputs = Vec::new();
        for name in names {
            let id = self.node_id(name)?;
            self.ensure_order(Some(id))?;
            inputs.extend_from_slice(self.input_nodes(Some(id))?);
        }
        self.sort_by_global_order(&inputs)
    }

    pub fn plan_cache(&self) -> &PlanCache {
        &self.plan_cache
    }
}
