use crate::graph::{DirectedGraph, has_self_edge, post_order_traversal, strongly_connected_components};
use crate::network::{
    ComputationNetwork, LoopId, NetworkError, NodeEvalState, NodeId, PlanStep,
};
use crate::ops::{OpError, Operation, SampleLayout};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, strum_macros::Display)]
pub enum StepDirection {
    /// First to last time step; each step consumes the previous step's state.
    Forward,
    Backward,
}

impl StepDirection {
    pub fn from_offset(offset: i32) -> Self {
        if offset > 0 {
            StepDirection::Forward
        } else {
            StepDirection::Backward
        }
    }

    pub fn reversed(&self) -> Self {
        match self {
            StepDirection::Forward => StepDirection::Backward,
            StepDirection::Backward => StepDirection::Forward,
        }
    }

    pub fn time_steps(&self, num_steps: usize) -> Vec<usize> {
        match self {
            StepDirection::Forward => (0..num_steps).collect(),
            StepDirection::Backward => (0..num_steps).rev().collect(),
        }
    }
}

/// Nodes of one recurrent strongly-connected component, executed step by step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopUnit {
    id: LoopId,
    /// Dependency order within one time step (delay edges cut).
    members: Vec<NodeId>,
    direction: StepDirection,
    anchor: NodeId,
}

impl LoopUnit {
    pub fn id(&self) -> LoopId {
        self.id
    }

    pub fn members(&self) -> &[NodeId] {
        &self.members
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.members.contains(&node)
    }

    pub fn direction(&self) -> StepDirection {
        self.direction
    }

    /// The delay node whose offset fixed the step direction.
    pub fn anchor(&self) -> NodeId {
        self.anchor
    }
}

/// Plain node graph: predecessors are a node's inputs.
pub(crate) struct ExecutionGraph<'a> {
    network: &'a ComputationNetwork,
    roots: Vec<NodeId>,
}

impl<'a> ExecutionGraph<'a> {
    pub(crate) fn new(network: &'a ComputationNetwork, roots: Vec<NodeId>) -> Self {
        Self { network, roots }
    }
}

impl DirectedGraph for ExecutionGraph<'_> {
    type NodeId = NodeId;

    fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        match self.network.node(*node) {
            Ok(node) => node.inputs.clone(),
            Err(_) => Vec::new(),
        }
    }

    fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}

/// One loop's members with delay edges cut, so the rest must be acyclic.
struct LoopBodyGraph<'a> {
    network: &'a ComputationNetwork,
    members: HashSet<NodeId>,
    roots: Vec<NodeId>,
}

impl DirectedGraph for LoopBodyGraph<'_> {
    type NodeId = NodeId;

    fn predecessors(&self, node: &NodeId) -> Vec<NodeId> {
        match self.network.node(*node) {
            Ok(node) if node.op.delay_offset().is_none() => node
                .inputs
                .iter()
                .filter(|x| self.members.contains(x))
                .copied()
                .collect(),
            _ => Vec::new(),
        }
    }

    fn roots(&self) -> &[NodeId] {
        &self.roots
    }
}

/// Node graph with every loop collapsed into a single vertex.
pub(crate) struct CondensedGraph<'a> {
    network: &'a ComputationNetwork,
    roots: Vec<PlanStep>,
}

impl<'a> CondensedGraph<'a> {
    pub(crate) fn new(network: &'a ComputationNetwork, roots: &[NodeId]) -> Self {
        let mut steps = Vec::new();
        for root in roots {
            let step = network.step_of(*root);
            if !steps.contains(&step) {
                steps.push(step);
            }
        }
        Self {
            network,
            roots: steps,
        }
    }
}

impl DirectedGraph for CondensedGraph<'_> {
    type NodeId = PlanStep;

    fn predecessors(&self, step: &PlanStep) -> Vec<PlanStep> {
        let mut result = Vec::new();
        let mut push_inputs = |node: NodeId| {
            if let Ok(node) = self.network.node(node) {
                for input in &node.inputs {
                    let input_step = self.network.step_of(*input);
                    if input_step != *step && !result.contains(&input_step) {
                        result.push(input_step);
                    }
                }
            }
        };
        match step {
            PlanStep::Node(id) => push_inputs(*id),
            PlanStep::Loop(id) => {
                if let Some(unit) = self.network.loops.get(id.0) {
                    for member in &unit.members {
                        push_inputs(*member);
                    }
                }
            }
        }
        result
    }

    fn roots(&self) -> &[PlanStep] {
        &self.roots
    }
}

impl ComputationNetwork {
    /// The plan entry a node executes under.
    pub(crate) fn step_of(&self, id: NodeId) -> PlanStep {
        match self.node(id).ok().and_then(|x| x.loop_id) {
            Some(loop_id) => PlanStep::Loop(loop_id),
            None => PlanStep::Node(id),
        }
    }

    /// Validates the graph, builds loop units and the whole-graph order.
    ///
    /// Calling it again on an unmodified graph is a no-op. Any structural edit
    /// clears the compiled state, so it must be called again after one.
    pub fn compile(&mut self) -> Result<(), NetworkError> {
        if self.compiled {
            debug!("compile: network unchanged since last compile");
            return Ok(());
        }
        self.invalidate_structure();

        self.validate_inputs()?;
        self.roots = self.determine_roots();
        let loops = self.detect_loops()?;
        self.assign_loop_membership(&loops)?;
        self.loops = loops;
        for root in &self.roots {
            let node = self.node(*root)?;
            if let Some(loop_id) = node.loop_id {
                debug!("Root {} is a member of loop {}", node.name, loop_id.0);
            }
        }
        self.infer_layouts()?;
        self.propagate_needs_gradient();

        let global_order = {
            let graph = CondensedGraph::new(self, &self.roots);
            post_order_traversal(&graph, graph.roots())
        };
        for step in &global_order {
            for member in self.step_members(*step) {
                if let Ok(node) = self.node_mut(member) {
                    node.state = NodeEvalState::Ordered;
                }
            }
        }
        self.plan_cache.set_global(global_order);
        self.compiled = true;
        self.ensure_order(None)?;

        info!(
            "Compiled network: {} nodes, {} roots, {} loops",
            self.num_nodes(),
            self.roots.len(),
            self.loops.len()
        );
        for unit in &self.loops {
            info!(
                "  loop {} anchored at {}: {} members, stepping {}",
                unit.id.0,
                self.node_name(unit.anchor),
                unit.members.len(),
                unit.direction
            );
        }
        Ok(())
    }

    /// Members of a plan step in execution order.
    pub(crate) fn step_members(&self, step: PlanStep) -> Vec<NodeId> {
        match step {
            PlanStep::Node(id) => vec![id],
            PlanStep::Loop(id) => self
                .loops
                .get(id.0)
                .map(|x| x.members.clone())
                .unwrap_or_default(),
        }
    }

    fn validate_inputs(&self) -> Result<(), NetworkError> {
        for (_, node) in self.nodes() {
            for input in &node.inputs {
                if self.node(*input).is_err() {
                    return Err(NetworkError::DanglingInput {
                        node: node.name.clone(),
                        input: *input,
                    });
                }
            }
        }
        Ok(())
    }

    /// Unconsumed nodes and loss/metric/output members, then the first registered
    /// node of anything still uncovered (a cycle with no consumer outside it).
    fn determine_roots(&self) -> Vec<NodeId> {
        let mut consumed = HashSet::new();
        for (_, node) in self.nodes() {
            consumed.extend(node.inputs.iter().copied());
        }
        let mut roots: Vec<NodeId> = self
            .nodes()
            .filter(|(id, node)| {
                !consumed.contains(id) || node.tags.iter().any(|x| x.is_root_group())
            })
            .map(|(id, _)| id)
            .collect();

        let graph = ExecutionGraph::new(self, roots.clone());
        let mut covered: HashSet<NodeId> = post_order_traversal(&graph, &roots).into_iter().collect();
        if covered.len() == self.num_nodes() {
            return roots;
        }
        let cyclic: HashSet<NodeId> = strongly_connected_components(&graph, &self.registration_order)
            .into_iter()
            .filter(|x| x.len() > 1 || has_self_edge(&graph, &x[0]))
            .flatten()
            .collect();
        for id in self.registration_order.iter().copied() {
            if !covered.contains(&id) && cyclic.contains(&id) {
                debug!("Node {} is only reachable through a cycle; adding it as a root", self.node_name(id));
                covered.extend(post_order_traversal(&graph, &[id]));
                roots.push(id);
            }
        }
        roots
    }

    fn detect_loops(&self) -> Result<Vec<LoopUnit>, NetworkError> {
        let graph = ExecutionGraph::new(self, self.roots.clone());
        let flat_order = post_order_traversal(&graph, &self.roots);
        let position: HashMap<NodeId, usize> =
            flat_order.iter().enumerate().map(|(i, x)| (*x, i)).collect();

        let mut cyclic: Vec<Vec<NodeId>> = strongly_connected_components(&graph, &self.roots)
            .into_iter()
            .filter(|x| x.len() > 1 || has_self_edge(&graph, &x[0]))
            .collect();
        cyclic.sort_by_key(|x| x.iter().map(|n| position[n]).min());

        let mut loops = Vec::with_capacity(cyclic.len());
        for (index, members) in cyclic.into_iter().enumerate() {
            loops.push(self.build_loop_unit(LoopId(index), members)?);
        }
        Ok(loops)
    }

    fn build_loop_unit(&self, id: LoopId, members: Vec<NodeId>) -> Result<LoopUnit, NetworkError> {
        let names = |nodes: &[NodeId]| nodes.iter().map(|x| self.node_name(*x)).collect::<Vec<_>>();

        let mut delays = Vec::new();
        for member in &members {
            let node = self.node(*member)?;
            if let Some(offset) = node.op.delay_offset() {
                delays.push((*member, offset));
            }
            if !node.op.supports_stepping() {
                return Err(NetworkError::InvalidOperation {
                    node: node.name.clone(),
                    source: OpError::NotSteppable(node.op_name()),
                });
            }
        }
        let Some((anchor, anchor_offset)) = delays.first().copied() else {
            return Err(NetworkError::UngroundedCycle(names(&members)));
        };
        let direction = StepDirection::from_offset(anchor_offset);
        if delays
            .iter()
            .any(|(_, offset)| StepDirection::from_offset(*offset) != direction)
        {
            return Err(NetworkError::ConflictingStepDirection(self.node_name(anchor)));
        }

        let body = LoopBodyGraph {
            network: self,
            members: members.iter().copied().collect(),
            roots: members.clone(),
        };
        for component in strongly_connected_components(&body, &body.roots) {
            if component.len() > 1 || has_self_edge(&body, &component[0]) {
                return Err(NetworkError::UngroundedCycle(names(&component)));
            }
        }
        let ordered = post_order_traversal(&body, &body.roots);

        Ok(LoopUnit {
            id,
            members: ordered,
            direction,
            anchor,
        })
    }

    /// Loop membership must partition the nodes it covers.
    fn assign_loop_membership(&mut self, loops: &[LoopUnit]) -> Result<(), NetworkError> {
        for unit in loops {
            for member in &unit.members {
                let node = self.node_mut(*member)?;
                if node.loop_id.is_some() {
                    let name = node.name.clone();
                    log::error!("Node {name} was assigned to two loops");
                    return Err(NetworkError::LoopPartition(name));
                }
                node.loop_id = Some(unit.id);
            }
        }
        Ok(())
    }

    /// Repeated passes until every layout is known, then one final pass that
    /// re-checks every node against its inputs.
    fn infer_layouts(&mut self) -> Result<(), NetworkError> {
        let order: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        let mut layouts: HashMap<NodeId, SampleLayout> = HashMap::new();
        for id in &order {
            if let Some(layout) = self.node(*id)?.op.declared_layout() {
                layouts.insert(*id, layout);
            }
        }

        let mut pass = 0;
        loop {
            pass += 1;
            let mut progress = false;
            for id in &order {
                if layouts.contains_key(id) {
                    continue;
                }
                let node = self.node(*id)?;
                let inputs: Option<Vec<SampleLayout>> =
                    node.inputs.iter().map(|x| layouts.get(x).copied()).collect();
                if let Some(inputs) = inputs {
                    let layout = node.op.infer_layout(&inputs).map_err(|source| {
                        NetworkError::InvalidOperation {
                            node: node.name.clone(),
                            source,
                        }
                    })?;
                    layouts.insert(*id, layout);
                    progress = true;
                }
            }
            if !progress {
                break;
            }
        }
        debug!("Layout inference settled after {pass} passes");

        if let Some(id) = order.iter().find(|x| !layouts.contains_key(x)) {
            return Err(NetworkError::UnresolvedLayout(self.node_name(*id)));
        }
        for id in &order {
            let node = self.node(*id)?;
            let layout = layouts[id];
            let inputs: Vec<SampleLayout> = node.inputs.iter().map(|x| layouts[x]).collect();
            let inferred = node.op.infer_layout(&inputs).map_err(|source| {
                NetworkError::InvalidOperation {
                    node: node.name.clone(),
                    source,
                }
            })?;
            if inferred != layout {
                return Err(NetworkError::InvalidOperation {
                    node: node.name.clone(),
                    source: OpError::IncompatibleLayouts(layout, inferred),
                });
            }
            if node.loop_id.is_some() && !layout.is_minibatch() {
                return Err(NetworkError::LoopMemberNotMinibatch(node.name.clone()));
            }
        }

        for (id, layout) in layouts {
            self.node_mut(id)?.layout = Some(layout);
        }
        Ok(())
    }

    /// A node needs a gradient if a trainable parameter (positive learning-rate
    /// multiplier) is among its transitive inputs.
    fn propagate_needs_gradient(&mut self) {
        let order: Vec<NodeId> = self.nodes().map(|(id, _)| id).collect();
        for node in self.nodes.iter_mut().flatten() {
            node.needs_gradient =
                node.is_learnable() && node.op.learning_rate_multiplier() > 0.0;
        }
        loop {
            let mut changed = false;
            for id in &order {
                let Ok(node) = self.node(*id) else { continue };
                if node.needs_gradient || node.is_leaf() {
                    continue;
                }
                let needs = node
                    .inputs
                    .iter()
                    .any(|x| self.node(*x).is_ok_and(|x| x.needs_gradient));
                if needs {
                    if let Ok(node) = self.node_mut(*id) {
                        node.needs_gradient = true;
                    }
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }
}
