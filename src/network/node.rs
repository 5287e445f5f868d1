use crate::ops::{AnyOperation, Operation, SampleLayout};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Hash, Ord, PartialOrd, Eq, PartialEq, Serialize, Deserialize)]
pub struct LoopId(pub(crate) usize);

impl LoopId {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for LoopId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "loop{}", self.0)
    }
}

/// Named node groups. Tags parse from either the short or the legacy spelling.
#[derive(
    Debug,
    Clone,
    Copy,
    Hash,
    Ord,
    PartialOrd,
    Eq,
    PartialEq,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
    strum_macros::EnumIter,
)]
#[strum(ascii_case_insensitive)]
pub enum NodeGroup {
    #[strum(to_string = "input", serialize = "feature")]
    Input,
    #[strum(to_string = "target", serialize = "label")]
    Target,
    #[strum(to_string = "loss", serialize = "criterion")]
    Loss,
    #[strum(to_string = "metric", serialize = "evaluation")]
    Metric,
    #[strum(to_string = "output")]
    Output,
}

impl NodeGroup {
    /// Groups whose members are always evaluation roots.
    pub fn is_root_group(&self) -> bool {
        matches!(self, NodeGroup::Loss | NodeGroup::Metric | NodeGroup::Output)
    }
}

/// Per-node evaluation progress within one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum NodeEvalState {
    Unvisited,
    Ordered,
    ForwardDone,
    BackwardDone,
}

#[derive(Debug, Clone)]
pub struct ComputationNode {
    pub(crate) name: String,
    pub(crate) op: AnyOperation,
    pub(crate) inputs: Vec<NodeId>,
    pub(crate) tags: BTreeSet<NodeGroup>,
    pub(crate) loop_id: Option<LoopId>,
    pub(crate) layout: Option<SampleLayout>,
    pub(crate) needs_gradient: bool,
    pub(crate) eval_time_stamp: u64,
    pub(crate) state: NodeEvalState,
    /// Storage for leaves (inputs and parameters); computed nodes use the buffer pool.
    pub(crate) leaf_value: Option<Array2<f32>>,
}

impl ComputationNode {
    pub fn new(name: impl Into<String>, op: impl Into<AnyOperation>) -> Self {
        Self {
            name: name.into(),
            op: op.into(),
            inputs: Vec::new(),
            tags: BTreeSet::new(),
            loop_id: None,
            layout: None,
            needs_gradient: false,
            eval_time_stamp: 0,
            state: NodeEvalState::Unvisited,
            leaf_value: None,
        }
    }

    pub fn with_inputs(mut self, inputs: impl IntoIterator<Item = NodeId>) -> Self {
        self.inputs = inputs.into_iter().collect();
        self
    }

    pub fn with_tag(mut self, group: NodeGroup) -> Self {
        self.tags.insert(group);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn op(&self) -> &AnyOperation {
        &self.op
    }

    pub fn op_mut(&mut self) -> &mut AnyOperation {
        &mut self.op
    }

    pub fn op_name(&self) -> &'static str {
        self.op.op_name()
    }

    pub fn inputs(&self) -> &[NodeId] {
        &self.inputs
    }

    pub fn tags(&self) -> &BTreeSet<NodeGroup> {
        &self.tags
    }

    pub fn has_tag(&self, group: NodeGroup) -> bool {
        self.tags.contains(&group)
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        self.loop_id
    }

    pub fn is_part_of_loop(&self) -> bool {
        self.loop_id.is_some()
    }

    /// Output layout, known after a successful compile.
    pub fn layout(&self) -> Option<SampleLayout> {
        self.layout
    }

    pub fn needs_gradient(&self) -> bool {
        self.needs_gradient
    }

    pub fn state(&self) -> NodeEvalState {
        self.state
    }

    pub fn eval_time_stamp(&self) -> u64 {
        self.eval_time_stamp
    }

    pub fn is_leaf(&self) -> bool {
        self.inputs.is_empty()
    }

    pub fn is_input(&self) -> bool {
        self.op.is_input()
    }

    pub fn is_learnable(&self) -> bool {
        self.op.is_learnable()
    }

    pub fn leaf_value(&self) -> Option<&Array2<f32>> {
        self.leaf_value.as_ref()
    }
}
