//! The computation network: node registry, compiled topology, cached plans,
//! executors and buffer allocation for one graph instance.
mod allocate;
pub mod buffer_pool;
mod diagnostics;
mod exec;
mod feed;
mod node;
pub mod observer;
mod plan;
mod registry;
mod topology;

pub use buffer_pool::{
    BufferId, BufferKey, BufferPool, BufferPoolError, BufferRole, BufferViolation, SizeClass,
};
pub use diagnostics::{TopologyEdge, TopologyExport, TopologyLoop, TopologyNode};
pub use feed::ParameterInit;
pub use node::{ComputationNode, LoopId, NodeEvalState, NodeGroup, NodeId};
pub use observer::{NetworkObserver, Pass};
pub use plan::{PlanCache, PlanStep};
pub use topology::{LoopUnit, StepDirection};

use crate::config::NetworkConfig;
use crate::mb_layout::{FrameRange, MBLayout, MBLayoutError};
use crate::ops::OpError;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
pub enum ErrorKind {
    /// Bad graph definition; fatal at registration or compile time.
    Configuration,
    /// Caller bug, such as skipping compile or misusing the buffer protocol.
    Logic,
    /// Bad data for one evaluation; the compiled plan and pool stay usable.
    Runtime,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkError {
    #[error("Duplicate node name {0}")]
    DuplicateNodeName(String),
    #[error("No node named {0}")]
    UnknownNodeName(String),
    #[error("No node with id {0}")]
    UnknownNode(NodeId),
    #[error("Node {node} references missing input {input}")]
    DanglingInput { node: String, input: NodeId },
    #[error("Invalid node group tag {0:?}")]
    InvalidGroupTag(String),
    #[error("Cycle through {0:?} contains no delay node")]
    UngroundedCycle(Vec<String>),
    #[error("Loop anchored at {0} mixes past and future delays")]
    ConflictingStepDirection(String),
    #[error("Invalid operation at node {node}: {source}")]
    InvalidOperation {
        node: String,
        #[source]
        source: OpError,
    },
    #[error("Could not infer the layout of node {0}")]
    UnresolvedLayout(String),
    #[error("Loop member {0} must be minibatch-shaped")]
    LoopMemberNotMinibatch(String),

    #[error("Network has not been compiled")]
    NotCompiled,
    #[error("Buffers have not been allocated")]
    BuffersNotAllocated,
    #[error("No execution order has been formed for {0}")]
    OrderNotFormed(String),
    #[error(transparent)]
    BufferPool(#[from] BufferPoolError),
    #[error("Node {0} was placed in more than one loop")]
    LoopPartition(String),
    #[error("No loop unit {0}")]
    UnknownLoop(LoopId),
    #[error("Node {0} is not a {1} node")]
    WrongNodeKind(String, &'static str),
    #[error("Node {node} reads {input}, whose buffer now holds another value")]
    OverwrittenInput { node: String, input: String },

    #[error("Evaluating node {node} over {frame}: {source}")]
    Eval {
        node: String,
        frame: FrameRange,
        #[source]
        source: OpError,
    },
    #[error(transparent)]
    MBLayout(#[from] MBLayoutError),
    #[error("Input node {0} has no value")]
    EmptyInput(String),
    #[error("Value for node {node} has shape {got:?}, expected {expected:?}")]
    ShapeMismatch {
        node: String,
        expected: (usize, usize),
        got: (usize, usize),
    },
    #[error("Forward pass has not been run for {0}")]
    ForwardNotDone(String),
    #[error("NaN in non-gap column {column} of node {node}")]
    NanInOutput { node: String, column: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl NetworkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            NetworkError::DuplicateNodeName(_)
            | NetworkError::UnknownNodeName(_)
            | NetworkError::UnknownNode(_)
            | NetworkError::DanglingInput { .. }
            | NetworkError::InvalidGroupTag(_)
            | NetworkError::UngroundedCycle(_)
            | NetworkError::ConflictingStepDirection(_)
            | NetworkError::InvalidOperation { .. }
            | NetworkError::UnresolvedLayout(_)
            | NetworkError::LoopMemberNotMinibatch(_) => ErrorKind::Configuration,
            NetworkError::NotCompiled
            | NetworkError::BuffersNotAllocated
            | NetworkError::OrderNotFormed(_)
            | NetworkError::BufferPool(_)
            | NetworkError::LoopPartition(_)
            | NetworkError::UnknownLoop(_)
            | NetworkError::WrongNodeKind(..)
            | NetworkError::OverwrittenInput { .. } => ErrorKind::Logic,
            NetworkError::Eval { .. }
            | NetworkError::MBLayout(_)
            | NetworkError::EmptyInput(_)
            | NetworkError::ShapeMismatch { .. }
            | NetworkError::ForwardNotDone(_)
            | NetworkError::NanInOutput { .. }
            | NetworkError::Io(_)
            | NetworkError::Json(_) => ErrorKind::Runtime,
        }
    }
}

/// One graph instance. Owns every node; everything else refers to nodes by [`NodeId`].
///
/// Independent clones of a compiled network may be evaluated on separate
/// threads; each clone carries its own buffer pools and caches.
#[derive(Debug, Clone)]
pub struct ComputationNetwork {
    config: NetworkConfig,
    nodes: Vec<Option<ComputationNode>>,
    name_index: HashMap<String, NodeId>,
    registration_order: Vec<NodeId>,

    roots: Vec<NodeId>,
    loops: Vec<LoopUnit>,
    plan_cache: PlanCache,
    compiled: bool,

    mb_layout: MBLayout,
    pool: BufferPool,
    /// One pool of single-step buffers per loop unit, indexed by loop id.
    step_pools: Vec<BufferPool>,
    /// Loop members with no full-width value; they only exist one step at a time.
    step_values: HashSet<NodeId>,
    buffers_allocated: bool,

    time_stamp_counter: u64,
}

impl Default for ComputationNetwork {
    fn default() -> Self {
        Self::new(NetworkConfig::default())
    }
}

impl ComputationNetwork {
    pub fn new(config: NetworkConfig) -> Self {
        let pool = if config.audit_buffers {
            BufferPool::with_audit()
        } else {
            BufferPool::new()
        };
        Self {
            config,
            nodes: Vec::new(),
            name_index: HashMap::new(),
            registration_order: Vec::new(),
            roots: Vec::new(),
            loops: Vec::new(),
            plan_cache: PlanCache::default(),
            compiled: false,
            mb_layout: MBLayout::new(1, 1),
            pool,
            step_pools: Vec::new(),
            step_values: HashSet::new(),
            buffers_allocated: false,
            time_stamp_counter: 0,
        }
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    pub fn are_buffers_allocated(&self) -> bool {
        self.buffers_allocated
    }

    pub fn num_nodes(&self) -> usize {
        self.registration_order.len()
    }

    pub fn node(&self, id: NodeId) -> Result<&ComputationNode, NetworkError> {
        self.nodes
            .get(id.0)
            .and_then(|x| x.as_ref())
            .ok_or(NetworkError::UnknownNode(id))
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut ComputationNode, NetworkError> {
        self.nodes
            .get_mut(id.0)
            .and_then(|x| x.as_mut())
            .ok_or(NetworkError::UnknownNode(id))
    }

    pub fn node_id(&self, name: &str) -> Result<NodeId, NetworkError> {
        self.name_index
            .get(name)
            .copied()
            .ok_or_else(|| NetworkError::UnknownNodeName(name.to_string()))
    }

    pub(crate) fn node_name(&self, id: NodeId) -> String {
        match self.node(id) {
            Ok(node) => node.name.clone(),
            Err(_) => id.to_string(),
        }
    }

    /// Registered nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ComputationNode)> {
        self.registration_order
            .iter()
            .filter_map(|id| self.nodes[id.0].as_ref().map(|x| (*id, x)))
    }

    /// Designated roots, valid after compile.
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    pub fn loops(&self) -> &[LoopUnit] {
        &self.loops
    }

    pub fn loop_unit(&self, id: LoopId) -> Option<&LoopUnit> {
        self.loops.get(id.0)
    }

    pub fn mb_layout(&self) -> &MBLayout {
        &self.mb_layout
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn step_pool(&self, id: LoopId) -> Option<&BufferPool> {
        self.step_pools.get(id.0)
    }

    /// Whether a loop member only ever holds one time step of its value.
    pub fn is_step_only(&self, id: NodeId) -> bool {
        self.step_values.contains(&id)
    }

    /// Current value of a node: the leaf storage for inputs and parameters,
    /// the assigned pool buffer for computed nodes.
    pub fn value(&self, id: NodeId) -> Result<&ndarray::Array2<f32>, NetworkError> {
        let node = self.node(id)?;
        if let Some(value) = &node.leaf_value {
            return Ok(value);
        }
        if node.is_leaf() {
            return Err(NetworkError::EmptyInput(node.name.clone()));
        }
        let id = self.pool.assignment(&BufferKey::value(id))?;
        Ok(self.pool.buffer(id))
    }

    /// Gradient of a node from the last backward pass.
    pub fn gradient(&self, id: NodeId) -> Result<&ndarray::Array2<f32>, NetworkError> {
        self.node(id)?;
        let id = self.pool.assignment(&BufferKey::gradient(id))?;
        Ok(self.pool.buffer(id))
    }

    /// Drops everything derived from the node/edge set.
    pub(crate) fn invalidate_structure(&mut self) {
        self.compiled = false;
        self.roots.clear();
        self.loops.clear();
        self.plan_cache.clear();
        self.invalidate_buffers();
        for node in self.nodes.iter_mut().flatten() {
            node.loop_id = None;
            node.layout = None;
            node.eval_time_stamp = 0;
            node.state = NodeEvalState::Unvisited;
        }
    }

    pub(crate) fn invalidate_buffers(&mut self) {
        self.buffers_allocated = false;
        self.pool.reset();
        self.step_pools.clear();
        self.step_values.clear();
    }

    pub(crate) fn next_time_stamp(&mut self) -> u64 {
        self.time_stamp_counter += 1;
        self.time_stamp_counter
    }

    pub(crate) fn require_compiled(&self) -> Result<(), NetworkError> {
        if self.compiled {
            Ok(())
        } else {
            log::error!("Network used before compile()");
            Err(NetworkError::NotCompiled)
        }
    }

    pub(crate) fn require_allocated(&self) -> Result<(), NetworkError> {
        self.require_compiled()?;
        if self.buffers_allocated {
            Ok(())
        } else {
            log::error!("Network evaluated before allocate_buffers()");
            Err(NetworkError::BuffersNotAllocated)
        }
    }
}
