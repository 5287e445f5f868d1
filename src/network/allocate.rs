use crate::network::{
    BufferKey, BufferPool, ComputationNetwork, NetworkError, NodeGroup, NodeId, PlanStep,
    SizeClass,
};
use crate::ops::Operation;
use log::{debug, info};
use std::collections::{HashMap, HashSet};

fn distinct_inputs(inputs: &[NodeId]) -> Vec<NodeId> {
    let mut result = Vec::with_capacity(inputs.len());
    for input in inputs {
        if !result.contains(input) {
            result.push(*input);
        }
    }
    result
}

impl ComputationNetwork {
    /// Plans buffer sharing for evaluating `eval_roots` and `output_roots`, plus a
    /// backward pass from `train_root` when given.
    ///
    /// The plan replays request/release over the merged global order: a node's
    /// value is requested before it computes and released after its last consumer,
    /// and a gradient is requested on its first contribution and released once it
    /// has been propagated. Values a backward step will read stay held until the
    /// owning node's backward step. Roots, outputs and delay inputs keep dedicated
    /// buffers, as do learnable-parameter gradients. Loop members nobody reads
    /// across steps or outside their loop get no value buffer at all and live in
    /// the loop's step pool.
    pub fn allocate_buffers(
        &mut self,
        eval_roots: &[NodeId],
        output_roots: &[NodeId],
        train_root: Option<NodeId>,
    ) -> Result<(), NetworkError> {
        self.require_compiled()?;
        self.invalidate_buffers();

        let mut all_roots: Vec<NodeId> = Vec::new();
        for root in eval_roots.iter().chain(output_roots).chain(train_root.iter()) {
            self.node(*root)?;
            if !all_roots.contains(root) {
                all_roots.push(*root);
            }
        }
        if all_roots.is_empty() {
            all_roots = self.roots.clone();
        }

        let forward_steps = self.merged_order(&all_roots)?;
        let dedicated = self.dedicated_value_nodes(&all_roots, output_roots);
        let held = match train_root {
            Some(root) => self.values_needed_by_backward(root)?,
            None => HashSet::new(),
        };

        self.step_values = self.step_only_members(&dedicated, &held)?;
        self.plan_forward_buffers(&forward_steps, &dedicated, &held)?;
        if let Some(root) = train_root {
            if self.node(root)?.needs_gradient {
                self.plan_backward_buffers(root, &dedicated, &held)?;
            }
        }

        let audited = self.config.audit_buffers;
        self.step_pools = self
            .loops
            .iter()
            .map(|_| {
                if audited {
                    BufferPool::with_audit()
                } else {
                    BufferPool::new()
                }
            })
            .collect();
        self.invalidate_computed_values();
        self.buffers_allocated = true;

        let summary = format!(
            "Allocated {} buffers for {} requests",
            self.pool.num_buffers(),
            self.pool.assignments().len()
        );
        if self.config.log_memory_sharing {
            info!("{summary}");
            info!("{}", self.describe_memory_sharing());
        } else {
            debug!("{summary}");
            debug!("{}", self.describe_memory_sharing());
        }
        Ok(())
    }

    fn dedicated_value_nodes(&self, roots: &[NodeId], output_roots: &[NodeId]) -> HashSet<NodeId> {
        let mut dedicated: HashSet<NodeId> = roots.iter().chain(output_roots).copied().collect();
        for (id, node) in self.nodes() {
            if !self.config.share_buffers || node.has_tag(NodeGroup::Output) {
                dedicated.insert(id);
            }
            if node.op.delay_offset().is_some() {
                dedicated.extend(node.inputs.iter().copied());
            }
        }
        dedicated
    }

    fn step_only_members(
        &self,
        dedicated: &HashSet<NodeId>,
        held: &HashSet<NodeId>,
    ) -> Result<HashSet<NodeId>, NetworkError> {
        let mut read_outside = HashSet::new();
        for (_, node) in self.nodes() {
            for input in &node.inputs {
                let input_loop = self.node(*input)?.loop_id;
                if input_loop.is_some() && input_loop != node.loop_id {
                    read_outside.insert(*input);
                }
            }
        }
        Ok(self
            .loops
            .iter()
            .flat_map(|x| x.members().iter().copied())
            .filter(|x| !dedicated.contains(x) && !held.contains(x) && !read_outside.contains(x))
            .collect())
    }

    fn values_needed_by_backward(&mut self, root: NodeId) -> Result<HashSet<NodeId>, NetworkError> {
        self.ensure_order(Some(root))?;
        let mut held = HashSet::new();
        for id in self.get_flat_order(Some(root))? {
            let node = self.node(id)?;
            if node.is_leaf() || !node.needs_gradient {
                continue;
            }
            if node.op.output_used_in_backprop() {
                held.insert(id);
            }
            for (index, input) in node.inputs.iter().enumerate() {
                if node.op.input_used_in_backprop(index) {
                    held.insert(*input);
                }
            }
        }
        Ok(held)
    }

    fn plan_forward_buffers(
        &mut self,
        steps: &[PlanStep],
        dedicated: &HashSet<NodeId>,
        held: &HashSet<NodeId>,
    ) -> Result<(), NetworkError> {
        let mut remaining: HashMap<NodeId, usize> = HashMap::new();
        for step in steps {
            for member in self.step_members(*step) {
                for input in distinct_inputs(&self.node(member)?.inputs) {
                    *remaining.entry(input).or_default() += 1;
                }
            }
        }

        for step in steps {
            let members = self.step_members(*step);
            // A loop holds its full-width member values for its whole run.
            for member in &members {
                let node = self.node(*member)?;
                if node.is_leaf() || self.step_values.contains(member) {
                    continue;
                }
                let class = SizeClass::of_layout(self.layout_of(*member)?);
                let shareable = !dedicated.contains(member);
                self.pool.request(BufferKey::value(*member), class, shareable)?;
            }
            for member in &members {
                for input in distinct_inputs(&self.node(*member)?.inputs) {
                    let Some(count) = remaining.get_mut(&input) else {
                        continue;
                    };
                    *count -= 1;
                    let key = BufferKey::value(input);
                    if *count == 0
                        && !dedicated.contains(&input)
                        && !held.contains(&input)
                        && self.pool.is_held(&key)
                    {
                        self.pool.release(key)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn plan_backward_buffers(
        &mut self,
        root: NodeId,
        dedicated: &HashSet<NodeId>,
        held: &HashSet<NodeId>,
    ) -> Result<(), NetworkError> {
        let steps = self.get_order(Some(root))?.to_vec();
        let mut touched = HashSet::new();
        self.request_gradient(root, &mut touched)?;

        for step in steps.iter().rev() {
            let members = self.step_members(*step);
            let mut active = Vec::new();
            for member in &members {
                let node = self.node(*member)?;
                if node.is_leaf() || !node.needs_gradient {
                    continue;
                }
                match step {
                    PlanStep::Loop(_) => {
                        self.request_gradient(*member, &mut touched)?;
                        active.push(*member);
                    }
                    PlanStep::Node(_) if touched.contains(member) => active.push(*member),
                    PlanStep::Node(_) => {}
                }
            }
            for member in &active {
                for input in distinct_inputs(&self.node(*member)?.inputs) {
                    if self.node(input)?.needs_gradient {
                        self.request_gradient(input, &mut touched)?;
                    }
                }
            }
            for member in &active {
                self.pool.release(BufferKey::gradient(*member))?;
            }
            for member in &members {
                let key = BufferKey::value(*member);
                if held.contains(member) && !dedicated.contains(member) && self.pool.is_held(&key) {
                    self.pool.release(key)?;
                }
            }
        }
        Ok(())
    }

    fn request_gradient(
        &mut self,
        id: NodeId,
        touched: &mut HashSet<NodeId>,
    ) -> Result<(), NetworkError> {
        if !touched.insert(id) {
            return Ok(());
        }
        let node = self.node(id)?;
        let shareable = self.config.share_buffers && !node.is_learnable();
        let class = SizeClass::of_layout(self.layout_of(id)?);
        self.pool.request(BufferKey::gradient(id), class, shareable)?;
        Ok(())
    }
}
