use crate::mb_layout::FrameRange;
use crate::network::{
    BufferId, BufferKey, BufferPool, BufferPoolError, ComputationNetwork, LoopId, LoopUnit,
    NetworkError, NetworkObserver, NodeEvalState, NodeId, Pass, PlanStep, SizeClass,
};
use crate::ops::{BackwardContext, ForwardContext, Operation, SampleLayout};
use log::{debug, error};
use ndarray::{Array2, ArrayView2};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

/// Input values of one node, their layouts, and which of them are one-step views.
type InputViews<'a> = (Vec<ArrayView2<'a, f32>>, Vec<SampleLayout>, Vec<bool>);

impl ComputationNetwork {
    /// Resets per-batch state for everything the roots reach (all roots when empty):
    /// computed values become stale and every operation gets its epoch-start hook.
    pub fn start_new_evaluation(&mut self, roots: &[NodeId]) -> Result<(), NetworkError> {
        self.require_compiled()?;
        let steps = if roots.is_empty() {
            self.get_order(None)?.to_vec()
        } else {
            self.merged_order(roots)?
        };
        for step in steps {
            for member in self.step_members(step) {
                let node = self.node_mut(member)?;
                if !node.is_leaf() {
                    node.eval_time_stamp = 0;
                }
                node.state = NodeEvalState::Ordered;
                node.op.on_epoch_start();
            }
        }
        Ok(())
    }

    /// Evaluates every node the roots depend on (all designated roots when empty),
    /// in one merged global order. Nodes whose value is still current are skipped.
    pub fn forward(&mut self, roots: &[NodeId]) -> Result<(), NetworkError> {
        self.forward_with_observer(roots, &mut ())
    }

    pub fn forward_with_observer<T: NetworkObserver>(
        &mut self,
        roots: &[NodeId],
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        self.require_allocated()?;
        let roots = if roots.is_empty() {
            self.roots.clone()
        } else {
            roots.to_vec()
        };
        let steps = self.merged_order(&roots)?;
        self.run_forward_steps(&steps, observer)
    }

    /// Recomputes the nodes of `to`'s closure that depend on a node in `from`,
    /// together with any producer they read whose buffer no longer holds its value.
    pub fn forward_from_to(&mut self, from: &[NodeId], to: &[NodeId]) -> Result<(), NetworkError> {
        self.require_allocated()?;
        let order = self.merged_order(to)?;
        let from: HashSet<NodeId> = from.iter().copied().collect();
        let mut marked: HashSet<NodeId> = HashSet::new();
        let mut included = vec![false; order.len()];
        for (index, step) in order.iter().enumerate() {
            let members = self.step_members(*step);
            let mut depends = false;
            for member in &members {
                let node = self.node(*member)?;
                depends |= node
                    .inputs
                    .iter()
                    .any(|x| from.contains(x) || marked.contains(x));
            }
            if depends {
                marked.extend(members);
                included[index] = true;
            }
        }
        self.include_stale_producers(&order, &mut included)?;

        let steps: Vec<PlanStep> = order
            .iter()
            .zip(&included)
            .filter(|(_, x)| **x)
            .map(|(step, _)| *step)
            .collect();
        for step in &steps {
            for member in self.step_members(*step) {
                let node = self.node_mut(member)?;
                if !node.is_leaf() {
                    node.eval_time_stamp = 0;
                }
            }
        }
        self.run_forward_steps(&steps, &mut ())
    }

    /// Marks every producer an included step would read after its value stopped
    /// being current: never computed, or its shared buffer since handed to another
    /// node. Buffer ownership is replayed over the included steps until nothing
    /// changes, since every producer added rewrites its own buffer.
    fn include_stale_producers(
        &self,
        order: &[PlanStep],
        included: &mut [bool],
    ) -> Result<(), NetworkError> {
        let position: HashMap<PlanStep, usize> =
            order.iter().enumerate().map(|(i, x)| (*x, i)).collect();
        loop {
            let mut owners: HashMap<BufferId, BufferKey> = HashMap::new();
            let mut added = false;
            for (index, step) in order.iter().enumerate() {
                if !included[index] {
                    continue;
                }
                let members = self.step_members(*step);
                for member in &members {
                    for input in &self.node(*member)?.inputs {
                        let producer = self.node(*input)?;
                        if producer.is_leaf() || members.contains(input) {
                            continue;
                        }
                        let key = BufferKey::value(*input);
                        let buffer = self.pool.assignment(&key)?;
                        let owner = owners
                            .get(&buffer)
                            .copied()
                            .or(self.pool.content_owner(buffer));
                        if producer.eval_time_stamp != 0 && owner == Some(key) {
                            continue;
                        }
                        if let Some(producer_index) = position.get(&self.step_of(*input)) {
                            if !included[*producer_index] {
                                debug!(
                                    "forward_from_to: {} no longer holds its value, recomputing it",
                                    producer.name
                                );
                                included[*producer_index] = true;
                                added = true;
                            }
                        }
                    }
                }
                for member in &members {
                    let key = BufferKey::value(*member);
                    if let Ok(buffer) = self.pool.assignment(&key) {
                        owners.insert(buffer, key);
                    }
                }
            }
            if !added {
                return Ok(());
            }
        }
    }

    fn run_forward_steps<T: NetworkObserver>(
        &mut self,
        steps: &[PlanStep],
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        for step in steps {
            match step {
                PlanStep::Node(id) => self.forward_node(*id, observer)?,
                PlanStep::Loop(id) => self.forward_loop(*id, observer)?,
            }
        }
        Ok(())
    }

    fn forward_node<T: NetworkObserver>(
        &mut self,
        id: NodeId,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        if node.is_leaf() {
            if node.leaf_value.is_none() {
                return Err(NetworkError::EmptyInput(node.name.clone()));
            }
            self.node_mut(id)?.state = NodeEvalState::ForwardDone;
            return Ok(());
        }
        if self.is_up_to_date(id)? {
            self.node_mut(id)?.state = NodeEvalState::ForwardDone;
            return Ok(());
        }

        let shape = self.output_shape(id)?;
        let buffer = self.pool.assignment(&BufferKey::value(id))?;
        self.pool.ensure_shape(buffer, shape);
        let mut output = self.pool.take(buffer);
        let start_instant = Instant::now();
        let result = self.compute_forward(id, &mut output, FrameRange::All, None);
        let end_instant = Instant::now();
        self.pool.restore(buffer, output);
        if let Err(err) = result {
            self.node_mut(id)?.eval_time_stamp = 0;
            return Err(err);
        }

        if self.layout_of(id)?.is_minibatch() {
            let gaps = self.mb_layout.gap_columns(FrameRange::All);
            let data = self.pool.buffer_mut(buffer);
            for column in gaps {
                data.column_mut(column).fill(0.0);
            }
        }
        self.observe(id, FrameRange::All, Pass::Forward, start_instant, end_instant, observer);
        self.finish_forward(id, buffer, observer)
    }

    fn forward_loop<T: NetworkObserver>(
        &mut self,
        loop_id: LoopId,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let unit = self
            .loops
            .get(loop_id.0)
            .cloned()
            .ok_or(NetworkError::UnknownLoop(loop_id))?;
        if self.is_loop_up_to_date(&unit)? {
            for member in unit.members() {
                self.node_mut(*member)?.state = NodeEvalState::ForwardDone;
            }
            return Ok(());
        }

        let mut value_buffers = Vec::with_capacity(unit.members().len());
        for member in unit.members() {
            if self.step_values.contains(member) {
                value_buffers.push(None);
                continue;
            }
            let shape = self.output_shape(*member)?;
            let buffer = self.pool.assignment(&BufferKey::value(*member))?;
            self.pool.ensure_shape(buffer, shape);
            self.pool.buffer_mut(buffer).fill(0.0);
            self.pool.set_content_owner(buffer, BufferKey::value(*member));
            value_buffers.push(Some(buffer));
        }

        if let Err(err) = self.step_loop_forward(&unit, &value_buffers, observer) {
            for member in unit.members() {
                self.node_mut(*member)?.eval_time_stamp = 0;
            }
            return Err(err);
        }
        for (member, buffer) in unit.members().iter().zip(&value_buffers) {
            match buffer {
                Some(buffer) => self.finish_forward(*member, *buffer, observer)?,
                None => self.mark_forward_done(*member)?,
            }
        }
        Ok(())
    }

    /// Runs every member once per time step, each computing into a one-step
    /// buffer from the loop's own pool. Members with a full-width value commit
    /// their live columns into it, where later steps and delays read them; the
    /// others are read straight from the step pool by later members of the same
    /// step. Every step buffer is released when its step ends.
    fn step_loop_forward<T: NetworkObserver>(
        &mut self,
        unit: &LoopUnit,
        value_buffers: &[Option<BufferId>],
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let num_steps = self.mb_layout.max_sequence_length();
        for t in unit.direction().time_steps(num_steps) {
            let mut held = Vec::with_capacity(unit.members().len());
            let result = self.run_loop_step(unit, t, value_buffers, &mut held, observer);
            let step_pool = self.step_pool_mut(unit.id())?;
            for key in held {
                step_pool.release(key)?;
            }
            result?;
        }
        Ok(())
    }

    fn run_loop_step<T: NetworkObserver>(
        &mut self,
        unit: &LoopUnit,
        t: usize,
        value_buffers: &[Option<BufferId>],
        held: &mut Vec<BufferKey>,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let num_parallel = self.mb_layout.num_parallel_sequences();
        let frame = FrameRange::Step(t);
        let first_column = frame.first_column(&self.mb_layout);
        let gaps: Vec<usize> = (0..num_parallel)
            .filter(|s| self.mb_layout.is_gap(*s, t))
            .collect();
        for (member, value_buffer) in unit.members().iter().zip(value_buffers) {
            let rows = self.layout_of(*member)?.rows();
            let key = BufferKey::step(*member);
            let step_pool = self.step_pool_mut(unit.id())?;
            let step_buffer = step_pool.request(key, SizeClass::step(rows, num_parallel), true)?;
            held.push(key);
            step_pool.ensure_shape(step_buffer, (rows, num_parallel));
            let mut output = step_pool.take(step_buffer);

            let start_instant = Instant::now();
            let result = self.compute_forward(*member, &mut output, frame, Some(unit.id()));
            let end_instant = Instant::now();
            for s in &gaps {
                output.column_mut(*s).fill(0.0);
            }
            if let (Ok(()), Some(value_buffer)) = (&result, value_buffer) {
                let value = self.pool.buffer_mut(*value_buffer);
                for s in (0..num_parallel).filter(|x| !gaps.contains(x)) {
                    value
                        .column_mut(first_column + s)
                        .assign(&output.column(s));
                }
            }
            self.step_pool_mut(unit.id())?.restore(step_buffer, output);
            result?;
            self.observe(*member, frame, Pass::Forward, start_instant, end_instant, observer);
            if value_buffer.is_none() {
                self.finish_step_value(*member, unit.id(), step_buffer, first_column, observer)?;
            }
        }
        Ok(())
    }

    /// A step-only member has no full value: NaN tracking and observers see each
    /// step as it is produced.
    fn finish_step_value<T: NetworkObserver>(
        &self,
        id: NodeId,
        loop_id: LoopId,
        buffer: BufferId,
        first_column: usize,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let step_pool = self
            .step_pools
            .get(loop_id.0)
            .ok_or(NetworkError::UnknownLoop(loop_id))?;
        let data = step_pool.buffer(buffer);
        if self.config.track_gap_nans {
            for (s, values) in data.columns().into_iter().enumerate() {
                if values.iter().any(|x| x.is_nan()) {
                    return Err(NetworkError::NanInOutput {
                        node: self.node_name(id),
                        column: first_column + s,
                    });
                }
            }
        }
        observer.on_value_assigned(id, &self.node(id)?.name, data.view());
        Ok(())
    }

    fn finish_forward<T: NetworkObserver>(
        &mut self,
        id: NodeId,
        buffer: BufferId,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        if self.config.track_gap_nans {
            self.check_nans(id, buffer)?;
        }
        self.pool.set_content_owner(buffer, BufferKey::value(id));
        self.mark_forward_done(id)?;
        let node = self.node(id)?;
        observer.on_value_assigned(id, &node.name, self.pool.buffer(buffer).view());
        Ok(())
    }

    fn mark_forward_done(&mut self, id: NodeId) -> Result<(), NetworkError> {
        let stamp = self.next_time_stamp();
        let node = self.node_mut(id)?;
        node.eval_time_stamp = stamp;
        node.state = NodeEvalState::ForwardDone;
        Ok(())
    }

    fn compute_forward(
        &self,
        id: NodeId,
        output: &mut Array2<f32>,
        frame: FrameRange,
        in_loop: Option<LoopId>,
    ) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        let (inputs, layouts, framed) = self.input_views(id, in_loop)?;
        let mut ctx = ForwardContext::new(inputs, layouts, output.view_mut(), frame, &self.mb_layout)
            .with_framed_inputs(framed);
        node.op
            .forward(&mut ctx)
            .map_err(|source| NetworkError::Eval {
                node: node.name.clone(),
                frame,
                source,
            })
    }

    /// Current values of a node's inputs, checked against their layouts and
    /// against the buffer's current owner. Inside a loop step, members without a
    /// full-width value are read from the loop's step pool.
    fn input_views(&self, id: NodeId, in_loop: Option<LoopId>) -> Result<InputViews<'_>, NetworkError> {
        let node = self.node(id)?;
        let mut views = Vec::with_capacity(node.inputs.len());
        let mut layouts = Vec::with_capacity(node.inputs.len());
        let mut framed = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            let layout = self.layout_of(*input)?;
            if self.step_values.contains(input) {
                let step_pool = in_loop
                    .and_then(|x| self.step_pools.get(x.0))
                    .ok_or(BufferPoolError::NotAssigned(BufferKey::value(*input)))?;
                let buffer = step_pool.assignment(&BufferKey::step(*input))?;
                views.push(step_pool.buffer(buffer).view());
                layouts.push(layout);
                framed.push(true);
                continue;
            }
            let input_node = self.node(*input)?;
            if !input_node.is_leaf() {
                let key = BufferKey::value(*input);
                if self.pool.content_owner(self.pool.assignment(&key)?) != Some(key) {
                    error!("{} would read {} from a reused buffer", node.name, input_node.name);
                    return Err(NetworkError::OverwrittenInput {
                        node: node.name.clone(),
                        input: input_node.name.clone(),
                    });
                }
            }
            let value = self.value(*input)?;
            let expected = layout.shape(&self.mb_layout);
            if value.dim() != expected {
                return Err(NetworkError::ShapeMismatch {
                    node: self.node_name(*input),
                    expected,
                    got: value.dim(),
                });
            }
            views.push(value.view());
            layouts.push(layout);
            framed.push(false);
        }
        Ok((views, layouts, framed))
    }

    fn is_up_to_date(&self, id: NodeId) -> Result<bool, NetworkError> {
        let node = self.node(id)?;
        if node.eval_time_stamp == 0 {
            return Ok(false);
        }
        let key = BufferKey::value(id);
        if self.pool.content_owner(self.pool.assignment(&key)?) != Some(key) {
            return Ok(false);
        }
        for input in &node.inputs {
            if self.node(*input)?.eval_time_stamp > node.eval_time_stamp {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// A loop is current when every member is, judged only against inputs from outside the loop.
    fn is_loop_up_to_date(&self, unit: &LoopUnit) -> Result<bool, NetworkError> {
        let mut oldest = u64::MAX;
        for member in unit.members() {
            let node = self.node(*member)?;
            if node.eval_time_stamp == 0 {
                return Ok(false);
            }
            let key = BufferKey::value(*member);
            if !self.step_values.contains(member)
                && self.pool.content_owner(self.pool.assignment(&key)?) != Some(key)
            {
                return Ok(false);
            }
            oldest = oldest.min(node.eval_time_stamp);
        }
        for member in unit.members() {
            for input in &self.node(*member)?.inputs {
                if !unit.contains(*input) && self.node(*input)?.eval_time_stamp > oldest {
                    return Ok(false);
                }
            }
        }
        Ok(true)
    }

    fn check_nans(&self, id: NodeId, buffer: BufferId) -> Result<(), NetworkError> {
        let data = self.pool.buffer(buffer);
        let gaps: HashSet<usize> = if self.layout_of(id)?.is_minibatch() {
            self.mb_layout.gap_columns(FrameRange::All).into_iter().collect()
        } else {
            HashSet::new()
        };
        for (column, values) in data.columns().into_iter().enumerate() {
            if !gaps.contains(&column) && values.iter().any(|x| x.is_nan()) {
                return Err(NetworkError::NanInOutput {
                    node: self.node_name(id),
                    column,
                });
            }
        }
        Ok(())
    }

    /// Propagates gradients from `root` back through everything it depends on.
    /// The root's own gradient is seeded with ones.
    pub fn backward(&mut self, root: NodeId) -> Result<(), NetworkError> {
        self.backward_with_observer(root, &mut ())
    }

    pub fn backward_with_observer<T: NetworkObserver>(
        &mut self,
        root: NodeId,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        self.require_allocated()?;
        let root_node = self.node(root)?;
        if !matches!(
            root_node.state,
            NodeEvalState::ForwardDone | NodeEvalState::BackwardDone
        ) {
            return Err(NetworkError::ForwardNotDone(root_node.name.clone()));
        }
        if !root_node.needs_gradient {
            debug!("backward: {} depends on no trainable parameter", root_node.name);
            return Ok(());
        }
        self.ensure_order(Some(root))?;
        let steps = self.get_order(Some(root))?.to_vec();

        let mut touched = HashSet::new();
        let buffer = self.touch_gradient(root, &mut touched)?;
        self.pool.buffer_mut(buffer).fill(1.0);
        self.mask_gradient_gaps(root)?;

        for step in steps.iter().rev() {
            match step {
                PlanStep::Node(id) => self.backward_node(*id, &mut touched, observer)?,
                PlanStep::Loop(id) => self.backward_loop(*id, &mut touched, observer)?,
            }
        }
        Ok(())
    }

    fn backward_node<T: NetworkObserver>(
        &mut self,
        id: NodeId,
        touched: &mut HashSet<NodeId>,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        if node.is_leaf() || !node.needs_gradient || !touched.contains(&id) {
            return Ok(());
        }
        let inputs = node.inputs.clone();
        self.mask_gradient_gaps(id)?;
        let start_instant = Instant::now();
        for (index, input) in inputs.iter().enumerate() {
            if !self.node(*input)?.needs_gradient {
                continue;
            }
            self.touch_gradient(*input, touched)?;
            self.compute_backward(id, index, FrameRange::All)?;
        }
        let end_instant = Instant::now();
        self.observe(id, FrameRange::All, Pass::Backward, start_instant, end_instant, observer);
        self.node_mut(id)?.state = NodeEvalState::BackwardDone;
        Ok(())
    }

    /// Steps opposite to the forward direction, members in reverse internal order,
    /// so every gradient column is complete before it is propagated.
    fn backward_loop<T: NetworkObserver>(
        &mut self,
        loop_id: LoopId,
        touched: &mut HashSet<NodeId>,
        observer: &mut T,
    ) -> Result<(), NetworkError> {
        let unit = self
            .loops
            .get(loop_id.0)
            .cloned()
            .ok_or(NetworkError::UnknownLoop(loop_id))?;
        let mut active = Vec::new();
        for member in unit.members() {
            if self.node(*member)?.needs_gradient {
                self.touch_gradient(*member, touched)?;
                self.mask_gradient_gaps(*member)?;
                active.push(*member);
            }
        }

        let num_steps = self.mb_layout.max_sequence_length();
        for t in unit.direction().reversed().time_steps(num_steps) {
            let frame = FrameRange::Step(t);
            for member in active.iter().rev() {
                let inputs = self.node(*member)?.inputs.clone();
                let start_instant = Instant::now();
                for (index, input) in inputs.iter().enumerate() {
                    if !self.node(*input)?.needs_gradient {
                        continue;
                    }
                    self.touch_gradient(*input, touched)?;
                    self.compute_backward(*member, index, frame)?;
                }
                let end_instant = Instant::now();
                self.observe(*member, frame, Pass::Backward, start_instant, end_instant, observer);
            }
        }
        for member in active {
            self.node_mut(member)?.state = NodeEvalState::BackwardDone;
        }
        Ok(())
    }

    /// Gradient buffer of `id`, zeroed the first time it is touched in this pass.
    fn touch_gradient(
        &mut self,
        id: NodeId,
        touched: &mut HashSet<NodeId>,
    ) -> Result<BufferId, NetworkError> {
        let key = BufferKey::gradient(id);
        let buffer = self.pool.assignment(&key)?;
        if touched.insert(id) {
            let shape = self.output_shape(id)?;
            self.pool.ensure_shape(buffer, shape);
            self.pool.buffer_mut(buffer).fill(0.0);
            self.pool.set_content_owner(buffer, key);
        }
        Ok(buffer)
    }

    fn mask_gradient_gaps(&mut self, id: NodeId) -> Result<(), NetworkError> {
        if !self.layout_of(id)?.is_minibatch() || !self.mb_layout.has_gaps() {
            return Ok(());
        }
        let buffer = self.pool.assignment(&BufferKey::gradient(id))?;
        let gaps = self.mb_layout.gap_columns(FrameRange::All);
        let data = self.pool.buffer_mut(buffer);
        for column in gaps {
            data.column_mut(column).fill(0.0);
        }
        Ok(())
    }

    fn compute_backward(
        &mut self,
        id: NodeId,
        index: usize,
        frame: FrameRange,
    ) -> Result<(), NetworkError> {
        let input = self.node(id)?.inputs[index];
        let input_buffer = self.pool.assignment(&BufferKey::gradient(input))?;
        let own_buffer = self.pool.assignment(&BufferKey::gradient(id))?;
        let mut input_gradient = self.pool.take(input_buffer);
        // A node feeding itself reads and writes the same gradient.
        let own_gradient = (input_buffer == own_buffer).then(|| input_gradient.clone());
        let result = self.backward_into(id, index, &mut input_gradient, own_gradient.as_ref(), frame);
        self.pool.restore(input_buffer, input_gradient);
        result
    }

    fn backward_into(
        &self,
        id: NodeId,
        index: usize,
        input_gradient: &mut Array2<f32>,
        own_gradient: Option<&Array2<f32>>,
        frame: FrameRange,
    ) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        let placeholder = Array2::<f32>::zeros((0, 0));
        let mut inputs = Vec::with_capacity(node.inputs.len());
        let mut layouts = Vec::with_capacity(node.inputs.len());
        for input in &node.inputs {
            inputs.push(self.backprop_value(*input, &placeholder)?);
            layouts.push(self.layout_of(*input)?);
        }
        let output_value = self.backprop_value(id, &placeholder)?;
        let output_gradient = match own_gradient {
            Some(gradient) => gradient.view(),
            None => self.gradient(id)?.view(),
        };
        let mut ctx = BackwardContext::new(
            index,
            inputs,
            layouts,
            output_value,
            output_gradient,
            self.layout_of(id)?,
            input_gradient.view_mut(),
            frame,
            &self.mb_layout,
        );
        node.op
            .backward(&mut ctx)
            .map_err(|source| NetworkError::Eval {
                node: node.name.clone(),
                frame,
                source,
            })
    }

    /// Step-only members are never held for backward, so no kernel reads them there.
    fn backprop_value<'a>(
        &'a self,
        id: NodeId,
        placeholder: &'a Array2<f32>,
    ) -> Result<ArrayView2<'a, f32>, NetworkError> {
        if self.step_values.contains(&id) {
            return Ok(placeholder.view());
        }
        Ok(self.value(id)?.view())
    }

    fn observe<T: NetworkObserver>(
        &self,
        id: NodeId,
        frame: FrameRange,
        pass: Pass,
        start_instant: Instant,
        end_instant: Instant,
        observer: &mut T,
    ) {
        let name = self.node_name(id);
        if self.config.trace_level > 0 {
            debug!(
                "{pass} {name} over {frame} took {:?}",
                end_instant.duration_since(start_instant)
            );
        }
        observer.on_node_executed(id, &name, frame, pass, start_instant, end_instant);
    }

    pub(crate) fn layout_of(&self, id: NodeId) -> Result<SampleLayout, NetworkError> {
        let node = self.node(id)?;
        node.layout
            .ok_or_else(|| NetworkError::UnresolvedLayout(node.name.clone()))
    }

    fn output_shape(&self, id: NodeId) -> Result<(usize, usize), NetworkError> {
        Ok(self.layout_of(id)?.shape(&self.mb_layout))
    }

    fn step_pool_mut(&mut self, id: LoopId) -> Result<&mut BufferPool, NetworkError> {
        self.step_pools
            .get_mut(id.0)
            .ok_or(NetworkError::UnknownLoop(id))
    }
}
