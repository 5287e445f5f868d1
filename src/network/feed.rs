use crate::mb_layout::{FrameRange, MBLayout};
use crate::network::{ComputationNetwork, NetworkError, NodeId};
use crate::ops::Operation;
use log::debug;
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParameterInit {
    /// Uniform in `[-scale, scale]`.
    Uniform { scale: f32 },
    Fixed(f32),
}

impl ComputationNetwork {
    /// Installs the packing descriptor for the next batch. A changed layout makes
    /// every computed value stale.
    pub fn set_mb_layout(&mut self, mb_layout: MBLayout) {
        if self.mb_layout != mb_layout {
            debug!(
                "Minibatch layout changed to {} sequences x {} steps",
                mb_layout.num_parallel_sequences(),
                mb_layout.num_time_steps()
            );
            self.mb_layout = mb_layout;
            self.invalidate_computed_values();
        }
    }

    /// Stores the value of an input node. Columns that fall into gaps of the
    /// current layout are zeroed.
    pub fn set_input_value(&mut self, id: NodeId, mut value: Array2<f32>) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        if !node.is_input() {
            return Err(NetworkError::WrongNodeKind(node.name.clone(), "input"));
        }
        let expected = self.declared_shape(id)?;
        if value.dim() != expected {
            return Err(NetworkError::ShapeMismatch {
                node: node.name.clone(),
                expected,
                got: value.dim(),
            });
        }
        for column in self.mb_layout.gap_columns(FrameRange::All) {
            value.column_mut(column).fill(0.0);
        }
        let stamp = self.next_time_stamp();
        let node = self.node_mut(id)?;
        node.leaf_value = Some(value);
        node.eval_time_stamp = stamp;
        Ok(())
    }

    /// Called after the caller changed input values behind the engine's back
    /// (or resized them): verifies the shapes and forces recomputation.
    pub fn notify_input_nodes_resized(&mut self) -> Result<(), NetworkError> {
        let inputs: Vec<NodeId> = self
            .nodes()
            .filter(|(_, node)| node.is_input())
            .map(|(id, _)| id)
            .collect();
        for id in inputs {
            let expected = self.declared_shape(id)?;
            let node = self.node(id)?;
            if let Some(value) = &node.leaf_value {
                if value.dim() != expected {
                    return Err(NetworkError::ShapeMismatch {
                        node: node.name.clone(),
                        expected,
                        got: value.dim(),
                    });
                }
            }
            let stamp = self.next_time_stamp();
            self.node_mut(id)?.eval_time_stamp = stamp;
        }
        self.invalidate_computed_values();
        Ok(())
    }

    /// Number of minibatch columns the fed inputs actually carry. All fed inputs
    /// must agree; with none fed, the layout's column count.
    pub fn determine_actual_mb_size(&self) -> Result<usize, NetworkError> {
        let mut actual: Option<usize> = None;
        for (_, node) in self.nodes().filter(|(_, x)| x.is_input()) {
            let Some(value) = &node.leaf_value else {
                continue;
            };
            match actual {
                None => actual = Some(value.ncols()),
                Some(cols) if cols != value.ncols() => {
                    return Err(NetworkError::ShapeMismatch {
                        node: node.name.clone(),
                        expected: (value.nrows(), cols),
                        got: value.dim(),
                    });
                }
                Some(_) => {}
            }
        }
        Ok(actual.unwrap_or_else(|| self.mb_layout.num_cols()))
    }

    pub fn set_parameter_value(&mut self, id: NodeId, value: Array2<f32>) -> Result<(), NetworkError> {
        let node = self.node(id)?;
        if !node.is_learnable() {
            return Err(NetworkError::WrongNodeKind(node.name.clone(), "learnable parameter"));
        }
        let expected = self.declared_shape(id)?;
        if value.dim() != expected {
            return Err(NetworkError::ShapeMismatch {
                node: node.name.clone(),
                expected,
                got: value.dim(),
            });
        }
        let stamp = self.next_time_stamp();
        let node = self.node_mut(id)?;
        node.leaf_value = Some(value);
        node.eval_time_stamp = stamp;
        Ok(())
    }

    pub fn init_learnable_parameters(
        &mut self,
        id: NodeId,
        init: ParameterInit,
        seed: u64,
    ) -> Result<(), NetworkError> {
        let shape = self.declared_shape(id)?;
        let value = match init {
            ParameterInit::Uniform { scale } => {
                let scale = scale.abs();
                let mut rng = StdRng::seed_from_u64(seed);
                Array2::from_shape_simple_fn(shape, || rng.gen_range(-scale..=scale))
            }
            ParameterInit::Fixed(x) => Array2::from_elem(shape, x),
        };
        self.set_parameter_value(id, value)
    }

    /// Shape of a leaf's value under the current layout.
    fn declared_shape(&self, id: NodeId) -> Result<(usize, usize), NetworkError> {
        let node = self.node(id)?;
        let layout = node
            .layout
            .or_else(|| node.op.declared_layout())
            .ok_or_else(|| NetworkError::UnresolvedLayout(node.name.clone()))?;
        Ok(layout.shape(&self.mb_layout))
    }

    /// Marks every computed node as never evaluated. Leaves keep their values.
    pub(crate) fn invalidate_computed_values(&mut self) {
        for node in self.nodes.iter_mut().flatten() {
            if !node.is_leaf() {
                node.eval_time_stamp = 0;
            }
        }
    }
}
