use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use serde::{Deserialize, Serialize};

/// Externally fed minibatch data (features, labels).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InputValueOperation {
    rows: usize,
}

impl InputValueOperation {
    pub fn new(rows: usize) -> Self {
        Self { rows }
    }
}

impl Operation for InputValueOperation {
    fn op_name(&self) -> &'static str {
        "InputValue"
    }

    fn declared_layout(&self) -> Option<SampleLayout> {
        Some(SampleLayout::Minibatch { rows: self.rows })
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 0)?;
        Ok(SampleLayout::Minibatch { rows: self.rows })
    }

    fn forward(&self, _ctx: &mut ForwardContext) -> Result<(), OpError> {
        // Values arrive from the caller.
        Ok(())
    }

    fn backward(&self, _ctx: &mut BackwardContext) -> Result<(), OpError> {
        Err(OpError::NoGradient(self.op_name()))
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn is_input(&self) -> bool {
        true
    }
}

/// Persistent trainable state. The value itself lives on the node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LearnableParameterOperation {
    rows: usize,
    cols: usize,
    learning_rate_multiplier: f32,
}

impl LearnableParameterOperation {
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            learning_rate_multiplier: 1.0,
        }
    }

    /// A multiplier of zero freezes the parameter: no gradient is computed for it.
    pub fn with_learning_rate_multiplier(mut self, multiplier: f32) -> Self {
        self.learning_rate_multiplier = multiplier;
        self
    }

    pub fn set_learning_rate_multiplier(&mut self, multiplier: f32) {
        self.learning_rate_multiplier = multiplier;
    }
}

impl Operation for LearnableParameterOperation {
    fn op_name(&self) -> &'static str {
        "LearnableParameter"
    }

    fn declared_layout(&self) -> Option<SampleLayout> {
        Some(SampleLayout::Fixed {
            rows: self.rows,
            cols: self.cols,
        })
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 0)?;
        Ok(SampleLayout::Fixed {
            rows: self.rows,
            cols: self.cols,
        })
    }

    fn forward(&self, _ctx: &mut ForwardContext) -> Result<(), OpError> {
        Ok(())
    }

    fn backward(&self, _ctx: &mut BackwardContext) -> Result<(), OpError> {
        Err(OpError::NoGradient(self.op_name()))
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn is_learnable(&self) -> bool {
        true
    }

    fn learning_rate_multiplier(&self) -> f32 {
        self.learning_rate_multiplier
    }
}
