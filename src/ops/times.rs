use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use ndarray::linalg::general_mat_mul;
use serde::{Deserialize, Serialize};

/// Matrix product `W * x` with a fixed left operand.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TimesOperation {}

impl TimesOperation {
    pub fn new() -> Self {
        Self {}
    }
}

impl Operation for TimesOperation {
    fn op_name(&self) -> &'static str {
        "Times"
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 2)?;
        let SampleLayout::Fixed { rows, cols } = inputs[0] else {
            return Err(OpError::ExpectedFixed(0));
        };
        if inputs[1].rows() != cols {
            return Err(OpError::IncompatibleLayouts(inputs[0], inputs[1]));
        }
        Ok(match inputs[1] {
            SampleLayout::Minibatch { .. } => SampleLayout::Minibatch { rows },
            SampleLayout::Fixed { cols, .. } => SampleLayout::Fixed { rows, cols },
        })
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        let weights = ctx.input(0);
        let x = ctx.input(1);
        let output = ctx.output();
        let expected = [weights.nrows(), x.ncols()];
        if output.shape() != &expected[..] {
            return Err(OpError::UnexpectedShape(
                expected.to_vec(),
                output.shape().to_vec(),
            ));
        }
        general_mat_mul(1.0, &weights, &x, 0.0, output);
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        let gradient = ctx.output_gradient();
        match ctx.input_index() {
            0 => {
                let x = ctx.input(1);
                let mut input_gradient = ctx.input_gradient();
                general_mat_mul(1.0, &gradient, &x.t(), 1.0, &mut input_gradient);
            }
            _ => {
                let weights = ctx.input(0);
                let mut input_gradient = ctx.input_gradient();
                general_mat_mul(1.0, &weights.t(), &gradient, 1.0, &mut input_gradient);
            }
        }
        Ok(())
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }
}
