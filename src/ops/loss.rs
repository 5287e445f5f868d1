use crate::mb_layout::FrameRange;
use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use serde::{Deserialize, Serialize};

const SCALAR: SampleLayout = SampleLayout::Fixed { rows: 1, cols: 1 };

fn require_whole_batch(frame: FrameRange, name: &'static str) -> Result<(), OpError> {
    match frame {
        FrameRange::All => Ok(()),
        FrameRange::Step(_) => Err(OpError::NotSteppable(name)),
    }
}

/// `sum((a - b)^2)` over every column. Gap columns are zero on both sides.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SquareErrorOperation {}

impl SquareErrorOperation {
    pub fn new() -> Self {
        Self {}
    }
}

impl Operation for SquareErrorOperation {
    fn op_name(&self) -> &'static str {
        "SquareError"
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 2)?;
        if inputs[0] != inputs[1] {
            return Err(OpError::IncompatibleLayouts(inputs[0], inputs[1]));
        }
        Ok(SCALAR)
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        require_whole_batch(ctx.frame(), self.op_name())?;
        let a = ctx.input(0);
        let b = ctx.input(1);
        let total: f32 = a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum();
        ctx.output().fill(total);
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        require_whole_batch(ctx.frame(), self.op_name())?;
        let scale = ctx.output_gradient()[[0, 0]];
        let sign = if ctx.input_index() == 0 { 2.0 } else { -2.0 };
        let difference = &ctx.input(0) - &ctx.input(1);
        let mut input_gradient = ctx.input_gradient();
        input_gradient.scaled_add(sign * scale, &difference);
        Ok(())
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn supports_stepping(&self) -> bool {
        false
    }
}

/// Sum of every element of the input.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReduceSumOperation {}

impl ReduceSumOperation {
    pub fn new() -> Self {
        Self {}
    }
}

impl Operation for ReduceSumOperation {
    fn op_name(&self) -> &'static str {
        "ReduceSum"
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 1)?;
        Ok(SCALAR)
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        require_whole_batch(ctx.frame(), self.op_name())?;
        let total = ctx.input(0).sum();
        ctx.output().fill(total);
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        require_whole_batch(ctx.frame(), self.op_name())?;
        let scale = ctx.output_gradient()[[0, 0]];
        ctx.input_gradient().mapv_inplace(|x| x + scale);
        Ok(())
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn input_used_in_backprop(&self, _input_index: usize) -> bool {
        false
    }

    fn supports_stepping(&self) -> bool {
        false
    }
}
