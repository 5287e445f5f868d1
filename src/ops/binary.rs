use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum WhichBinaryOperation {
    Plus,
    Minus,
    ElementTimes,
}

/// Elementwise binary op. A `[rows x 1]` fixed input broadcasts across every column.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BinaryOperation {
    which: WhichBinaryOperation,
}

impl BinaryOperation {
    pub fn new(which: WhichBinaryOperation) -> Self {
        Self { which }
    }

    pub fn plus() -> Self {
        Self::new(WhichBinaryOperation::Plus)
    }

    pub fn minus() -> Self {
        Self::new(WhichBinaryOperation::Minus)
    }

    pub fn element_times() -> Self {
        Self::new(WhichBinaryOperation::ElementTimes)
    }

    pub fn which(&self) -> WhichBinaryOperation {
        self.which
    }
}

fn is_column(layout: &SampleLayout) -> bool {
    matches!(layout, SampleLayout::Fixed { cols: 1, .. })
}

/// Sum a contribution down to the shape of a broadcast input.
fn reduce_to(contribution: Array2<f32>, target: &SampleLayout) -> Array2<f32> {
    if is_column(target) && contribution.ncols() != 1 {
        contribution.sum_axis(Axis(1)).insert_axis(Axis(1))
    } else {
        contribution
    }
}

impl Operation for BinaryOperation {
    fn op_name(&self) -> &'static str {
        match self.which {
            WhichBinaryOperation::Plus => "Plus",
            WhichBinaryOperation::Minus => "Minus",
            WhichBinaryOperation::ElementTimes => "ElementTimes",
        }
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 2)?;
        let (a, b) = (inputs[0], inputs[1]);
        if a == b {
            return Ok(a);
        }
        if a.rows() == b.rows() {
            if a.is_minibatch() && is_column(&b) {
                return Ok(a);
            }
            if b.is_minibatch() && is_column(&a) {
                return Ok(b);
            }
        }
        Err(OpError::IncompatibleLayouts(a, b))
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        let a = ctx.input(0);
        let b = ctx.input(1);
        let result = match self.which {
            WhichBinaryOperation::Plus => &a + &b,
            WhichBinaryOperation::Minus => &a - &b,
            WhichBinaryOperation::ElementTimes => &a * &b,
        };
        let output = ctx.output();
        if output.shape() != result.shape() {
            return Err(OpError::UnexpectedShape(
                output.shape().to_vec(),
                result.shape().to_vec(),
            ));
        }
        output.assign(&result);
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        let index = ctx.input_index();
        let gradient = ctx.output_gradient();
        let contribution = match (self.which, index) {
            (WhichBinaryOperation::Plus, _) | (WhichBinaryOperation::Minus, 0) => {
                gradient.to_owned()
            }
            (WhichBinaryOperation::Minus, _) => gradient.mapv(|x| -x),
            (WhichBinaryOperation::ElementTimes, _) => {
                let other = ctx.input(1 - index);
                &gradient * &other
            }
        };
        let contribution = reduce_to(contribution, &ctx.input_layout(index));
        let mut input_gradient = ctx.input_gradient();
        input_gradient += &contribution;
        Ok(())
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn input_used_in_backprop(&self, _input_index: usize) -> bool {
        matches!(self.which, WhichBinaryOperation::ElementTimes)
    }
}
