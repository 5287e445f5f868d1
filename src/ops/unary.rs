use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use ndarray::Zip;
use num_traits::Float;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
pub enum WhichUnaryOperation {
    Tanh,
    Sigmoid,
    ReLU,
}

impl WhichUnaryOperation {
    pub fn apply<F: Float>(&self, x: F) -> F {
        match self {
            WhichUnaryOperation::Tanh => x.tanh(),
            WhichUnaryOperation::Sigmoid => F::one() / (F::one() + (-x).exp()),
            WhichUnaryOperation::ReLU => x.max(F::zero()),
        }
    }

    /// Derivative expressed through the output value `y = f(x)`.
    pub fn derivative_from_output<F: Float>(&self, y: F) -> F {
        match self {
            WhichUnaryOperation::Tanh => F::one() - y * y,
            WhichUnaryOperation::Sigmoid => y * (F::one() - y),
            WhichUnaryOperation::ReLU => {
                if y > F::zero() {
                    F::one()
                } else {
                    F::zero()
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnaryOperation {
    which: WhichUnaryOperation,
}

impl UnaryOperation {
    pub fn new(which: WhichUnaryOperation) -> Self {
        Self { which }
    }

    pub fn tanh() -> Self {
        Self::new(WhichUnaryOperation::Tanh)
    }

    pub fn sigmoid() -> Self {
        Self::new(WhichUnaryOperation::Sigmoid)
    }

    pub fn relu() -> Self {
        Self::new(WhichUnaryOperation::ReLU)
    }
}

impl Operation for UnaryOperation {
    fn op_name(&self) -> &'static str {
        match self.which {
            WhichUnaryOperation::Tanh => "Tanh",
            WhichUnaryOperation::Sigmoid => "Sigmoid",
            WhichUnaryOperation::ReLU => "RectifiedLinear",
        }
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 1)?;
        Ok(inputs[0])
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        let input = ctx.input(0);
        let which = self.which;
        let output = ctx.output();
        if output.shape() != input.shape() {
            return Err(OpError::UnexpectedShape(
                output.shape().to_vec(),
                input.shape().to_vec(),
            ));
        }
        Zip::from(output)
            .and(&input)
            .for_each(|y, &x| *y = which.apply(x));
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        let value = ctx.output_value();
        let gradient = ctx.output_gradient();
        let which = self.which;
        let input_gradient = ctx.input_gradient();
        Zip::from(input_gradient)
            .and(&gradient)
            .and(&value)
            .for_each(|dx, &dy, &y| *dx += dy * which.derivative_from_output(y));
        Ok(())
    }

    fn input_used_in_backprop(&self, _input_index: usize) -> bool {
        false
    }
}
