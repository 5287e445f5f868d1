use crate::ops::{
    BackwardContext, ForwardContext, OpError, Operation, SampleLayout, check_input_count,
};
use serde::{Deserialize, Serialize};

/// Recurrence edge: output at step `t` is the input at `t - offset` of the same sequence.
///
/// A positive offset reads the past (the loop steps forward in time), a negative
/// offset reads the future (the loop steps backward). Steps that fall outside the
/// sequence read `initial_value`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DelayOperation {
    rows: usize,
    offset: i32,
    initial_value: f32,
}

impl DelayOperation {
    pub fn new(rows: usize, offset: i32, initial_value: f32) -> Self {
        Self {
            rows,
            offset,
            initial_value,
        }
    }

    pub fn past_value(rows: usize, time_step: usize) -> Self {
        Self::new(rows, time_step as i32, 0.0)
    }

    pub fn future_value(rows: usize, time_step: usize) -> Self {
        Self::new(rows, -(time_step as i32), 0.0)
    }

    pub fn with_initial_value(mut self, initial_value: f32) -> Self {
        self.initial_value = initial_value;
        self
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }
}

impl Operation for DelayOperation {
    fn op_name(&self) -> &'static str {
        if self.offset >= 0 {
            "PastValue"
        } else {
            "FutureValue"
        }
    }

    fn declared_layout(&self) -> Option<SampleLayout> {
        Some(SampleLayout::Minibatch { rows: self.rows })
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError> {
        check_input_count(inputs, 1)?;
        if self.offset == 0 {
            return Err(OpError::InvalidInput(format!(
                "{}: time offset must not be zero",
                self.op_name()
            )));
        }
        let expected = SampleLayout::Minibatch { rows: self.rows };
        if !inputs[0].is_minibatch() {
            return Err(OpError::ExpectedMinibatch(0));
        }
        if inputs[0] != expected {
            return Err(OpError::IncompatibleLayouts(expected, inputs[0]));
        }
        Ok(expected)
    }

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError> {
        let mb_layout = ctx.mb_layout();
        let frame = ctx.frame();
        let input = ctx.input_full(0);
        let first_column = frame.first_column(mb_layout);
        let initial_value = self.initial_value;
        let offset = self.offset;
        let output = ctx.output();
        for t in frame.time_steps(mb_layout) {
            for s in 0..mb_layout.num_parallel_sequences() {
                let out_col = mb_layout.column_index(s, t) - first_column;
                let mut column = output.column_mut(out_col);
                match mb_layout.shifted_step(s, t, offset) {
                    Some(source) => {
                        column.assign(&input.column(mb_layout.column_index(s, source)));
                    }
                    None => column.fill(initial_value),
                }
            }
        }
        Ok(())
    }

    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError> {
        let mb_layout = ctx.mb_layout();
        let frame = ctx.frame();
        let gradient = ctx.output_gradient_full();
        let offset = self.offset;
        let input_gradient = ctx.input_gradient_full();
        for t in frame.time_steps(mb_layout) {
            for s in 0..mb_layout.num_parallel_sequences() {
                if let Some(source) = mb_layout.shifted_step(s, t, offset) {
                    let mut target = input_gradient.column_mut(mb_layout.column_index(s, source));
                    target += &gradient.column(mb_layout.column_index(s, t));
                }
            }
        }
        Ok(())
    }

    fn output_used_in_backprop(&self) -> bool {
        false
    }

    fn input_used_in_backprop(&self, _input_index: usize) -> bool {
        false
    }

    fn delay_offset(&self) -> Option<i32> {
        Some(self.offset)
    }
}
