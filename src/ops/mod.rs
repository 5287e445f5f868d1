mod binary;
mod delay;
mod leaf;
mod loss;
mod times;
mod unary;

pub use binary::{BinaryOperation, WhichBinaryOperation};
pub use delay::DelayOperation;
pub use leaf::{InputValueOperation, LearnableParameterOperation};
pub use loss::{ReduceSumOperation, SquareErrorOperation};
pub use times::TimesOperation;
pub use unary::{UnaryOperation, WhichUnaryOperation};

use crate::mb_layout::{FrameRange, MBLayout};
use ndarray::{ArrayView2, ArrayViewMut2, s};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum OpError {
    #[error("Expected {expected} inputs, got {got}")]
    InvalidInputCount { expected: usize, got: usize },
    #[error("Incompatible input layouts: {0} vs {1}")]
    IncompatibleLayouts(SampleLayout, SampleLayout),
    #[error("Input {0} must be minibatch-shaped")]
    ExpectedMinibatch(usize),
    #[error("Input {0} must be a fixed-size matrix")]
    ExpectedFixed(usize),
    #[error("Unexpected shape: expected {0:?}, got {1:?}")]
    UnexpectedShape(Vec<usize>, Vec<usize>),
    #[error("Operation {0} has no gradient")]
    NoGradient(&'static str),
    #[error("Operation {0} cannot run one time step at a time")]
    NotSteppable(&'static str),
    #[error("Invalid input for operation {0}")]
    InvalidInput(String),
}

/// Shape of one node's output.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SampleLayout {
    /// `rows` values per column, one column per (time step, parallel sequence).
    Minibatch { rows: usize },
    /// A plain matrix that does not depend on the batch.
    Fixed { rows: usize, cols: usize },
}

impl SampleLayout {
    pub fn rows(&self) -> usize {
        match self {
            SampleLayout::Minibatch { rows } => *rows,
            SampleLayout::Fixed { rows, .. } => *rows,
        }
    }

    pub fn is_minibatch(&self) -> bool {
        matches!(self, SampleLayout::Minibatch { .. })
    }

    pub fn num_cols(&self, mb_layout: &MBLayout) -> usize {
        match self {
            SampleLayout::Minibatch { .. } => mb_layout.num_cols(),
            SampleLayout::Fixed { cols, .. } => *cols,
        }
    }

    pub fn shape(&self, mb_layout: &MBLayout) -> (usize, usize) {
        (self.rows(), self.num_cols(mb_layout))
    }
}

impl std::fmt::Display for SampleLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SampleLayout::Minibatch { rows } => write!(f, "[{rows} x *]"),
            SampleLayout::Fixed { rows, cols } => write!(f, "[{rows} x {cols}]"),
        }
    }
}

pub(crate) fn check_input_count(inputs: &[SampleLayout], expected: usize) -> Result<(), OpError> {
    if inputs.len() != expected {
        return Err(OpError::InvalidInputCount {
            expected,
            got: inputs.len(),
        });
    }
    Ok(())
}

fn frame_view<'a>(
    view: &ArrayView2<'a, f32>,
    layout: SampleLayout,
    frame: FrameRange,
    mb_layout: &MBLayout,
) -> ArrayView2<'a, f32> {
    if layout.is_minibatch() {
        let cols = frame.columns(mb_layout);
        view.clone().slice_move(s![.., cols.start..cols.end])
    } else {
        view.clone()
    }
}

/// Everything a kernel sees while computing one frame of its output.
///
/// `output` is already frame-sized: the full buffer for whole-batch execution,
/// a one-step buffer for stepped execution.
pub struct ForwardContext<'a> {
    inputs: Vec<ArrayView2<'a, f32>>,
    input_layouts: Vec<SampleLayout>,
    /// Inputs that already cover exactly the current frame (one-step loop buffers).
    framed: Vec<bool>,
    output: ArrayViewMut2<'a, f32>,
    frame: FrameRange,
    mb_layout: &'a MBLayout,
}

impl<'a> ForwardContext<'a> {
    pub fn new(
        inputs: Vec<ArrayView2<'a, f32>>,
        input_layouts: Vec<SampleLayout>,
        output: ArrayViewMut2<'a, f32>,
        frame: FrameRange,
        mb_layout: &'a MBLayout,
    ) -> Self {
        let framed = vec![false; inputs.len()];
        Self {
            inputs,
            input_layouts,
            framed,
            output,
            frame,
            mb_layout,
        }
    }

    pub(crate) fn with_framed_inputs(mut self, framed: Vec<bool>) -> Self {
        self.framed = framed;
        self
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// Input `index` restricted to the current frame.
    pub fn input(&self, index: usize) -> ArrayView2<'a, f32> {
        if self.framed[index] {
            return self.inputs[index].clone();
        }
        frame_view(
            &self.inputs[index],
            self.input_layouts[index],
            self.frame,
            self.mb_layout,
        )
    }

    /// Input `index` over every time step, for kernels that look across time.
    /// Only full-width inputs have every step; a framed input has just the current one.
    pub fn input_full(&self, index: usize) -> ArrayView2<'a, f32> {
        self.inputs[index].clone()
    }

    pub fn input_layout(&self, index: usize) -> SampleLayout {
        self.input_layouts[index]
    }

    pub fn output(&mut self) -> &mut ArrayViewMut2<'a, f32> {
        &mut self.output
    }

    pub fn frame(&self) -> FrameRange {
        self.frame
    }

    pub fn mb_layout(&self) -> &'a MBLayout {
        self.mb_layout
    }
}

/// Everything a kernel sees while adding its gradient contribution to one input.
///
/// Contributions are always accumulated into `input_gradient`, never assigned.
pub struct BackwardContext<'a> {
    input_index: usize,
    inputs: Vec<ArrayView2<'a, f32>>,
    input_layouts: Vec<SampleLayout>,
    output_value: ArrayView2<'a, f32>,
    output_gradient: ArrayView2<'a, f32>,
    output_layout: SampleLayout,
    input_gradient: ArrayViewMut2<'a, f32>,
    frame: FrameRange,
    mb_layout: &'a MBLayout,
}

impl<'a> BackwardContext<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_index: usize,
        inputs: Vec<ArrayView2<'a, f32>>,
        input_layouts: Vec<SampleLayout>,
        output_value: ArrayView2<'a, f32>,
        output_gradient: ArrayView2<'a, f32>,
        output_layout: SampleLayout,
        input_gradient: ArrayViewMut2<'a, f32>,
        frame: FrameRange,
        mb_layout: &'a MBLayout,
    ) -> Self {
        Self {
            input_index,
            inputs,
            input_layouts,
            output_value,
            output_gradient,
            output_layout,
            input_gradient,
            frame,
            mb_layout,
        }
    }

    pub fn input_index(&self) -> usize {
        self.input_index
    }

    pub fn input(&self, index: usize) -> ArrayView2<'a, f32> {
        frame_view(
            &self.inputs[index],
            self.input_layouts[index],
            self.frame,
            self.mb_layout,
        )
    }

    pub fn input_layout(&self, index: usize) -> SampleLayout {
        self.input_layouts[index]
    }

    pub fn output_value(&self) -> ArrayView2<'a, f32> {
        frame_view(
            &self.output_value,
            self.output_layout,
            self.frame,
            self.mb_layout,
        )
    }

    pub fn output_gradient(&self) -> ArrayView2<'a, f32> {
        frame_view(
            &self.output_gradient,
            self.output_layout,
            self.frame,
            self.mb_layout,
        )
    }

    pub fn output_gradient_full(&self) -> ArrayView2<'a, f32> {
        self.output_gradient.clone()
    }

    /// Gradient of the current input, restricted to the current frame.
    pub fn input_gradient(&mut self) -> ArrayViewMut2<'_, f32> {
        let layout = self.input_layouts[self.input_index];
        if layout.is_minibatch() {
            let cols = self.frame.columns(self.mb_layout);
            self.input_gradient.slice_mut(s![.., cols.start..cols.end])
        } else {
            self.input_gradient.view_mut()
        }
    }

    pub fn input_gradient_full(&mut self) -> &mut ArrayViewMut2<'a, f32> {
        &mut self.input_gradient
    }

    pub fn frame(&self) -> FrameRange {
        self.frame
    }

    pub fn mb_layout(&self) -> &'a MBLayout {
        self.mb_layout
    }
}

/// Capability interface every operation kind implements.
pub trait Operation {
    fn op_name(&self) -> &'static str;

    /// Layout the node declares on its own, without looking at inputs.
    /// Delay nodes use this so shape inference can get through a cycle.
    fn declared_layout(&self) -> Option<SampleLayout> {
        None
    }

    fn infer_layout(&self, inputs: &[SampleLayout]) -> Result<SampleLayout, OpError>;

    fn forward(&self, ctx: &mut ForwardContext) -> Result<(), OpError>;

    /// Accumulate the gradient for `ctx.input_index()`.
    fn backward(&self, ctx: &mut BackwardContext) -> Result<(), OpError>;

    fn output_used_in_backprop(&self) -> bool {
        true
    }

    fn input_used_in_backprop(&self, _input_index: usize) -> bool {
        true
    }

    /// Signed time offset for recurrence edges: positive reads the past.
    fn delay_offset(&self) -> Option<i32> {
        None
    }

    fn is_input(&self) -> bool {
        false
    }

    fn is_learnable(&self) -> bool {
        false
    }

    fn learning_rate_multiplier(&self) -> f32 {
        0.0
    }

    fn supports_stepping(&self) -> bool {
        true
    }

    fn on_epoch_start(&mut self) {}
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum AnyOperation {
    InputValue(InputValueOperation),
    LearnableParameter(LearnableParameterOperation),
    Binary(BinaryOperation),
    Unary(UnaryOperation),
    Times(TimesOperation),
    Delay(DelayOperation),
    SquareError(SquareErrorOperation),
    ReduceSum(ReduceSumOperation),
}

macro_rules! delegate {
    ($name:ident($($arg:ident: $ty:ty),*) -> $ret:ty) => {
        fn $name(&self, $($arg: $ty),*) -> $ret {
            match self {
                AnyOperation::InputValue(x) => x.$name($($arg),*),
                AnyOperation::LearnableParameter(x) => x.$name($($arg),*),
                AnyOperation::Binary(x) => x.$name($($arg),*),
                AnyOperation::Unary(x) => x.$name($($arg),*),
                AnyOperation::Times(x) => x.$name($($arg),*),
                AnyOperation::Delay(x) => x.$name($($arg),*),
                AnyOperation::SquareError(x) => x.$name($($arg),*),
                AnyOperation::ReduceSum(x) => x.$name($($arg),*),
            }
        }
    };
}

impl Operation for AnyOperation {
    delegate!(op_name() -> &'static str);
    delegate!(declared_layout() -> Option<SampleLayout>);
    delegate!(infer_layout(inputs: &[SampleLayout]) -> Result<SampleLayout, OpError>);
    delegate!(forward(ctx: &mut ForwardContext) -> Result<(), OpError>);
    delegate!(backward(ctx: &mut BackwardContext) -> Result<(), OpError>);
    delegate!(output_used_in_backprop() -> bool);
    delegate!(input_used_in_backprop(input_index: usize) -> bool);
    delegate!(delay_offset() -> Option<i32>);
    delegate!(is_input() -> bool);
    delegate!(is_learnable() -> bool);
    delegate!(learning_rate_multiplier() -> f32);
    delegate!(supports_stepping() -> bool);

    fn on_epoch_start(&mut self) {
        match self {
            AnyOperation::InputValue(x) => x.on_epoch_start(),
            AnyOperation::LearnableParameter(x) => x.on_epoch_start(),
            AnyOperation::Binary(x) => x.on_epoch_start(),
            AnyOperation::Unary(x) => x.on_epoch_start(),
            AnyOperation::Times(x) => x.on_epoch_start(),
            AnyOperation::Delay(x) => x.on_epoch_start(),
            AnyOperation::SquareError(x) => x.on_epoch_start(),
            AnyOperation::ReduceSum(x) => x.on_epoch_start(),
        }
    }
}

macro_rules! impl_from_operation {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for AnyOperation {
            fn from(value: $ty) -> Self {
                AnyOperation::$variant(value)
            }
        }
    };
}

impl_from_operation!(InputValue, InputValueOperation);
impl_from_operation!(LearnableParameter, LearnableParameterOperation);
impl_from_operation!(Binary, BinaryOperation);
impl_from_operation!(Unary, UnaryOperation);
impl_from_operation!(Times, TimesOperation);
impl_from_operation!(Delay, DelayOperation);
impl_from_operation!(SquareError, SquareErrorOperation);
impl_from_operation!(ReduceSum, ReduceSumOperation);
