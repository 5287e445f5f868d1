use crate::mb_layout::FrameRange;
use crate::network::NodeId;
use ndarray::ArrayView2;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
pub enum Pass {
    Forward,
    Backward,
}

pub trait NetworkObserver {
    /// Called once per compute step: once for a whole-batch node, once per time step for a loop member.
    fn on_node_executed(
        &mut self,
        node: NodeId,
        name: &str,
        frame: FrameRange,
        pass: Pass,
        start_instant: Instant,
        end_instant: Instant,
    );
    fn on_value_assigned(&mut self, node: NodeId, name: &str, value: ArrayView2<f32>);
}

impl NetworkObserver for () {
    fn on_node_executed(
        &mut self,
        _node: NodeId,
        _name: &str,
        _frame: FrameRange,
        _pass: Pass,
        _start_instant: Instant,
        _end_instant: Instant,
    ) {
    }
    fn on_value_assigned(&mut self, _node: NodeId, _name: &str, _value: ArrayView2<f32>) {}
}
