pub mod config;
pub mod graph;
pub mod mb_layout;
pub mod network;
pub mod ops;

pub use config::NetworkConfig;
pub use mb_layout::{FrameRange, MBLayout, MBLayoutError};
pub use network::{
    ComputationNetwork, ComputationNode, ErrorKind, LoopId, NetworkError, NodeGroup, NodeId,
    PlanStep,
};
pub use ops::{AnyOperation, OpError, Operation, SampleLayout};
