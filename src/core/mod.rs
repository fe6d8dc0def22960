//! Core stacking modules

pub mod estimator;
pub mod stack;
pub mod tiles;
pub mod distributed;

// Re-export main types
pub use estimator::{PixelEstimator, EstimatorTrace, Termination};
pub use stack::{
    ObservationStack, StackRateEngine, StackRateOutput, ExecutionStrategy, SerialStrategy,
    RowParallelStrategy, PixelParallelStrategy, DistributedStrategy, apply_max_sigma_mask,
};
pub use tiles::{Tile, TileGrid, TileAssignment};
pub use distributed::{Communicator, ChannelCommunicator, ClusterOptions, Message, Envelope, TileResult, run_cluster};
