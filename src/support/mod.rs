//! Shared support utilities

pub mod ocpp_frame;
pub mod shutdown;

pub use ocpp_frame::{FrameError, OcppFrame};
pub use shutdown::ShutdownSignal;
