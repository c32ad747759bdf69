pub mod encoder;
pub mod scheduler;

pub use encoder::{CapturedFrame, FrameEncoder, FALLBACK_DIMENSIONS};
pub use scheduler::FrameScheduler;
