pub mod camera;
pub mod clip;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

pub use camera::{
    CameraConstraints, CameraFeed, CameraSource, CaptureDevice, Facing, TestPatternCamera,
};
pub use clip::{ClipDecoder, ClipInfo, ClipSource, DecodedClip, MotionJpegDecoder};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn is_known(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Camera,
    Clip,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReadyState {
    #[default]
    Idle,
    Ready,
    Ended,
    Error,
}

// A playable stream of raw image frames, either a live camera feed or a
// loaded clip file. Both feed the same capture pipeline.
pub trait FrameSource: Send {
    fn kind(&self) -> SourceKind;

    fn ready_state(&self) -> ReadyState;

    // Native dimensions, once metadata is known.
    fn dimensions(&self) -> Option<Dimensions>;

    fn snapshot_capable(&self) -> bool {
        self.dimensions().is_some()
    }

    // The current raw frame, or None while idle, paused or ended.
    fn current_frame(&mut self) -> Option<DynamicImage>;

    // Source-relative playback position in seconds. Clip sources only.
    fn playback_position(&self) -> Option<f64> {
        None
    }

    // Idempotent. Stops the underlying feed and discards playback state;
    // safe to call before any acquisition and any number of times.
    fn release(&mut self);
}
