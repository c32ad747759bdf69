use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use image::{DynamicImage, RgbImage};
use rand::Rng;
use tracing::{debug, info};

use crate::error::SourceError;
use crate::media::{Dimensions, FrameSource, ReadyState, SourceKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Facing {
    User,
    Environment,
}

impl Facing {
    pub fn opposite(self) -> Self {
        match self {
            Facing::User => Facing::Environment,
            Facing::Environment => Facing::User,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct CameraConstraints {
    pub facing: Facing,
    pub ideal: Dimensions,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            facing: Facing::User,
            ideal: Dimensions::new(1280, 720),
        }
    }
}

// Boundary to the platform capture API. Requesting access may suspend on a
// permission prompt, hence async.
#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn request_access(
        &self,
        constraints: CameraConstraints,
    ) -> Result<Box<dyn CameraFeed>, SourceError>;
}

// A granted device feed. Exactly one feed may be live per source; `stop`
// returns the hardware handle.
pub trait CameraFeed: Send {
    fn dimensions(&self) -> Dimensions;

    fn latest_frame(&mut self) -> Option<DynamicImage>;

    fn stop(&mut self);
}

pub struct CameraSource {
    device: Arc<dyn CaptureDevice>,
    feed: Option<Box<dyn CameraFeed>>,
    facing: Facing,
    state: ReadyState,
}

impl CameraSource {
    pub fn new(device: Arc<dyn CaptureDevice>) -> Self {
        Self {
            device,
            feed: None,
            facing: Facing::User,
            state: ReadyState::Idle,
        }
    }

    // Releases any prior feed before requesting the new one, so two device
    // handles are never held concurrently.
    pub async fn acquire(&mut self, facing: Facing) -> Result<(), SourceError> {
        self.release();
        let constraints = CameraConstraints {
            facing,
            ..CameraConstraints::default()
        };
        match self.device.request_access(constraints).await {
            Ok(feed) => {
                self.install(feed, facing);
                Ok(())
            }
            Err(e) => {
                self.state = ReadyState::Error;
                Err(e)
            }
        }
    }

    pub async fn toggle_facing(&mut self) -> Result<(), SourceError> {
        self.acquire(self.facing.opposite()).await
    }

    // Installs an already granted feed. Used when the access request has to
    // happen outside a lock on the source.
    pub fn install(&mut self, feed: Box<dyn CameraFeed>, facing: Facing) {
        self.release();
        debug!(?facing, "camera feed installed");
        self.feed = Some(feed);
        self.facing = facing;
        self.state = ReadyState::Ready;
    }

    pub fn facing(&self) -> Facing {
        self.facing
    }

    pub fn device(&self) -> Arc<dyn CaptureDevice> {
        Arc::clone(&self.device)
    }
}

impl FrameSource for CameraSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Camera
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn dimensions(&self) -> Option<Dimensions> {
        self.feed.as_ref().map(|feed| feed.dimensions())
    }

    fn current_frame(&mut self) -> Option<DynamicImage> {
        if self.state != ReadyState::Ready {
            return None;
        }
        self.feed.as_mut().and_then(|feed| feed.latest_frame())
    }

    fn release(&mut self) {
        if let Some(mut feed) = self.feed.take() {
            feed.stop();
            info!("camera feed released");
        }
        self.state = ReadyState::Idle;
    }
}

// Synthetic camera producing a moving gradient pattern, so the pipeline runs
// end to end without hardware. Counts live feeds to surface double-acquire
// bugs in tests.
pub struct TestPatternCamera {
    dimensions: Dimensions,
    live_feeds: Arc<AtomicUsize>,
}

impl TestPatternCamera {
    pub fn new(dimensions: Dimensions) -> Self {
        Self {
            dimensions,
            live_feeds: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn live_feeds(&self) -> usize {
        self.live_feeds.load(Ordering::SeqCst)
    }
}

impl Default for TestPatternCamera {
    fn default() -> Self {
        Self::new(Dimensions::new(640, 480))
    }
}

#[async_trait]
impl CaptureDevice for TestPatternCamera {
    async fn request_access(
        &self,
        _constraints: CameraConstraints,
    ) -> Result<Box<dyn CameraFeed>, SourceError> {
        self.live_feeds.fetch_add(1, Ordering::SeqCst);
        let phase = rand::rng().random_range(0..self.dimensions.width.max(1));
        Ok(Box::new(TestPatternFeed {
            dimensions: self.dimensions,
            live_feeds: Arc::clone(&self.live_feeds),
            tick: phase,
            stopped: false,
        }))
    }
}

struct TestPatternFeed {
    dimensions: Dimensions,
    live_feeds: Arc<AtomicUsize>,
    tick: u32,
    stopped: bool,
}

impl CameraFeed for TestPatternFeed {
    fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    fn latest_frame(&mut self) -> Option<DynamicImage> {
        if self.stopped {
            return None;
        }
        self.tick = self.tick.wrapping_add(1);
        let (w, h) = (self.dimensions.width, self.dimensions.height);
        let tick = self.tick;
        let image = RgbImage::from_fn(w, h, |x, y| {
            let shifted = x.wrapping_add(tick) % w.max(1);
            image::Rgb([(shifted % 256) as u8, (y % 256) as u8, (tick % 256) as u8])
        });
        Some(DynamicImage::ImageRgb8(image))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live_feeds.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl Drop for TestPatternFeed {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct DeniedDevice;

    #[async_trait]
    impl CaptureDevice for DeniedDevice {
        async fn request_access(
            &self,
            _constraints: CameraConstraints,
        ) -> Result<Box<dyn CameraFeed>, SourceError> {
            Err(SourceError::PermissionDenied)
        }
    }

    #[tokio::test]
    async fn release_is_idempotent_and_reacquirable() {
        let device = Arc::new(TestPatternCamera::default());
        let mut source = CameraSource::new(Arc::clone(&device) as Arc<dyn CaptureDevice>);

        // Releasing before any acquisition must be harmless.
        source.release();
        source.release();
        assert_eq!(source.ready_state(), ReadyState::Idle);

        source.acquire(Facing::User).await.expect("acquire");
        assert_eq!(source.ready_state(), ReadyState::Ready);
        assert!(source.snapshot_capable());

        source.release();
        source.release();
        assert_eq!(source.ready_state(), ReadyState::Idle);
        assert_eq!(device.live_feeds(), 0);

        source.acquire(Facing::User).await.expect("reacquire");
        assert_eq!(source.ready_state(), ReadyState::Ready);
    }

    #[tokio::test]
    async fn facing_toggle_never_holds_two_feeds() {
        let device = Arc::new(TestPatternCamera::default());
        let mut source = CameraSource::new(Arc::clone(&device) as Arc<dyn CaptureDevice>);

        source.acquire(Facing::User).await.expect("acquire");
        assert_eq!(device.live_feeds(), 1);

        source.toggle_facing().await.expect("toggle");
        assert_eq!(source.facing(), Facing::Environment);
        assert_eq!(device.live_feeds(), 1);

        source.toggle_facing().await.expect("toggle back");
        assert_eq!(source.facing(), Facing::User);
        assert_eq!(device.live_feeds(), 1);
    }

    #[tokio::test]
    async fn acquisition_failure_keeps_the_error_kind() {
        let mut source = CameraSource::new(Arc::new(DeniedDevice));
        let err = source.acquire(Facing::User).await.unwrap_err();
        assert!(matches!(err, SourceError::PermissionDenied));
        assert_eq!(source.ready_state(), ReadyState::Error);

        // Still recoverable: release and the source is idle again.
        source.release();
        assert_eq!(source.ready_state(), ReadyState::Idle);
    }

    #[tokio::test]
    async fn test_pattern_frames_are_produced() {
        let device = Arc::new(TestPatternCamera::new(Dimensions::new(32, 24)));
        let mut source = CameraSource::new(device as Arc<dyn CaptureDevice>);
        source.acquire(Facing::User).await.expect("acquire");

        let frame = source.current_frame().expect("frame");
        assert_eq!(frame.width(), 32);
        assert_eq!(frame.height(), 24);
    }
}
