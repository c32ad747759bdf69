use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use tracing::warn;

use crate::media::{Dimensions, FrameSource, ReadyState};

// Used when the source reports no usable metadata.
pub const FALLBACK_DIMENSIONS: Dimensions = Dimensions::new(640, 480);

// A single sampled still, ready for the wire. Ephemeral: sent immediately or
// appended to a recording buffer, never retained otherwise.
#[derive(Clone, Debug, PartialEq)]
pub struct CapturedFrame {
    // Base64 JPEG payload. Never empty when produced.
    pub data: String,
    pub dimensions: Dimensions,
    // Capture wall-clock time, epoch milliseconds.
    pub timestamp: i64,
    // Source-relative playback time in seconds, clip sources only.
    pub playback_time: Option<f64>,
}

// Rasterizes the current frame of a source into a compressed still. The
// quality is fixed low enough to bound payload size against the send cadence.
pub struct FrameEncoder {
    quality: u8,
}

impl FrameEncoder {
    pub fn new(quality: u8) -> Self {
        Self { quality }
    }

    // None when the source is not ready, paused or ended. A transient encode
    // failure is also None, with a logged diagnostic; one bad frame must not
    // take the capture timer down.
    pub fn capture(&self, source: &mut dyn FrameSource) -> Option<CapturedFrame> {
        if source.ready_state() != ReadyState::Ready {
            return None;
        }
        let playback_time = source.playback_position();
        let image = source.current_frame()?;

        let mut jpeg = Vec::new();
        if let Err(e) = image.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, self.quality))
        {
            warn!("dropping frame that failed to encode: {e}");
            return None;
        }

        let dimensions = source
            .dimensions()
            .filter(Dimensions::is_known)
            .unwrap_or(FALLBACK_DIMENSIONS);

        Some(CapturedFrame {
            data: STANDARD.encode(&jpeg),
            dimensions,
            timestamp: Utc::now().timestamp_millis(),
            playback_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SourceKind;
    use image::{DynamicImage, RgbImage};

    struct FakeSource {
        state: ReadyState,
        dimensions: Option<Dimensions>,
        frame: Option<DynamicImage>,
        position: Option<f64>,
    }

    impl FakeSource {
        fn ready(width: u32, height: u32) -> Self {
            Self {
                state: ReadyState::Ready,
                dimensions: Some(Dimensions::new(width, height)),
                frame: Some(DynamicImage::ImageRgb8(RgbImage::from_pixel(
                    width,
                    height,
                    image::Rgb([10, 20, 30]),
                ))),
                position: None,
            }
        }
    }

    impl FrameSource for FakeSource {
        fn kind(&self) -> SourceKind {
            SourceKind::Camera
        }

        fn ready_state(&self) -> ReadyState {
            self.state
        }

        fn dimensions(&self) -> Option<Dimensions> {
            self.dimensions
        }

        fn current_frame(&mut self) -> Option<DynamicImage> {
            self.frame.clone()
        }

        fn playback_position(&self) -> Option<f64> {
            self.position
        }

        fn release(&mut self) {
            self.state = ReadyState::Idle;
        }
    }

    #[test]
    fn capture_produces_a_nonempty_payload() {
        let encoder = FrameEncoder::new(70);
        let mut source = FakeSource::ready(32, 24);

        let frame = encoder.capture(&mut source).expect("frame");
        assert!(!frame.data.is_empty());
        assert_eq!(frame.dimensions, Dimensions::new(32, 24));
        assert!(frame.timestamp > 0);
        assert!(frame.playback_time.is_none());
    }

    #[test]
    fn unready_sources_yield_nothing() {
        let encoder = FrameEncoder::new(70);

        let mut idle = FakeSource::ready(32, 24);
        idle.state = ReadyState::Idle;
        assert!(encoder.capture(&mut idle).is_none());

        let mut ended = FakeSource::ready(32, 24);
        ended.state = ReadyState::Ended;
        assert!(encoder.capture(&mut ended).is_none());

        // Ready but momentarily frameless, e.g. a paused clip.
        let mut frameless = FakeSource::ready(32, 24);
        frameless.frame = None;
        assert!(encoder.capture(&mut frameless).is_none());
    }

    #[test]
    fn missing_metadata_falls_back_to_default_dimensions() {
        let encoder = FrameEncoder::new(70);
        let mut source = FakeSource::ready(32, 24);
        source.dimensions = Some(Dimensions::new(0, 0));
        let frame = encoder.capture(&mut source).expect("frame");
        assert_eq!(frame.dimensions, FALLBACK_DIMENSIONS);

        source.dimensions = None;
        let frame = encoder.capture(&mut source).expect("frame");
        assert_eq!(frame.dimensions, FALLBACK_DIMENSIONS);
    }

    #[test]
    fn playback_time_is_carried_for_clip_sources() {
        let encoder = FrameEncoder::new(70);
        let mut source = FakeSource::ready(32, 24);
        source.position = Some(1.25);
        let frame = encoder.capture(&mut source).expect("frame");
        assert_eq!(frame.playback_time, Some(1.25));
    }
}
