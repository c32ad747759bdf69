use std::sync::Arc;

use image::DynamicImage;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::media::{Dimensions, FrameSource, ReadyState, SourceKind};

// Boundary to clip decoding. Full container/codec handling is out of scope;
// a decoder turns a binary blob into decoded stills plus metadata.
pub trait ClipDecoder: Send + Sync {
    fn decode(&self, blob: &[u8]) -> Result<DecodedClip, SourceError>;
}

#[derive(Debug)]
pub struct DecodedClip {
    pub frames: Vec<DynamicImage>,
    pub frame_rate: f64,
    pub dimensions: Dimensions,
}

impl DecodedClip {
    pub fn duration(&self) -> f64 {
        self.frames.len() as f64 / self.frame_rate
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClipInfo {
    pub duration: f64,
    pub dimensions: Dimensions,
    pub frame_count: usize,
}

// A loaded clip file behaving like a video element: programmatic play, pause
// and seek, with the position advancing on the tokio clock while playing.
pub struct ClipSource {
    clip: Option<DecodedClip>,
    state: ReadyState,
    playing: bool,
    // Position in seconds at the moment playback last paused or sought.
    position: f64,
    resumed_at: Option<Instant>,
}

impl ClipSource {
    pub fn new() -> Self {
        Self {
            clip: None,
            state: ReadyState::Idle,
            playing: false,
            position: 0.0,
            resumed_at: None,
        }
    }

    // Decodes off the runtime, then installs the result. Decode failures keep
    // their typed kind.
    pub async fn load(
        &mut self,
        decoder: Arc<dyn ClipDecoder>,
        blob: Vec<u8>,
    ) -> Result<ClipInfo, SourceError> {
        self.release();
        let clip = tokio::task::spawn_blocking(move || decoder.decode(&blob))
            .await
            .map_err(|e| SourceError::Unknown(e.to_string()))??;
        Ok(self.install(clip))
    }

    pub fn install(&mut self, clip: DecodedClip) -> ClipInfo {
        self.release();
        let info = ClipInfo {
            duration: clip.duration(),
            dimensions: clip.dimensions,
            frame_count: clip.frames.len(),
        };
        info!(
            duration = info.duration,
            frames = info.frame_count,
            "clip loaded"
        );
        self.clip = Some(clip);
        self.state = ReadyState::Ready;
        self.playing = false;
        self.position = 0.0;
        self.resumed_at = None;
        info
    }

    pub fn info(&self) -> Option<ClipInfo> {
        self.clip.as_ref().map(|clip| ClipInfo {
            duration: clip.duration(),
            dimensions: clip.dimensions,
            frame_count: clip.frames.len(),
        })
    }

    pub fn duration(&self) -> Option<f64> {
        self.clip.as_ref().map(DecodedClip::duration)
    }

    pub fn play(&mut self) {
        if self.clip.is_none() || self.state == ReadyState::Error {
            return;
        }
        if self.state == ReadyState::Ended {
            // Playing past the end restarts from the beginning.
            self.position = 0.0;
            self.state = ReadyState::Ready;
        }
        if !self.playing {
            self.playing = true;
            self.resumed_at = Some(Instant::now());
            debug!(position = self.position, "clip playback started");
        }
    }

    pub fn pause(&mut self) {
        if self.playing {
            self.position = self.raw_position();
            self.playing = false;
            self.resumed_at = None;
            debug!(position = self.position, "clip playback paused");
        }
    }

    pub fn seek(&mut self, seconds: f64) {
        let Some(duration) = self.duration() else {
            return;
        };
        self.position = seconds.clamp(0.0, duration);
        if self.playing {
            self.resumed_at = Some(Instant::now());
        }
        if self.position < duration && self.state == ReadyState::Ended {
            self.state = ReadyState::Ready;
        }
    }

    pub fn is_playing(&self) -> bool {
        self.playing
    }

    // Refreshes position and flips to Ended once playback passes the
    // duration. Called on every capture tick.
    pub fn poll(&mut self) {
        let Some(duration) = self.duration() else {
            return;
        };
        let position = self.raw_position();
        if position >= duration && self.state == ReadyState::Ready {
            self.position = duration;
            self.playing = false;
            self.resumed_at = None;
            self.state = ReadyState::Ended;
            info!("clip playback ended");
        }
    }

    fn raw_position(&self) -> f64 {
        let elapsed = self
            .resumed_at
            .filter(|_| self.playing)
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);
        let position = self.position + elapsed;
        match self.duration() {
            Some(duration) => position.min(duration),
            None => position,
        }
    }
}

impl Default for ClipSource {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameSource for ClipSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Clip
    }

    fn ready_state(&self) -> ReadyState {
        self.state
    }

    fn dimensions(&self) -> Option<Dimensions> {
        self.clip.as_ref().map(|clip| clip.dimensions)
    }

    fn current_frame(&mut self) -> Option<DynamicImage> {
        self.poll();
        if self.state != ReadyState::Ready || !self.playing {
            return None;
        }
        let position = self.raw_position();
        let clip = self.clip.as_ref()?;
        let index = ((position * clip.frame_rate) as usize).min(clip.frames.len().saturating_sub(1));
        clip.frames.get(index).cloned()
    }

    fn playback_position(&self) -> Option<f64> {
        self.clip.as_ref().map(|_| self.raw_position())
    }

    fn release(&mut self) {
        if self.clip.take().is_some() {
            debug!("clip discarded");
        }
        self.state = ReadyState::Idle;
        self.playing = false;
        self.position = 0.0;
        self.resumed_at = None;
    }
}

const JPEG_SOI: [u8; 3] = [0xFF, 0xD8, 0xFF];

// Decoder for concatenated-JPEG (MJPEG style) blobs: splits on start-of-image
// markers and decodes each still with the image crate.
pub struct MotionJpegDecoder {
    frame_rate: f64,
}

impl MotionJpegDecoder {
    pub fn new(frame_rate: f64) -> Self {
        Self { frame_rate }
    }
}

impl Default for MotionJpegDecoder {
    fn default() -> Self {
        Self::new(10.0)
    }
}

impl ClipDecoder for MotionJpegDecoder {
    fn decode(&self, blob: &[u8]) -> Result<DecodedClip, SourceError> {
        let starts = soi_offsets(blob);
        if starts.is_empty() {
            return Err(SourceError::Decode("no JPEG frames found".to_string()));
        }

        let mut frames = Vec::with_capacity(starts.len());
        for (i, &start) in starts.iter().enumerate() {
            let end = starts.get(i + 1).copied().unwrap_or(blob.len());
            match image::load_from_memory(&blob[start..end]) {
                Ok(frame) => frames.push(frame),
                Err(e) => warn!(frame = i, "skipping undecodable JPEG frame: {e}"),
            }
        }
        if frames.is_empty() {
            return Err(SourceError::Decode(
                "no decodable JPEG frames in file".to_string(),
            ));
        }

        let dimensions = Dimensions::new(frames[0].width(), frames[0].height());
        Ok(DecodedClip {
            frames,
            frame_rate: self.frame_rate,
            dimensions,
        })
    }
}

fn soi_offsets(blob: &[u8]) -> Vec<usize> {
    let mut offsets = Vec::new();
    let mut i = 0;
    while i + JPEG_SOI.len() <= blob.len() {
        if blob[i..i + JPEG_SOI.len()] == JPEG_SOI {
            offsets.push(i);
            // Skip past the marker so embedded FF bytes are not re-matched.
            i += JPEG_SOI.len();
        } else {
            i += 1;
        }
    }
    offsets
}
