use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::capture::{CapturedFrame, FrameEncoder, FrameScheduler};
use crate::config::Settings;
use crate::error::{ChannelError, SessionError};
use crate::media::{CameraSource, CaptureDevice, FrameSource};
use crate::predictor::channel::PredictorChannel;
use crate::predictor::wire::{ClientMessage, Prediction, ServerMessage};
use crate::session::{acquire_camera, open_channel, ConnectionStatus, SessionState};

// Discrete recording mode: frames are captured into a local buffer at a fixed
// rate, unaffected by network conditions, then submitted wholesale as an
// ordered batch on an explicit analyze action.
pub struct RecordingSession {
    settings: Settings,
    camera: Arc<Mutex<CameraSource>>,
    channel: PredictorChannel,
    scheduler: FrameScheduler,
    buffer: Arc<Mutex<Vec<CapturedFrame>>>,
    state_tx: watch::Sender<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl RecordingSession {
    pub fn new(settings: Settings, device: Arc<dyn CaptureDevice>) -> Result<Self, SessionError> {
        let channel = PredictorChannel::new(settings.predictor.clone())?;
        let (state_tx, _) = watch::channel(SessionState::default());
        Ok(Self {
            settings,
            camera: Arc::new(Mutex::new(CameraSource::new(device))),
            channel,
            scheduler: FrameScheduler::new(),
            buffer: Arc::new(Mutex::new(Vec::new())),
            state_tx,
            tasks: Vec::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub async fn start(&mut self) -> Result<(), SessionError> {
        let facing = self.camera.lock().unwrap().facing();
        acquire_camera(&self.camera, facing, &self.state_tx).await?;
        open_channel(
            &mut self.channel,
            &self.settings.predictor,
            &self.state_tx,
            &mut self.tasks,
        )
        .await?;
        if let Some(inbound) = self.channel.take_inbound() {
            self.tasks
                .push(spawn_result_pump(inbound, self.state_tx.clone()));
        }
        info!("recording session started");
        Ok(())
    }

    // Starts a fresh recording; any previous buffer content is discarded.
    pub async fn start_recording(&mut self) {
        self.buffer.lock().unwrap().clear();
        self.state_tx.send_modify(|state| {
            state.recording = true;
            state.recorded_frames = 0;
            state.prediction = None;
            state.processing = false;
        });

        let camera = Arc::clone(&self.camera);
        let encoder = FrameEncoder::new(self.settings.capture.jpeg_quality);
        let produce = move || {
            let mut source = camera.lock().unwrap();
            encoder.capture(&mut *source)
        };

        let buffer = Arc::clone(&self.buffer);
        let state_tx = self.state_tx.clone();
        let consume = move |frame: CapturedFrame| {
            let count = {
                let mut frames = buffer.lock().unwrap();
                frames.push(frame);
                frames.len()
            };
            state_tx.send_modify(|state| state.recorded_frames = count);
        };

        self.scheduler
            .start(self.settings.capture.recording_interval(), produce, consume)
            .await;
        info!("recording started");
    }

    pub async fn stop_recording(&mut self) {
        self.scheduler.stop().await;
        self.state_tx.send_modify(|state| state.recording = false);
        info!(
            frames = self.buffer.lock().unwrap().len(),
            "recording stopped"
        );
    }

    // Submits the whole buffer as an ordered batch, pacing the sends so the
    // channel is not saturated. The session stays `processing` until a result
    // arrives or `reset` cancels it.
    pub async fn analyze(&mut self) -> Result<usize, SessionError> {
        self.stop_recording().await;
        let frames = self.buffer.lock().unwrap().clone();
        if frames.is_empty() {
            return Ok(0);
        }

        self.state_tx.send_modify(|state| {
            state.processing = true;
            state.prediction = None;
        });

        let pause = self.settings.recording.inter_send_pause();
        let mut sent = 0;
        for message in recording_batch(&frames) {
            if self.channel.send(&message) {
                sent += 1;
            } else {
                warn!("recording frame dropped, channel not open");
            }
            tokio::time::sleep(pause).await;
        }

        if sent == 0 {
            let error = ChannelError::Closed;
            self.state_tx.send_modify(|state| {
                state.processing = false;
                state.channel_error = Some(error.to_string());
            });
            return Err(error.into());
        }
        info!(frames = sent, "recording submitted for analysis");
        Ok(sent)
    }

    // Clears buffer and result state in a single transition, so observers
    // never see a half-reset session.
    pub async fn reset(&mut self) {
        self.scheduler.stop().await;
        self.buffer.lock().unwrap().clear();
        self.state_tx.send_modify(|state| {
            state.recording = false;
            state.processing = false;
            state.prediction = None;
            state.recorded_frames = 0;
        });
        info!("recording reset");
    }

    pub async fn stop(&mut self) {
        self.scheduler.stop().await;
        self.channel.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.camera.lock().unwrap().release();
        self.state_tx.send_modify(|state| {
            state.connection = ConnectionStatus::Disconnected;
            state.recording = false;
            state.processing = false;
        });
        info!("recording session stopped");
    }
}

// Batch metadata lets the remote side reconstruct order: ascending indices,
// the total count, and a completion flag on the final frame only.
pub fn recording_batch(frames: &[CapturedFrame]) -> Vec<ClientMessage> {
    let total = frames.len();
    frames
        .iter()
        .enumerate()
        .map(|(index, frame)| ClientMessage::RecordingFrame {
            data: frame.data.clone(),
            timestamp: frame.timestamp,
            frame_index: index,
            total_frames: total,
            is_complete: index + 1 == total,
        })
        .collect()
}

fn spawn_result_pump(
    mut inbound: mpsc::Receiver<ServerMessage>,
    state_tx: watch::Sender<SessionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            match message {
                ServerMessage::PredictionUpdate { data } => {
                    let Some(prediction) = Prediction::from_update(&data) else {
                        continue;
                    };
                    state_tx.send_modify(|state| {
                        state.prediction = Some(prediction);
                        state.processing = false;
                    });
                }
                ServerMessage::Analysis { data } => {
                    if data.text.is_some() || data.status.is_some() {
                        state_tx.send_modify(|state| state.processing = false);
                    }
                }
                ServerMessage::Error { data } => {
                    if let Some(message) = data.message {
                        state_tx.send_modify(|state| {
                            state.channel_error = Some(message);
                            state.processing = false;
                        });
                    }
                }
                ServerMessage::Unknown => {}
            }
        }
    })
}
