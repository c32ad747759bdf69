use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use crate::capture::{CapturedFrame, FrameEncoder, FrameScheduler};
use crate::config::Settings;
use crate::error::SessionError;
use crate::media::{CameraSource, CaptureDevice, Facing, FrameSource};
use crate::predictor::channel::PredictorChannel;
use crate::predictor::wire::{ClientMessage, Prediction, ServerMessage};
use crate::session::{
    acquire_camera, open_channel, ConnectionStatus, SessionState, Transcript,
};

// Continuous mirror mode: camera frames stream live the moment the channel is
// connected and the camera is on; predictions replace the latest-prediction
// state and feed the sentence transcript under the dedup rule.
pub struct LiveSession {
    settings: Settings,
    camera: Arc<Mutex<CameraSource>>,
    channel: PredictorChannel,
    scheduler: FrameScheduler,
    transcript: Arc<Mutex<Transcript>>,
    state_tx: watch::Sender<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl LiveSession {
    pub fn new(settings: Settings, device: Arc<dyn CaptureDevice>) -> Result<Self, SessionError> {
        let channel = PredictorChannel::new(settings.predictor.clone())?;
        let (state_tx, _) = watch::channel(SessionState::default());
        Ok(Self {
            settings,
            camera: Arc::new(Mutex::new(CameraSource::new(device))),
            channel,
            scheduler: FrameScheduler::new(),
            transcript: Arc::new(Mutex::new(Transcript::new())),
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
        self.begin_streaming().await;
        info!("live session started");
        Ok(())
    }

    async fn begin_streaming(&mut self) {
        let Some(sender) = self.channel.sender() else {
            return;
        };

        let camera = Arc::clone(&self.camera);
        let encoder = FrameEncoder::new(self.settings.capture.jpeg_quality);
        let produce = move || {
            let mut source = camera.lock().unwrap();
            encoder.capture(&mut *source)
        };
        let consume = move |frame: CapturedFrame| {
            sender.send(&ClientMessage::Frame {
                data: frame.data,
                timestamp: frame.timestamp,
                dimensions: frame.dimensions,
            });
        };
        self.scheduler
            .start(self.settings.capture.live_interval(), produce, consume)
            .await;

        if let Some(inbound) = self.channel.take_inbound() {
            self.tasks.push(spawn_live_pump(
                inbound,
                self.state_tx.clone(),
                Arc::clone(&self.transcript),
            ));
        }
    }

    // Re-acquires the camera with the opposite facing mode. The channel is
    // left untouched.
    pub async fn toggle_facing(&mut self) -> Result<(), SessionError> {
        let facing = self.camera.lock().unwrap().facing().opposite();
        acquire_camera(&self.camera, facing, &self.state_tx).await
    }

    pub fn facing(&self) -> Facing {
        self.camera.lock().unwrap().facing()
    }

    // Empties the transcript and tells the server to drop its accumulated
    // sentence as well.
    pub fn clear(&mut self) {
        self.transcript.lock().unwrap().clear();
        self.state_tx.send_modify(|state| state.transcript.clear());
        self.channel.send(&ClientMessage::ClearSentence {
            timestamp: Utc::now().timestamp_millis(),
        });
    }

    // Tears down scheduler, then channel, then source.
    pub async fn stop(&mut self) {
        self.scheduler.stop().await;
        self.channel.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
        self.camera.lock().unwrap().release();
        self.state_tx.send_modify(|state| {
            state.connection = ConnectionStatus::Disconnected;
        });
        info!("live session stopped");
    }
}

fn spawn_live_pump(
    mut inbound: mpsc::Receiver<ServerMessage>,
    state_tx: watch::Sender<SessionState>,
    transcript: Arc<Mutex<Transcript>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = inbound.recv().await {
            match message {
                ServerMessage::PredictionUpdate { data } => {
                    let Some(prediction) = Prediction::from_update(&data) else {
                        continue;
                    };
                    let text = {
                        let mut transcript = transcript.lock().unwrap();
                        if prediction.is_meaningful() {
                            transcript.push(&prediction.label);
                        }
                        transcript.text()
                    };
                    state_tx.send_modify(|state| {
                        state.prediction = Some(prediction);
                        state.transcript = text;
                    });
                }
                // Server-accumulated text is authoritative when present.
                ServerMessage::Analysis { data } => {
                    if let Some(text) = data.text {
                        state_tx.send_modify(|state| state.transcript = text);
                    }
                }
                ServerMessage::Error { data } => {
                    if let Some(message) = data.message {
                        state_tx.send_modify(|state| state.channel_error = Some(message));
                    }
                }
                ServerMessage::Unknown => {}
            }
        }
    })
}
