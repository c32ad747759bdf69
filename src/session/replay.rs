use std::pin::Pin;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::capture::{CapturedFrame, FrameEncoder, FrameScheduler};
use crate::config::{ReplaySettings, Settings};
use crate::error::{SessionError, SourceError};
use crate::media::{ClipDecoder, ClipInfo, ClipSource, FrameSource, ReadyState};
use crate::predictor::channel::{ChannelSender, PredictorChannel};
use crate::predictor::wire::{ClientMessage, Prediction, ServerMessage};
use crate::session::{open_channel, ConnectionStatus, SessionState};

const SESSION_TYPE: &str = "video_upload";

enum ReplayEvent {
    Ended,
}

// Clip replay mode: the loaded file plays back programmatically while frames
// are sampled and streamed. Completion comes from whichever fires first, the
// clip reporting end of stream or a prediction crossing the early-stop
// heuristic, and `reprocess` restarts the whole pipeline without reloading.
pub struct ReplaySession {
    settings: Settings,
    decoder: Arc<dyn ClipDecoder>,
    clip: Arc<Mutex<ClipSource>>,
    channel: PredictorChannel,
    scheduler: FrameScheduler,
    state_tx: watch::Sender<SessionState>,
    tasks: Vec<JoinHandle<()>>,
}

impl ReplaySession {
    pub fn new(settings: Settings, decoder: Arc<dyn ClipDecoder>) -> Result<Self, SessionError> {
        let channel = PredictorChannel::new(settings.predictor.clone())?;
        let (state_tx, _) = watch::channel(SessionState::default());
        Ok(Self {
            settings,
            decoder,
            clip: Arc::new(Mutex::new(ClipSource::new())),
            channel,
            scheduler: FrameScheduler::new(),
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

    // Decodes the blob off the runtime and installs it, replacing any prior
    // clip. Decode failures keep their typed kind and land in the source
    // error slot.
    pub async fn load(&mut self, blob: Vec<u8>) -> Result<ClipInfo, SessionError> {
        let decoder = Arc::clone(&self.decoder);
        let decoded = tokio::task::spawn_blocking(move || decoder.decode(&blob))
            .await
            .map_err(|e| SourceError::Unknown(e.to_string()))?;
        match decoded {
            Ok(clip) => {
                let info = self.clip.lock().unwrap().install(clip);
                self.state_tx.send_modify(|state| state.source_error = None);
                Ok(info)
            }
            Err(e) => {
                self.state_tx
                    .send_modify(|state| state.source_error = Some(e.to_string()));
                Err(e.into())
            }
        }
    }

    pub async fn start(&mut self) -> Result<(), SessionError> {
        let info = self
            .clip
            .lock()
            .unwrap()
            .info()
            .ok_or_else(|| SessionError::Other("no clip loaded".to_string()))?;

        self.state_tx.send_modify(|state| {
            state.completed = false;
            state.processing = true;
            state.progress = 0.0;
            state.prediction = None;
        });
        if let Err(e) = open_channel(
            &mut self.channel,
            &self.settings.predictor,
            &self.state_tx,
            &mut self.tasks,
        )
        .await
        {
            self.state_tx.send_modify(|state| state.processing = false);
            return Err(e);
        }

        // Metadata preamble, then playback from the top.
        self.channel.send(&ClientMessage::VideoMetadata {
            duration: info.duration,
            dimensions: info.dimensions,
            session_type: SESSION_TYPE.to_string(),
        });
        {
            let mut clip = self.clip.lock().unwrap();
            clip.seek(0.0);
            clip.play();
        }

        let (event_tx, event_rx) = mpsc::channel(4);
        self.begin_sampling(event_tx).await;

        if let Some(inbound) = self.channel.take_inbound() {
            self.tasks.push(tokio::spawn(run_replay_pump(
                inbound,
                event_rx,
                self.state_tx.clone(),
                Arc::clone(&self.clip),
                self.channel.sender(),
                self.settings.replay.clone(),
            )));
        }
        info!(duration = info.duration, "replay started");
        Ok(())
    }

    async fn begin_sampling(&mut self, event_tx: mpsc::Sender<ReplayEvent>) {
        let Some(sender) = self.channel.sender() else {
            return;
        };
        let duration = self.clip.lock().unwrap().duration().unwrap_or(0.0);

        let clip = Arc::clone(&self.clip);
        let encoder = FrameEncoder::new(self.settings.capture.jpeg_quality);
        let mut last_time = -1.0;
        let mut ended_notified = false;
        let produce = move || {
            let mut source = clip.lock().unwrap();
            source.poll();
            if source.ready_state() == ReadyState::Ended {
                if !ended_notified {
                    ended_notified = true;
                    let _ = event_tx.try_send(ReplayEvent::Ended);
                }
                return None;
            }
            // Gated by playback position: frames are never captured faster
            // than the clip advances.
            let position = source.playback_position().unwrap_or(0.0);
            if position <= last_time {
                return None;
            }
            let frame = encoder.capture(&mut *source)?;
            last_time = position;
            Some(frame)
        };

        let state_tx = self.state_tx.clone();
        let consume = move |frame: CapturedFrame| {
            let current_time = frame.playback_time.unwrap_or(0.0);
            sender.send(&ClientMessage::VideoFrame {
                data: frame.data,
                timestamp: frame.timestamp,
                dimensions: frame.dimensions,
                current_time,
            });
            if duration > 0.0 {
                state_tx.send_modify(|state| {
                    state.progress = (current_time / duration * 100.0).min(100.0);
                });
            }
        };

        self.scheduler
            .start(self.settings.capture.replay_interval(), produce, consume)
            .await;
    }

    // Tears down and restarts the whole pipeline, fresh channel and session
    // id included, without requiring a new file load.
    pub async fn reprocess(&mut self) -> Result<(), SessionError> {
        info!("reprocessing clip");
        self.teardown().await;
        self.state_tx.send_modify(|state| {
            state.prediction = None;
            state.progress = 0.0;
            state.completed = false;
            state.processing = false;
            state.channel_error = None;
        });
        self.start().await
    }

    pub async fn stop(&mut self) {
        self.channel.send(&ClientMessage::ProcessingStopped {
            timestamp: Utc::now().timestamp_millis(),
        });
        self.teardown().await;
        self.state_tx.send_modify(|state| {
            state.processing = false;
            state.connection = ConnectionStatus::Disconnected;
        });
        info!("replay stopped");
    }

    async fn teardown(&mut self) {
        self.scheduler.stop().await;
        self.clip.lock().unwrap().pause();
        self.channel.close().await;
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

async fn run_replay_pump(
    mut inbound: mpsc::Receiver<ServerMessage>,
    mut events: mpsc::Receiver<ReplayEvent>,
    state_tx: watch::Sender<SessionState>,
    clip: Arc<Mutex<ClipSource>>,
    sender: Option<ChannelSender>,
    replay: ReplaySettings,
) {
    let mut settle: Option<Pin<Box<tokio::time::Sleep>>> = None;
    let mut events_open = true;
    loop {
        tokio::select! {
            message = inbound.recv() => match message {
                Some(ServerMessage::PredictionUpdate { data }) => {
                    let Some(prediction) = Prediction::from_update(&data) else {
                        continue;
                    };
                    let winning = prediction.is_meaningful()
                        && prediction.confidence > replay.early_stop_confidence;
                    state_tx.send_modify(|state| state.prediction = Some(prediction));
                    if winning && settle.is_none() {
                        debug!("early-stop confidence reached, settling");
                        settle = Some(Box::pin(tokio::time::sleep(replay.settle_delay())));
                    }
                }
                Some(ServerMessage::Error { data }) => {
                    if let Some(message) = data.message {
                        state_tx.send_modify(|state| state.channel_error = Some(message));
                    }
                }
                Some(_) => {}
                None => break,
            },
            event = events.recv(), if events_open => match event {
                Some(ReplayEvent::Ended) => {
                    if let Some(sender) = &sender {
                        sender.send(&ClientMessage::VideoEnded {
                            timestamp: Utc::now().timestamp_millis(),
                        });
                    }
                    finish(&state_tx, &clip);
                    break;
                }
                None => events_open = false,
            },
            () = async { settle.as_mut().expect("settle timer").await }, if settle.is_some() => {
                finish(&state_tx, &clip);
                break;
            }
        }
    }
}

fn finish(state_tx: &watch::Sender<SessionState>, clip: &Arc<Mutex<ClipSource>>) {
    clip.lock().unwrap().pause();
    state_tx.send_modify(|state| {
        state.completed = true;
        state.processing = false;
    });
    info!("replay completed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::clip::tests::mjpeg_blob;
    use crate::media::MotionJpegDecoder;
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpListener;

    fn test_settings(addr: std::net::SocketAddr) -> Settings {
        let mut settings = Settings::default();
        settings.predictor.endpoint = format!("tcp://{addr}");
        settings.capture.replay_interval_ms = 10;
        settings.replay.settle_ms = 100;
        settings
    }

    async fn wait_for<F>(rx: &mut watch::Receiver<SessionState>, mut predicate: F) -> SessionState
    where
        F: FnMut(&SessionState) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                {
                    let state = rx.borrow_and_update();
                    if predicate(&state) {
                        return state.clone();
                    }
                }
                rx.changed().await.expect("state stream ended");
            }
        })
        .await
        .expect("condition not reached")
    }

    // Predictor double: on every connection, optionally replies to the first
    // video_frame with a confident prediction, and records session ids.
    fn spawn_predictor(
        listener: TcpListener,
        reply_confidence: Option<f64>,
    ) -> mpsc::UnboundedReceiver<String> {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let session_tx = session_tx.clone();
                tokio::spawn(async move {
                    let (read_half, mut write_half) = socket.into_split();
                    let mut lines = BufReader::new(read_half).lines();
                    let mut replied = false;
                    while let Ok(Some(line)) = lines.next_line().await {
                        let value: serde_json::Value = match serde_json::from_str(&line) {
                            Ok(value) => value,
                            Err(_) => continue,
                        };
                        if value["type"] == "session_init" {
                            let _ = session_tx
                                .send(value["session_id"].as_str().unwrap_or_default().to_string());
                        }
                        if value["type"] == "video_frame" && !replied {
                            if let Some(confidence) = reply_confidence {
                                replied = true;
                                let reply = format!(
                                    "{{\"type\":\"prediction_update\",\"data\":{{\"prediction\":\"HOLA\",\"confidence\":{confidence}}}}}\n"
                                );
                                let _ = write_half.write_all(reply.as_bytes()).await;
                            }
                        }
                    }
                });
            }
        });
        session_rx
    }

    #[tokio::test]
    async fn confident_prediction_completes_after_the_settle_delay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut sessions = spawn_predictor(listener, Some(0.35));

        let mut session =
            ReplaySession::new(test_settings(addr), Arc::new(MotionJpegDecoder::new(10.0)))
                .expect("session");
        let mut state_rx = session.subscribe();

        // One second of clip; early stop should beat end-of-stream.
        session.load(mjpeg_blob(10)).await.expect("load");
        session.start().await.expect("start");

        let state = wait_for(&mut state_rx, |state| state.completed).await;
        let prediction = state.prediction.expect("prediction");
        assert_eq!(prediction.label, "HOLA");
        assert!(prediction.confidence > 0.3);
        assert!(!state.processing);

        let first_session = sessions.recv().await.expect("session id");

        // Reprocess restarts from scratch: fresh session id, reset state.
        session.reprocess().await.expect("reprocess");
        let state = session.state();
        assert!(!state.completed);
        assert!(state.prediction.is_none());
        assert_eq!(state.progress, 0.0);

        let second_session = sessions.recv().await.expect("second session id");
        assert_ne!(first_session, second_session);

        // The second run completes again off the same loaded clip.
        let state = wait_for(&mut state_rx, |state| state.completed).await;
        assert_eq!(state.prediction.expect("prediction").label, "HOLA");

        session.stop().await;
    }

    #[tokio::test]
    async fn end_of_stream_completes_without_predictions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _sessions = spawn_predictor(listener, None);

        let mut session =
            ReplaySession::new(test_settings(addr), Arc::new(MotionJpegDecoder::new(10.0)))
                .expect("session");
        let mut state_rx = session.subscribe();

        // Half a second of clip.
        session.load(mjpeg_blob(5)).await.expect("load");
        session.start().await.expect("start");

        let state = wait_for(&mut state_rx, |state| state.completed).await;
        assert!(state.prediction.is_none());
        assert!(!state.processing);

        session.stop().await;
    }

    #[tokio::test]
    async fn low_confidence_predictions_do_not_stop_the_replay() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let _sessions = spawn_predictor(listener, Some(0.2));

        let mut session =
            ReplaySession::new(test_settings(addr), Arc::new(MotionJpegDecoder::new(10.0)))
                .expect("session");
        let mut state_rx = session.subscribe();

        session.load(mjpeg_blob(10)).await.expect("load");
        session.start().await.expect("start");

        // The prediction lands in state without finishing the session.
        let state = wait_for(&mut state_rx, |state| state.prediction.is_some()).await;
        assert!(!state.completed);

        // Completion still arrives, from end-of-stream.
        let state = wait_for(&mut state_rx, |state| state.completed).await;
        assert_eq!(state.prediction.expect("prediction").label, "HOLA");

        session.stop().await;
    }

    #[tokio::test]
    async fn starting_without_a_clip_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut session =
            ReplaySession::new(test_settings(addr), Arc::new(MotionJpegDecoder::default()))
                .expect("session");
        assert!(session.start().await.is_err());
    }

    #[tokio::test]
    async fn failed_open_does_not_leave_the_session_processing() {
        // Nothing listens on port 1.
        let mut settings = Settings::default();
        settings.predictor.endpoint = "tcp://127.0.0.1:1".to_string();
        settings.capture.replay_interval_ms = 10;

        let mut session = ReplaySession::new(settings, Arc::new(MotionJpegDecoder::new(10.0)))
            .expect("session");
        session.load(mjpeg_blob(5)).await.expect("load");

        assert!(session.start().await.is_err());
        let state = session.state();
        assert!(!state.processing);
        assert!(state.channel_error.is_some());
    }

    #[tokio::test]
    async fn undecodable_blobs_set_the_source_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let mut session =
            ReplaySession::new(test_settings(addr), Arc::new(MotionJpegDecoder::default()))
                .expect("session");
        let result = session.load(vec![0u8; 32]).await;
        assert!(matches!(
            result,
            Err(SessionError::Source(SourceError::Decode(_)))
        ));
        assert!(session.state().source_error.is_some());
    }
}
