pub mod live;
pub mod recording;
pub mod replay;
pub mod transcript;

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::PredictorSettings;
use crate::error::{ChannelError, SessionError};
use crate::media::{CameraConstraints, CameraSource, Facing, FrameSource};
use crate::predictor::channel::{ChannelState, ChannelStatus, PredictorChannel};
use crate::predictor::Prediction;

pub use live::LiveSession;
pub use recording::RecordingSession;
pub use replay::ReplaySession;
pub use transcript::Transcript;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

// Externally observable session state, published through a watch channel.
// Source and channel errors are independent fields so one never masks the
// other; both are cleared only by explicit restarts.
#[derive(Clone, Debug, Default)]
pub struct SessionState {
    pub connection: ConnectionStatus,
    pub source_error: Option<String>,
    pub channel_error: Option<String>,
    pub prediction: Option<Prediction>,
    pub transcript: String,
    pub recording: bool,
    pub recorded_frames: usize,
    pub processing: bool,
    pub completed: bool,
    // Replay progress, 0..100.
    pub progress: f64,
}

// Mirrors channel status transitions into session state, one update per
// transition.
pub(crate) fn spawn_status_mirror(
    mut channel_rx: watch::Receiver<ChannelState>,
    state_tx: watch::Sender<SessionState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let channel_state = channel_rx.borrow_and_update().clone();
            state_tx.send_modify(|state| {
                state.connection = match channel_state.status {
                    ChannelStatus::Disconnected | ChannelStatus::Closing => {
                        ConnectionStatus::Disconnected
                    }
                    ChannelStatus::Connecting => ConnectionStatus::Connecting,
                    ChannelStatus::Connected => ConnectionStatus::Connected,
                    ChannelStatus::Error => ConnectionStatus::Error,
                };
                // The watch coalesces rapid transitions, so an error followed
                // immediately by `disconnected` may only be observed in its
                // final state. The error string is authoritative on its own.
                if channel_state.last_error.is_some() {
                    state.channel_error = channel_state.last_error.clone();
                }
            });
            if channel_rx.changed().await.is_err() {
                debug!("channel state stream ended");
                break;
            }
        }
    })
}

// Opens the channel and waits for `connected`, bounded by the configured open
// timeout. Failures land in the session's channel error slot; reconnection is
// always a fresh explicit action.
pub(crate) async fn open_channel(
    channel: &mut PredictorChannel,
    settings: &PredictorSettings,
    state_tx: &watch::Sender<SessionState>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<(), SessionError> {
    state_tx.send_modify(|state| state.channel_error = None);
    if let Err(e) = channel.open() {
        state_tx.send_modify(|state| {
            state.channel_error = Some(e.to_string());
            state.connection = ConnectionStatus::Error;
        });
        return Err(e.into());
    }
    tasks.push(spawn_status_mirror(channel.subscribe(), state_tx.clone()));

    let opened = tokio::time::timeout(settings.open_timeout(), channel.opened()).await;
    let error = match opened {
        Ok(Ok(())) => return Ok(()),
        Ok(Err(e)) => e,
        Err(_) => ChannelError::OpenTimeout,
    };
    state_tx.send_modify(|state| state.channel_error = Some(error.to_string()));
    channel.close().await;
    Err(error.into())
}

// Releases any prior feed, requests access outside the source lock, then
// installs the granted feed. Exactly one device handle is live at any point.
pub(crate) async fn acquire_camera(
    camera: &Arc<Mutex<CameraSource>>,
    facing: Facing,
    state_tx: &watch::Sender<SessionState>,
) -> Result<(), SessionError> {
    let device = {
        let mut source = camera.lock().unwrap();
        source.release();
        source.device()
    };
    let constraints = CameraConstraints {
        facing,
        ..CameraConstraints::default()
    };
    match device.request_access(constraints).await {
        Ok(feed) => {
            camera.lock().unwrap().install(feed, facing);
            state_tx.send_modify(|state| state.source_error = None);
            Ok(())
        }
        Err(e) => {
            state_tx.send_modify(|state| state.source_error = Some(e.to_string()));
            Err(e.into())
        }
    }
}
