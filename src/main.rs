use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn, Level};

use signstream::config::Settings;
use signstream::error::SessionError;
use signstream::media::{MotionJpegDecoder, TestPatternCamera};
use signstream::predictor::{PredictorApi, ServiceHealth};
use signstream::session::{LiveSession, RecordingSession, ReplaySession};

fn init_logging() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();
}

#[tokio::main]
async fn main() -> Result<(), SessionError> {
    init_logging();
    let settings = Settings::load()?;

    let api = PredictorApi::new(settings.predictor.api_base.clone());
    match tokio::task::spawn_blocking(move || api.health()).await {
        Ok(ServiceHealth::Reachable(status)) => info!(%status, "predictor service reachable"),
        Ok(ServiceHealth::Unreachable) => warn!("predictor REST API unreachable, continuing"),
        Err(e) => warn!("health probe failed: {e}"),
    }

    let mut args = std::env::args().skip(1);
    match args.next().as_deref() {
        Some("live") | None => run_live(settings).await,
        Some("record") => run_recording(settings).await,
        Some("replay") => {
            let path = args.next().ok_or_else(|| {
                SessionError::Other("usage: signstream replay <file.mjpeg>".to_string())
            })?;
            run_replay(settings, &path).await
        }
        Some(other) => Err(SessionError::Other(format!(
            "unknown mode `{other}` (expected live, record or replay)"
        ))),
    }
}

async fn run_live(settings: Settings) -> Result<(), SessionError> {
    let mut session = LiveSession::new(settings, Arc::new(TestPatternCamera::default()))?;
    let mut state_rx = session.subscribe();
    session.start().await?;
    info!("live session running, press ctrl-c to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = state_rx.borrow_and_update().clone();
                if !state.transcript.is_empty() {
                    info!(transcript = %state.transcript, "transcript");
                }
                if let Some(error) = state.channel_error {
                    warn!(%error, "channel error");
                }
            }
        }
    }
    session.stop().await;
    Ok(())
}

async fn run_recording(settings: Settings) -> Result<(), SessionError> {
    let mut session = RecordingSession::new(settings, Arc::new(TestPatternCamera::default()))?;
    let mut state_rx = session.subscribe();
    session.start().await?;

    info!("recording for three seconds");
    session.start_recording().await;
    tokio::time::sleep(Duration::from_secs(3)).await;
    let sent = session.analyze().await?;
    info!(frames = sent, "batch submitted, waiting for the result");

    let result = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            {
                let state = state_rx.borrow_and_update();
                if !state.processing {
                    return state.prediction.clone();
                }
            }
            if state_rx.changed().await.is_err() {
                return None;
            }
        }
    })
    .await;
    match result {
        Ok(Some(prediction)) => {
            info!(
                label = %prediction.label,
                confidence = prediction.confidence,
                "prediction"
            );
        }
        Ok(None) => warn!("no prediction returned"),
        Err(_) => warn!("timed out waiting for the result"),
    }
    session.stop().await;
    Ok(())
}

async fn run_replay(settings: Settings, path: &str) -> Result<(), SessionError> {
    let blob = tokio::fs::read(path)
        .await
        .map_err(|e| SessionError::Other(format!("reading {path}: {e}")))?;
    let mut session = ReplaySession::new(settings, Arc::new(MotionJpegDecoder::default()))?;
    let mut state_rx = session.subscribe();
    let clip = session.load(blob).await?;
    info!(duration = clip.duration, frames = clip.frame_count, "clip loaded");
    session.start().await?;

    loop {
        {
            let state = state_rx.borrow_and_update();
            if state.completed {
                break;
            }
        }
        if state_rx.changed().await.is_err() {
            break;
        }
    }
    let state = session.state();
    match state.prediction {
        Some(prediction) => {
            info!(
                label = %prediction.label,
                confidence = prediction.confidence,
                "final prediction"
            );
        }
        None => info!("clip ended without a prediction"),
    }
    session.stop().await;
    Ok(())
}
