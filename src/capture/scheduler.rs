use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::capture::CapturedFrame;

// Drives periodic capture-and-consume at a fixed rate. At most one tick task
// is live; starting again stops the previous task first, and `stop` joins the
// task so no consume call can land after it returns.
pub struct FrameScheduler {
    active: Option<ActiveTimer>,
}

struct ActiveTimer {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl FrameScheduler {
    pub fn new() -> Self {
        Self { active: None }
    }

    pub async fn start<P, C>(&mut self, interval: Duration, mut produce: P, mut consume: C)
    where
        P: FnMut() -> Option<CapturedFrame> + Send + 'static,
        C: FnMut(CapturedFrame) + Send + 'static,
    {
        self.stop().await;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Discard the immediate first tick so captures start one interval in.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        // Ticks that yield no frame are skipped silently.
                        if let Some(frame) = produce() {
                            consume(frame);
                        }
                    }
                }
            }
            debug!("capture timer finished");
        });
        self.active = Some(ActiveTimer { cancel, task });
    }

    pub async fn stop(&mut self) {
        let Some(ActiveTimer { cancel, task }) = self.active.take() else {
            return;
        };
        cancel.cancel();
        let _ = task.await;
    }

    pub fn is_running(&self) -> bool {
        self.active.is_some()
    }
}

impl Default for FrameScheduler {
    fn default() -> Self {
        Self::new()
    }
}
