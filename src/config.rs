use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::error::SessionError;
use crate::predictor::endpoint::SecurityPolicy;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub predictor: PredictorSettings,
    pub capture: CaptureSettings,
    pub recording: RecordingSettings,
    pub replay: ReplaySettings,
}

impl Settings {
    // Layers an optional `signstream.toml` file and SIGNSTREAM_* environment
    // variables over the defaults below.
    pub fn load() -> Result<Self, SessionError> {
        let settings = Config::builder()
            .add_source(File::with_name("signstream").required(false))
            .add_source(Environment::with_prefix("SIGNSTREAM").separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(settings)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PredictorSettings {
    pub endpoint: String,
    pub api_base: String,
    pub security: SecurityPolicy,
    pub open_timeout_ms: u64,
    pub inbound_buffer_size: usize,
    pub outbound_buffer_size: usize,
}

impl Default for PredictorSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:8765".to_string(),
            api_base: "http://127.0.0.1:8000".to_string(),
            security: SecurityPolicy::AllowPlaintext,
            open_timeout_ms: 5_000,
            inbound_buffer_size: 64,
            outbound_buffer_size: 32,
        }
    }
}

impl PredictorSettings {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    // Live mirror streaming runs faster than recording to keep latency low.
    pub live_interval_ms: u64,
    // Recording captures locally at a fixed rate, unaffected by the network.
    pub recording_interval_ms: u64,
    // Replay samples faster but is gated by actual clip playback position.
    pub replay_interval_ms: u64,
    pub jpeg_quality: u8,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            live_interval_ms: 66,
            recording_interval_ms: 100,
            replay_interval_ms: 50,
            jpeg_quality: 70,
        }
    }
}

impl CaptureSettings {
    pub fn live_interval(&self) -> Duration {
        Duration::from_millis(self.live_interval_ms)
    }

    pub fn recording_interval(&self) -> Duration {
        Duration::from_millis(self.recording_interval_ms)
    }

    pub fn replay_interval(&self) -> Duration {
        Duration::from_millis(self.replay_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RecordingSettings {
    // Pause between batch items so the submission does not saturate the channel.
    pub inter_send_pause_ms: u64,
}

impl Default for RecordingSettings {
    fn default() -> Self {
        Self {
            inter_send_pause_ms: 30,
        }
    }
}

impl RecordingSettings {
    pub fn inter_send_pause(&self) -> Duration {
        Duration::from_millis(self.inter_send_pause_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReplaySettings {
    // Product tuning values for the early-stop heuristic. A prediction above
    // this confidence with a real label finalizes the replay session.
    pub early_stop_confidence: f64,
    // Delay between the winning prediction and completion so it stays visible.
    pub settle_ms: u64,
}

impl Default for ReplaySettings {
    fn default() -> Self {
        Self {
            early_stop_confidence: 0.3,
            settle_ms: 1_000,
        }
    }
}

impl ReplaySettings {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_product_tuning_values() {
        let settings = Settings::default();
        assert_eq!(settings.capture.live_interval_ms, 66);
        assert_eq!(settings.capture.recording_interval_ms, 100);
        assert_eq!(settings.capture.jpeg_quality, 70);
        assert_eq!(settings.replay.early_stop_confidence, 0.3);
        assert_eq!(settings.replay.settle_ms, 1_000);
        assert_eq!(settings.predictor.security, SecurityPolicy::AllowPlaintext);
    }

    #[test]
    fn interval_helpers_convert_to_durations() {
        let capture = CaptureSettings::default();
        assert_eq!(capture.recording_interval(), Duration::from_millis(100));
        assert_eq!(capture.replay_interval(), Duration::from_millis(50));
    }
}
