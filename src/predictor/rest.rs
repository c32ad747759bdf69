use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use crate::capture::CapturedFrame;
use crate::error::ApiError;
use crate::predictor::wire::PredictionData;

// Blocking HTTP side-channel to the same predictor service: health probe,
// the known label set, and one-shot prediction from a single frame without a
// socket session.
pub struct PredictorApi {
    base_url: String,
    agent: ureq::Agent,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServiceHealth {
    Reachable(String),
    // Network failure is a status value here, not an error.
    Unreachable,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClassesResponse {
    #[serde(default)]
    classes: Vec<String>,
}

impl PredictorApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        let config = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(10)))
            .build();
        Self {
            base_url: base_url.into(),
            agent: config.into(),
        }
    }

    pub fn health(&self) -> ServiceHealth {
        let url = format!("{}/api/health", self.base_url);
        match self
            .agent
            .get(&url)
            .call()
            .map_err(|e| e.to_string())
            .and_then(|response| {
                response
                    .into_body()
                    .read_json::<HealthResponse>()
                    .map_err(|e| e.to_string())
            }) {
            Ok(health) => ServiceHealth::Reachable(health.status.unwrap_or_default()),
            Err(e) => {
                warn!("predictor health check failed: {e}");
                ServiceHealth::Unreachable
            }
        }
    }

    pub fn classes(&self) -> Result<Vec<String>, ApiError> {
        let url = format!("{}/api/classes", self.base_url);
        let response = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let classes: ClassesResponse = response
            .into_body()
            .read_json()
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        Ok(classes.classes)
    }

    // Discrete burst capture: predict from one encoded frame.
    pub fn predict(&self, frame: &CapturedFrame) -> Result<PredictionData, ApiError> {
        let url = format!("{}/api/predict", self.base_url);
        let response = self
            .agent
            .post(&url)
            .send_json(serde_json::json!({ "frame": frame.data }))
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        response
            .into_body()
            .read_json()
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;

    // Minimal canned-response HTTP fixture.
    fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            if let Ok((mut socket, _)) = listener.accept() {
                let mut buffer = [0u8; 2048];
                let _ = socket.read(&mut buffer);
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes());
            }
        });
        format!("http://{addr}")
    }

    #[test]
    fn health_maps_network_failure_to_unreachable() {
        // Nothing listens on port 1.
        let api = PredictorApi::new("http://127.0.0.1:1");
        assert_eq!(api.health(), ServiceHealth::Unreachable);
    }

    #[test]
    fn health_reports_the_service_status() {
        let api = PredictorApi::new(serve_once(r#"{"status":"ok"}"#));
        assert_eq!(api.health(), ServiceHealth::Reachable("ok".to_string()));
    }

    #[test]
    fn classes_decodes_the_label_set() {
        let api = PredictorApi::new(serve_once(r#"{"classes":["HOLA","GRACIAS"]}"#));
        let classes = api.classes().expect("classes");
        assert_eq!(classes, ["HOLA", "GRACIAS"]);
    }

    #[test]
    fn classes_surfaces_transport_errors() {
        let api = PredictorApi::new("http://127.0.0.1:1");
        assert!(matches!(api.classes(), Err(ApiError::Transport(_))));
    }
}
