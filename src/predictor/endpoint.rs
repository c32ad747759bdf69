use serde::Deserialize;
use url::Url;

use crate::error::ChannelError;

// Whether the client runs in a secure context. Under `RequireTls` a plaintext
// endpoint is refused before any I/O, as its own error class, so the user is
// not told the server is unreachable when the scheme is the problem.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityPolicy {
    #[default]
    AllowPlaintext,
    RequireTls,
}

#[derive(Clone, Debug)]
pub struct Endpoint {
    url: Url,
}

impl Endpoint {
    pub fn parse(raw: &str) -> Result<Self, ChannelError> {
        let url = Url::parse(raw)
            .map_err(|e| ChannelError::InvalidEndpoint(raw.to_string(), e.to_string()))?;
        match url.scheme() {
            "tcp" | "ws" => {}
            other => {
                return Err(ChannelError::InvalidEndpoint(
                    raw.to_string(),
                    format!("unsupported scheme '{other}'"),
                ));
            }
        }
        if url.host_str().is_none() {
            return Err(ChannelError::InvalidEndpoint(
                raw.to_string(),
                "missing host".to_string(),
            ));
        }
        if url.port().is_none() {
            return Err(ChannelError::InvalidEndpoint(
                raw.to_string(),
                "missing port".to_string(),
            ));
        }
        Ok(Self { url })
    }

    pub fn validate(&self, policy: SecurityPolicy) -> Result<(), ChannelError> {
        match policy {
            SecurityPolicy::AllowPlaintext => Ok(()),
            // Both recognized schemes are plaintext transports.
            SecurityPolicy::RequireTls => Err(ChannelError::SchemeMismatch),
        }
    }

    pub fn authority(&self) -> String {
        // Host and port presence are checked in parse.
        format!(
            "{}:{}",
            self.url.host_str().unwrap_or_default(),
            self.url.port().unwrap_or_default()
        )
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.url.fmt(f)
    }
}
