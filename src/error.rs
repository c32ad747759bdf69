use thiserror::Error;

// Media acquisition errors. Each variant carries its own user-facing message;
// none of them are retried automatically.
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Camera permission denied. Allow camera access and try again.")]
    PermissionDenied,
    #[error("No camera was found on this device.")]
    DeviceNotFound,
    #[error("The camera is in use by another application.")]
    DeviceBusy,
    #[error("No media capture API is available in this environment.")]
    UnsupportedEnvironment,
    #[error("Could not decode the video file: {0}")]
    Decode(String),
    #[error("Unknown media error: {0}")]
    Unknown(String),
}

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error(
        "Plaintext endpoint blocked under a secure context. Use a TLS endpoint or allow plaintext."
    )]
    SchemeMismatch,
    #[error("Invalid predictor endpoint '{0}': {1}")]
    InvalidEndpoint(String, String),
    #[error("Failed to connect to the predictor: {0}")]
    Connect(#[from] std::io::Error),
    #[error("Predictor connection failed: {0}")]
    Transport(String),
    #[error("Timed out waiting for the predictor connection to open.")]
    OpenTimeout,
    #[error("The channel is already open.")]
    AlreadyOpen,
    #[error("The channel is closed.")]
    Closed,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Predictor API request failed: {0}")]
    Transport(String),
    #[error("Failed to decode predictor API response: {0}")]
    Decode(String),
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("API error: {0}")]
    Api(#[from] ApiError),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Session error: {0}")]
    Other(String),
}
