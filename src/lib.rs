pub mod capture;
pub mod config;
pub mod error;
pub mod media;
pub mod predictor;
pub mod session;

pub use config::Settings;
pub use error::{ApiError, ChannelError, SessionError, SourceError};

pub use session::{LiveSession, RecordingSession, ReplaySession};
