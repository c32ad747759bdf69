pub mod channel;
pub mod endpoint;
pub mod rest;
pub mod wire;

pub use channel::{ChannelSender, ChannelState, ChannelStatus, PredictorChannel};
pub use endpoint::{Endpoint, SecurityPolicy};
pub use rest::{PredictorApi, ServiceHealth};
pub use wire::{ClientMessage, Prediction, ServerMessage, NO_PREDICTION};
