use chrono::Utc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PredictorSettings;
use crate::error::ChannelError;
use crate::predictor::endpoint::{Endpoint, SecurityPolicy};
use crate::predictor::wire::{ClientMessage, ServerMessage};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ChannelStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Closing,
    Error,
}

#[derive(Clone, Debug, Default)]
pub struct ChannelState {
    pub status: ChannelStatus,
    pub last_error: Option<String>,
}

// A cheap handle for pushing outbound messages from capture closures. Sends
// are attempted only while connected and are otherwise dropped, never queued
// for later: frames are a sampled lossy stream.
#[derive(Clone)]
pub struct ChannelSender {
    state_rx: watch::Receiver<ChannelState>,
    outbound_tx: mpsc::Sender<ClientMessage>,
}

impl ChannelSender {
    pub fn send(&self, message: &ClientMessage) -> bool {
        if self.state_rx.borrow().status != ChannelStatus::Connected {
            return false;
        }
        self.outbound_tx.try_send(message.clone()).is_ok()
    }
}

// One duplex NDJSON connection to the remote predictor. Session-scoped: a
// fresh session identifier namespaces every connection attempt, and the live
// socket is a single-owner resource; `open` on a non-closed channel is an
// error, never a silent leak.
pub struct PredictorChannel {
    endpoint: Endpoint,
    policy: SecurityPolicy,
    settings: PredictorSettings,
    state_tx: watch::Sender<ChannelState>,
    session_id: Option<Uuid>,
    open_state: Option<OpenState>,
    inbound_rx: Option<mpsc::Receiver<ServerMessage>>,
}

struct OpenState {
    outbound_tx: mpsc::Sender<ClientMessage>,
    cancel: CancellationToken,
    io_task: JoinHandle<()>,
}

impl PredictorChannel {
    pub fn new(settings: PredictorSettings) -> Result<Self, ChannelError> {
        let endpoint = Endpoint::parse(&settings.endpoint)?;
        let (state_tx, _) = watch::channel(ChannelState::default());
        Ok(Self {
            endpoint,
            policy: settings.security,
            settings,
            state_tx,
            session_id: None,
            open_state: None,
            inbound_rx: None,
        })
    }

    // Validates the target scheme before any I/O, then resolves the transport
    // in a background task: `disconnected -> connecting -> connected`, or
    // `-> error -> disconnected` on failure. A scheme mismatch never reaches
    // `connecting`.
    pub fn open(&mut self) -> Result<Uuid, ChannelError> {
        if self.open_state.is_some() {
            return Err(ChannelError::AlreadyOpen);
        }
        if let Err(e) = self.endpoint.validate(self.policy) {
            set_state(&self.state_tx, ChannelStatus::Error, Some(e.to_string()));
            set_state(&self.state_tx, ChannelStatus::Disconnected, None);
            return Err(e);
        }

        let session_id = Uuid::new_v4();
        self.session_id = Some(session_id);
        info!(%session_id, endpoint = %self.endpoint, "opening predictor channel");

        self.state_tx.send_replace(ChannelState {
            status: ChannelStatus::Connecting,
            last_error: None,
        });

        let (outbound_tx, outbound_rx) = mpsc::channel(self.settings.outbound_buffer_size);
        let (inbound_tx, inbound_rx) = mpsc::channel(self.settings.inbound_buffer_size);
        let cancel = CancellationToken::new();
        let io_task = tokio::spawn(run_io(
            self.endpoint.authority(),
            session_id,
            outbound_rx,
            inbound_tx,
            self.state_tx.clone(),
            cancel.clone(),
        ));

        self.open_state = Some(OpenState {
            outbound_tx,
            cancel,
            io_task,
        });
        self.inbound_rx = Some(inbound_rx);
        Ok(session_id)
    }

    // Resolves once the channel first reaches `connected`, or with the error
    // that ended the attempt. Callers bound this with their own timeout.
    pub async fn opened(&self) -> Result<(), ChannelError> {
        let mut rx = self.state_tx.subscribe();
        loop {
            let state = rx.borrow_and_update().clone();
            match state.status {
                ChannelStatus::Connected => return Ok(()),
                ChannelStatus::Disconnected | ChannelStatus::Error | ChannelStatus::Closing => {
                    return Err(match state.last_error {
                        Some(message) => ChannelError::Transport(message),
                        None => ChannelError::Closed,
                    });
                }
                ChannelStatus::Connecting => {}
            }
            if rx.changed().await.is_err() {
                return Err(ChannelError::Closed);
            }
        }
    }

    // Serializes and transmits only while connected; the return value says
    // whether the message was actually handed to the transport.
    pub fn send(&self, message: &ClientMessage) -> bool {
        match self.sender() {
            Some(sender) => sender.send(message),
            None => false,
        }
    }

    pub fn sender(&self) -> Option<ChannelSender> {
        self.open_state.as_ref().map(|open| ChannelSender {
            state_rx: self.state_tx.subscribe(),
            outbound_tx: open.outbound_tx.clone(),
        })
    }

    // The inbound message stream for this connection attempt. Single
    // consumer; taken once by the owning session.
    pub fn take_inbound(&mut self) -> Option<mpsc::Receiver<ServerMessage>> {
        self.inbound_rx.take()
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    pub fn state(&self) -> ChannelState {
        self.state_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    // Idempotent; safe when never connected. Joins the transport task, so the
    // channel can be reopened (with a fresh session id) once this returns.
    pub async fn close(&mut self) {
        let Some(open) = self.open_state.take() else {
            set_state(&self.state_tx, ChannelStatus::Disconnected, None);
            return;
        };
        set_state(&self.state_tx, ChannelStatus::Closing, None);
        open.cancel.cancel();
        let _ = open.io_task.await;
        self.inbound_rx = None;
        set_state(&self.state_tx, ChannelStatus::Disconnected, None);
        debug!("predictor channel closed");
    }
}

// Exactly-once status notifications: a repeated status with no new error does
// not wake subscribers again.
fn set_state(tx: &watch::Sender<ChannelState>, status: ChannelStatus, error: Option<String>) {
    tx.send_if_modified(|state| {
        let changed = state.status != status || (error.is_some() && state.last_error != error);
        if let Some(message) = error {
            state.last_error = Some(message);
        }
        state.status = status;
        changed
    });
}

async fn run_io(
    authority: String,
    session_id: Uuid,
    mut outbound_rx: mpsc::Receiver<ClientMessage>,
    inbound_tx: mpsc::Sender<ServerMessage>,
    state_tx: watch::Sender<ChannelState>,
    cancel: CancellationToken,
) {
    let stream = tokio::select! {
        _ = cancel.cancelled() => return,
        connected = TcpStream::connect(&authority) => match connected {
            Ok(stream) => stream,
            Err(e) => {
                warn!(%authority, "predictor connection failed: {e}");
                set_state(&state_tx, ChannelStatus::Error, Some(e.to_string()));
                set_state(&state_tx, ChannelStatus::Disconnected, None);
                return;
            }
        },
    };

    let (read_half, mut write_half) = stream.into_split();

    // The session namespace goes out first, before the channel reports open.
    let init = ClientMessage::SessionInit {
        session_id: session_id.to_string(),
        timestamp: Utc::now().timestamp_millis(),
    };
    if let Err(e) = write_line(&mut write_half, &init).await {
        warn!("failed to send session init: {e}");
        set_state(&state_tx, ChannelStatus::Error, Some(e.to_string()));
        set_state(&state_tx, ChannelStatus::Disconnected, None);
        return;
    }

    set_state(&state_tx, ChannelStatus::Connected, None);
    info!(%session_id, "predictor channel connected");

    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            outbound = outbound_rx.recv() => match outbound {
                Some(message) => {
                    if let Err(e) = write_line(&mut write_half, &message).await {
                        warn!("predictor write failed: {e}");
                        set_state(&state_tx, ChannelStatus::Error, Some(e.to_string()));
                        break;
                    }
                }
                None => break,
            },
            inbound = lines.next_line() => match inbound {
                Ok(Some(line)) => match serde_json::from_str::<ServerMessage>(&line) {
                    // One malformed message never closes the channel.
                    Ok(message) => {
                        if inbound_tx.send(message).await.is_err() {
                            debug!("inbound consumer gone, dropping messages");
                        }
                    }
                    Err(e) => warn!("dropping malformed predictor message: {e}"),
                },
                Ok(None) => {
                    info!("predictor closed the connection");
                    break;
                }
                Err(e) => {
                    warn!("predictor read failed: {e}");
                    set_state(&state_tx, ChannelStatus::Error, Some(e.to_string()));
                    break;
                }
            },
        }
    }

    set_state(&state_tx, ChannelStatus::Disconnected, None);
}

async fn write_line(
    write_half: &mut OwnedWriteHalf,
    message: &ClientMessage,
) -> std::io::Result<()> {
    let mut line = serde_json::to_vec(message).map_err(std::io::Error::other)?;
    line.push(b'\n');
    write_half.write_all(&line).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::Dimensions;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn settings_for(addr: std::net::SocketAddr) -> PredictorSettings {
        PredictorSettings {
            endpoint: format!("tcp://{addr}"),
            ..PredictorSettings::default()
        }
    }

    fn frame_message() -> ClientMessage {
        ClientMessage::Frame {
            data: "Zg==".to_string(),
            timestamp: 1,
            dimensions: Dimensions::new(640, 480),
        }
    }

    async fn local_listener() -> (TcpListener, std::net::SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        (listener, addr)
    }

    #[tokio::test]
    async fn send_is_dropped_while_disconnected() {
        let (_listener, addr) = local_listener().await;
        let channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        assert!(!channel.send(&frame_message()));
        assert_eq!(channel.state().status, ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn open_handshake_sends_session_init_first() {
        let (listener, addr) = local_listener().await;
        let mut channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        let session_id = channel.open().expect("open");

        let (socket, _) = listener.accept().await.expect("accept");
        let mut lines = BufReader::new(socket).lines();

        channel.opened().await.expect("opened");
        assert_eq!(channel.state().status, ChannelStatus::Connected);

        let init = lines.next_line().await.expect("read").expect("line");
        let value: serde_json::Value = serde_json::from_str(&init).expect("json");
        assert_eq!(value["type"], "session_init");
        assert_eq!(value["session_id"], session_id.to_string());

        assert!(channel.send(&frame_message()));
        let frame = lines.next_line().await.expect("read").expect("line");
        let value: serde_json::Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "frame");

        channel.close().await;
        assert_eq!(channel.state().status, ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn second_open_without_close_is_refused() {
        let (listener, addr) = local_listener().await;
        let mut channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        channel.open().expect("open");
        let (_socket, _) = listener.accept().await.expect("accept");
        channel.opened().await.expect("opened");

        assert!(matches!(channel.open(), Err(ChannelError::AlreadyOpen)));

        // After an explicit close the channel is reusable, with a new id.
        let first = channel.session_id().expect("id");
        channel.close().await;
        channel.open().expect("reopen");
        let (_socket, _) = listener.accept().await.expect("accept");
        channel.opened().await.expect("reopened");
        assert_ne!(channel.session_id().expect("id"), first);
        channel.close().await;
    }

    #[tokio::test]
    async fn scheme_mismatch_fails_before_any_io() {
        let settings = PredictorSettings {
            endpoint: "tcp://127.0.0.1:1".to_string(),
            security: SecurityPolicy::RequireTls,
            ..PredictorSettings::default()
        };
        let mut channel = PredictorChannel::new(settings).expect("channel");
        assert!(matches!(channel.open(), Err(ChannelError::SchemeMismatch)));

        // Never reached `connecting`; the error text is preserved.
        let state = channel.state();
        assert_eq!(state.status, ChannelStatus::Disconnected);
        assert!(state.last_error.is_some());
        assert!(channel.session_id().is_none());
        assert!(channel.take_inbound().is_none());
    }

    #[tokio::test]
    async fn transport_failure_surfaces_through_opened() {
        // Port 1 on loopback refuses connections.
        let settings = PredictorSettings {
            endpoint: "tcp://127.0.0.1:1".to_string(),
            ..PredictorSettings::default()
        };
        let mut channel = PredictorChannel::new(settings).expect("channel");
        channel.open().expect("open");
        let result = tokio::time::timeout(Duration::from_secs(5), channel.opened()).await;
        assert!(matches!(result, Ok(Err(ChannelError::Transport(_)))));
        assert_eq!(channel.state().status, ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn malformed_inbound_lines_are_dropped_not_fatal() {
        let (listener, addr) = local_listener().await;
        let mut channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        channel.open().expect("open");

        let (mut socket, _) = listener.accept().await.expect("accept");
        channel.opened().await.expect("opened");
        let mut inbound = channel.take_inbound().expect("inbound");

        socket
            .write_all(b"this is not json\n")
            .await
            .expect("write garbage");
        socket
            .write_all(
                b"{\"type\":\"prediction_update\",\"data\":{\"prediction\":\"HOLA\",\"confidence\":0.9}}\n",
            )
            .await
            .expect("write valid");

        // The valid message still arrives and the channel stays connected.
        let message = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("no message")
            .expect("closed");
        assert!(matches!(message, ServerMessage::PredictionUpdate { .. }));
        assert_eq!(channel.state().status, ChannelStatus::Connected);

        channel.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (_listener, addr) = local_listener().await;
        let mut channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        channel.close().await;
        channel.close().await;
        assert_eq!(channel.state().status, ChannelStatus::Disconnected);
    }

    #[tokio::test]
    async fn peer_close_transitions_to_disconnected() {
        let (listener, addr) = local_listener().await;
        let mut channel = PredictorChannel::new(settings_for(addr)).expect("channel");
        channel.open().expect("open");
        let (socket, _) = listener.accept().await.expect("accept");
        channel.opened().await.expect("opened");

        drop(socket);
        let mut state_rx = channel.subscribe();
        tokio::time::timeout(Duration::from_secs(5), async {
            while state_rx.borrow_and_update().status == ChannelStatus::Connected {
                state_rx.changed().await.expect("watch");
            }
        })
        .await
        .expect("no transition");
        assert_eq!(channel.state().status, ChannelStatus::Disconnected);

        // Sends are now silently dropped.
        assert!(!channel.send(&frame_message()));
        channel.close().await;
    }
}
