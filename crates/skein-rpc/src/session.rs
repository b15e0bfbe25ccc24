//! Long-lived client connection with heartbeat and reconnect.
//!
//! A [`Session`] keeps one socket open to a server, sends a heartbeat
//! every `heartbeat`, and reconnects after `reconnect_delay` whenever the
//! connection is lost. A `close` message from the server ends the session
//! for good.

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::Codec;
use crate::frame::{Delimiter, Frame, FrameCodec};
use crate::message::{Message, MessageType};

/// Connection state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    /// The server sent `close`; no reconnect follows.
    ClosedByServer,
    /// Stopped locally.
    Stopped,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub addr: String,
    pub codec: Codec,
    pub delimiter: Delimiter,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub max_frame_bytes: usize,
}

impl SessionConfig {
    pub fn new(addr: impl Into<String>, codec: Codec) -> Self {
        Self {
            addr: addr.into(),
            codec,
            delimiter: Delimiter::default(),
            heartbeat: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            max_frame_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Callbacks driven by the session task.
pub trait SessionHandler: Send + Sync + 'static {
    /// Runs after every successful (re)connect.
    fn on_connect(&self, _link: &SessionLink) {}

    /// Every decoded inbound message, `close` included.
    fn on_message(&self, message: Message, link: &SessionLink);

    /// Runs when an established connection ends.
    fn on_disconnect(&self, _state: ClientState) {}
}

/// Sends messages over the session's current connection. Messages sent
/// while disconnected go out after the next connect.
#[derive(Debug, Clone)]
pub struct SessionLink {
    tx: mpsc::UnboundedSender<Message>,
}

impl SessionLink {
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

pub struct Session {
    link: SessionLink,
    state: watch::Receiver<ClientState>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

enum End {
    Lost,
    ClosedByServer,
    Shutdown,
}

impl Session {
    pub fn spawn<H: SessionHandler>(config: SessionConfig, handler: Arc<H>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ClientState::Disconnected);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let link = SessionLink { tx };
        let task = tokio::spawn(run(
            config,
            handler,
            link.clone(),
            rx,
            state_tx,
            shutdown_rx,
        ));
        Self {
            link,
            state: state_rx,
            shutdown: shutdown_tx,
            task,
        }
    }

    pub fn link(&self) -> &SessionLink {
        &self.link
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state.clone()
    }

    /// Wait until the session reaches `target`, or has ended.
    pub async fn wait_for(&self, target: ClientState) -> ClientState {
        let mut rx = self.state.clone();
        let reached = rx
            .wait_for(|s| {
                *s == target || matches!(s, ClientState::ClosedByServer | ClientState::Stopped)
            })
            .await
            .map(|s| *s);
        reached.unwrap_or(ClientState::Stopped)
    }

    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run<H: SessionHandler>(
    config: SessionConfig,
    handler: Arc<H>,
    link: SessionLink,
    mut outgoing: mpsc::UnboundedReceiver<Message>,
    state: watch::Sender<ClientState>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        state.send_replace(ClientState::Connecting);
        let connected = tokio::select! {
            result = TcpStream::connect(&config.addr) => result,
            _ = shutdown.changed() => break,
        };
        let end = match connected {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                info!(addr = %config.addr, "session connected");
                state.send_replace(ClientState::Connected);
                handler.on_connect(&link);
                let end = serve(&config, stream, handler.as_ref(), &link, &mut outgoing, &mut shutdown).await;
                let after = match end {
                    End::ClosedByServer => ClientState::ClosedByServer,
                    End::Shutdown => ClientState::Stopped,
                    End::Lost => ClientState::Disconnected,
                };
                handler.on_disconnect(after);
                end
            }
            Err(err) => {
                warn!(addr = %config.addr, error = %err, "connect failed");
                End::Lost
            }
        };

        match end {
            End::ClosedByServer => {
                info!(addr = %config.addr, "server closed the session, not reconnecting");
                state.send_replace(ClientState::ClosedByServer);
                return;
            }
            End::Shutdown => break,
            End::Lost => {
                state.send_replace(ClientState::Disconnected);
                debug!(addr = %config.addr, delay = ?config.reconnect_delay, "reconnecting after delay");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(config.reconnect_delay) => {}
            _ = shutdown.changed() => break,
        }
    }
    state.send_replace(ClientState::Stopped);
}

async fn serve<H: SessionHandler>(
    config: &SessionConfig,
    stream: TcpStream,
    handler: &H,
    link: &SessionLink,
    outgoing: &mut mpsc::UnboundedReceiver<Message>,
    shutdown: &mut watch::Receiver<bool>,
) -> End {
    let codec = FrameCodec::new(config.delimiter.clone(), config.max_frame_bytes);
    let (mut sink, mut frames) = Framed::new(stream, codec).split();
    let period = config.heartbeat.max(Duration::from_millis(10));
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Frame::Payload(payload))) => match config.codec.decode(&payload) {
                    Ok(message) => {
                        let closing = message.kind == MessageType::Close;
                        handler.on_message(message, link);
                        if closing {
                            return End::ClosedByServer;
                        }
                    }
                    Err(err) => warn!(addr = %config.addr, error = %err, "discarding undecodable frame"),
                },
                Some(Ok(Frame::Heartbeat)) => {}
                Some(Err(err)) => {
                    warn!(addr = %config.addr, error = %err, "framing error");
                    return End::Lost;
                }
                None => {
                    debug!(addr = %config.addr, "server closed the socket");
                    return End::Lost;
                }
            },
            message = outgoing.recv() => {
                let Some(message) = message else { return End::Shutdown };
                let payload = match config.codec.encode(&message) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(error = %err, kind = %message.kind, "failed to encode outgoing message");
                        continue;
                    }
                };
                if let Err(err) = sink.send(Frame::Payload(payload)).await {
                    warn!(addr = %config.addr, error = %err, "write failed");
                    return End::Lost;
                }
            }
            _ = heartbeat.tick() => {
                if let Err(err) = sink.send(Frame::Heartbeat).await {
                    warn!(addr = %config.addr, error = %err, "heartbeat failed");
                    return End::Lost;
                }
            }
            _ = shutdown.changed() => {
                let _ = sink.close().await;
                return End::Shutdown;
            }
        }
    }
}
