//! Request/response client.
//!
//! Every call borrows a dedicated call channel (its own TCP socket) from a
//! bounded [`Pool`], writes one request and reads frames until the
//! response arrives, so concurrent calls never share a socket. Server
//! pushes (`on` events) arrive over a separate persistent [`Session`]
//! opened by [`RpcClient::connect`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use skein_core::SkeinConfig;
use skein_pool::{Lease, Manager, Pool, PoolConfig, PoolStats};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_util::codec::Framed;
use tracing::{debug, warn};

use crate::codec::{Codec, CodecOptions};
use crate::error::{CodecResult, RpcError, RpcResult};
use crate::frame::{Delimiter, Frame, FrameCodec};
use crate::message::{Message, MessageType, next_request_id};
use crate::session::{ClientState, Session, SessionConfig, SessionHandler, SessionLink};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub addr: String,
    /// Service addressed by every request; the server's default if unset.
    pub service: Option<String>,
    pub key: Option<String>,
    pub delimiter: Delimiter,
    /// Wait for the response frame once the request is written.
    pub read_timeout: Duration,
    /// Wait for a free call channel.
    pub acquire_timeout: Duration,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
    pub max_frame_bytes: usize,
    pub reserved_prefix: String,
    pub pool: PoolConfig,
    pub codec_options: CodecOptions,
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            service: None,
            key: None,
            delimiter: Delimiter::default(),
            read_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(5),
            heartbeat: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
            max_frame_bytes: 8 * 1024 * 1024,
            reserved_prefix: "_".to_string(),
            pool: PoolConfig {
                size: 8,
                max_waiting: 64,
            },
            codec_options: CodecOptions::default(),
        }
    }

    /// Client settings matching a server configured from the same file:
    /// transport values come from `[server]`, channel limits from `[pool]`.
    pub fn from_config(addr: impl Into<String>, config: &SkeinConfig) -> CodecResult<Self> {
        let server = &config.server;
        let delimiter = match &server.delimiter {
            Some(escaped) => Delimiter::parse(escaped)?,
            None => Delimiter::default(),
        };
        Ok(Self {
            delimiter,
            read_timeout: Duration::from_millis(server.read_timeout_ms),
            acquire_timeout: Duration::from_millis(config.pool.acquire_timeout_ms),
            heartbeat: Duration::from_secs(server.heartbeat_secs.max(1)),
            reconnect_delay: Duration::from_millis(config.register.reconnect_ms),
            max_frame_bytes: server.max_frame_bytes,
            reserved_prefix: server.reserved_prefix.clone(),
            codec_options: CodecOptions::from_section(server),
            pool: PoolConfig {
                size: config.pool.size.max(1),
                max_waiting: config.pool.max_waiting,
            },
            ..Self::new(addr)
        })
    }

    pub fn with_service(mut self, service: &str) -> Self {
        self.service = Some(service.to_string());
        self
    }

    pub fn with_key(mut self, key: Option<&str>) -> Self {
        self.key = key.map(str::to_string);
        self
    }

    pub fn with_delimiter(mut self, delimiter: Delimiter) -> Self {
        self.delimiter = delimiter;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

/// A framed socket used for one call at a time.
pub type CallChannel = Framed<TcpStream, FrameCodec>;

/// Opens call channels for the pool.
pub struct ChannelManager {
    addr: String,
    frames: FrameCodec,
}

impl Manager for ChannelManager {
    type Resource = CallChannel;
    type Error = std::io::Error;

    async fn create(&self) -> Result<CallChannel, std::io::Error> {
        let stream = TcpStream::connect(&self.addr).await?;
        stream.set_nodelay(true)?;
        debug!(addr = %self.addr, "call channel opened");
        Ok(Framed::new(stream, self.frames.clone()))
    }

    fn close(&self, _channel: CallChannel) {
        debug!(addr = %self.addr, "call channel closed");
    }
}

type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

struct EventDispatch {
    handlers: HashMap<String, EventHandler>,
}

impl SessionHandler for EventDispatch {
    fn on_message(&self, message: Message, _link: &SessionLink) {
        match message.kind {
            MessageType::On => {
                let name = message.name.as_deref().unwrap_or_default();
                match self.handlers.get(name) {
                    Some(handler) => handler(message.args.unwrap_or(Value::Null)),
                    None => debug!(event = name, "no handler for event"),
                }
            }
            MessageType::Error => {
                let (code, msg) = message.error_parts().unwrap_or_default();
                warn!(code, %msg, "server reported an error on the event connection");
            }
            kind => debug!(%kind, "ignoring message on the event connection"),
        }
    }
}

pub struct RpcClient {
    config: ClientConfig,
    codec: Codec,
    pool: Pool<ChannelManager>,
    handlers: HashMap<String, EventHandler>,
    session: Option<Session>,
}

impl RpcClient {
    pub fn new(config: ClientConfig) -> Self {
        let codec = Codec::new(config.key.as_deref(), config.service.as_deref())
            .with_options(config.codec_options);
        let manager = ChannelManager {
            addr: config.addr.clone(),
            frames: FrameCodec::new(config.delimiter.clone(), config.max_frame_bytes),
        };
        let pool = Pool::new(manager, config.pool.clone());
        Self {
            config,
            codec,
            pool,
            handlers: HashMap::new(),
            session: None,
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Register a handler for server-pushed `on` events. Only allowed
    /// before [`connect`](Self::connect).
    pub fn on<F>(&mut self, event: &str, handler: F) -> RpcResult<()>
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        if self.session.is_some() {
            return Err(RpcError::Usage(format!(
                "handler for {event} registered after connect"
            )));
        }
        self.handlers.insert(event.to_string(), Arc::new(handler));
        Ok(())
    }

    /// Open the persistent event connection.
    pub fn connect(&mut self) -> RpcResult<()> {
        if self.session.is_some() {
            return Err(RpcError::Usage("already connected".into()));
        }
        let handler = Arc::new(EventDispatch {
            handlers: std::mem::take(&mut self.handlers),
        });
        let config = SessionConfig {
            addr: self.config.addr.clone(),
            codec: self.codec.clone(),
            delimiter: self.config.delimiter.clone(),
            heartbeat: self.config.heartbeat,
            reconnect_delay: self.config.reconnect_delay,
            max_frame_bytes: self.config.max_frame_bytes,
        };
        self.session = Some(Session::spawn(config, handler));
        Ok(())
    }

    pub fn state(&self) -> ClientState {
        self.session
            .as_ref()
            .map(Session::state)
            .unwrap_or(ClientState::Disconnected)
    }

    pub fn subscribe_state(&self) -> Option<watch::Receiver<ClientState>> {
        self.session.as_ref().map(Session::subscribe)
    }

    /// Wait until the event connection is up.
    pub async fn wait_connected(&self) -> ClientState {
        match &self.session {
            Some(session) => session.wait_for(ClientState::Connected).await,
            None => ClientState::Disconnected,
        }
    }

    /// Invoke a method over the event connection without waiting for the
    /// response. Lets a service learn which connection to push events to.
    pub fn notify(&self, method: &str, args: Vec<Value>) -> RpcResult<()> {
        self.check_name(method)?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| RpcError::Usage("notify before connect".into()))?;
        let message = self.stamp(Message::call(method, args));
        if session.link().send(message) {
            Ok(())
        } else {
            Err(RpcError::Transport("event connection is gone".into()))
        }
    }

    pub async fn call(&self, method: &str, args: Vec<Value>) -> RpcResult<Value> {
        self.check_name(method)?;
        let response = self.request(Message::call(method, args)).await?;
        Ok(response.args.unwrap_or(Value::Null))
    }

    pub async fn get_property(&self, name: &str) -> RpcResult<Value> {
        self.check_name(name)?;
        let response = self.request(Message::get(name)).await?;
        Ok(response.args.unwrap_or(Value::Null))
    }

    pub async fn set_property(&self, name: &str, value: Value) -> RpcResult<()> {
        self.check_name(name)?;
        self.request(Message::set(name, value)).await?;
        Ok(())
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Stop the event connection and close idle call channels.
    pub async fn close(mut self) {
        if let Some(session) = self.session.take() {
            session.stop().await;
        }
        self.pool.drain();
    }

    fn check_name(&self, name: &str) -> RpcResult<()> {
        let prefix = &self.config.reserved_prefix;
        if !prefix.is_empty() && name.to_lowercase().starts_with(&prefix.to_lowercase()) {
            return Err(RpcError::Remote {
                code: 403,
                msg: format!("{name} is reserved"),
            });
        }
        Ok(())
    }

    fn stamp(&self, mut message: Message) -> Message {
        message.id = Some(next_request_id());
        if let Some(service) = &self.config.service {
            message.rpc_service = service.clone();
        }
        message
    }

    async fn request(&self, message: Message) -> RpcResult<Message> {
        let message = self.stamp(message);
        let payload = self.codec.encode(&message)?;
        self.pool.reap_idle(self.config.heartbeat);
        let mut channel = self.pool.acquire(self.config.acquire_timeout).await?;
        if let Err(err) = channel.send(Frame::Payload(payload)).await {
            channel.remove();
            return Err(RpcError::Transport(err.to_string()));
        }

        let timeout = self.config.read_timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let frame = match tokio::time::timeout_at(deadline, channel.next()).await {
                Ok(frame) => frame,
                Err(_) => {
                    channel.remove();
                    return Err(RpcError::Timeout(timeout));
                }
            };
            let payload = match frame {
                Some(Ok(Frame::Payload(payload))) => payload,
                Some(Ok(Frame::Heartbeat)) => continue,
                Some(Err(err)) => {
                    channel.remove();
                    return Err(RpcError::Protocol(err));
                }
                None => {
                    channel.remove();
                    return Err(RpcError::Transport("connection closed before response".into()));
                }
            };
            let response = match self.codec.decode(&payload) {
                Ok(response) => response,
                Err(err) => {
                    warn!(error = %err, "discarding undecodable response frame");
                    continue;
                }
            };
            return self.settle(channel, &message, response);
        }
    }

    fn settle(
        &self,
        channel: Lease<ChannelManager>,
        request: &Message,
        response: Message,
    ) -> RpcResult<Message> {
        match response.kind {
            MessageType::Close => {
                channel.remove();
                let (code, msg) = response.error_parts().unwrap_or_default();
                Err(RpcError::ConnectionClosedByServer(format!("{code}: {msg}")))
            }
            MessageType::Error => {
                let (code, msg) = response.error_parts().unwrap_or_default();
                Err(RpcError::Remote { code, msg })
            }
            _ => {
                if response.id.is_some() && response.id != request.id {
                    debug!(expected = ?request.id, got = ?response.id, "response id differs from request");
                }
                Ok(response)
            }
        }
    }
}
