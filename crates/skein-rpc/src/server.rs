//! TCP listener, connection tasks and worker tasks.
//!
//! Every accepted connection gets a task that splits the byte stream into
//! frames and drains the connection's outbound queue. Frames are handed to
//! one of `workers` worker tasks chosen by the [`DispatchMode`]; each worker
//! owns a [`Dispatcher`] and therefore its own instance arena.
//!
//! Every connection has a home worker holding its instances: `conn % workers`,
//! or `uid % workers` once a `uid`-mode connection is bound. A worker that
//! receives a frame for a connection homed elsewhere forwards the decoded
//! message there. Binding moves the connection's instances to the new home
//! before the binding takes effect, so a connection always talks to the
//! same instance.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use skein_core::config::ServerSection;
use skein_core::{ConnectionId, DispatchMode, WorkerId};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::codec::{Codec, CodecOptions, Envelope};
use crate::dispatcher::{Detached, Dispatcher, NamePolicy};
use crate::error::{CodecError, CodecResult, RpcError, RpcResult};
use crate::frame::{Delimiter, Frame, FrameCodec};
use crate::hub::ConnectionHub;
use crate::message::{Message, MessageType};
use crate::service::{ServiceDefinition, is_valid_service_name};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen: String,
    pub workers: usize,
    pub dispatch_mode: DispatchMode,
    pub delimiter: Delimiter,
    /// Connections silent for three heartbeats are dropped.
    pub heartbeat: Duration,
    pub max_frame_bytes: usize,
    pub reserved_prefix: String,
    pub forbidden_actions: Vec<String>,
    /// Replay window applied to every registered service.
    pub codec_options: CodecOptions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:9501".to_string(),
            workers: 1,
            dispatch_mode: DispatchMode::Fd,
            delimiter: Delimiter::default(),
            heartbeat: Duration::from_secs(30),
            max_frame_bytes: 8 * 1024 * 1024,
            reserved_prefix: "_".to_string(),
            forbidden_actions: Vec::new(),
            codec_options: CodecOptions::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_section(section: &ServerSection) -> CodecResult<Self> {
        let delimiter = match &section.delimiter {
            Some(escaped) => Delimiter::parse(escaped)?,
            None => Delimiter::default(),
        };
        Ok(Self {
            listen: section.listen.clone(),
            workers: section.workers.max(1),
            dispatch_mode: section.dispatch_mode,
            delimiter,
            heartbeat: Duration::from_secs(section.heartbeat_secs.max(1)),
            max_frame_bytes: section.max_frame_bytes,
            reserved_prefix: section.reserved_prefix.clone(),
            forbidden_actions: section.forbidden_actions.clone(),
            codec_options: CodecOptions::from_section(section),
        })
    }

    pub fn idle_timeout(&self) -> Duration {
        self.heartbeat * 3
    }
}

enum Job {
    Frame {
        conn: ConnectionId,
        payload: Bytes,
    },
    Forwarded {
        conn: ConnectionId,
        service: Arc<ServiceDefinition>,
        message: Message,
    },
    Closed {
        conn: ConnectionId,
    },
    Adopt {
        detached: Detached,
    },
}

/// An RPC server before it is started.
pub struct Server {
    config: ServerConfig,
    services: HashMap<String, Arc<ServiceDefinition>>,
    default_service: Option<String>,
    hub: ConnectionHub,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            services: HashMap::new(),
            default_service: None,
            hub: ConnectionHub::new(),
        }
    }

    /// Add a service. The first one registered serves envelopes that name
    /// no service.
    pub fn register(&mut self, service: ServiceDefinition) -> &mut Self {
        let service = service.with_codec_options(self.config.codec_options);
        let name = service.name().to_string();
        if self.default_service.is_none() {
            self.default_service = Some(name.clone());
        }
        self.services.insert(name, Arc::new(service));
        self
    }

    /// The connection registry, usable before the server starts.
    pub fn hub(&self) -> ConnectionHub {
        self.hub.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and spawn the accept loop and worker tasks.
    pub async fn start(self) -> RpcResult<ServerHandle> {
        let default_service = match &self.default_service {
            Some(name) => self
                .services
                .get(name)
                .cloned()
                .ok_or_else(|| RpcError::Usage(format!("default service {name} is not registered")))?,
            None => return Err(RpcError::Usage("no service registered".into())),
        };

        let listener = TcpListener::bind(&self.config.listen).await?;
        let local_addr = listener.local_addr()?;
        let workers = self.config.workers.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut senders = Vec::with_capacity(workers);
        let mut receivers = Vec::with_capacity(workers);
        for _ in 0..workers {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            receivers.push(rx);
        }

        let policy = Arc::new(NamePolicy::new(
            &self.config.reserved_prefix,
            &self.config.forbidden_actions,
        ));
        let shared = Arc::new(Shared {
            config: self.config,
            services: self.services,
            default_service: default_service.clone(),
            hub: self.hub.clone(),
            policy,
            workers: senders,
            load: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            next_worker: AtomicUsize::new(0),
        });

        let mut tasks = Vec::with_capacity(workers + 1);
        for (id, jobs) in receivers.into_iter().enumerate() {
            tasks.push(tokio::spawn(run_worker(
                id,
                jobs,
                shared.clone(),
                shutdown_rx.clone(),
            )));
        }
        info!(
            %local_addr,
            workers,
            mode = %shared.config.dispatch_mode,
            "rpc server listening"
        );
        tasks.push(tokio::spawn(accept_loop(listener, shared, shutdown_rx)));

        Ok(ServerHandle {
            local_addr,
            hub: self.hub,
            codec: default_service.codec().clone(),
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// A running server. Dropping the handle stops it as well.
pub struct ServerHandle {
    local_addr: SocketAddr,
    hub: ConnectionHub,
    codec: Codec,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    /// Push an `on` event to `conn`, encoded for the default service.
    pub fn push(&self, conn: ConnectionId, event: &str, args: Value) -> RpcResult<bool> {
        Ok(self.hub.push_event(conn, event, args, &self.codec)?)
    }

    /// Stop accepting, drop every connection and wait for the workers.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!(addr = %self.local_addr, "rpc server stopped");
    }
}

struct Shared {
    config: ServerConfig,
    services: HashMap<String, Arc<ServiceDefinition>>,
    default_service: Arc<ServiceDefinition>,
    hub: ConnectionHub,
    policy: Arc<NamePolicy>,
    workers: Vec<mpsc::UnboundedSender<Job>>,
    /// Frames queued or running per worker.
    load: Vec<AtomicUsize>,
    next_worker: AtomicUsize,
}

impl Shared {
    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    fn uid_worker(&self, uid: u64) -> WorkerId {
        (uid % self.worker_count() as u64) as usize
    }

    /// Worker holding the instances of `conn`.
    fn home_of(&self, conn: ConnectionId) -> WorkerId {
        match self.hub.bound_uid(conn) {
            Some(uid) if self.config.dispatch_mode.supports_bind() => self.uid_worker(uid),
            _ => (conn % self.worker_count() as u64) as usize,
        }
    }

    fn pick_worker(&self, conn: ConnectionId) -> WorkerId {
        let n = self.worker_count();
        match self.config.dispatch_mode {
            DispatchMode::Fd | DispatchMode::Uid => self.home_of(conn),
            DispatchMode::RoundRobin => self.next_worker.fetch_add(1, Ordering::Relaxed) % n,
            DispatchMode::Preemptive => (0..n)
                .min_by_key(|w| self.load[*w].load(Ordering::Relaxed))
                .unwrap_or(0),
        }
    }

    /// Hand an inbound frame to a worker.
    fn route(&self, conn: ConnectionId, payload: Bytes) {
        let worker = self.pick_worker(conn);
        self.load[worker].fetch_add(1, Ordering::Relaxed);
        if self.workers[worker].send(Job::Frame { conn, payload }).is_err() {
            self.load[worker].fetch_sub(1, Ordering::Relaxed);
            warn!(conn, worker, "worker is gone, frame dropped");
        }
    }

    fn notify_closed(&self, conn: ConnectionId) {
        for worker in &self.workers {
            let _ = worker.send(Job::Closed { conn });
        }
    }

    fn resolve(&self, name: Option<&str>) -> Option<Arc<ServiceDefinition>> {
        match name {
            Some(name) if is_valid_service_name(name) => self.services.get(name).cloned(),
            _ => Some(self.default_service.clone()),
        }
    }

    fn protocol_violation(&self, conn: ConnectionId, codec: &Codec, reason: &str) {
        warn!(conn, %reason, "protocol violation, closing connection");
        if let Err(err) = self.hub.close(conn, 400, reason, codec) {
            warn!(conn, error = %err, "failed to encode close message");
            self.hub.unregister(conn);
        }
    }

    /// Decode one frame and execute it on this worker or its owner.
    fn on_receive(&self, dispatcher: &mut Dispatcher, conn: ConnectionId, payload: Bytes) {
        if !self.hub.contains(conn) {
            debug!(conn, "frame for a closed connection dropped");
            return;
        }
        let envelope = match Envelope::from_slice(&payload) {
            Ok(envelope) => envelope,
            Err(err) => {
                return self.protocol_violation(
                    conn,
                    self.default_service.codec(),
                    &format!("malformed envelope: {err}"),
                );
            }
        };
        let Some(service) = self.resolve(envelope.rpc_service.as_deref()) else {
            let name = envelope.rpc_service.unwrap_or_default();
            return self.protocol_violation(
                conn,
                self.default_service.codec(),
                &format!("unknown service {name}"),
            );
        };
        let message = match service.codec().open(&envelope) {
            Ok(message) => message,
            Err(err) => {
                return self.protocol_violation(conn, service.codec(), &format!("rejected envelope: {err}"));
            }
        };
        debug!(
            conn,
            worker = dispatcher.worker(),
            kind = %message.kind,
            name = ?message.name,
            service = service.name(),
            "request received"
        );

        let home = self.home_of(conn);
        if home != dispatcher.worker() {
            let job = Job::Forwarded {
                conn,
                service,
                message,
            };
            if self.workers[home].send(job).is_err() {
                warn!(conn, home, "owning worker is gone, request dropped");
            }
            return;
        }

        self.execute(dispatcher, conn, &service, message);
    }

    /// Run a message on the connection's home worker.
    fn execute(
        &self,
        dispatcher: &mut Dispatcher,
        conn: ConnectionId,
        service: &Arc<ServiceDefinition>,
        message: Message,
    ) {
        if message.kind == MessageType::Bind && self.config.dispatch_mode.supports_bind() {
            return self.bind(dispatcher, conn, &message);
        }
        dispatcher.call(conn, service, message);
    }

    /// Record a uid binding. The connection's instances move to the uid's
    /// worker first, so frames routed there by the binding find them.
    fn bind(&self, dispatcher: &mut Dispatcher, conn: ConnectionId, message: &Message) {
        let Some(uid) = bind_uid(message) else {
            warn!(conn, "bind without a numeric uid ignored");
            return;
        };
        let target = self.uid_worker(uid);
        if target != dispatcher.worker() {
            let detached = dispatcher.detach(conn);
            if !detached.is_empty() {
                debug!(
                    conn,
                    from = dispatcher.worker(),
                    to = target,
                    instances = detached.len(),
                    "moving service instances"
                );
                if self.workers[target].send(Job::Adopt { detached }).is_err() {
                    warn!(conn, target, "target worker is gone, instances dropped");
                }
            }
        }
        self.hub.bind(conn, uid);
        debug!(conn, uid, worker = target, "connection bound");
    }
}

fn bind_uid(message: &Message) -> Option<u64> {
    match message.args.as_ref()? {
        Value::Array(items) => items.first().and_then(Value::as_u64),
        Value::Object(map) => map.get("uid").and_then(Value::as_u64),
        other => other.as_u64(),
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut next_conn: ConnectionId = 1;
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let conn = next_conn;
                    next_conn += 1;
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(conn, error = %err, "set_nodelay failed");
                    }
                    debug!(conn, %peer, "connection accepted");
                    tokio::spawn(run_connection(conn, stream, peer, shared.clone(), shutdown.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("accept loop stopped");
}

async fn run_connection(
    conn: ConnectionId,
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut outbound = shared.hub.register(conn, peer);
    let codec = FrameCodec::new(shared.config.delimiter.clone(), shared.config.max_frame_bytes);
    let (mut sink, mut frames) = Framed::new(stream, codec).split();
    let idle = shared.config.idle_timeout();
    let mut deadline = Instant::now() + idle;

    loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(Frame::Heartbeat)) => {
                    deadline = Instant::now() + idle;
                    debug!(conn, "heartbeat");
                }
                Some(Ok(Frame::Payload(payload))) => {
                    deadline = Instant::now() + idle;
                    shared.route(conn, payload);
                }
                Some(Err(err)) => {
                    warn!(conn, error = %err, "framing error, dropping connection");
                    break;
                }
                None => {
                    debug!(conn, "peer closed the connection");
                    break;
                }
            },
            out = outbound.recv() => {
                let Some(mut out) = out else { break };
                let sent = sink.send(Frame::Payload(out.payload().clone())).await;
                // Refused frames never reach the socket; only I/O errors break it.
                let broken = matches!(sent, Err(CodecError::Io(_)));
                if let Err(err) = &sent {
                    warn!(conn, error = %err, "outbound frame not written");
                }
                out.complete(sent.map_err(|e| RpcError::Transport(e.to_string())));
                if broken {
                    warn!(conn, "write failed, dropping connection");
                    break;
                }
                if out.is_close() {
                    debug!(conn, "final message written, closing");
                    break;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                info!(conn, ?idle, "no traffic, dropping idle connection");
                break;
            }
            _ = shutdown.changed() => break,
        }
    }

    shared.hub.unregister(conn);
    let _ = sink.close().await;
    shared.notify_closed(conn);
    debug!(conn, %peer, "connection closed");
}

async fn run_worker(
    id: WorkerId,
    mut jobs: mpsc::UnboundedReceiver<Job>,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dispatcher = Dispatcher::new(id, shared.hub.clone(), shared.policy.clone());
    loop {
        let job = tokio::select! {
            job = jobs.recv() => job,
            _ = shutdown.changed() => None,
        };
        let Some(job) = job else { break };
        match job {
            Job::Frame { conn, payload } => {
                shared.on_receive(&mut dispatcher, conn, payload);
                shared.load[id].fetch_sub(1, Ordering::Relaxed);
            }
            Job::Forwarded {
                conn,
                service,
                message,
            } => {
                if shared.hub.contains(conn) {
                    shared.execute(&mut dispatcher, conn, &service, message);
                }
            }
            Job::Closed { conn } => {
                dispatcher.close_connection(conn);
            }
            Job::Adopt { detached } => {
                dispatcher.attach(detached);
            }
        }
    }
    debug!(worker = id, "worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn shared(mode: DispatchMode, workers: usize) -> Shared {
        let service = Arc::new(ServiceDefinition::new("Nop", |_ctx| Nop));
        Shared {
            config: ServerConfig {
                workers,
                dispatch_mode: mode,
                ..ServerConfig::default()
            },
            services: HashMap::from([("Nop".to_string(), service.clone())]),
            default_service: service,
            hub: ConnectionHub::new(),
            policy: Arc::new(NamePolicy::default()),
            workers: (0..workers).map(|_| mpsc::unbounded_channel().0).collect(),
            load: (0..workers).map(|_| AtomicUsize::new(0)).collect(),
            next_worker: AtomicUsize::new(0),
        }
    }

    struct Nop;

    impl crate::service::Service for Nop {
        fn capabilities() -> crate::service::CapabilityTable<Self> {
            crate::service::CapabilityTable::new()
        }
    }

    #[test]
    fn fd_mode_pins_connection() {
        let s = shared(DispatchMode::Fd, 4);
        assert_eq!(s.pick_worker(6), 2);
        assert_eq!(s.pick_worker(6), 2);
    }

    #[test]
    fn round_robin_rotates() {
        let s = shared(DispatchMode::RoundRobin, 3);
        let picks: Vec<_> = (0..4).map(|_| s.pick_worker(1)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn preemptive_prefers_idle_worker() {
        let s = shared(DispatchMode::Preemptive, 3);
        s.load[0].store(2, Ordering::Relaxed);
        s.load[1].store(0, Ordering::Relaxed);
        s.load[2].store(1, Ordering::Relaxed);
        assert_eq!(s.pick_worker(10), 1);
    }

    #[test]
    fn uid_mode_follows_binding() {
        let s = shared(DispatchMode::Uid, 4);
        let _rx = s.hub.register(5, "127.0.0.1:1".parse().unwrap());
        assert_eq!(s.pick_worker(5), 1);
        s.hub.bind(5, 11);
        assert_eq!(s.pick_worker(5), 3);
    }

    #[test]
    fn resolve_falls_back_to_default() {
        let s = shared(DispatchMode::Fd, 1);
        assert_eq!(s.resolve(None).unwrap().name(), "Nop");
        assert_eq!(s.resolve(Some("not a name!")).unwrap().name(), "Nop");
        assert_eq!(s.resolve(Some("Nop")).unwrap().name(), "Nop");
        assert!(s.resolve(Some("Other")).is_none());
    }

    #[test]
    fn bind_uid_shapes() {
        let bind = |args| Message::new(MessageType::Bind).with_args(args);
        assert_eq!(bind_uid(&bind(json!(7))), Some(7));
        assert_eq!(bind_uid(&bind(json!([8]))), Some(8));
        assert_eq!(bind_uid(&bind(json!({"uid": 9}))), Some(9));
        assert_eq!(bind_uid(&bind(json!("x"))), None);
    }

    #[test]
    fn config_from_section_parses_delimiter() {
        let section = ServerSection {
            delimiter: Some(r"\r\n\r\n".into()),
            heartbeat_secs: 2,
            ..ServerSection::default()
        };
        let config = ServerConfig::from_section(&section).unwrap();
        assert_eq!(config.delimiter.as_bytes(), b"\r\n\r\n");
        assert_eq!(config.idle_timeout(), Duration::from_secs(6));
        assert_eq!(config.codec_options.max_age, None);
    }

    #[test]
    fn registered_services_take_the_replay_window() {
        let section = ServerSection {
            max_age_secs: Some(45),
            skew_tolerance_secs: 10,
            ..ServerSection::default()
        };
        let mut server = Server::new(ServerConfig::from_section(&section).unwrap());
        server.register(ServiceDefinition::new("Nop", |_ctx| Nop).with_key(Some("k")));

        let codec = server.services["Nop"].codec();
        assert!(codec.is_encrypted());
        assert_eq!(codec.options().max_age, Some(Duration::from_secs(45)));
        assert_eq!(codec.options().skew_tolerance, Duration::from_secs(10));
    }
}
