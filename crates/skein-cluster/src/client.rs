//! Node side of the registration protocol.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::de::DeserializeOwned;
use skein_core::SkeinConfig;
use skein_rpc::{
    ClientState, Codec, Delimiter, Message, MessageType, RpcError, Session, SessionConfig,
    SessionHandler, SessionLink, message::next_request_id,
};
use skein_state::Host;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::service::REGISTER_SERVICE;
use crate::types::{Assignment, RegisterReply, RegisterRequest, RemovedNode};
use crate::view::MembershipView;

#[derive(Debug, Clone)]
pub struct RegistrationConfig {
    /// `ip:port` of the register server.
    pub addr: String,
    pub shared_key: Option<String>,
    pub request: RegisterRequest,
    pub delimiter: Delimiter,
    pub heartbeat: Duration,
    pub reconnect_delay: Duration,
}

impl RegistrationConfig {
    pub fn new(addr: impl Into<String>, request: RegisterRequest) -> Self {
        Self {
            addr: addr.into(),
            shared_key: None,
            request,
            delimiter: Delimiter::default(),
            heartbeat: Duration::from_secs(30),
            reconnect_delay: Duration::from_secs(3),
        }
    }

    pub fn from_config(config: &SkeinConfig) -> ClusterResult<Self> {
        let register = &config.register;
        let delimiter = match &config.server.delimiter {
            Some(escaped) => Delimiter::parse(escaped).map_err(RpcError::from)?,
            None => Delimiter::default(),
        };
        Ok(Self {
            addr: format!("{}:{}", register.ip, register.port),
            shared_key: register.shared_key.clone().filter(|k| !k.is_empty()),
            request: RegisterRequest::from_section(&config.node),
            delimiter,
            heartbeat: Duration::from_secs(config.server.heartbeat_secs.max(1)),
            reconnect_delay: Duration::from_millis(register.reconnect_ms),
        })
    }
}

struct RegistrationHandler {
    request: RegisterRequest,
    view: MembershipView,
    assigned: watch::Sender<Option<Assignment>>,
    rejection: Mutex<Option<(i64, String)>>,
}

impl RegistrationHandler {
    fn parse<T: DeserializeOwned>(message: &Message) -> Option<T> {
        let args = message.args.clone()?;
        match serde_json::from_value(args) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(kind = %message.kind, error = %err, "discarding malformed registration message");
                None
            }
        }
    }
}

impl SessionHandler for RegistrationHandler {
    fn on_connect(&self, link: &SessionLink) {
        let args = match serde_json::to_value(&self.request) {
            Ok(args) => args,
            Err(err) => {
                warn!(error = %err, "cannot encode registration request");
                return;
            }
        };
        let reg = Message::new(MessageType::Reg)
            .with_args(args)
            .with_service(REGISTER_SERVICE)
            .with_id(Some(next_request_id()));
        if !link.send(reg) {
            warn!("registration session is gone");
        }
    }

    fn on_message(&self, message: Message, _link: &SessionLink) {
        match message.kind {
            MessageType::RegOk => {
                let Some(reply) = Self::parse::<RegisterReply>(&message) else {
                    return;
                };
                let assignment = Assignment::from(&reply);
                info!(group = %assignment.group, id = assignment.id, ip = %assignment.ip, nodes = reply.hosts.len(), "registered with cluster");
                self.view.reset(reply.hosts);
                self.assigned.send_replace(Some(assignment));
            }
            MessageType::Add => {
                if let Some(host) = Self::parse::<Host>(&message) {
                    debug!(group = %host.group, id = host.id, "node joined");
                    self.view.insert(host);
                }
            }
            MessageType::Remove => {
                if let Some(gone) = Self::parse::<RemovedNode>(&message) {
                    debug!(group = %gone.group, id = gone.id, "node left");
                    self.view.remove(&gone.group, gone.id);
                }
            }
            MessageType::Close => {
                let parts = message.error_parts().unwrap_or_default();
                warn!(code = parts.0, msg = %parts.1, "register server closed the session");
                *self.rejection.lock().unwrap_or_else(PoisonError::into_inner) = Some(parts);
            }
            MessageType::Error => {
                let (code, msg) = message.error_parts().unwrap_or_default();
                warn!(code, %msg, "register server reported an error");
            }
            other => debug!(kind = %other, "ignoring message"),
        }
    }

    fn on_disconnect(&self, state: ClientState) {
        debug!(?state, "registration connection ended");
    }
}

/// Keeps this node registered and its [`MembershipView`] current.
///
/// The connection is re-established after `reconnect_delay` whenever it
/// drops, and the registration is repeated on every connect. A `close`
/// from the register server ends the client for good.
pub struct RegistrationClient {
    session: Session,
    handler: Arc<RegistrationHandler>,
}

impl RegistrationClient {
    pub fn start(config: RegistrationConfig) -> Self {
        let codec = Codec::new(config.shared_key.as_deref(), Some(REGISTER_SERVICE));
        let mut session_config = SessionConfig::new(config.addr, codec);
        session_config.delimiter = config.delimiter;
        session_config.heartbeat = config.heartbeat;
        session_config.reconnect_delay = config.reconnect_delay;

        let (assigned, _) = watch::channel(None);
        let handler = Arc::new(RegistrationHandler {
            request: config.request,
            view: MembershipView::new(),
            assigned,
            rejection: Mutex::new(None),
        });
        let session = Session::spawn(session_config, handler.clone());
        Self { session, handler }
    }

    pub fn view(&self) -> &MembershipView {
        &self.handler.view
    }

    pub fn state(&self) -> ClientState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ClientState> {
        self.session.subscribe()
    }

    /// The latest assignment, if registered.
    pub fn assignment(&self) -> Option<Assignment> {
        self.handler.assigned.borrow().clone()
    }

    /// Assignment changes, one per successful (re)registration.
    pub fn subscribe_assignment(&self) -> watch::Receiver<Option<Assignment>> {
        self.handler.assigned.subscribe()
    }

    /// Wait until the node holds an assignment.
    ///
    /// Fails with [`ClusterError::Rejected`] when the register server
    /// closes the session, or [`ClusterError::Stopped`] when the client
    /// ends otherwise.
    pub async fn registered(&self) -> ClusterResult<Assignment> {
        let mut assigned = self.handler.assigned.subscribe();
        let mut state = self.session.subscribe();
        loop {
            if let Some(assignment) = assigned.borrow_and_update().clone() {
                return Ok(assignment);
            }
            let current = *state.borrow_and_update();
            if matches!(current, ClientState::ClosedByServer | ClientState::Stopped) {
                return Err(self.ended(current));
            }
            tokio::select! {
                changed = assigned.changed() => {
                    if changed.is_err() {
                        return Err(ClusterError::Stopped);
                    }
                }
                changed = state.changed() => {
                    if changed.is_err() {
                        let last = *state.borrow();
                        return match self.assignment() {
                            Some(assignment) => Ok(assignment),
                            None => Err(self.ended(last)),
                        };
                    }
                }
            }
        }
    }

    fn ended(&self, state: ClientState) -> ClusterError {
        if state == ClientState::ClosedByServer {
            let (code, msg) = self
                .handler
                .rejection
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
                .unwrap_or_default();
            ClusterError::Rejected { code, msg }
        } else {
            ClusterError::Stopped
        }
    }

    pub async fn stop(self) {
        self.session.stop().await;
    }
}
