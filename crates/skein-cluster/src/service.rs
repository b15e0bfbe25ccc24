//! The `Register` RPC service hosted by the register server.

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use skein_core::{ConnectionId, epoch_millis};
use skein_rpc::{
    Arity, CallContext, CapabilityTable, Codec, ConnectionHub, Deferred, Message, MessageType,
    RemoteError, Reply, Service,
};
use skein_state::Host;
use tracing::{debug, error, warn};

use crate::error::ClusterError;
use crate::registry::Registry;
use crate::types::{RegisterReply, RegisterRequest, RemovedNode};

/// Service name registration traffic is addressed to.
pub const REGISTER_SERVICE: &str = "Register";

/// Whether peers have heard about this connection's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Announce {
    /// `reg.ok` not yet delivered.
    Pending,
    /// `add` went out; a `remove` must follow on close.
    Added,
    Closed,
}

/// Per-connection registration state.
pub struct RegisterService {
    registry: Registry,
    /// `(group, id)` once this connection registered.
    node: Option<(String, u32)>,
    /// Shared with the reply's delivery callback, which runs off the worker.
    announce: Arc<Mutex<Announce>>,
}

impl RegisterService {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            node: None,
            announce: Arc::new(Mutex::new(Announce::Pending)),
        }
    }

    fn register(&mut self, ctx: &mut CallContext<'_>, message: &Message) -> Result<Reply, RemoteError> {
        if let Some((group, id)) = &self.node {
            return Err(RemoteError::new(
                409,
                format!("connection already registered as {group}/{id}"),
            ));
        }
        let request: RegisterRequest = match serde_json::from_value(message.args.clone().unwrap_or(Value::Null)) {
            Ok(request) => request,
            Err(err) => {
                warn!(conn = ctx.conn(), error = %err, "malformed registration request");
                ctx.close(400, &format!("malformed registration request: {err}"));
                return Ok(Reply::null());
            }
        };

        let registration = match self.registry.register(request, ctx.conn(), ctx.worker(), ctx.peer()) {
            Ok(registration) => registration,
            Err(err) => {
                match &err {
                    ClusterError::RegistrationConflict(reason) => {
                        warn!(conn = ctx.conn(), %reason, "registration refused");
                    }
                    other => error!(conn = ctx.conn(), error = %other, "registration failed"),
                }
                ctx.close(err.close_code(), &err.to_string());
                return Ok(Reply::null());
            }
        };

        let host = registration.host;
        self.node = Some((host.group.clone(), host.id));
        let reply = RegisterReply {
            id: host.id,
            group: host.group.clone(),
            key: host.key.clone(),
            ip: host.ip.clone(),
            hosts: registration.hosts,
        };
        let data = serde_json::to_value(&reply)
            .map_err(|e| RemoteError::internal(format!("cannot encode registration reply: {e}")))?;

        let registry = self.registry.clone();
        let hub = ctx.hub().clone();
        let codec = ctx.codec().clone();
        let conn = ctx.conn();
        let announce = self.announce.clone();
        Ok(Reply::Deferred(
            Deferred::new(data)
                .with_kind(MessageType::RegOk)
                .on_success(move || {
                    let mut announce = announce.lock().unwrap_or_else(PoisonError::into_inner);
                    if *announce != Announce::Pending {
                        debug!(conn, "connection closed before reg.ok was delivered, skipping add");
                        return;
                    }
                    let sent = broadcast_add(&registry, &hub, &codec, &host);
                    *announce = Announce::Added;
                    debug!(group = %host.group, id = host.id, sent, "add broadcast");
                })
                .on_error(move |err| {
                    warn!(conn, error = %err, "registration reply not delivered, skipping add broadcast");
                }),
        ))
    }
}

impl Service for RegisterService {
    fn capabilities() -> CapabilityTable<Self> {
        CapabilityTable::new()
            .on_message(MessageType::Reg, |svc: &mut RegisterService, ctx, message| {
                svc.register(ctx, message)
            })
            .method("hosts", Arity::Exact(0), |svc: &mut RegisterService, _ctx, _args| {
                let hosts = svc
                    .registry
                    .live_hosts()
                    .map_err(|e| RemoteError::internal(e.to_string()))?;
                serde_json::to_value(hosts)
                    .map(Reply::Value)
                    .map_err(|e| RemoteError::internal(e.to_string()))
            })
            .property("registered", |svc: &RegisterService| {
                Value::Bool(svc.node.is_some())
            })
    }

    fn on_close(&mut self, ctx: &mut CallContext<'_>) {
        if self.node.is_none() {
            return;
        }
        let mut announce = self.announce.lock().unwrap_or_else(PoisonError::into_inner);
        let added = *announce == Announce::Added;
        *announce = Announce::Closed;
        match self.registry.disconnect(ctx.conn(), epoch_millis()) {
            Ok(Some(host)) if added => {
                let sent = broadcast_remove(&self.registry, ctx.hub(), ctx.codec(), &host);
                debug!(group = %host.group, id = host.id, sent, "remove broadcast");
            }
            Ok(Some(host)) => {
                debug!(group = %host.group, id = host.id, "node never announced, no remove sent");
            }
            Ok(None) => {}
            Err(err) => error!(conn = ctx.conn(), error = %err, "failed to mark node removed"),
        }
    }
}

/// Send `add(host)` to every other live node. Returns how many were queued.
pub fn broadcast_add(registry: &Registry, hub: &ConnectionHub, codec: &Codec, host: &Host) -> usize {
    let args = match serde_json::to_value(host) {
        Ok(args) => args,
        Err(err) => {
            error!(error = %err, "cannot encode add event");
            return 0;
        }
    };
    broadcast(registry, hub, codec, MessageType::Add, args, host.fd)
}

/// Send `remove(group, id)` to every live node except `host` itself.
pub fn broadcast_remove(
    registry: &Registry,
    hub: &ConnectionHub,
    codec: &Codec,
    host: &Host,
) -> usize {
    let args = match serde_json::to_value(RemovedNode::from(host)) {
        Ok(args) => args,
        Err(err) => {
            error!(error = %err, "cannot encode remove event");
            return 0;
        }
    };
    broadcast(registry, hub, codec, MessageType::Remove, args, host.fd)
}

fn broadcast(
    registry: &Registry,
    hub: &ConnectionHub,
    codec: &Codec,
    kind: MessageType,
    args: Value,
    skip: ConnectionId,
) -> usize {
    let hosts = match registry.live_hosts() {
        Ok(hosts) => hosts,
        Err(err) => {
            error!(error = %err, %kind, "cannot list nodes for broadcast");
            return 0;
        }
    };
    let mut message = Message::new(kind).with_args(args);
    if let Some(service) = codec.service() {
        message.rpc_service = service.to_string();
    }
    let mut sent = 0;
    for host in hosts.iter().filter(|h| h.fd != skip) {
        match hub.push(host.fd, &message, codec) {
            Ok(true) => sent += 1,
            Ok(false) => debug!(conn = host.fd, %kind, "node connection gone, event skipped"),
            Err(err) => {
                warn!(%kind, error = %err, "cannot encode broadcast");
                return sent;
            }
        }
    }
    sent
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;
    use skein_rpc::{Dispatcher, Invocation, NamePolicy, Outbound, ServiceDefinition};
    use skein_state::StateStore;
    use tokio::sync::mpsc;

    use super::*;
    use crate::registry::RegistryConfig;

    struct Harness {
        registry: Registry,
        hub: ConnectionHub,
        dispatcher: Dispatcher,
        service: Arc<ServiceDefinition>,
    }

    fn harness() -> Harness {
        let registry = Registry::new(StateStore::open_in_memory().unwrap(), RegistryConfig::default());
        let hub = ConnectionHub::new();
        let factory_registry = registry.clone();
        let service = Arc::new(ServiceDefinition::new(REGISTER_SERVICE, move |_ctx| {
            RegisterService::new(factory_registry.clone())
        }));
        let dispatcher = Dispatcher::new(0, hub.clone(), Arc::new(NamePolicy::default()));
        Harness {
            registry,
            hub,
            dispatcher,
            service,
        }
    }

    fn connect(h: &Harness, conn: ConnectionId) -> mpsc::UnboundedReceiver<Outbound> {
        h.hub.register(conn, "127.0.0.1:6000".parse().unwrap())
    }

    fn reg(port: u16) -> Message {
        Message::new(MessageType::Reg)
            .with_args(json!({ "port": port }))
            .with_service(REGISTER_SERVICE)
            .with_id(Some(1.5))
    }

    /// Register on `conn` and report the reply as delivered.
    fn join(h: &mut Harness, conn: ConnectionId, port: u16) {
        let service = h.service.clone();
        let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(conn, &service, &reg(port)) else {
            panic!("expected a deferred reply");
        };
        deferred.settle(&Ok(()));
    }

    fn decode(h: &Harness, rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Message {
        h.service.codec().decode(rx.try_recv().unwrap().payload()).unwrap()
    }

    #[test]
    fn registration_replies_reg_ok_with_members() {
        let mut h = harness();
        let _rx = connect(&h, 1);
        let service = h.service.clone();

        let Invocation::Deferred(reply, deferred) = h.dispatcher.invoke(1, &service, &reg(7001)) else {
            panic!("expected a deferred reply");
        };
        assert_eq!(reply.kind, MessageType::RegOk);
        assert_eq!(reply.id, Some(1.5));
        let body: RegisterReply = serde_json::from_value(reply.args.unwrap()).unwrap();
        assert_eq!(body.id, 0);
        assert_eq!(body.ip, "127.0.0.1");
        assert_eq!(body.hosts.len(), 1);
        deferred.settle(&Ok(()));
    }

    #[test]
    fn add_goes_to_other_nodes_after_delivery() {
        let mut h = harness();
        let mut first = connect(&h, 1);
        let mut second = connect(&h, 2);
        let service = h.service.clone();

        if let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(1, &service, &reg(7001)) {
            deferred.settle(&Ok(()));
        }
        assert!(first.try_recv().is_err());

        let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(2, &service, &reg(7002)) else {
            panic!("expected a deferred reply");
        };
        // Nothing is broadcast before the reply is written.
        assert!(first.try_recv().is_err());
        deferred.settle(&Ok(()));

        let add = decode(&h, &mut first);
        assert_eq!(add.kind, MessageType::Add);
        assert_eq!(add.rpc_service, REGISTER_SERVICE);
        assert_eq!(add.args.unwrap()["port"], 7002);
        assert!(second.try_recv().is_err());
    }

    #[test]
    fn failed_delivery_skips_broadcast() {
        let mut h = harness();
        let mut first = connect(&h, 1);
        let _second = connect(&h, 2);
        let service = h.service.clone();

        if let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(1, &service, &reg(7001)) {
            deferred.settle(&Ok(()));
        }
        if let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(2, &service, &reg(7002)) {
            deferred.settle(&Err(skein_rpc::RpcError::Transport("gone".into())));
        }
        assert!(first.try_recv().is_err());
    }

    #[test]
    fn conflicts_close_the_connection() {
        let mut h = harness();
        let mut rx = connect(&h, 1);
        let service = h.service.clone();
        let no_port = Message::new(MessageType::Reg).with_args(json!({ "group": "g" }));

        assert!(matches!(h.dispatcher.invoke(1, &service, &no_port), Invocation::Closed));
        let out = rx.try_recv().unwrap();
        assert!(out.is_close());
        let (code, msg) = h.service.codec().decode(out.payload()).unwrap().error_parts().unwrap();
        assert_eq!(code, 409);
        assert!(msg.contains("port"));
        assert!(h.registry.live_hosts().unwrap().is_empty());
    }

    #[test]
    fn second_registration_on_one_connection_is_refused() {
        let mut h = harness();
        let _rx = connect(&h, 1);
        let service = h.service.clone();
        h.dispatcher.invoke(1, &service, &reg(7001));

        let Invocation::Reply(reply) = h.dispatcher.invoke(1, &service, &reg(7002)) else {
            panic!("expected an error reply");
        };
        assert_eq!(reply.kind, MessageType::Error);
        assert_eq!(reply.error_parts().unwrap().0, 409);
    }

    #[test]
    fn close_marks_removed_and_notifies_the_rest() {
        let mut h = harness();
        let _first = connect(&h, 1);
        let mut second = connect(&h, 2);
        join(&mut h, 1, 7001);
        join(&mut h, 2, 7002);

        h.hub.unregister(1);
        assert_eq!(h.dispatcher.close_connection(1), 1);

        let remove = decode(&h, &mut second);
        assert_eq!(remove.kind, MessageType::Remove);
        assert_eq!(remove.args.unwrap(), json!({ "group": "default", "id": 0 }));
        let row = h.registry.store().get_host("default", 0).unwrap().unwrap();
        assert!(!row.is_live());
    }

    #[test]
    fn close_before_delivery_sends_neither_add_nor_remove() {
        let mut h = harness();
        let mut first = connect(&h, 1);
        let _second = connect(&h, 2);
        join(&mut h, 1, 7001);
        let service = h.service.clone();

        let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(2, &service, &reg(7002)) else {
            panic!("expected a deferred reply");
        };
        h.hub.unregister(2);
        assert_eq!(h.dispatcher.close_connection(2), 1);
        // The write outcome arrives after the close.
        deferred.settle(&Ok(()));

        assert!(first.try_recv().is_err());
        let row = h.registry.store().get_host("default", 1).unwrap().unwrap();
        assert!(!row.is_live());
        assert!(row.announced);
    }

    #[test]
    fn undelivered_registration_closes_without_remove() {
        let mut h = harness();
        let mut first = connect(&h, 1);
        let _second = connect(&h, 2);
        join(&mut h, 1, 7001);
        let service = h.service.clone();

        if let Invocation::Deferred(_, deferred) = h.dispatcher.invoke(2, &service, &reg(7002)) {
            deferred.settle(&Err(skein_rpc::RpcError::Transport("gone".into())));
        }
        h.hub.unregister(2);
        h.dispatcher.close_connection(2);

        assert!(first.try_recv().is_err());
    }
}
