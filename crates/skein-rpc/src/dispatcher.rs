//! Worker-local request execution.
//!
//! A [`Dispatcher`] belongs to exactly one worker task. It owns the
//! instance arena keyed by `(connection, service)`, enforces the name
//! policy, converts handler failures (including panics) into error
//! responses and queues the response on the [`ConnectionHub`].

use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use skein_core::{ConnectionId, WorkerId};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::error::{RemoteError, RpcError, RpcResult};
use crate::hub::{ConnectionHub, Outbound};
use crate::message::Message;
use crate::service::{CallContext, Deferred, Instance, InstanceContext, Reply, ServiceDefinition};

/// Names a caller may never reach.
#[derive(Debug, Clone)]
pub struct NamePolicy {
    reserved_prefix: String,
    forbidden: HashSet<String>,
}

impl Default for NamePolicy {
    fn default() -> Self {
        Self::new("_", std::iter::empty::<&str>())
    }
}

impl NamePolicy {
    pub fn new<I, T>(reserved_prefix: &str, forbidden_actions: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        Self {
            reserved_prefix: reserved_prefix.to_lowercase(),
            forbidden: forbidden_actions
                .into_iter()
                .map(|a| a.as_ref().to_lowercase())
                .collect(),
        }
    }

    pub fn reserved_prefix(&self) -> &str {
        &self.reserved_prefix
    }

    /// Whether `name` starts with the reserved prefix.
    pub fn is_reserved(&self, name: &str) -> bool {
        !self.reserved_prefix.is_empty() && name.to_lowercase().starts_with(&self.reserved_prefix)
    }

    pub fn check(&self, message: &Message) -> Result<(), RemoteError> {
        let name = message.name.as_deref().filter(|n| !n.is_empty());
        let Some(name) = name else {
            if message.kind.is_access() {
                return Err(RemoteError::bad_request(format!(
                    "{} request without a name",
                    message.kind
                )));
            }
            return Ok(());
        };
        if self.is_reserved(name) {
            return Err(RemoteError::forbidden(format!("{name} is reserved")));
        }
        if message.kind.is_access() && self.forbidden.contains(&name.to_lowercase()) {
            return Err(RemoteError::forbidden(format!("{name} is not allowed")));
        }
        Ok(())
    }
}

/// Result of running one request.
#[derive(Debug)]
pub enum Invocation {
    Reply(Message),
    Deferred(Message, Deferred),
    /// The handler closed the connection; nothing is sent back.
    Closed,
}

struct Slot {
    service: Arc<ServiceDefinition>,
    instance: Box<dyn Instance>,
}

/// The service instances of one connection, in transit between workers.
pub struct Detached {
    conn: ConnectionId,
    slots: Vec<(String, Slot)>,
}

impl Detached {
    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

pub struct Dispatcher {
    worker: WorkerId,
    hub: ConnectionHub,
    policy: Arc<NamePolicy>,
    instances: HashMap<(ConnectionId, String), Slot>,
}

impl Dispatcher {
    pub fn new(worker: WorkerId, hub: ConnectionHub, policy: Arc<NamePolicy>) -> Self {
        Self {
            worker,
            hub,
            policy,
            instances: HashMap::new(),
        }
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn hub(&self) -> &ConnectionHub {
        &self.hub
    }

    pub fn instance_count(&self) -> usize {
        self.instances.len()
    }

    pub fn has_instance(&self, conn: ConnectionId, service: &str) -> bool {
        self.instances.contains_key(&(conn, service.to_string()))
    }

    /// Run `message` against the connection's instance of `service`,
    /// creating the instance on first use.
    pub fn invoke(
        &mut self,
        conn: ConnectionId,
        service: &Arc<ServiceDefinition>,
        message: &Message,
    ) -> Invocation {
        let mut ctx = CallContext::new(conn, self.worker, &self.hub, service.codec());
        let outcome = match self.policy.check(message) {
            Err(refused) => Err(refused),
            Ok(()) => {
                let worker = self.worker;
                let hub = &self.hub;
                let slot = self
                    .instances
                    .entry((conn, service.name().to_string()))
                    .or_insert_with(|| {
                        debug!(conn, worker, service = service.name(), "creating service instance");
                        Slot {
                            service: service.clone(),
                            instance: service.instantiate(&InstanceContext {
                                conn,
                                worker,
                                peer: hub.peer(conn),
                            }),
                        }
                    });
                panic::catch_unwind(AssertUnwindSafe(|| slot.instance.handle(message, &mut ctx)))
                    .unwrap_or_else(|payload| {
                        let reason = panic_message(payload.as_ref());
                        error!(conn, worker, service = service.name(), %reason, "handler panicked");
                        Err(RemoteError::internal(reason))
                    })
            }
        };

        if ctx.is_closed() {
            self.instances.remove(&(conn, service.name().to_string()));
            return Invocation::Closed;
        }

        match outcome {
            Ok(Reply::Value(value)) => Invocation::Reply(message.reply(value)),
            Ok(Reply::Message(mut reply)) => {
                if reply.id.is_none() {
                    reply.id = message.id;
                }
                if reply.rpc_service.is_empty() {
                    reply.rpc_service = message.rpc_service.clone();
                }
                Invocation::Reply(reply)
            }
            Ok(Reply::Deferred(deferred)) => {
                Invocation::Deferred(deferred.to_message(message), deferred)
            }
            Err(err) => {
                debug!(conn, kind = %message.kind, name = ?message.name, code = err.code, msg = %err.msg, "request failed");
                let mut reply = Message::from(&err).with_id(message.id);
                reply.rpc_service = message.rpc_service.clone();
                Invocation::Reply(reply)
            }
        }
    }

    /// Invoke and queue the response. Deferred callbacks run once the
    /// connection task reports the write outcome.
    pub fn call(&mut self, conn: ConnectionId, service: &Arc<ServiceDefinition>, message: Message) {
        match self.invoke(conn, service, &message) {
            Invocation::Closed => debug!(conn, "connection closed by handler, no response"),
            Invocation::Reply(reply) => {
                if let Err(err) = self.write(conn, service, &reply, None) {
                    warn!(conn, error = %err, "failed to queue response");
                }
            }
            Invocation::Deferred(reply, deferred) => {
                let (tx, rx) = oneshot::channel();
                match self.write(conn, service, &reply, Some(tx)) {
                    Ok(()) => {
                        tokio::spawn(async move {
                            let outcome = rx.await.unwrap_or_else(|_| {
                                Err(RpcError::Transport("write outcome lost".into()))
                            });
                            deferred.settle(&outcome);
                        });
                    }
                    Err(err) => {
                        warn!(conn, error = %err, "failed to queue deferred response");
                        deferred.settle(&Err(err));
                    }
                }
            }
        }
    }

    fn write(
        &self,
        conn: ConnectionId,
        service: &ServiceDefinition,
        reply: &Message,
        ack: Option<oneshot::Sender<RpcResult<()>>>,
    ) -> RpcResult<()> {
        let payload = service.codec().encode(reply)?;
        let mut outbound = Outbound::new(payload);
        if let Some(ack) = ack {
            outbound = outbound.with_ack(ack);
        }
        if self.hub.send(conn, outbound) {
            Ok(())
        } else {
            Err(RpcError::Transport(format!("connection {conn} is gone")))
        }
    }

    /// Drop every instance bound to `conn`, running their close hooks.
    pub fn close_connection(&mut self, conn: ConnectionId) -> usize {
        let detached = self.detach(conn);
        let count = detached.len();
        for (service, slot) in detached.slots {
            self.destroy(conn, &service, slot);
        }
        count
    }

    /// Take every instance of `conn` out of this arena without closing
    /// it, so another worker can [`attach`](Self::attach) it.
    pub fn detach(&mut self, conn: ConnectionId) -> Detached {
        let keys: Vec<_> = self
            .instances
            .keys()
            .filter(|(c, _)| *c == conn)
            .cloned()
            .collect();
        let slots = keys
            .into_iter()
            .filter_map(|key| {
                let slot = self.instances.remove(&key)?;
                Some((key.1, slot))
            })
            .collect();
        Detached { conn, slots }
    }

    /// Adopt instances detached by another worker. Instances of a
    /// connection that closed in the meantime are destroyed right away.
    pub fn attach(&mut self, detached: Detached) {
        let conn = detached.conn;
        let open = self.hub.contains(conn);
        for (service, slot) in detached.slots {
            if open {
                debug!(conn, worker = self.worker, %service, "service instance adopted");
                self.instances.insert((conn, service), slot);
            } else {
                self.destroy(conn, &service, slot);
            }
        }
    }

    fn destroy(&self, conn: ConnectionId, service: &str, mut slot: Slot) {
        let mut ctx = CallContext::new(conn, self.worker, &self.hub, slot.service.codec());
        let hook = panic::catch_unwind(AssertUnwindSafe(|| slot.instance.on_close(&mut ctx)));
        if let Err(payload) = hook {
            error!(conn, service, reason = %panic_message(payload.as_ref()), "close hook panicked");
        }
        debug!(conn, worker = self.worker, service, "service instance destroyed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Outbound;
    use crate::message::MessageType;
    use crate::service::{Arity, CapabilityTable, Service};
    use serde_json::json;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct Tally {
        calls: u32,
        closed: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Service for Tally {
        fn capabilities() -> CapabilityTable<Self> {
            CapabilityTable::new()
                .method("count", Arity::Exact(0), |p: &mut Tally, _ctx, _args| {
                    p.calls += 1;
                    Ok(Reply::value(p.calls))
                })
                .method("boom", Arity::Any, |_p: &mut Tally, _ctx, _args| -> Result<Reply, RemoteError> {
                    panic!("kaboom")
                })
                .method("quit", Arity::Any, |_p: &mut Tally, ctx, _args| {
                    ctx.close(410, "bye");
                    Ok(Reply::null())
                })
                .method("shutdown", Arity::Any, |_p: &mut Tally, _ctx, _args| Ok(Reply::null()))
                .method("_secret", Arity::Any, |_p: &mut Tally, _ctx, _args| Ok(Reply::null()))
                .method("later", Arity::Any, |p: &mut Tally, _ctx, _args| {
                    let (ok, err, done) = (p.log.clone(), p.log.clone(), p.log.clone());
                    Ok(Reply::Deferred(
                        Deferred::new(json!("queued"))
                            .on_success(move || ok.lock().unwrap().push("success"))
                            .on_error(move |_| err.lock().unwrap().push("error"))
                            .on_complete(move || done.lock().unwrap().push("complete")),
                    ))
                })
        }

        fn on_close(&mut self, _ctx: &mut CallContext<'_>) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        dispatcher: Dispatcher,
        service: Arc<ServiceDefinition>,
        closed: Arc<AtomicUsize>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    fn harness() -> Harness {
        let closed = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));
        let (c, l) = (closed.clone(), log.clone());
        let service = Arc::new(ServiceDefinition::new("Tally", move |_ctx| Tally {
            calls: 0,
            closed: c.clone(),
            log: l.clone(),
        }));
        let policy = Arc::new(NamePolicy::new("_", ["ShutDown"]));
        Harness {
            dispatcher: Dispatcher::new(0, ConnectionHub::new(), policy),
            service,
            closed,
            log,
        }
    }

    fn connect(h: &Harness, conn: ConnectionId) -> mpsc::UnboundedReceiver<Outbound> {
        h.dispatcher
            .hub()
            .register(conn, "127.0.0.1:5000".parse().unwrap())
    }

    fn reply(inv: Invocation) -> Message {
        match inv {
            Invocation::Reply(m) => m,
            other => panic!("expected reply, got {other:?}"),
        }
    }

    // ── Instances ───────────────────────────────────────────────

    #[test]
    fn instance_state_is_per_connection() {
        let mut h = harness();
        let svc = h.service.clone();
        let count = Message::call("count", vec![]);
        assert_eq!(reply(h.dispatcher.invoke(1, &svc, &count)).args, Some(json!(1)));
        assert_eq!(reply(h.dispatcher.invoke(1, &svc, &count)).args, Some(json!(2)));
        assert_eq!(reply(h.dispatcher.invoke(2, &svc, &count)).args, Some(json!(1)));
        assert_eq!(h.dispatcher.instance_count(), 2);
    }

    #[test]
    fn close_connection_runs_hook_once() {
        let mut h = harness();
        let svc = h.service.clone();
        h.dispatcher.invoke(1, &svc, &Message::call("count", vec![]));
        assert_eq!(h.dispatcher.close_connection(1), 1);
        assert_eq!(h.dispatcher.close_connection(1), 0);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
        assert!(!h.dispatcher.has_instance(1, "Tally"));
    }

    #[test]
    fn detached_instances_keep_their_state_on_another_worker() {
        let mut h = harness();
        let _rx = connect(&h, 1);
        let svc = h.service.clone();
        let count = Message::call("count", vec![]);
        h.dispatcher.invoke(1, &svc, &count);
        h.dispatcher.invoke(1, &svc, &count);

        let detached = h.dispatcher.detach(1);
        assert_eq!(detached.len(), 1);
        assert_eq!(h.dispatcher.instance_count(), 0);

        let mut other = Dispatcher::new(1, h.dispatcher.hub().clone(), Arc::new(NamePolicy::default()));
        other.attach(detached);
        assert!(other.has_instance(1, "Tally"));
        assert_eq!(reply(other.invoke(1, &svc, &count)).args, Some(json!(3)));
        assert_eq!(h.closed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn attach_after_close_runs_the_hook() {
        let mut h = harness();
        let _rx = connect(&h, 1);
        let svc = h.service.clone();
        h.dispatcher.invoke(1, &svc, &Message::call("count", vec![]));

        let detached = h.dispatcher.detach(1);
        h.dispatcher.hub().unregister(1);
        let mut other = Dispatcher::new(1, h.dispatcher.hub().clone(), Arc::new(NamePolicy::default()));
        other.attach(detached);
        assert_eq!(other.instance_count(), 0);
        assert_eq!(h.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn response_echoes_request_id() {
        let mut h = harness();
        let svc = h.service.clone();
        let msg = Message::call("count", vec![]).with_id(Some(12.5));
        assert_eq!(reply(h.dispatcher.invoke(1, &svc, &msg)).id, Some(12.5));
    }

    // ── Name policy ─────────────────────────────────────────────

    #[test]
    fn reserved_prefix_is_forbidden_without_creating_instance() {
        let mut h = harness();
        let svc = h.service.clone();
        let resp = reply(h.dispatcher.invoke(1, &svc, &Message::call("_secret", vec![])));
        assert_eq!(resp.kind, MessageType::Error);
        assert_eq!(resp.error_parts().unwrap().0, 403);
        assert_eq!(h.dispatcher.instance_count(), 0);
    }

    #[test]
    fn forbidden_actions_match_case_insensitively() {
        let mut h = harness();
        let svc = h.service.clone();
        let resp = reply(h.dispatcher.invoke(1, &svc, &Message::call("shutdown", vec![])));
        assert_eq!(resp.error_parts().unwrap().0, 403);
        let resp = reply(h.dispatcher.invoke(1, &svc, &Message::call("SHUTDOWN", vec![])));
        assert_eq!(resp.error_parts().unwrap().0, 403);
    }

    #[test]
    fn forbidden_actions_cover_properties_too() {
        let policy = NamePolicy::new("_", ["Config"]);
        assert_eq!(policy.check(&Message::get("config")).unwrap_err().code, 403);
        assert_eq!(policy.check(&Message::set("CONFIG", json!(1))).unwrap_err().code, 403);
        assert!(policy.check(&Message::new(MessageType::Reg).with_name("config")).is_ok());
    }

    #[test]
    fn access_without_name_is_bad_request() {
        let policy = NamePolicy::default();
        let err = policy.check(&Message::new(MessageType::Get)).unwrap_err();
        assert_eq!(err.code, 400);
        assert!(policy.check(&Message::new(MessageType::Reg)).is_ok());
    }

    #[test]
    fn reserved_prefix_applies_to_properties() {
        let policy = NamePolicy::default();
        assert_eq!(policy.check(&Message::get("_state")).unwrap_err().code, 403);
        assert!(policy.check(&Message::get("state")).is_ok());
    }

    // ── Failures ────────────────────────────────────────────────

    #[test]
    fn panicking_handler_becomes_internal_error() {
        let mut h = harness();
        let svc = h.service.clone();
        let resp = reply(h.dispatcher.invoke(1, &svc, &Message::call("boom", vec![])));
        assert_eq!(resp.error_parts(), Some((500, "kaboom".to_string())));
        // The worker keeps serving.
        let resp = reply(h.dispatcher.invoke(1, &svc, &Message::call("count", vec![])));
        assert_eq!(resp.args, Some(json!(1)));
    }

    #[test]
    fn handler_close_suppresses_response() {
        let mut h = harness();
        let svc = h.service.clone();
        let mut rx = connect(&h, 4);
        let inv = h.dispatcher.invoke(4, &svc, &Message::call("quit", vec![]));
        assert!(matches!(inv, Invocation::Closed));
        assert!(!h.dispatcher.has_instance(4, "Tally"));
        let out = rx.try_recv().unwrap();
        assert!(out.is_close());
        assert!(rx.try_recv().is_err());
    }

    // ── Writes ──────────────────────────────────────────────────

    #[tokio::test]
    async fn call_queues_encoded_response() {
        let mut h = harness();
        let svc = h.service.clone();
        let mut rx = connect(&h, 9);
        h.dispatcher.call(9, &svc, Message::call("count", vec![]).with_service("Tally"));
        let out = rx.recv().await.unwrap();
        let resp = svc.codec().decode(out.payload()).unwrap();
        assert_eq!(resp.args, Some(json!(1)));
    }

    #[tokio::test]
    async fn deferred_settles_after_write_completes() {
        let mut h = harness();
        let svc = h.service.clone();
        let mut rx = connect(&h, 9);
        h.dispatcher.call(9, &svc, Message::call("later", vec![]));

        let mut out = rx.recv().await.unwrap();
        tokio::task::yield_now().await;
        assert!(h.log.lock().unwrap().is_empty());

        out.complete(Ok(()));
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*h.log.lock().unwrap(), vec!["success", "complete"]);
    }

    #[tokio::test]
    async fn deferred_to_vanished_connection_reports_error() {
        let mut h = harness();
        let svc = h.service.clone();
        h.dispatcher.call(77, &svc, Message::call("later", vec![]));
        assert_eq!(*h.log.lock().unwrap(), vec!["error", "complete"]);
    }
}
