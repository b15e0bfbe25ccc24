//! Service definitions: the explicit table of operations a connection may
//! reach, and the per-connection instances built from it.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::Value;
use skein_core::{ConnectionId, WorkerId};
use tracing::warn;

use crate::codec::{Codec, CodecOptions};
use crate::error::{RemoteError, RpcError, RpcResult};
use crate::hub::ConnectionHub;
use crate::message::{Message, MessageType};

/// Accepted argument counts of a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Any,
    Exact(usize),
    /// Inclusive bounds.
    Range(usize, usize),
}

impl Arity {
    pub fn accepts(&self, n: usize) -> bool {
        match *self {
            Arity::Any => true,
            Arity::Exact(k) => n == k,
            Arity::Range(lo, hi) => (lo..=hi).contains(&n),
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arity::Any => write!(f, "any number of"),
            Arity::Exact(k) => write!(f, "{k}"),
            Arity::Range(lo, hi) => write!(f, "{lo} to {hi}"),
        }
    }
}

/// What a handler hands back to the dispatcher.
#[derive(Debug)]
pub enum Reply {
    /// Sent as the response's `args`.
    Value(Value),
    /// Sent as-is; the request id is copied in when missing.
    Message(Message),
    /// Sent, then settled once the write completed.
    Deferred(Deferred),
}

impl Reply {
    pub fn value(v: impl Into<Value>) -> Self {
        Reply::Value(v.into())
    }

    pub fn null() -> Self {
        Reply::Value(Value::Null)
    }
}

impl From<Value> for Reply {
    fn from(v: Value) -> Self {
        Reply::Value(v)
    }
}

type Callback = Box<dyn FnOnce() + Send>;
type ErrorCallback = Box<dyn FnOnce(&RpcError) + Send>;

/// A response whose side effects wait for its delivery outcome.
///
/// The dispatcher writes `data` to the connection and then runs
/// `on_success` or `on_error`, followed by `on_complete` in both cases.
pub struct Deferred {
    data: Value,
    kind: Option<MessageType>,
    on_success: Option<Callback>,
    on_error: Option<ErrorCallback>,
    on_complete: Option<Callback>,
}

impl fmt::Debug for Deferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deferred")
            .field("data", &self.data)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Deferred {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            kind: None,
            on_success: None,
            on_error: None,
            on_complete: None,
        }
    }

    /// Override the response type (defaults to the request's type).
    pub fn with_kind(mut self, kind: MessageType) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn on_success(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    pub fn on_error(mut self, f: impl FnOnce(&RpcError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_complete(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    /// The response message for `request`.
    pub fn to_message(&self, request: &Message) -> Message {
        let mut reply = request.reply(self.data.clone());
        if let Some(kind) = self.kind {
            reply.kind = kind;
        }
        reply
    }

    /// Run the callbacks for a delivery outcome.
    pub fn settle(mut self, outcome: &RpcResult<()>) {
        match outcome {
            Ok(()) => {
                if let Some(f) = self.on_success.take() {
                    f();
                }
            }
            Err(err) => {
                if let Some(f) = self.on_error.take() {
                    f(err);
                }
            }
        }
        if let Some(f) = self.on_complete.take() {
            f();
        }
    }
}

/// Where an instance lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceContext {
    pub conn: ConnectionId,
    pub worker: WorkerId,
    pub peer: Option<SocketAddr>,
}

/// Handle given to handlers for the duration of one call.
pub struct CallContext<'a> {
    conn: ConnectionId,
    worker: WorkerId,
    hub: &'a ConnectionHub,
    codec: &'a Codec,
    closed: bool,
}

impl<'a> CallContext<'a> {
    pub fn new(conn: ConnectionId, worker: WorkerId, hub: &'a ConnectionHub, codec: &'a Codec) -> Self {
        Self {
            conn,
            worker,
            hub,
            codec,
            closed: false,
        }
    }

    pub fn conn(&self) -> ConnectionId {
        self.conn
    }

    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.hub.peer(self.conn)
    }

    pub fn hub(&self) -> &'a ConnectionHub {
        self.hub
    }

    pub fn codec(&self) -> &'a Codec {
        self.codec
    }

    /// Push an `on` event to any connection, encoded for this service.
    pub fn push(&self, conn: ConnectionId, event: &str, args: Value) -> bool {
        match self.hub.push_event(conn, event, args, self.codec) {
            Ok(sent) => sent,
            Err(err) => {
                warn!(conn, event, error = %err, "failed to encode event");
                false
            }
        }
    }

    /// Send a `close` message to the calling connection and drop it. No
    /// response is written for the current request.
    pub fn close(&mut self, code: i64, msg: &str) {
        self.closed = true;
        if let Err(err) = self.hub.close(self.conn, code, msg, self.codec) {
            warn!(conn = self.conn, error = %err, "failed to encode close message");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

type MethodFn<S> =
    Box<dyn Fn(&mut S, &mut CallContext<'_>, Vec<Value>) -> Result<Reply, RemoteError> + Send + Sync>;
type GetFn<S> = Box<dyn Fn(&S) -> Value + Send + Sync>;
type SetFn<S> = Box<dyn Fn(&mut S, Value) -> Result<(), RemoteError> + Send + Sync>;
type HandlerFn<S> =
    Box<dyn Fn(&mut S, &mut CallContext<'_>, &Message) -> Result<Reply, RemoteError> + Send + Sync>;

struct Method<S> {
    arity: Arity,
    f: MethodFn<S>,
}

struct Property<S> {
    get: GetFn<S>,
    set: Option<SetFn<S>>,
}

/// Every operation a service exposes, by name.
pub struct CapabilityTable<S> {
    methods: HashMap<String, Method<S>>,
    properties: HashMap<String, Property<S>>,
    handlers: HashMap<MessageType, HandlerFn<S>>,
}

impl<S> Default for CapabilityTable<S> {
    fn default() -> Self {
        Self {
            methods: HashMap::new(),
            properties: HashMap::new(),
            handlers: HashMap::new(),
        }
    }
}

impl<S> CapabilityTable<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn method<F>(mut self, name: &str, arity: Arity, f: F) -> Self
    where
        F: Fn(&mut S, &mut CallContext<'_>, Vec<Value>) -> Result<Reply, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.methods.insert(
            name.to_string(),
            Method {
                arity,
                f: Box::new(f),
            },
        );
        self
    }

    /// Read-only property.
    pub fn property<G>(mut self, name: &str, get: G) -> Self
    where
        G: Fn(&S) -> Value + Send + Sync + 'static,
    {
        self.properties.insert(
            name.to_string(),
            Property {
                get: Box::new(get),
                set: None,
            },
        );
        self
    }

    pub fn property_mut<G, W>(mut self, name: &str, get: G, set: W) -> Self
    where
        G: Fn(&S) -> Value + Send + Sync + 'static,
        W: Fn(&mut S, Value) -> Result<(), RemoteError> + Send + Sync + 'static,
    {
        self.properties.insert(
            name.to_string(),
            Property {
                get: Box::new(get),
                set: Some(Box::new(set)),
            },
        );
        self
    }

    /// Handle a non-access message type (`reg`, `add`, ...).
    pub fn on_message<F>(mut self, kind: MessageType, f: F) -> Self
    where
        F: Fn(&mut S, &mut CallContext<'_>, &Message) -> Result<Reply, RemoteError>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(kind, Box::new(f));
        self
    }

    pub fn has_method(&self, name: &str) -> bool {
        self.methods.contains_key(name)
    }

    pub fn has_property(&self, name: &str) -> bool {
        self.properties.contains_key(name)
    }

    /// Route `message` to the matching entry.
    pub fn handle(
        &self,
        state: &mut S,
        ctx: &mut CallContext<'_>,
        message: &Message,
    ) -> Result<Reply, RemoteError> {
        let name = message.name.as_deref().unwrap_or_default();
        match message.kind {
            MessageType::Get => {
                let prop = self
                    .properties
                    .get(name)
                    .ok_or_else(|| RemoteError::not_found(format!("no property {name}")))?;
                Ok(Reply::Value((prop.get)(state)))
            }
            MessageType::Set => {
                let prop = self
                    .properties
                    .get(name)
                    .ok_or_else(|| RemoteError::not_found(format!("no property {name}")))?;
                let set = prop
                    .set
                    .as_ref()
                    .ok_or_else(|| RemoteError::forbidden(format!("property {name} is read-only")))?;
                set(state, message.args.clone().unwrap_or(Value::Null))?;
                Ok(Reply::Value(Value::Bool(true)))
            }
            MessageType::Fun | MessageType::Call => {
                let method = self
                    .methods
                    .get(name)
                    .ok_or_else(|| RemoteError::not_found(format!("no method {name}")))?;
                let args = message.positional_args();
                if !method.arity.accepts(args.len()) {
                    return Err(RemoteError::bad_request(format!(
                        "{name} takes {} arguments, got {}",
                        method.arity,
                        args.len()
                    )));
                }
                (method.f)(state, ctx, args)
            }
            kind => match self.handlers.get(&kind) {
                Some(handler) => handler(state, ctx, message),
                None => Err(RemoteError::bad_request(format!(
                    "message type {kind} is not handled here"
                ))),
            },
        }
    }
}

/// A type whose instances serve one connection each.
pub trait Service: Send + Sized + 'static {
    fn capabilities() -> CapabilityTable<Self>;

    /// Called once when the owning connection goes away.
    fn on_close(&mut self, _ctx: &mut CallContext<'_>) {}
}

/// Type-erased per-connection service instance.
pub trait Instance: Send {
    fn handle(&mut self, message: &Message, ctx: &mut CallContext<'_>) -> Result<Reply, RemoteError>;
    fn on_close(&mut self, ctx: &mut CallContext<'_>);
}

struct BoundInstance<S> {
    state: S,
    table: Arc<CapabilityTable<S>>,
}

impl<S: Service> Instance for BoundInstance<S> {
    fn handle(&mut self, message: &Message, ctx: &mut CallContext<'_>) -> Result<Reply, RemoteError> {
        self.table.handle(&mut self.state, ctx, message)
    }

    fn on_close(&mut self, ctx: &mut CallContext<'_>) {
        self.state.on_close(ctx);
    }
}

type Factory = Box<dyn Fn(&InstanceContext) -> Box<dyn Instance> + Send + Sync>;

/// A named service: its codec and how to build instances.
pub struct ServiceDefinition {
    name: String,
    codec: Codec,
    factory: Factory,
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("codec", &self.codec)
            .finish_non_exhaustive()
    }
}

impl ServiceDefinition {
    pub fn new<S, F>(name: &str, factory: F) -> Self
    where
        S: Service,
        F: Fn(&InstanceContext) -> S + Send + Sync + 'static,
    {
        let table = Arc::new(S::capabilities());
        Self {
            name: name.to_string(),
            codec: Codec::new(None, Some(name)),
            factory: Box::new(move |ctx: &InstanceContext| -> Box<dyn Instance> {
                Box::new(BoundInstance {
                    state: factory(ctx),
                    table: table.clone(),
                })
            }),
        }
    }

    /// Encrypt traffic of this service with a shared key.
    pub fn with_key(mut self, key: Option<&str>) -> Self {
        let options = *self.codec.options();
        self.codec = Codec::new(key, Some(&self.name)).with_options(options);
        self
    }

    pub fn with_codec_options(mut self, options: CodecOptions) -> Self {
        self.codec = self.codec.with_options(options);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    pub fn instantiate(&self, ctx: &InstanceContext) -> Box<dyn Instance> {
        (self.factory)(ctx)
    }
}

/// `[A-Za-z_][A-Za-z0-9_.]*`
pub fn is_valid_service_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}
