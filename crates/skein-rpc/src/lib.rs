//! skein-rpc — object-style RPC over a delimited, optionally encrypted
//! TCP byte stream.
//!
//! # Architecture
//!
//! ```text
//! RpcClient                                   Server
//!   call("ping") ─┐                             accept loop
//!                 │ Pool<CallChannel>             └── connection task (FrameCodec)
//!                 └─► Message                           └── pick worker (DispatchMode)
//!                      → Codec (msgpack, cipher,            └── Dispatcher (worker-local)
//!                        digest) → Envelope                      ├── instance arena
//!                      → FrameCodec (delimiter)                  │   (service, conn) → Instance
//!   Session ◄──── `on` pushes ◄── ConnectionHub ◄────────────────┴── CapabilityTable lookup
//! ```
//!
//! Services expose an explicit [`CapabilityTable`]: every method and
//! property reachable over the wire is registered by name, and names with
//! the reserved prefix or on the forbidden list are refused before lookup.

pub mod cipher;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod frame;
pub mod hub;
pub mod message;
pub mod server;
pub mod service;
pub mod session;

pub use client::{ClientConfig, RpcClient};
pub use codec::{Codec, CodecOptions, Envelope};
pub use dispatcher::{Detached, Dispatcher, Invocation, NamePolicy};
pub use error::{CodecError, CodecResult, RemoteError, RpcError, RpcResult};
pub use frame::{Delimiter, Frame, FrameCodec};
pub use hub::{ConnectionHub, Outbound};
pub use message::{Message, MessageType};
pub use server::{Server, ServerConfig, ServerHandle};
pub use service::{
    Arity, CallContext, CapabilityTable, Deferred, InstanceContext, Reply, Service,
    ServiceDefinition,
};
pub use session::{ClientState, Session, SessionConfig, SessionHandler, SessionLink};
