//! Registry of live server connections and their outbound queues.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use skein_core::ConnectionId;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::codec::Codec;
use crate::error::{CodecResult, RpcError, RpcResult};
use crate::message::Message;

/// One queued write to a connection.
#[derive(Debug)]
pub struct Outbound {
    payload: Bytes,
    close: bool,
    ack: Option<oneshot::Sender<RpcResult<()>>>,
}

impl Outbound {
    pub fn new(payload: Bytes) -> Self {
        Self {
            payload,
            close: false,
            ack: None,
        }
    }

    /// Write the payload, then shut the connection down.
    pub fn closing(payload: Bytes) -> Self {
        Self {
            payload,
            close: true,
            ack: None,
        }
    }

    /// Report the write outcome on `ack`.
    pub fn with_ack(mut self, ack: oneshot::Sender<RpcResult<()>>) -> Self {
        self.ack = Some(ack);
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_close(&self) -> bool {
        self.close
    }

    /// Hand the write outcome to whoever waits on it.
    pub fn complete(&mut self, result: RpcResult<()>) {
        if let Some(ack) = self.ack.take() {
            let _ = ack.send(result);
        }
    }
}

impl Drop for Outbound {
    fn drop(&mut self) {
        self.complete(Err(RpcError::Transport("connection gone before write".into())));
    }
}

#[derive(Debug)]
struct Entry {
    tx: mpsc::UnboundedSender<Outbound>,
    peer: SocketAddr,
    uid: Option<u64>,
}

/// Shared map `ConnectionId → outbound queue`.
#[derive(Debug, Clone, Default)]
pub struct ConnectionHub {
    inner: Arc<RwLock<HashMap<ConnectionId, Entry>>>,
}

impl ConnectionHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection; the caller drains the returned queue onto
    /// the socket.
    pub fn register(&self, conn: ConnectionId, peer: SocketAddr) -> mpsc::UnboundedReceiver<Outbound> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.write().insert(
            conn,
            Entry {
                tx,
                peer,
                uid: None,
            },
        );
        rx
    }

    pub fn unregister(&self, conn: ConnectionId) {
        if self.write().remove(&conn).is_some() {
            debug!(conn, "connection unregistered");
        }
    }

    pub fn contains(&self, conn: ConnectionId) -> bool {
        self.read().contains_key(&conn)
    }

    pub fn peer(&self, conn: ConnectionId) -> Option<SocketAddr> {
        self.read().get(&conn).map(|e| e.peer)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn connections(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Associate a user id with the connection (`uid` dispatch mode).
    pub fn bind(&self, conn: ConnectionId, uid: u64) -> bool {
        match self.write().get_mut(&conn) {
            Some(entry) => {
                entry.uid = Some(uid);
                true
            }
            None => false,
        }
    }

    pub fn bound_uid(&self, conn: ConnectionId) -> Option<u64> {
        self.read().get(&conn).and_then(|e| e.uid)
    }

    /// Queue a write. Returns `false` if the connection is gone.
    pub fn send(&self, conn: ConnectionId, outbound: Outbound) -> bool {
        match self.read().get(&conn) {
            Some(entry) => entry.tx.send(outbound).is_ok(),
            None => false,
        }
    }

    /// Encode `message` with `codec` and queue it.
    pub fn push(&self, conn: ConnectionId, message: &Message, codec: &Codec) -> CodecResult<bool> {
        let payload = codec.encode(message)?;
        Ok(self.send(conn, Outbound::new(payload)))
    }

    /// Queue an `on` event tagged with the codec's service name.
    pub fn push_event(
        &self,
        conn: ConnectionId,
        event: &str,
        args: serde_json::Value,
        codec: &Codec,
    ) -> CodecResult<bool> {
        let mut message = Message::event(event, args);
        if let Some(service) = codec.service() {
            message.rpc_service = service.to_string();
        }
        self.push(conn, &message, codec)
    }

    /// Send a final `close` message and shut the connection down.
    pub fn close(&self, conn: ConnectionId, code: i64, msg: &str, codec: &Codec) -> CodecResult<bool> {
        let mut message = Message::close(code, msg);
        if let Some(service) = codec.service() {
            message.rpc_service = service.to_string();
        }
        let payload = codec.encode(&message)?;
        Ok(self.send(conn, Outbound::closing(payload)))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<ConnectionId, Entry>> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<ConnectionId, Entry>> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
