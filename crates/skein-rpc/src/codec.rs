//! Message ⇄ envelope bytes.
//!
//! A [`Message`] is serialized to MessagePack (the plaintext), optionally
//! sealed with the [`LegacyCipher`](crate::cipher::LegacyCipher), and
//! wrapped in an [`Envelope`] whose `hash` is
//! `md5(plaintext || sharedKey || rpcService)`. The envelope itself is
//! MessagePack too; framing is done separately by
//! [`FrameCodec`](crate::frame::FrameCodec).

use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use skein_core::config::ServerSection;
use skein_core::epoch_secs;

use crate::cipher::{LegacyCipher, md5_hex};
use crate::error::{CodecError, CodecResult};
use crate::message::Message;

/// Wire container around one serialized (possibly encrypted) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "rpcService", default, skip_serializing_if = "Option::is_none")]
    pub rpc_service: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    pub hash: String,
}

impl Envelope {
    pub fn to_vec(&self) -> CodecResult<Vec<u8>> {
        rmp_serde::to_vec_named(self).map_err(|e| CodecError::Serialize(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> CodecResult<Self> {
        rmp_serde::from_slice(bytes).map_err(|e| CodecError::Deserialize(e.to_string()))
    }
}

/// Replay-window parameters for encrypted envelopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodecOptions {
    /// How far in the future an issue time may lie.
    pub skew_tolerance: Duration,
    /// Reject envelopes issued longer ago than this.
    pub max_age: Option<Duration>,
}

impl Default for CodecOptions {
    fn default() -> Self {
        Self {
            skew_tolerance: Duration::from_secs(300),
            max_age: None,
        }
    }
}

impl CodecOptions {
    pub fn from_section(section: &ServerSection) -> Self {
        Self {
            skew_tolerance: Duration::from_secs(section.skew_tolerance_secs),
            max_age: section.max_age_secs.map(Duration::from_secs),
        }
    }
}

/// `md5(plaintext || key || service)` as lowercase hex.
pub fn digest(plaintext: &[u8], key: &str, service: &str) -> String {
    let mut input = Vec::with_capacity(plaintext.len() + key.len() + service.len());
    input.extend_from_slice(plaintext);
    input.extend_from_slice(key.as_bytes());
    input.extend_from_slice(service.as_bytes());
    md5_hex(&input)
}

/// Encoder/decoder bound to one shared key and service name.
#[derive(Clone, Default)]
pub struct Codec {
    key: Option<String>,
    cipher: Option<LegacyCipher>,
    service: Option<String>,
    options: CodecOptions,
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("encrypted", &self.cipher.is_some())
            .field("service", &self.service)
            .field("options", &self.options)
            .finish()
    }
}

impl Codec {
    pub fn new(key: Option<&str>, service: Option<&str>) -> Self {
        let key = key.filter(|k| !k.is_empty()).map(str::to_string);
        Self {
            cipher: key.as_deref().map(LegacyCipher::new),
            key,
            service: service.filter(|s| !s.is_empty()).map(str::to_string),
            options: CodecOptions::default(),
        }
    }

    pub fn with_options(mut self, options: CodecOptions) -> Self {
        self.options = options;
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    pub fn options(&self) -> &CodecOptions {
        &self.options
    }

    /// Wrap a message into an envelope.
    pub fn seal(&self, message: &Message) -> CodecResult<Envelope> {
        let plain =
            rmp_serde::to_vec_named(message).map_err(|e| CodecError::Serialize(e.to_string()))?;
        let key = self.key.as_deref().unwrap_or_default();
        let service = self.service.as_deref().unwrap_or_default();
        let hash = digest(&plain, key, service);
        let data = match &self.cipher {
            Some(cipher) => cipher.seal(&plain, epoch_secs())?,
            None => plain,
        };
        Ok(Envelope {
            rpc_service: self.service.clone(),
            kind: message.kind.as_str().to_string(),
            data,
            hash,
        })
    }

    /// Verify and unwrap an envelope.
    pub fn open(&self, envelope: &Envelope) -> CodecResult<Message> {
        self.open_at(envelope, epoch_secs())
    }

    fn open_at(&self, envelope: &Envelope, now: u64) -> CodecResult<Message> {
        let plain = match &self.cipher {
            Some(cipher) => {
                let (plain, issued) = cipher.open(&envelope.data)?;
                self.check_window(issued, now)?;
                plain
            }
            None => envelope.data.clone(),
        };
        let key = self.key.as_deref().unwrap_or_default();
        let service = envelope.rpc_service.as_deref().unwrap_or_default();
        if digest(&plain, key, service) != envelope.hash {
            return Err(CodecError::DigestMismatch);
        }
        rmp_serde::from_slice(&plain).map_err(|e| CodecError::Deserialize(e.to_string()))
    }

    fn check_window(&self, issued: u64, now: u64) -> CodecResult<()> {
        if issued > now + self.options.skew_tolerance.as_secs() {
            return Err(CodecError::FromFuture { issued, now });
        }
        if let Some(max_age) = self.options.max_age {
            if now.saturating_sub(issued) > max_age.as_secs() {
                return Err(CodecError::Expired { issued, now });
            }
        }
        Ok(())
    }

    /// Message to envelope bytes, ready for framing.
    pub fn encode(&self, message: &Message) -> CodecResult<Bytes> {
        Ok(Bytes::from(self.seal(message)?.to_vec()?))
    }

    /// Envelope bytes (one frame, delimiter stripped) to message.
    pub fn decode(&self, bytes: &[u8]) -> CodecResult<Message> {
        self.open(&Envelope::from_slice(bytes)?)
    }
}

/// Encode `message` with an optional shared key and service name.
pub fn encode(message: &Message, key: Option<&str>, service: Option<&str>) -> CodecResult<Bytes> {
    Codec::new(key, service).encode(message)
}

/// Decode envelope bytes produced by [`encode`] with the same key.
pub fn decode(bytes: &[u8], key: Option<&str>, service: Option<&str>) -> CodecResult<Message> {
    Codec::new(key, service).decode(bytes)
}
