//! Delimiter framing over a TCP byte stream.
//!
//! Each frame is one envelope followed by the delimiter. A lone `0x00`
//! byte (optionally delimited) is a heartbeat; leading NULs before a
//! payload are skipped.
//!
//! Plain MessagePack data may contain any byte sequence, the delimiter
//! included. A payload that would collide with the delimiter (or that
//! starts with a NUL or the escape marker) is written escaped instead:
//!
//! ```text
//! marker | body with delimiter[0] -> (marker, lead_sub)
//!        |        and    marker   -> (marker, mark_sub)
//! ```
//!
//! The escaped body never contains `delimiter[0]`, so it cannot hold the
//! delimiter. The marker is `0xC1` (or `0xC0` when the delimiter starts
//! with `0xC1`); neither byte can begin a MessagePack map, so envelopes
//! written unescaped are never mistaken for escaped ones.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{CodecError, CodecResult};

/// Heartbeat marker byte.
pub const HEARTBEAT: u8 = 0x00;

/// Byte sequence separating frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delimiter(Bytes);

impl Delimiter {
    /// `C1 0D C1 0A`. MessagePack never uses 0xC1 as a type byte, but it
    /// can still show up inside numbers and binary data.
    pub const DEFAULT: [u8; 4] = [0xc1, 0x0d, 0xc1, 0x0a];

    pub fn new(bytes: impl Into<Bytes>) -> CodecResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(CodecError::InvalidDelimiter("empty".into()));
        }
        if bytes[0] == HEARTBEAT {
            return Err(CodecError::InvalidDelimiter(
                "must not start with the heartbeat byte".into(),
            ));
        }
        Ok(Self(bytes))
    }

    /// Parse a config string with escapes such as `"\r\n\r\n"`.
    pub fn parse(escaped: &str) -> CodecResult<Self> {
        let bytes =
            skein_core::unescape(escaped).map_err(|e| CodecError::InvalidDelimiter(e.to_string()))?;
        Self::new(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when writing `payload` followed by the delimiter would put a
    /// delimiter match before the real one.
    pub fn collides_with(&self, payload: &[u8]) -> bool {
        if self.find_in(payload).is_some() {
            return true;
        }
        let delim = self.0.as_ref();
        (1..delim.len()).any(|k| {
            payload.ends_with(&delim[..k]) && delim[k..] == delim[..delim.len() - k]
        })
    }

    fn lead(&self) -> u8 {
        self.0[0]
    }

    /// Position of the first occurrence inside `haystack`.
    pub fn find_in(&self, haystack: &[u8]) -> Option<usize> {
        if haystack.len() < self.0.len() {
            return None;
        }
        haystack
            .windows(self.0.len())
            .position(|window| window == self.0.as_ref())
    }
}

impl Default for Delimiter {
    fn default() -> Self {
        Self(Bytes::from_static(&Self::DEFAULT))
    }
}

/// Byte-stuffing parameters derived from a delimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Escape {
    lead: u8,
    marker: u8,
    lead_sub: u8,
    mark_sub: u8,
}

impl Escape {
    fn for_delimiter(delimiter: &Delimiter) -> Self {
        let lead = delimiter.lead();
        let marker = if lead == 0xc1 { 0xc0 } else { 0xc1 };
        let mut subs = [0x01u8, 0x02, 0x03].into_iter().filter(|b| *b != lead);
        // Three candidates, at most one excluded.
        let lead_sub = subs.next().unwrap_or(0x01);
        let mark_sub = subs.next().unwrap_or(0x02);
        Self {
            lead,
            marker,
            lead_sub,
            mark_sub,
        }
    }

    fn needed(&self, delimiter: &Delimiter, payload: &[u8]) -> bool {
        matches!(payload.first(), Some(&b) if b == HEARTBEAT || b == self.marker)
            || delimiter.collides_with(payload)
    }

    fn write(&self, payload: &[u8]) -> BytesMut {
        let mut dst = BytesMut::with_capacity(payload.len() + payload.len() / 8 + 2);
        dst.put_u8(self.marker);
        for &b in payload {
            if b == self.lead {
                dst.put_slice(&[self.marker, self.lead_sub]);
            } else if b == self.marker {
                dst.put_slice(&[self.marker, self.mark_sub]);
            } else {
                dst.put_u8(b);
            }
        }
        dst
    }

    /// Undo [`Escape::write`]; `body` excludes the leading marker.
    fn read(&self, body: &[u8]) -> CodecResult<Bytes> {
        let mut out = BytesMut::with_capacity(body.len());
        let mut bytes = body.iter().copied();
        while let Some(b) = bytes.next() {
            if b != self.marker {
                out.put_u8(b);
                continue;
            }
            match bytes.next() {
                Some(s) if s == self.lead_sub => out.put_u8(self.lead),
                Some(s) if s == self.mark_sub => out.put_u8(self.marker),
                _ => return Err(CodecError::Deserialize("bad escape sequence in frame".into())),
            }
        }
        Ok(out.freeze())
    }
}

/// One unit read off the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Heartbeat,
    Payload(Bytes),
}

/// `tokio_util` codec splitting a stream on a [`Delimiter`].
#[derive(Debug, Clone)]
pub struct FrameCodec {
    delimiter: Delimiter,
    escape: Escape,
    max_frame_bytes: usize,
    /// Bytes already scanned without finding a delimiter.
    scanned: usize,
}

impl FrameCodec {
    pub fn new(delimiter: Delimiter, max_frame_bytes: usize) -> Self {
        Self {
            escape: Escape::for_delimiter(&delimiter),
            delimiter,
            max_frame_bytes,
            scanned: 0,
        }
    }

    pub fn delimiter(&self) -> &Delimiter {
        &self.delimiter
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(Delimiter::default(), 8 * 1024 * 1024)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, CodecError> {
        loop {
            let overlap = self.delimiter.len() - 1;
            let start = self.scanned.saturating_sub(overlap);
            let Some(offset) = self.delimiter.find_in(&src[start..]) else {
                // Bare heartbeats carry no delimiter.
                if !src.is_empty() && src.iter().all(|b| *b == HEARTBEAT) {
                    src.clear();
                    self.scanned = 0;
                    return Ok(Some(Frame::Heartbeat));
                }
                if src.len() > self.max_frame_bytes {
                    return Err(CodecError::FrameTooLarge {
                        len: src.len(),
                        max: self.max_frame_bytes,
                    });
                }
                self.scanned = src.len();
                return Ok(None);
            };
            self.scanned = 0;

            let mut chunk = src.split_to(start + offset);
            src.advance(self.delimiter.len());

            let nuls = chunk.iter().take_while(|b| **b == HEARTBEAT).count();
            chunk.advance(nuls);
            if !chunk.is_empty() {
                if chunk.len() > self.max_frame_bytes {
                    return Err(CodecError::FrameTooLarge {
                        len: chunk.len(),
                        max: self.max_frame_bytes,
                    });
                }
                if chunk[0] == self.escape.marker {
                    let payload = self.escape.read(&chunk[1..])?;
                    return Ok(Some(Frame::Payload(payload)));
                }
                return Ok(Some(Frame::Payload(chunk.freeze())));
            }
            if nuls > 0 {
                return Ok(Some(Frame::Heartbeat));
            }
            // Two delimiters back to back: nothing to report.
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), CodecError> {
        match frame {
            Frame::Heartbeat => {
                dst.reserve(1 + self.delimiter.len());
                dst.put_u8(HEARTBEAT);
            }
            Frame::Payload(payload) => {
                let payload = if self.escape.needed(&self.delimiter, &payload) {
                    self.escape.write(&payload).freeze()
                } else {
                    payload
                };
                if payload.len() > self.max_frame_bytes {
                    return Err(CodecError::FrameTooLarge {
                        len: payload.len(),
                        max: self.max_frame_bytes,
                    });
                }
                dst.reserve(payload.len() + self.delimiter.len());
                dst.put_slice(&payload);
            }
        }
        dst.put_slice(self.delimiter.as_bytes());
        Ok(())
    }
}
