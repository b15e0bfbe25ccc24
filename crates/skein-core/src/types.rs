//! Identifiers and small value types shared by every skein crate.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Server-assigned identity of an accepted connection. Never reused
/// within one server lifetime.
pub type ConnectionId = u64;

/// Index of a worker task inside a server (`0..workers`).
pub type WorkerId = usize;

/// Policy deciding which worker owns the requests of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// Frames of a connection always go to `conn % workers`.
    #[default]
    Fd,
    /// Frames are spread across workers in turn.
    RoundRobin,
    /// Frames go to the least busy worker.
    Preemptive,
    /// Like `Fd` until the connection sends `bind`, then `uid % workers`.
    Uid,
}

impl DispatchMode {
    /// Whether the mode honours `bind` messages.
    pub fn supports_bind(&self) -> bool {
        matches!(self, DispatchMode::Uid)
    }
}

impl std::fmt::Display for DispatchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DispatchMode::Fd => write!(f, "fd"),
            DispatchMode::RoundRobin => write!(f, "round_robin"),
            DispatchMode::Preemptive => write!(f, "preemptive"),
            DispatchMode::Uid => write!(f, "uid"),
        }
    }
}

/// Milliseconds since the unix epoch.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Seconds since the unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Error returned by [`unescape`].
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EscapeError {
    #[error("dangling backslash at end of input")]
    Dangling,
    #[error("unknown escape sequence \\{0}")]
    Unknown(char),
    #[error("invalid hex escape: {0}")]
    Hex(String),
}

/// Decode a config string such as `"\r\n\r\n"` or `"\xc1\r\xc1\n"` into bytes.
///
/// Supports `\r`, `\n`, `\t`, `\0`, `\\` and `\xHH`.
pub fn unescape(input: &str) -> Result<Vec<u8>, EscapeError> {
    let mut out = Vec::with_capacity(input.len());
    let mut chars = input.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            None => return Err(EscapeError::Dangling),
            Some('r') => out.push(b'\r'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('0') => out.push(0),
            Some('\\') => out.push(b'\\'),
            Some('x') => {
                let hex: String = chars.by_ref().take(2).collect();
                let byte = u8::from_str_radix(&hex, 16)
                    .map_err(|_| EscapeError::Hex(hex.clone()))?;
                if hex.len() != 2 {
                    return Err(EscapeError::Hex(hex));
                }
                out.push(byte);
            }
            Some(other) => return Err(EscapeError::Unknown(other)),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_uid_mode_binds() {
        assert!(!DispatchMode::RoundRobin.supports_bind());
        assert!(DispatchMode::Uid.supports_bind());
        assert!(!DispatchMode::Fd.supports_bind());
    }

    #[test]
    fn unescape_crlf() {
        assert_eq!(unescape(r"\r\n\r\n").unwrap(), b"\r\n\r\n");
    }

    #[test]
    fn unescape_hex() {
        assert_eq!(unescape(r"\xc1\r\xC1\n").unwrap(), vec![0xc1, b'\r', 0xc1, b'\n']);
    }

    #[test]
    fn unescape_plain_text_passes_through() {
        assert_eq!(unescape("abc").unwrap(), b"abc");
    }

    #[test]
    fn unescape_rejects_bad_sequences() {
        assert_eq!(unescape("\\"), Err(EscapeError::Dangling));
        assert_eq!(unescape(r"\q"), Err(EscapeError::Unknown('q')));
        assert!(matches!(unescape(r"\xzz"), Err(EscapeError::Hex(_))));
        assert!(matches!(unescape(r"\x1"), Err(EscapeError::Hex(_))));
    }
}
