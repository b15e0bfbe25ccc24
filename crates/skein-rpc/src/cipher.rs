//! Legacy-compatible envelope cipher.
//!
//! Salted RC4 keystream with an md5 key schedule and a truncated md5
//! integrity tag, plus an embedded issue time for replay-window checks.
//! This is obfuscation kept for wire compatibility with existing peers. It
//! is not an authenticated cipher.
//!
//! Sealed layout (ASCII):
//!
//! ```text
//! salt (8 hex chars) || base64( rc4( issued:010 || md5(plain || keyb)[..16] || plain ) )
//! rc4 key = keya || md5(keya || salt)
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use md5::{Digest, Md5};

use crate::error::{CodecError, CodecResult};

const SALT_LEN: usize = 8;
const ISSUED_LEN: usize = 10;
const TAG_LEN: usize = 16;

/// Lowercase hex md5 of `data`.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Table-based RC4 keystream.
struct Rc4 {
    s: [u8; 256],
    i: u8,
    j: u8,
}

impl Rc4 {
    fn new(key: &[u8]) -> Self {
        let mut s = [0u8; 256];
        for (idx, slot) in s.iter_mut().enumerate() {
            *slot = idx as u8;
        }
        let mut j: u8 = 0;
        for i in 0..256 {
            j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
            s.swap(i, j as usize);
        }
        Self { s, i: 0, j: 0 }
    }

    fn apply(&mut self, buf: &mut [u8]) {
        for byte in buf.iter_mut() {
            self.i = self.i.wrapping_add(1);
            self.j = self.j.wrapping_add(self.s[self.i as usize]);
            self.s.swap(self.i as usize, self.j as usize);
            let idx = self.s[self.i as usize].wrapping_add(self.s[self.j as usize]);
            *byte ^= self.s[idx as usize];
        }
    }
}

/// Key material derived once from a shared key.
#[derive(Clone)]
pub struct LegacyCipher {
    keya: String,
    keyb: String,
}

impl std::fmt::Debug for LegacyCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LegacyCipher").finish_non_exhaustive()
    }
}

impl LegacyCipher {
    pub fn new(shared_key: &str) -> Self {
        let hashed = md5_hex(shared_key.as_bytes());
        Self {
            keya: md5_hex(&hashed.as_bytes()[..16]),
            keyb: md5_hex(&hashed.as_bytes()[16..]),
        }
    }

    fn keystream(&self, salt: &[u8]) -> Rc4 {
        let mut seed = self.keya.clone().into_bytes();
        seed.extend_from_slice(salt);
        let mut key = self.keya.clone().into_bytes();
        key.extend_from_slice(md5_hex(&seed).as_bytes());
        Rc4::new(&key)
    }

    fn tag(&self, plain: &[u8]) -> String {
        let mut input = plain.to_vec();
        input.extend_from_slice(self.keyb.as_bytes());
        let mut tag = md5_hex(&input);
        tag.truncate(TAG_LEN);
        tag
    }

    /// Encrypt `plain` with a fresh random salt.
    pub fn seal(&self, plain: &[u8], issued_secs: u64) -> CodecResult<Vec<u8>> {
        let mut raw = [0u8; SALT_LEN / 2];
        getrandom::getrandom(&mut raw).map_err(|e| CodecError::Random(e.to_string()))?;
        Ok(self.seal_with_salt(plain, issued_secs, hex::encode(raw).as_bytes()))
    }

    fn seal_with_salt(&self, plain: &[u8], issued_secs: u64, salt: &[u8]) -> Vec<u8> {
        let mut inner = format!("{issued_secs:0width$}", width = ISSUED_LEN).into_bytes();
        inner.extend_from_slice(self.tag(plain).as_bytes());
        inner.extend_from_slice(plain);
        self.keystream(salt).apply(&mut inner);

        let mut out = salt.to_vec();
        out.extend_from_slice(STANDARD.encode(inner).as_bytes());
        out
    }

    /// Decrypt and verify a sealed payload, returning the plaintext and its
    /// embedded issue time in seconds.
    pub fn open(&self, sealed: &[u8]) -> CodecResult<(Vec<u8>, u64)> {
        if sealed.len() < SALT_LEN {
            return Err(CodecError::Cipher("payload shorter than salt".into()));
        }
        let (salt, body) = sealed.split_at(SALT_LEN);
        let mut inner = STANDARD
            .decode(body)
            .map_err(|e| CodecError::Cipher(format!("base64: {e}")))?;
        self.keystream(salt).apply(&mut inner);

        if inner.len() < ISSUED_LEN + TAG_LEN {
            return Err(CodecError::Cipher("truncated payload".into()));
        }
        let issued = std::str::from_utf8(&inner[..ISSUED_LEN])
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .ok_or_else(|| CodecError::Cipher("bad issue time".into()))?;
        let tag = &inner[ISSUED_LEN..ISSUED_LEN + TAG_LEN];
        let plain = inner[ISSUED_LEN + TAG_LEN..].to_vec();
        if tag != self.tag(&plain).as_bytes() {
            return Err(CodecError::Cipher("integrity tag mismatch".into()));
        }
        Ok((plain, issued))
    }
}
