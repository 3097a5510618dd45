//! Fixed-capacity buffers for challenges, passwords and responses.
//!
//! Every buffer tracks its own length and rejects input that does not fit,
//! so padding and truncation happen in exactly one place.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{ErrorCode, GridError, Result};

/// Length of the agent challenge in bytes.
pub const CHALLENGE_LEN: usize = 64;

/// Length of the challenge response (digest) in bytes.
pub const RESPONSE_LEN: usize = 16;

/// Maximum password length in bytes.
pub const MAX_PASSWORD_LEN: usize = 50;

/// Length of the hex session signature.
pub const SESSION_SIGNATURE_LEN: usize = RESPONSE_LEN * 2;

/// Size of the buffer hashed for a challenge response.
pub const DIGEST_INPUT_LEN: usize = CHALLENGE_LEN + MAX_PASSWORD_LEN;

/// Bounds-checked byte array with explicit length.
///
/// Unused capacity is always zero, so [`FixedBuf::padded`] yields the
/// zero-padded form the digests are computed over.
#[derive(Clone)]
pub struct FixedBuf<const N: usize> {
    bytes: [u8; N],
    len: usize,
}

impl<const N: usize> FixedBuf<N> {
    /// Empty buffer.
    pub fn new() -> Self {
        Self {
            bytes: [0u8; N],
            len: 0,
        }
    }

    /// Copy `data` into a new buffer; fails if it exceeds the capacity.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let mut buf = Self::new();
        buf.extend(data).then_some(buf)
    }

    /// Copy as much of `data` as fits, dropping the rest.
    pub fn truncated(data: &[u8]) -> Self {
        let mut buf = Self::new();
        let take = data.len().min(N);
        buf.bytes[..take].copy_from_slice(&data[..take]);
        buf.len = take;
        buf
    }

    /// Append `data`; returns false and leaves the buffer untouched if it does not fit.
    pub fn extend(&mut self, data: &[u8]) -> bool {
        let Some(end) = self.len.checked_add(data.len()).filter(|end| *end <= N) else {
            return false;
        };
        self.bytes[self.len..end].copy_from_slice(data);
        self.len = end;
        true
    }

    /// Append as much of `data` as fits.
    pub fn extend_truncated(&mut self, data: &[u8]) {
        let take = data.len().min(N - self.len);
        self.bytes[self.len..self.len + take].copy_from_slice(&data[..take]);
        self.len += take;
    }

    /// Used bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The full zero-padded array.
    pub fn padded(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Number of used bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if no bytes are used.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Total capacity.
    pub const fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for FixedBuf<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Drop for FixedBuf<N> {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl<const N: usize> fmt::Debug for FixedBuf<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FixedBuf<{}>([REDACTED, {} bytes])", N, self.len)
    }
}

/// Agent-generated random challenge, single use per authentication attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct Challenge([u8; CHALLENGE_LEN]);

impl Challenge {
    /// Fresh random challenge.
    pub fn random() -> Self {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Challenge from raw bytes; the length must be exact.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; CHALLENGE_LEN] = bytes.try_into().map_err(|_| {
            GridError::auth(
                ErrorCode::SYS_INVALID_INPUT_PARAM,
                format!(
                    "challenge must be {} bytes, got {}",
                    CHALLENGE_LEN,
                    bytes.len()
                ),
            )
        })?;
        Ok(Self(arr))
    }

    /// Decode the base64 wire form.
    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = STANDARD.decode(text).map_err(|e| {
            GridError::auth(
                ErrorCode::SYS_INVALID_INPUT_PARAM,
                format!("malformed challenge: {e}"),
            )
        })?;
        Self::from_bytes(&bytes)
    }

    /// Base64 wire form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; CHALLENGE_LEN] {
        &self.0
    }

    /// Signature derived from the leading bytes of this challenge.
    pub fn session_signature(&self) -> SessionSignature {
        SessionSignature(crate::auth::digest::to_hex(&self.0[..RESPONSE_LEN]))
    }
}

impl fmt::Debug for Challenge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Challenge([{} bytes])", CHALLENGE_LEN)
    }
}

/// Hex value derived from the first challenge of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSignature(String);

impl SessionSignature {
    /// Hex text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Password bounded by [`MAX_PASSWORD_LEN`], zeroed on drop.
#[derive(Clone, Default)]
pub struct Password(FixedBuf<MAX_PASSWORD_LEN>);

impl Password {
    /// Password from text; rejects anything longer than the maximum.
    pub fn new(text: &str) -> Result<Self> {
        FixedBuf::from_slice(text.as_bytes()).map(Self).ok_or_else(|| {
            GridError::auth(
                ErrorCode::PASSWORD_EXCEEDS_MAX_SIZE,
                format!(
                    "password of {} bytes exceeds maximum of {}",
                    text.len(),
                    MAX_PASSWORD_LEN
                ),
            )
        })
    }

    /// Empty password (anonymous users).
    pub fn empty() -> Self {
        Self::default()
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    /// Text form; passwords are built from `&str` so this is lossless.
    pub fn expose(&self) -> String {
        String::from_utf8_lossy(self.0.as_slice()).into_owned()
    }

    /// Check if the password is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl PartialEq for Password {
    fn eq(&self, other: &Self) -> bool {
        constant_time_eq(self.as_bytes(), other.as_bytes())
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Password([REDACTED])")
    }
}

/// Challenge response sent by the client.
#[derive(Clone, PartialEq, Eq)]
pub struct Response([u8; RESPONSE_LEN]);

impl Response {
    /// Response from digest output: truncated to [`RESPONSE_LEN`], zero bytes bumped to 1.
    pub fn from_digest(digest: &[u8]) -> Result<Self> {
        if digest.len() < RESPONSE_LEN {
            return Err(GridError::resource(
                ErrorCode::SYS_LIBRARY_ERROR,
                format!("digest of {} bytes is too short", digest.len()),
            ));
        }
        let mut bytes = [0u8; RESPONSE_LEN];
        bytes.copy_from_slice(&digest[..RESPONSE_LEN]);
        for byte in &mut bytes {
            if *byte == 0 {
                *byte = 1;
            }
        }
        Ok(Self(bytes))
    }

    /// Decode the base64 wire form.
    pub fn from_base64(text: &str) -> Result<Self> {
        let bytes = STANDARD.decode(text).map_err(|e| {
            GridError::auth(
                ErrorCode::CAT_INVALID_AUTHENTICATION,
                format!("malformed digest: {e}"),
            )
        })?;
        let arr: [u8; RESPONSE_LEN] = bytes.as_slice().try_into().map_err(|_| {
            GridError::auth(
                ErrorCode::CAT_INVALID_AUTHENTICATION,
                format!("digest must be {} bytes, got {}", RESPONSE_LEN, bytes.len()),
            )
        })?;
        Ok(Self(arr))
    }

    /// Base64 wire form.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; RESPONSE_LEN] {
        &self.0
    }

    /// Full-length comparison that does not stop at the first difference.
    pub fn matches(&self, other: &Response) -> bool {
        constant_time_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Response([REDACTED])")
    }
}

/// challenge‖secret, zero-padded to [`DIGEST_INPUT_LEN`].
pub fn digest_input(challenge: &Challenge, secret: &[u8]) -> FixedBuf<DIGEST_INPUT_LEN> {
    let mut buf = FixedBuf::<DIGEST_INPUT_LEN>::new();
    buf.extend_truncated(challenge.as_bytes());
    buf.extend_truncated(secret);
    buf
}

/// Constant-time comparison to prevent timing attacks
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}
