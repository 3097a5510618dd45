//! One-way hash strategies used by challenge responses, limited passwords
//! and secret obfuscation.
//!
//! A [`Hasher`] moves through `Fresh -> Finalized`; any update or second
//! finalize after finalization is an explicit [`GridError::Resource`].

use std::fmt;
use std::str::FromStr;

use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};

use super::secret::{digest_input, Challenge, FixedBuf, Password, Response};
use crate::error::{ErrorCode, GridError, Result};

/// Size of the zero-padded buffer hashed when deriving a limited password.
pub const LIMITED_PASSWORD_INPUT_LEN: usize = 100;

/// Hash used for limited passwords on both sides, independent of either
/// side's configured default.
pub const LIMITED_PASSWORD_SCHEME: HashScheme = HashScheme::Md5;

/// Digest algorithm selection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashScheme {
    /// MD5 (wire default)
    #[default]
    Md5,
    /// SHA-1, truncated to the response length
    Sha1,
    /// SHA-256, truncated to the response length
    Sha256,
}

impl HashScheme {
    /// Get scheme name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha1 => "sha1",
            Self::Sha256 => "sha256",
        }
    }
}

impl fmt::Display for HashScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashScheme {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha1" | "sha-1" => Ok(Self::Sha1),
            "sha256" | "sha-256" => Ok(Self::Sha256),
            _ => Err(GridError::Config(format!("Unknown hash scheme: {s}"))),
        }
    }
}

/// How strictly the agent matches the client's hash scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashPolicy {
    /// Only the agent's default scheme is tried.
    Strict,
    /// The default scheme, then md5 and sha1.
    #[default]
    Compatible,
}

impl HashPolicy {
    /// Schemes to try, in order, given the agent default.
    pub fn candidates(&self, default: HashScheme) -> Vec<HashScheme> {
        match self {
            Self::Strict => vec![default],
            Self::Compatible => {
                let mut schemes = vec![default];
                for scheme in [HashScheme::Md5, HashScheme::Sha1] {
                    if !schemes.contains(&scheme) {
                        schemes.push(scheme);
                    }
                }
                schemes
            },
        }
    }
}

impl FromStr for HashPolicy {
    type Err = GridError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "compatible" => Ok(Self::Compatible),
            _ => Err(GridError::Config(format!("Unknown hash policy: {s}"))),
        }
    }
}

enum HasherState {
    Md5(Md5),
    Sha1(Sha1),
    Sha256(Sha256),
    Finalized,
}

/// Incremental hasher with an explicit finalized state.
pub struct Hasher {
    scheme: HashScheme,
    state: HasherState,
}

impl Hasher {
    /// Start a new digest.
    pub fn new(scheme: HashScheme) -> Self {
        let state = match scheme {
            HashScheme::Md5 => HasherState::Md5(Md5::new()),
            HashScheme::Sha1 => HasherState::Sha1(Sha1::new()),
            HashScheme::Sha256 => HasherState::Sha256(Sha256::new()),
        };
        Self { scheme, state }
    }

    /// Scheme in use.
    pub fn scheme(&self) -> HashScheme {
        self.scheme
    }

    /// Feed more input.
    pub fn update(&mut self, data: &[u8]) -> Result<()> {
        match &mut self.state {
            HasherState::Md5(h) => h.update(data),
            HasherState::Sha1(h) => h.update(data),
            HasherState::Sha256(h) => h.update(data),
            HasherState::Finalized => {
                return Err(GridError::resource(
                    ErrorCode::SYS_LIBRARY_ERROR,
                    format!("{} digest updated after finalize", self.scheme),
                ))
            },
        }
        Ok(())
    }

    /// Produce the digest; the hasher cannot be used afterwards.
    pub fn finalize(&mut self) -> Result<Vec<u8>> {
        match std::mem::replace(&mut self.state, HasherState::Finalized) {
            HasherState::Md5(h) => Ok(h.finalize().to_vec()),
            HasherState::Sha1(h) => Ok(h.finalize().to_vec()),
            HasherState::Sha256(h) => Ok(h.finalize().to_vec()),
            HasherState::Finalized => Err(GridError::resource(
                ErrorCode::SYS_LIBRARY_ERROR,
                format!("{} digest finalized twice", self.scheme),
            )),
        }
    }

    /// Check if the digest was already produced.
    pub fn is_finalized(&self) -> bool {
        matches!(self.state, HasherState::Finalized)
    }
}

/// Hash `data` in one step.
pub fn one_way_hash(scheme: HashScheme, data: &[u8]) -> Result<Vec<u8>> {
    let mut hasher = Hasher::new(scheme);
    hasher.update(data)?;
    hasher.finalize()
}

/// Response to `challenge` for `secret`.
pub fn challenge_response(
    scheme: HashScheme,
    challenge: &Challenge,
    secret: &[u8],
) -> Result<Response> {
    let input = digest_input(challenge, secret);
    let digest = one_way_hash(scheme, input.padded())?;
    Response::from_digest(&digest)
}

/// Limited password for `password` salted with the agent's `string_to_hash_with`.
pub fn limited_password(string_to_hash_with: &str, password: &Password) -> Result<Password> {
    let mut input = FixedBuf::<LIMITED_PASSWORD_INPUT_LEN>::new();
    input.extend_truncated(string_to_hash_with.as_bytes());
    input.extend_truncated(password.as_bytes());
    let digest = one_way_hash(LIMITED_PASSWORD_SCHEME, input.padded())?;
    Password::new(&to_hex(&digest[..super::secret::RESPONSE_LEN]))
}

/// Lowercase hex encoding.
pub fn to_hex(bytes: &[u8]) -> String {
    const DIGITS: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(DIGITS[(byte >> 4) as usize] as char);
        out.push(DIGITS[(byte & 0x0f) as usize] as char);
    }
    out
}

/// Decode hex, accepting either case.
pub fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }

    hex.as_bytes()
        .chunks(2)
        .map(|chunk| Some((hex_nibble(chunk[0])? << 4) | hex_nibble(chunk[1])?))
        .collect()
}

fn hex_nibble(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}
