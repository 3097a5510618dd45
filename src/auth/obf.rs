//! Secret obfuscation and the persisted authentication file.
//!
//! Obfuscation rotates each character around a fixed 77-symbol wheel by a
//! key stream derived from chained digests of the key:
//!
//! ```text
//! wheel    = 0-9 A-Z a-z ! " # $ % & ' ( ) * + , - . /
//! stream   = H(key100) | H(s[0..16]) | H(s[0..32]) | H(s[0..32])   (61 bytes used)
//! encode   = wheel[(i + k + prev) mod 77]
//! decode   = wheel[(i - k - prev) mod 77]
//! ```
//!
//! `prev` is the previous ciphertext symbol when chaining is enabled. Symbols
//! off the wheel pass through unchanged but still consume key stream. A sha1
//! key stream is marked by a `sha1` prefix on the output.
//!
//! This hides secrets from casual inspection; it is not encryption.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use super::digest::{one_way_hash, HashScheme};
use super::secret::{FixedBuf, Password};
use crate::error::{ErrorCode, GridError, Result};

const WHEEL_LEN: usize = 77;
const KEY_INPUT_LEN: usize = 100;
const KEY_STREAM_WRAP: usize = 61;
const SHA1_PREFIX: &str = "sha1";

/// Seed mixed into the auth file key.
const AUTH_FILE_KEY_SEED: &str = "gridlink-auth-file";

fn wheel() -> [char; WHEEL_LEN] {
    let mut wheel = ['\0'; WHEEL_LEN];
    let symbols = ('0'..='9')
        .chain('A'..='Z')
        .chain('a'..='z')
        .chain('!'..='/');
    for (slot, c) in wheel.iter_mut().zip(symbols) {
        *slot = c;
    }
    wheel
}

fn wheel_index(wheel: &[char; WHEEL_LEN], c: char) -> Option<usize> {
    wheel.iter().position(|w| *w == c)
}

fn key_stream(key: &str, scheme: HashScheme) -> Result<[u8; 64]> {
    let key_input = FixedBuf::<KEY_INPUT_LEN>::truncated(key.as_bytes());
    let mut stream = [0u8; 64];

    let first = one_way_hash(scheme, key_input.padded())?;
    stream[..16].copy_from_slice(&first[..16]);
    let second = one_way_hash(scheme, &stream[..16])?;
    stream[16..32].copy_from_slice(&second[..16]);
    let third = one_way_hash(scheme, &stream[..32])?;
    stream[32..48].copy_from_slice(&third[..16]);
    let fourth = one_way_hash(scheme, &stream[..32])?;
    stream[48..64].copy_from_slice(&fourth[..16]);

    Ok(stream)
}

/// Wheel cipher configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Obfuscator {
    scheme: HashScheme,
    chaining: bool,
}

impl Default for Obfuscator {
    fn default() -> Self {
        Self {
            scheme: HashScheme::Md5,
            chaining: true,
        }
    }
}

impl Obfuscator {
    /// Create an obfuscator; only md5 and sha1 key streams are supported.
    pub fn new(scheme: HashScheme, chaining: bool) -> Result<Self> {
        if scheme == HashScheme::Sha256 {
            return Err(GridError::Config(
                "obfuscation supports md5 and sha1 key streams only".to_string(),
            ));
        }
        Ok(Self { scheme, chaining })
    }

    /// Obfuscate `plain` with `key`.
    pub fn obfuscate(&self, plain: &str, key: &str) -> Result<String> {
        let wheel = wheel();
        let stream = key_stream(key, self.scheme)?;
        let mut out = String::with_capacity(plain.len() + SHA1_PREFIX.len());
        if self.scheme == HashScheme::Sha1 {
            out.push_str(SHA1_PREFIX);
        }

        let mut prev = 0usize;
        for (n, c) in plain.chars().enumerate() {
            let k = stream[n % KEY_STREAM_WRAP] as usize;
            match wheel_index(&wheel, c) {
                Some(i) => {
                    let encoded = wheel[(i + k + prev) % WHEEL_LEN];
                    if self.chaining {
                        prev = encoded as usize;
                    }
                    out.push(encoded);
                },
                None => out.push(c),
            }
        }
        Ok(out)
    }

    /// Reverse [`Obfuscator::obfuscate`]; the key stream follows the input's prefix.
    pub fn deobfuscate(&self, text: &str, key: &str) -> Result<String> {
        let (scheme, body) = match text.strip_prefix(SHA1_PREFIX) {
            Some(rest) => (HashScheme::Sha1, rest),
            None => (HashScheme::Md5, text),
        };
        let wheel = wheel();
        let stream = key_stream(key, scheme)?;
        let mut out = String::with_capacity(body.len());

        let mut prev = 0usize;
        for (n, c) in body.chars().enumerate() {
            let k = stream[n % KEY_STREAM_WRAP] as usize;
            match wheel_index(&wheel, c) {
                Some(i) => {
                    let shift = (k + prev) % WHEEL_LEN;
                    out.push(wheel[(i + WHEEL_LEN - shift) % WHEEL_LEN]);
                    if self.chaining {
                        prev = c as usize;
                    }
                },
                None => out.push(c),
            }
        }
        Ok(out)
    }
}

/// Obfuscate with the default (md5, chained) configuration.
pub fn obfuscate(plain: &str, key: &str) -> Result<String> {
    Obfuscator::default().obfuscate(plain, key)
}

/// Deobfuscate with the default configuration.
pub fn deobfuscate(text: &str, key: &str) -> Result<String> {
    Obfuscator::default().deobfuscate(text, key)
}

/// On-disk store for one obfuscated secret.
#[derive(Debug, Clone)]
pub struct AuthFile {
    path: PathBuf,
    obfuscator: Obfuscator,
}

impl AuthFile {
    /// Auth file at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            obfuscator: Obfuscator::default(),
        }
    }

    /// Use a different key stream scheme for writing.
    pub fn with_obfuscator(mut self, obfuscator: Obfuscator) -> Self {
        self.obfuscator = obfuscator;
        self
    }

    /// `~/.grid/.gridA`, if a home directory is known.
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".grid").join(".gridA"))
    }

    /// File location.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check whether the file exists.
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Obfuscate and persist `password`, replacing any previous content.
    pub fn save(&self, password: &Password) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = open_private(&self.path)?;
        let key = file_key(&file.metadata()?);
        let text = self.obfuscator.obfuscate(&password.expose(), &key)?;
        file.write_all(text.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;

        tracing::debug!(path = %self.path.display(), "Wrote authentication file");
        Ok(())
    }

    /// Load the persisted secret; `None` if the file does not exist.
    pub fn load(&self) -> Result<Option<Password>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let line = content.lines().next().unwrap_or("").trim_end();
        if line.is_empty() {
            return Err(GridError::auth(
                ErrorCode::USER_AUTH_STRING_EMPTY,
                format!("authentication file {} is empty", self.path.display()),
            ));
        }

        let key = file_key(&fs::metadata(&self.path)?);
        let plain = self.obfuscator.deobfuscate(line, &key)?;
        Password::new(&plain).map(Some)
    }

    /// Delete the file; missing files are not an error.
    pub fn remove(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

    let file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    file.set_permissions(fs::Permissions::from_mode(0o600))?;
    Ok(file)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

#[cfg(unix)]
fn file_key(metadata: &fs::Metadata) -> String {
    use std::os::unix::fs::MetadataExt;
    format!("{}{}", AUTH_FILE_KEY_SEED, metadata.uid())
}

#[cfg(not(unix))]
fn file_key(_metadata: &fs::Metadata) -> String {
    AUTH_FILE_KEY_SEED.to_string()
}
