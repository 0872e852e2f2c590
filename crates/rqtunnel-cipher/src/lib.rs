//! Stream ciphers for the protected leg of a tunnel
//!
//! A [`CipherSpec`] is built once from the configured method name and shared
//! secret. Every connection that crosses the network between the two tunnel
//! processes gets its own [`Cipher`] from it: stream cipher state is
//! connection specific and must never be shared or swapped mid-stream.
//!
//! Ciphers are pure keystream transforms. There is no framing, so a
//! ciphertext byte stream has exactly the length of its plaintext and can be
//! layered directly onto a socket's read and write paths.

use rc4::consts::U32;
use rc4::{KeyInit, Rc4, StreamCipher};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Cipher configuration errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("Unknown cipher method '{0}' (supported: none, rc4)")]
    UnknownMethod(String),

    #[error("Cipher method '{0}' requires a non-empty secret")]
    EmptySecret(CipherMethod),
}

/// Supported stream cipher methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherMethod {
    /// Identity transform, bytes pass through untouched
    None,
    /// RC4 keyed with SHA-256 of the shared secret
    Rc4,
}

impl CipherMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CipherMethod::None => "none",
            CipherMethod::Rc4 => "rc4",
        }
    }
}

impl fmt::Display for CipherMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherMethod {
    type Err = CipherError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "none" => Ok(CipherMethod::None),
            "rc4" => Ok(CipherMethod::Rc4),
            _ => Err(CipherError::UnknownMethod(s.to_string())),
        }
    }
}

/// Validated cipher parameters, the factory for per-connection [`Cipher`]s
#[derive(Clone)]
pub struct CipherSpec {
    method: CipherMethod,
    key: [u8; 32],
}

impl CipherSpec {
    /// Build a spec from a method name and the shared secret.
    ///
    /// Unknown method names are rejected; there is no fallback to `none`.
    pub fn new(method: &str, secret: impl AsRef<[u8]>) -> Result<Self, CipherError> {
        let method = method.parse::<CipherMethod>()?;
        Self::with_method(method, secret)
    }

    pub fn with_method(
        method: CipherMethod,
        secret: impl AsRef<[u8]>,
    ) -> Result<Self, CipherError> {
        let secret = secret.as_ref();
        if method != CipherMethod::None && secret.is_empty() {
            return Err(CipherError::EmptySecret(method));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&Sha256::digest(secret));
        tracing::debug!(method = %method, "Derived tunnel cipher key");

        Ok(Self { method, key })
    }

    /// Spec that never transforms anything
    pub fn none() -> Self {
        Self {
            method: CipherMethod::None,
            key: [0u8; 32],
        }
    }

    pub fn method(&self) -> CipherMethod {
        self.method
    }

    pub fn is_identity(&self) -> bool {
        self.method == CipherMethod::None
    }

    /// Create a fresh cipher with independent encrypt and decrypt states.
    pub fn new_cipher(&self) -> Cipher {
        Cipher {
            encryptor: Encryptor(self.keystream()),
            decryptor: Decryptor(self.keystream()),
        }
    }

    fn keystream(&self) -> Keystream {
        match self.method {
            CipherMethod::None => Keystream::Identity,
            CipherMethod::Rc4 => Keystream::Rc4(Box::new(Rc4::<U32>::new(&self.key.into()))),
        }
    }
}

impl fmt::Debug for CipherSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherSpec")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

enum Keystream {
    Identity,
    Rc4(Box<Rc4<U32>>),
}

impl Keystream {
    fn apply(&mut self, buf: &mut [u8]) {
        match self {
            Keystream::Identity => {}
            Keystream::Rc4(rc4) => rc4.apply_keystream(buf),
        }
    }
}

impl fmt::Debug for Keystream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Keystream::Identity => f.write_str("Identity"),
            Keystream::Rc4(_) => f.write_str("Rc4"),
        }
    }
}

/// Write-direction keystream of one connection
#[derive(Debug)]
pub struct Encryptor(Keystream);

impl Encryptor {
    /// Encrypt `buf` in place, advancing the stream state by `buf.len()`.
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.0.apply(buf);
    }
}

/// Read-direction keystream of one connection
#[derive(Debug)]
pub struct Decryptor(Keystream);

impl Decryptor {
    /// Decrypt `buf` in place, advancing the stream state by `buf.len()`.
    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.0.apply(buf);
    }
}

/// Stateful encrypt/decrypt pair owned by exactly one connection
#[derive(Debug)]
pub struct Cipher {
    encryptor: Encryptor,
    decryptor: Decryptor,
}

impl Cipher {
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.encryptor.encrypt(buf);
    }

    pub fn decrypt(&mut self, buf: &mut [u8]) {
        self.decryptor.decrypt(buf);
    }

    /// Split into halves so the read and write paths can run on different tasks
    pub fn into_split(self) -> (Encryptor, Decryptor) {
        (self.encryptor, self.decryptor)
    }
}
