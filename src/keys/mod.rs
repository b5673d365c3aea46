//! WireGuard key material
//!
//! Keys are 32-byte Curve25519 values exchanged as standard base64, the same
//! encoding `wg genkey` and `wg pubkey` produce.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::Error;

/// Key size in bytes
pub const KEY_SIZE: usize = 32;

fn decode(what: &str, encoded: &str) -> Result<[u8; KEY_SIZE], Error> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::Crypto(format!("{} is not valid base64: {}", what, e)))?;

    if bytes.len() != KEY_SIZE {
        return Err(Error::Crypto(format!(
            "{} must be {} bytes, got {}",
            what,
            KEY_SIZE,
            bytes.len()
        )));
    }

    let mut key = [0u8; KEY_SIZE];
    key.copy_from_slice(&bytes);
    Ok(key)
}

/// A peer's public key
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_SIZE]);

impl PublicKey {
    /// Decode a public key from base64
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        decode("public key", encoded).map(Self)
    }

    /// Encode the key as base64
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b64 = self.to_base64();
        write!(f, "PublicKey({}...)", &b64[..8])
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base64())
    }
}

/// Secret key material: an interface private key or a peer preshared key
///
/// Never printed, `Debug` is redacted. Zeroized when dropped.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey([u8; KEY_SIZE]);

impl SecretKey {
    /// Decode a private key from base64
    pub fn private_from_base64(encoded: &str) -> Result<Self, Error> {
        decode("private key", encoded).map(Self)
    }

    /// Decode a preshared key from base64
    pub fn preshared_from_base64(encoded: &str) -> Result<Self, Error> {
        decode("preshared key", encoded).map(Self)
    }

    /// Encode the key as base64, for handing to the kernel device
    pub fn expose_base64(&self) -> Zeroizing<String> {
        Zeroizing::new(STANDARD.encode(self.0))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}
