//! Cryptographic primitives consumed by the packet codec.
//!
//! All byte strings crossing the [CryptoProvider] interface are *atom bytes*, i.e. the
//!  little-endian representation of an integer, without trailing zero bytes. The underlying
//!  ciphers work on big-endian byte strings, so [UrCrypto] reverses everything on the way in
//!  and out. This convention is part of the wire compatibility surface.

use aes_siv::siv::Aes256Siv;
use aes_siv::KeyInit;
use ed25519_dalek::SigningKey;
#[cfg(test)] use mockall::automock;
use num_bigint::BigUint;
use num_traits::One;
use sha2::{Digest, Sha512};
use tracing::trace;

use crate::error::AmesError;

#[cfg_attr(test, automock)]
pub trait CryptoProvider: Send + Sync + 'static {
    /// Derives the X25519 shared secret between a remote ed25519 public key and a local ed25519
    ///  seed.
    fn shared_secret(&self, public_key: &[u8; 32], private_seed: &[u8; 32]) -> [u8; 32];

    /// AES-256-SIV encryption, returning `(iv, ciphertext)`. The ciphertext has the same length
    ///  as the plaintext.
    fn siv_encrypt(&self, plaintext: &[u8], associated_data: &[Vec<u8>], key: &[u8; 64]) -> anyhow::Result<([u8; 16], Vec<u8>)>;

    /// Fails with [AmesError::Decryption] if the ciphertext, associated data, key or iv do not
    ///  authenticate.
    fn siv_decrypt(&self, ciphertext: &[u8], associated_data: &[Vec<u8>], key: &[u8; 64], iv: &[u8; 16]) -> anyhow::Result<Vec<u8>>;
}

/// A peer's symmetric session key, i.e. the raw shared secret
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey(Vec<u8>);

impl SymmetricKey {
    pub fn new(raw: impl Into<Vec<u8>>) -> SymmetricKey {
        SymmetricKey(raw.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The 64 byte AES-SIV key derived from this secret
    pub fn siv_key(&self) -> [u8; 64] {
        let digest = Sha512::digest(&self.0);
        let mut key = [0u8; 64];
        key.copy_from_slice(&digest);
        key
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SymmetricKey(<{} bytes>)", self.0.len())
    }
}

/// The atom's minimal little-endian bytes; zero is the empty string
pub fn atom_bytes(atom: &BigUint) -> Vec<u8> {
    if atom.bits() == 0 {
        Vec::new()
    }
    else {
        atom.to_bytes_le()
    }
}

/// Little-endian bytes padded (or truncated) to exactly `len`
pub fn atom_bytes_padded(atom: &BigUint, len: usize) -> Vec<u8> {
    let mut bytes = atom_bytes(atom);
    bytes.resize(len, 0);
    bytes
}

fn field_prime() -> BigUint {
    (BigUint::one() << 255u32) - 19u32
}

/// The ed25519 public key matching an encryption seed, as published in the key directory
pub fn encryption_public_key(seed: &[u8; 32]) -> [u8; 32] {
    SigningKey::from_bytes(seed)
        .verifying_key()
        .to_bytes()
}

fn reversed(bytes: &[u8]) -> Vec<u8> {
    bytes.iter().rev().copied().collect()
}

/// [CryptoProvider] based on RustCrypto's AES-SIV and dalek's X25519
pub struct UrCrypto;

impl UrCrypto {
    fn cipher(key: &[u8; 64]) -> anyhow::Result<Aes256Siv> {
        Aes256Siv::new_from_slice(&reversed(key))
            .map_err(|e| AmesError::Decryption(format!("invalid AES-SIV key: {}", e)).into())
    }

    /// Maps an ed25519 public key (compressed Edwards y) to its Montgomery u coordinate:
    ///  `u = (1 + y) / (1 - y) mod 2^255 - 19`
    fn edwards_to_montgomery(public_key: &[u8; 32]) -> [u8; 32] {
        let p = field_prime();

        let mut y_bytes = *public_key;
        y_bytes[31] &= 0x7f;
        let y = BigUint::from_bytes_le(&y_bytes) % &p;

        let numerator = (BigUint::one() + &y) % &p;
        let denominator = (&p + BigUint::one() - &y) % &p;
        let inverse = denominator.modpow(&(&p - 2u32), &p);
        let u = (numerator * inverse) % &p;

        let mut result = [0u8; 32];
        for (dst, src) in result.iter_mut().zip(u.to_bytes_le()) {
            *dst = src;
        }
        result
    }
}

impl CryptoProvider for UrCrypto {
    fn shared_secret(&self, public_key: &[u8; 32], private_seed: &[u8; 32]) -> [u8; 32] {
        let hashed = Sha512::digest(private_seed);
        let mut scalar = [0u8; 32];
        scalar.copy_from_slice(&hashed[..32]);

        // x25519 clamps the scalar
        x25519_dalek::x25519(scalar, Self::edwards_to_montgomery(public_key))
    }

    fn siv_encrypt(&self, plaintext: &[u8], associated_data: &[Vec<u8>], key: &[u8; 64]) -> anyhow::Result<([u8; 16], Vec<u8>)> {
        let headers = associated_data.iter()
            .map(|ad| reversed(ad))
            .collect::<Vec<_>>();

        let sealed = Self::cipher(key)?
            .encrypt(&headers, &reversed(plaintext))
            .map_err(|_| AmesError::Decryption("AES-SIV encryption failed".to_string()))?;
        trace!("encrypted {} bytes", plaintext.len());

        let (raw_iv, raw_cipher) = sealed.split_at(16);
        let mut iv = [0u8; 16];
        for (dst, src) in iv.iter_mut().zip(raw_iv.iter().rev()) {
            *dst = *src;
        }
        Ok((iv, reversed(raw_cipher)))
    }

    fn siv_decrypt(&self, ciphertext: &[u8], associated_data: &[Vec<u8>], key: &[u8; 64], iv: &[u8; 16]) -> anyhow::Result<Vec<u8>> {
        let headers = associated_data.iter()
            .map(|ad| reversed(ad))
            .collect::<Vec<_>>();

        let mut sealed = reversed(iv);
        sealed.extend(ciphertext.iter().rev());

        let plaintext = Self::cipher(key)?
            .decrypt(&headers, &sealed)
            .map_err(|_| AmesError::Decryption("AES-SIV authentication failed".to_string()))?;
        Ok(reversed(&plaintext))
    }
}
