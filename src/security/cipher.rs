use aes::cipher::block_padding::Pkcs7;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::protocol::SessionId;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Shared secret mixed into every session key derivation. Fixed by the
/// deployed client builds; changing it breaks datagram interop.
pub const UDP_SHARED_SECRET: &str = "RacingServerUDP2024!";

/// Size of the little-endian length prefix framing each encrypted datagram.
pub const LENGTH_PREFIX_SIZE: usize = 4;

const BLOCK_SIZE: usize = 16;
const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 16;

/// Errors produced while unframing/decrypting a datagram.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CipherError {
    #[error("packet too short for a length prefix ({0} bytes)")]
    TruncatedPacket(usize),
    #[error("length prefix {prefix} does not match payload length {actual}")]
    LengthMismatch { prefix: usize, actual: usize },
    #[error("ciphertext length {0} is not a positive multiple of the AES block size")]
    NotBlockAligned(usize),
    #[error("padding verification failed")]
    BadPadding,
    #[error("plaintext is not valid UTF-8 JSON")]
    InvalidPlaintext,
}

/// Per-session AES-256-CBC datagram cipher.
///
/// Key material is `SHA-256(session_id || UDP_SHARED_SECRET)`: the key is the
/// full digest, the IV is the digest's last 16 bytes. The IV therefore
/// overlaps the key and is fixed for the session lifetime; deployed clients
/// derive the same material, so this construction is reproduced exactly.
pub struct DatagramCipher {
    key: [u8; KEY_SIZE],
    iv: [u8; IV_SIZE],
}

impl std::fmt::Debug for DatagramCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("DatagramCipher").finish_non_exhaustive()
    }
}

impl DatagramCipher {
    /// Derive the cipher for a session from its wire-form id.
    #[must_use]
    pub fn for_session(session_id: &SessionId) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(session_id.as_str().as_bytes());
        hasher.update(UDP_SHARED_SECRET.as_bytes());
        let digest = hasher.finalize();

        let mut key = [0u8; KEY_SIZE];
        key.copy_from_slice(&digest);
        let mut iv = [0u8; IV_SIZE];
        iv.copy_from_slice(&digest[KEY_SIZE - IV_SIZE..]);
        Self { key, iv }
    }

    /// Whether a raw datagram carries the encrypted length-prefix framing.
    #[must_use]
    pub fn looks_encrypted(datagram: &[u8]) -> bool {
        if datagram.len() < LENGTH_PREFIX_SIZE {
            return false;
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&datagram[..LENGTH_PREFIX_SIZE]);
        u32::from_le_bytes(prefix) as usize == datagram.len() - LENGTH_PREFIX_SIZE
    }

    /// Encrypt a plaintext and frame it with the length prefix.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let ciphertext = Aes256CbcEnc::new(&self.key.into(), &self.iv.into())
            .encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut packet = Vec::with_capacity(LENGTH_PREFIX_SIZE + ciphertext.len());
        packet.extend_from_slice(&(ciphertext.len() as u32).to_le_bytes());
        packet.extend_from_slice(&ciphertext);
        packet
    }

    /// Encrypt a JSON object for the wire.
    #[must_use]
    pub fn encrypt_value(&self, value: &Value) -> Vec<u8> {
        self.encrypt(value.to_string().as_bytes())
    }

    /// Unframe and decrypt a datagram to its plaintext bytes.
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, CipherError> {
        if packet.len() < LENGTH_PREFIX_SIZE {
            return Err(CipherError::TruncatedPacket(packet.len()));
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&packet[..LENGTH_PREFIX_SIZE]);
        let declared = u32::from_le_bytes(prefix) as usize;

        let body = &packet[LENGTH_PREFIX_SIZE..];
        if declared != body.len() {
            return Err(CipherError::LengthMismatch {
                prefix: declared,
                actual: body.len(),
            });
        }
        if body.is_empty() || body.len() % BLOCK_SIZE != 0 {
            return Err(CipherError::NotBlockAligned(body.len()));
        }

        Aes256CbcDec::new(&self.key.into(), &self.iv.into())
            .decrypt_padded_vec_mut::<Pkcs7>(body)
            .map_err(|_| CipherError::BadPadding)
    }

    /// Unframe, decrypt, and parse a datagram as a JSON object.
    pub fn decrypt_value(&self, packet: &[u8]) -> Result<Value, CipherError> {
        let plaintext = self.decrypt(packet)?;
        let text = std::str::from_utf8(&plaintext).map_err(|_| CipherError::InvalidPlaintext)?;
        serde_json::from_str(text).map_err(|_| CipherError::InvalidPlaintext)
    }

    #[cfg(test)]
    pub(crate) fn key_material(&self) -> (&[u8; KEY_SIZE], &[u8; IV_SIZE]) {
        (&self.key, &self.iv)
    }
}
