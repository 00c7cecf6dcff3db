//! AES-256-GCM encryption for the metadata file.
//!
//! Each call to [`MetadataCipher::seal`] uses a fresh random nonce. The
//! output format is `nonce (12 bytes) || ciphertext || tag (16 bytes)`.

use crate::error::{SyncError, SyncResult};
use aes_gcm::{
    aead::{generic_array::GenericArray, Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of the AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of the GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;
/// Size of the GCM authentication tag in bytes.
pub const TAG_SIZE: usize = 16;

/// Associated data binding ciphertext to the metadata format.
const METADATA_AAD: &[u8] = b"synclane-metadata-v1";

/// Key used to encrypt the metadata file. Zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a new random key.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Creates a key from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if `bytes` is not exactly 32 bytes long.
    pub fn from_bytes(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(SyncError::invalid_key_size(bytes.len(), KEY_SIZE));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Parses a key from 64 hexadecimal characters.
    pub fn from_hex(hex: &str) -> SyncResult<Self> {
        let hex = hex.trim();
        if !hex.is_ascii() {
            return Err(SyncError::invalid_metadata("encryption key is not valid hex"));
        }
        if hex.len() != KEY_SIZE * 2 {
            return Err(SyncError::invalid_key_size(hex.len() / 2, KEY_SIZE));
        }
        let mut bytes = [0u8; KEY_SIZE];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| SyncError::invalid_metadata("encryption key is not valid hex"))?;
        }
        Ok(Self { bytes })
    }

    /// Returns the key bytes. Never log the result.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Seals and opens metadata blobs.
pub struct MetadataCipher {
    cipher: Aes256Gcm,
}

impl MetadataCipher {
    /// Creates a cipher for `key`.
    #[must_use]
    pub fn new(key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { cipher }
    }

    /// Encrypts `plaintext`.
    pub fn seal(&self, plaintext: &[u8]) -> SyncResult<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: METADATA_AAD,
                },
            )
            .map_err(|_| SyncError::encryption_failed("encryption error"))?;

        let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        result.extend_from_slice(&nonce_bytes);
        result.extend(ciphertext);
        Ok(result)
    }

    /// Decrypts data produced by [`seal`](Self::seal).
    ///
    /// # Errors
    ///
    /// Fails on a wrong key or corrupted data.
    pub fn open(&self, sealed: &[u8]) -> SyncResult<Vec<u8>> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(SyncError::decryption_failed("ciphertext too short"));
        }
        let nonce = Nonce::from_slice(&sealed[..NONCE_SIZE]);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &sealed[NONCE_SIZE..],
                    aad: METADATA_AAD,
                },
            )
            .map_err(|_| SyncError::decryption_failed("decryption error"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let cipher = MetadataCipher::new(&EncryptionKey::generate());
        let sealed = cipher.seal(b"user records").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + b"user records".len() + TAG_SIZE);
        assert_eq!(cipher.open(&sealed).unwrap(), b"user records");
    }

    #[test]
    fn wrong_key_fails() {
        let sealed = MetadataCipher::new(&EncryptionKey::generate())
            .seal(b"secret")
            .unwrap();
        let other = MetadataCipher::new(&EncryptionKey::generate());
        assert!(matches!(
            other.open(&sealed),
            Err(SyncError::DecryptionFailed { .. })
        ));
    }

    #[test]
    fn nonces_differ() {
        let cipher = MetadataCipher::new(&EncryptionKey::generate());
        assert_ne!(cipher.seal(b"same").unwrap(), cipher.seal(b"same").unwrap());
    }

    #[test]
    fn key_from_bytes_checks_length() {
        assert!(EncryptionKey::from_bytes(&[0u8; 32]).is_ok());
        assert!(matches!(
            EncryptionKey::from_bytes(&[0u8; 16]),
            Err(SyncError::InvalidKeySize {
                expected: 32,
                actual: 16
            })
        ));
    }

    #[test]
    fn key_from_hex() {
        let hex = "00112233445566778899aabbccddeeff00112233445566778899aabbccddeeff";
        let key = EncryptionKey::from_hex(hex).unwrap();
        assert_eq!(key.as_bytes()[1], 0x11);
        assert_eq!(key.as_bytes()[15], 0xff);
        assert!(EncryptionKey::from_hex("abcd").is_err());
        assert!(EncryptionKey::from_hex(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn debug_redacts_key() {
        let key = EncryptionKey::generate();
        assert!(format!("{key:?}").contains("REDACTED"));
    }
}
