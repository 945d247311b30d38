//! Encrypted storage wrapper.
//!
//! Wraps any [`StorageProvider`] so that every stored value is encrypted at
//! rest with AES-256-GCM.
//!
//! ## Security Model
//!
//! - Each value is encrypted independently with a random 96-bit nonce
//! - Stored form: hex of `nonce (12 bytes) || ciphertext || tag (16 bytes)`
//! - The key name is bound as associated data, so values cannot be swapped
//!   between keys without failing authentication
//! - Key names themselves are stored in the clear
//! - Keys are never stored; they must be provided by the application

use crate::backend::{StorageBackend, StorageProvider};
use crate::encoding::{from_hex, to_hex};
use crate::error::{StorageError, StorageResult};
use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use parking_lot::Mutex;
use rand::RngCore;
use std::collections::HashMap;
use std::sync::Arc;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of AES-256 key in bytes.
pub const KEY_SIZE: usize = 32;
/// Size of GCM nonce in bytes.
pub const NONCE_SIZE: usize = 12;

const KDF_INFO: &[u8] = b"mailsync-cursor-store-v1";

/// Encryption key for [`EncryptedProvider`].
///
/// Key bytes are zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey {
    bytes: [u8; KEY_SIZE],
}

impl EncryptionKey {
    /// Generates a random key.
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
    /// Returns an error if `bytes` is not exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(StorageError::encryption(format!(
                "invalid key size: expected {KEY_SIZE}, got {}",
                bytes.len()
            )));
        }
        let mut key_bytes = [0u8; KEY_SIZE];
        key_bytes.copy_from_slice(bytes);
        Ok(Self { bytes: key_bytes })
    }

    /// Derives a key from a password and salt using HKDF-SHA256.
    ///
    /// # Errors
    ///
    /// Returns an error if HKDF expansion fails.
    pub fn derive_from_password(password: &[u8], salt: &[u8]) -> StorageResult<Self> {
        use hkdf::Hkdf;
        use sha2::Sha256;

        let hk = Hkdf::<Sha256>::new(Some(salt), password);
        let mut bytes = [0u8; KEY_SIZE];
        hk.expand(KDF_INFO, &mut bytes)
            .map_err(|_| StorageError::encryption("HKDF expand failed"))?;
        Ok(Self { bytes })
    }

    /// Returns the key as a byte slice.
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

/// A namespace whose values are encrypted before reaching the inner backend.
pub struct EncryptedBackend {
    inner: Arc<dyn StorageBackend>,
    cipher: Aes256Gcm,
}

impl EncryptedBackend {
    /// Wraps `inner` with the given key.
    pub fn new(inner: Arc<dyn StorageBackend>, key: &EncryptionKey) -> Self {
        let cipher = Aes256Gcm::new(GenericArray::from_slice(key.as_bytes()));
        Self { inner, cipher }
    }

    fn encrypt(&self, key: &str, plaintext: &[u8]) -> StorageResult<String> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::encryption("encryption failed"))?;

        let mut sealed = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(to_hex(&sealed))
    }

    fn decrypt(&self, key: &str, stored: &str) -> StorageResult<Vec<u8>> {
        let sealed = from_hex(stored)
            .ok_or_else(|| StorageError::corrupted(format!("value of {key:?} is not hex")))?;
        if sealed.len() < NONCE_SIZE {
            return Err(StorageError::encryption("ciphertext too short"));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);

        self.cipher
            .decrypt(
                Nonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: key.as_bytes(),
                },
            )
            .map_err(|_| StorageError::encryption("authentication failed"))
    }
}

impl StorageBackend for EncryptedBackend {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let Some(stored) = self.inner.get(key)? else {
            return Ok(None);
        };
        let plaintext = self.decrypt(key, &stored)?;
        String::from_utf8(plaintext)
            .map(Some)
            .map_err(|_| StorageError::corrupted(format!("value of {key:?} is not UTF-8")))
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        let sealed = self.encrypt(key, value.as_bytes())?;
        self.inner.put(key, &sealed)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.inner.remove(key)
    }

    fn clear(&self) -> StorageResult<()> {
        self.inner.clear()
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        self.inner.keys()
    }
}

/// Provider wrapper that encrypts every namespace of `P`.
///
/// # Example
///
/// ```rust
/// use mailsync_storage::{EncryptedProvider, EncryptionKey, InMemoryProvider, StorageProvider};
///
/// let key = EncryptionKey::derive_from_password(b"device secret", b"salt").unwrap();
/// let provider = EncryptedProvider::new(InMemoryProvider::new(), key);
/// provider.open("u1").unwrap().put("latest_event_id", "ev-1").unwrap();
/// ```
pub struct EncryptedProvider<P: StorageProvider> {
    inner: P,
    key: EncryptionKey,
    backends: Mutex<HashMap<String, Arc<EncryptedBackend>>>,
}

impl<P: StorageProvider> EncryptedProvider<P> {
    /// Wraps `inner` so that all values are encrypted with `key`.
    pub fn new(inner: P, key: EncryptionKey) -> Self {
        Self {
            inner,
            key,
            backends: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the wrapped provider.
    pub fn inner(&self) -> &P {
        &self.inner
    }
}

impl<P: StorageProvider> StorageProvider for EncryptedProvider<P> {
    fn open(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        let mut backends = self.backends.lock();
        if let Some(existing) = backends.get(namespace) {
            return Ok(Arc::clone(existing) as Arc<dyn StorageBackend>);
        }
        let backend = Arc::new(EncryptedBackend::new(
            self.inner.open(namespace)?,
            &self.key,
        ));
        backends.insert(namespace.to_string(), Arc::clone(&backend));
        Ok(backend)
    }

    fn namespaces(&self) -> StorageResult<Vec<String>> {
        self.inner.namespaces()
    }

    fn destroy(&self, namespace: &str) -> StorageResult<()> {
        self.backends.lock().remove(namespace);
        self.inner.destroy(namespace)
    }
}
