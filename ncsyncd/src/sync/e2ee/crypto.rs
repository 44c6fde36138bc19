use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chacha20poly1305::{ChaCha20Poly1305, Key, KeyInit, Nonce, aead::Aead};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use thiserror::Error;

const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    Encryption,
    #[error("decryption failed")]
    Decryption,
    #[error("invalid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("key has wrong length")]
    InvalidKey,
}

/// AEAD output split into its parts, all base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFragment {
    pub ciphertext: String,
    pub initialization_vector: String,
    pub authentication_tag: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSecrets {
    pub key: String,
    pub initialization_vector: String,
    pub authentication_tag: String,
}

/// Cryptographic primitives the E2EE layer consumes. Keys travel as base64 strings,
/// matching how they are persisted.
pub trait CryptoProvider: Send + Sync {
    fn generate_metadata_key(&self) -> String;

    /// Fresh `(key, initialization_vector)` for a manifest entry.
    fn generate_file_key(&self) -> (String, String);

    fn seal_metadata_key(&self, metadata_key: &str, private_key: &[u8])
    -> Result<String, CryptoError>;

    fn open_metadata_key(&self, sealed: &str, private_key: &[u8]) -> Result<String, CryptoError>;

    fn encrypt_fragment(
        &self,
        plaintext: &[u8],
        metadata_key: &str,
    ) -> Result<SealedFragment, CryptoError>;

    fn decrypt_fragment(
        &self,
        fragment: &SealedFragment,
        metadata_key: &str,
    ) -> Result<Vec<u8>, CryptoError>;

    /// Encrypts file contents with a new per-file key. The returned bytes are what
    /// gets uploaded.
    fn encrypt_file(&self, plaintext: &[u8]) -> Result<(Vec<u8>, FileSecrets), CryptoError>;
}

/// Default provider over ChaCha20-Poly1305 with SHA-256 key derivation.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChaChaCrypto;

impl CryptoProvider for ChaChaCrypto {
    fn generate_metadata_key(&self) -> String {
        STANDARD.encode(random_bytes::<KEY_LEN>())
    }

    fn generate_file_key(&self) -> (String, String) {
        (
            STANDARD.encode(random_bytes::<KEY_LEN>()),
            STANDARD.encode(random_bytes::<NONCE_LEN>()),
        )
    }

    fn seal_metadata_key(
        &self,
        metadata_key: &str,
        private_key: &[u8],
    ) -> Result<String, CryptoError> {
        let nonce = random_bytes::<NONCE_LEN>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&derive_key(private_key)));
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), metadata_key.as_bytes())
            .map_err(|_| CryptoError::Encryption)?;
        let mut payload = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        payload.extend_from_slice(&nonce);
        payload.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(payload))
    }

    fn open_metadata_key(&self, sealed: &str, private_key: &[u8]) -> Result<String, CryptoError> {
        let payload = STANDARD.decode(sealed)?;
        if payload.len() < NONCE_LEN + TAG_LEN {
            return Err(CryptoError::Decryption);
        }
        let (nonce, ciphertext) = payload.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&derive_key(private_key)));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)?;
        String::from_utf8(plaintext).map_err(|_| CryptoError::Decryption)
    }

    fn encrypt_fragment(
        &self,
        plaintext: &[u8],
        metadata_key: &str,
    ) -> Result<SealedFragment, CryptoError> {
        let key = decode_key(metadata_key)?;
        let nonce = random_bytes::<NONCE_LEN>();
        let (ciphertext, tag) = seal(&key, &nonce, plaintext)?;
        Ok(SealedFragment {
            ciphertext: STANDARD.encode(ciphertext),
            initialization_vector: STANDARD.encode(nonce),
            authentication_tag: STANDARD.encode(tag),
        })
    }

    fn decrypt_fragment(
        &self,
        fragment: &SealedFragment,
        metadata_key: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = decode_key(metadata_key)?;
        let nonce = STANDARD.decode(&fragment.initialization_vector)?;
        if nonce.len() != NONCE_LEN {
            return Err(CryptoError::Decryption);
        }
        let mut combined = STANDARD.decode(&fragment.ciphertext)?;
        combined.extend(STANDARD.decode(&fragment.authentication_tag)?);
        let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
        cipher
            .decrypt(Nonce::from_slice(&nonce), combined.as_slice())
            .map_err(|_| CryptoError::Decryption)
    }

    fn encrypt_file(&self, plaintext: &[u8]) -> Result<(Vec<u8>, FileSecrets), CryptoError> {
        let key = random_bytes::<KEY_LEN>();
        let nonce = random_bytes::<NONCE_LEN>();
        let (mut ciphertext, tag) = seal(&key, &nonce, plaintext)?;
        let secrets = FileSecrets {
            key: STANDARD.encode(key),
            initialization_vector: STANDARD.encode(nonce),
            authentication_tag: STANDARD.encode(&tag),
        };
        ciphertext.extend_from_slice(&tag);
        Ok((ciphertext, secrets))
    }
}

fn seal(key: &[u8], nonce: &[u8], plaintext: &[u8]) -> Result<(Vec<u8>, Vec<u8>), CryptoError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    let mut ciphertext = cipher
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| CryptoError::Encryption)?;
    let tag = ciphertext.split_off(ciphertext.len() - TAG_LEN);
    Ok((ciphertext, tag))
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    let key = STANDARD.decode(encoded)?;
    if key.len() != KEY_LEN {
        return Err(CryptoError::InvalidKey);
    }
    Ok(key)
}

fn derive_key(secret: &[u8]) -> [u8; KEY_LEN] {
    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&Sha256::digest(secret));
    key
}

fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    OsRng.fill_bytes(&mut bytes);
    bytes
}
