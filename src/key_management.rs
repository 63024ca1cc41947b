// Key material for hops, the coordinator and clients.
//
// seal/open: X25519 (ephemeral) -> HKDF-SHA256 -> ChaCha20-Poly1305
//   wire: eph_pub(32) || nonce(12) || ciphertext+tag
// symmetric: AES-256-GCM
//   wire: nonce(12) || ciphertext+tag

use std::fmt;

use aes_gcm::Aes256Gcm;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{CommError, Result};

const SEAL_INFO: &[u8] = b"ghost-comm/seal/v1";
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;

/// X25519 public key as carried in topologies and envelopes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey([u8; KEY_LEN]);

impl PublicKey {
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0)
    }

    pub fn from_base64(encoded: &str) -> Result<Self> {
        let raw = STANDARD
            .decode(encoded.trim())
            .map_err(|e| CommError::Crypto(format!("public key is not base64: {e}")))?;
        let bytes: [u8; KEY_LEN] = raw
            .try_into()
            .map_err(|v: Vec<u8>| CommError::Crypto(format!("public key must be 32 bytes, got {}", v.len())))?;
        Ok(Self(bytes))
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

/// Long-lived (for one lock cycle) X25519 keypair.
pub struct IdentityKeypair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeypair {
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey(x25519_dalek::PublicKey::from(&secret).to_bytes());
        Self { secret, public }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Decrypt a blob produced by [`seal`] for this keypair.
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < KEY_LEN + NONCE_LEN {
            return Err(CommError::DecryptionFailure);
        }
        let (eph, rest) = sealed.split_at(KEY_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let mut eph_bytes = [0u8; KEY_LEN];
        eph_bytes.copy_from_slice(eph);
        let eph_pub = x25519_dalek::PublicKey::from(eph_bytes);

        let shared = self.secret.diffie_hellman(&eph_pub);
        if !shared.was_contributory() {
            return Err(CommError::DecryptionFailure);
        }
        let cipher = seal_cipher(shared.as_bytes(), &eph_bytes, self.public.as_bytes())?;
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CommError::DecryptionFailure)
    }
}

impl fmt::Debug for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeypair")
            .field("public", &self.public)
            .finish_non_exhaustive()
    }
}

/// Asymmetrically encrypt `plaintext` so only the holder of `recipient`'s secret can read it.
///
/// Low-order recipient keys are refused: they fix the shared secret no
/// matter which ephemeral key is used.
pub fn seal(plaintext: &[u8], recipient: &PublicKey) -> Result<Vec<u8>> {
    let eph_secret = EphemeralSecret::random_from_rng(OsRng);
    let eph_pub = x25519_dalek::PublicKey::from(&eph_secret).to_bytes();
    let shared = eph_secret.diffie_hellman(&x25519_dalek::PublicKey::from(recipient.0));
    if !shared.was_contributory() {
        return Err(CommError::Crypto("recipient public key has low order".into()));
    }

    let cipher = seal_cipher(shared.as_bytes(), &eph_pub, recipient.as_bytes())?;
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CommError::Crypto("seal failed".into()))?;

    let mut out = Vec::with_capacity(KEY_LEN + NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&eph_pub);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

fn seal_cipher(shared: &[u8; KEY_LEN], eph_pub: &[u8; KEY_LEN], recipient: &[u8; KEY_LEN]) -> Result<ChaCha20Poly1305> {
    let mut salt = [0u8; KEY_LEN * 2];
    salt[..KEY_LEN].copy_from_slice(eph_pub);
    salt[KEY_LEN..].copy_from_slice(recipient);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(SEAL_INFO, &mut okm)
        .map_err(|_| CommError::Crypto("hkdf expand".into()))?;
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&okm));
    okm.zeroize();
    Ok(cipher)
}

/// Random AES-256 key used for one payload.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let key: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| CommError::Crypto(format!("symmetric key must be 32 bytes, got {}", bytes.len())))?;
        Ok(Self(key))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| CommError::Crypto(format!("key init failed: {e}")))?;
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let ciphertext = cipher
            .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CommError::Crypto(format!("encrypt failed: {e}")))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(CommError::DecryptionFailure);
        }
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new_from_slice(&self.0)
            .map_err(|e| CommError::Crypto(format!("key init failed: {e}")))?;
        cipher
            .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CommError::DecryptionFailure)
    }
}
