//! End-to-end encrypted control channel.
//!
//! Clients verify the server identity through a signed-nonce handshake, then
//! wrap a fresh AES-256 key with RSA-OAEP. Every control-plane request and
//! JSON response after that travels as an `{iv, ciphertext}` AES-GCM envelope
//! keyed by the `X-Session-ID` header. This sits above TLS so that operators
//! terminating TLS cannot read admin traffic; forward secrecy is not claimed.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use dashmap::DashMap;
use rand::RngCore;
use rsa::pkcs8::{DecodePrivateKey, EncodePublicKey, LineEnding};
use rsa::sha2::{Digest, Sha256};
use rsa::{Oaep, Pss, RsaPrivateKey};
use serde::{Deserialize, Serialize};
use std::path::Path;
use uuid::Uuid;

use crate::core::{Error, Result};

/// AES-GCM nonce length in bytes.
const IV_LEN: usize = 12;

/// Expected length of the client-generated AES key.
const AES_KEY_LEN: usize = 32;

/// PSS salt length used for the handshake signature.
const PSS_SALT_LEN: usize = 32;

/// Response of the first handshake step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeInitiate {
    /// 32 random bytes, base64.
    pub nonce: String,
    /// RSA-PSS signature of the nonce under the server key, base64.
    pub signature: String,
}

/// An encrypted request or response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncryptedPayload {
    /// 12-byte AES-GCM nonce, base64.
    pub iv: String,
    /// AES-256-GCM ciphertext (no AAD), base64.
    pub ciphertext: String,
}

/// Server-side state of the encrypted control channel.
///
/// Crypto sessions are ephemeral: they live in memory only and disappear on
/// restart, forcing clients back through the handshake.
pub struct CryptoChannel {
    private_key: RsaPrivateKey,
    public_key_pem: String,
    sessions: DashMap<Uuid, [u8; AES_KEY_LEN]>,
}

impl std::fmt::Debug for CryptoChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoChannel")
            .field("sessions", &self.sessions.len())
            .finish_non_exhaustive()
    }
}

impl CryptoChannel {
    /// Load the server private key from a PKCS#8 PEM file.
    ///
    /// # Errors
    /// Returns an error if the file is missing or not a valid RSA key;
    /// callers treat this as fatal at startup.
    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read_to_string(path).map_err(|e| {
            Error::Internal(anyhow::anyhow!(
                "server private key not found at {}: {e}",
                path.display()
            ))
        })?;
        let private_key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .map_err(|e| Error::Internal(anyhow::anyhow!("invalid server private key: {e}")))?;
        Ok(Self::new(private_key))
    }

    /// Build a channel from an already-loaded key.
    #[must_use]
    pub fn new(private_key: RsaPrivateKey) -> Self {
        let public_key_pem = private_key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap_or_default();
        Self {
            private_key,
            public_key_pem,
            sessions: DashMap::new(),
        }
    }

    /// The server public key PEM, distributed out of band to clients.
    #[must_use]
    pub fn public_key_pem(&self) -> &str {
        &self.public_key_pem
    }

    /// First handshake step: a fresh nonce plus its PSS signature.
    ///
    /// Stateless; the client uses the signature to confirm it is talking to
    /// the holder of the server private key.
    ///
    /// # Errors
    /// Returns an error if signing fails.
    pub fn handshake_initiate(&self) -> Result<HandshakeInitiate> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let digest = Sha256::digest(nonce);
        let padding = Pss::new_with_salt::<Sha256>(PSS_SALT_LEN);
        let signature = self
            .private_key
            .sign_with_rng(&mut rand::thread_rng(), padding, &digest)
            .map_err(|e| Error::Internal(anyhow::anyhow!("handshake signing failed: {e}")))?;

        Ok(HandshakeInitiate {
            nonce: B64.encode(nonce),
            signature: B64.encode(signature),
        })
    }

    /// Second handshake step: unwrap the client's AES key and mint a session.
    ///
    /// # Errors
    /// `BadRequest` when the payload is not valid base64, does not decrypt
    /// under RSA-OAEP, or is not a 32-byte key.
    pub fn handshake_exchange(&self, encrypted_session_key_b64: &str) -> Result<Uuid> {
        let wrapped = B64
            .decode(encrypted_session_key_b64)
            .map_err(|_| Error::bad_request("Failed to decrypt session key"))?;
        let key_bytes = self
            .private_key
            .decrypt(Oaep::new::<Sha256>(), &wrapped)
            .map_err(|_| Error::bad_request("Failed to decrypt session key"))?;
        let key: [u8; AES_KEY_LEN] = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| Error::bad_request("Failed to decrypt session key"))?;

        let session_id = Uuid::new_v4();
        self.sessions.insert(session_id, key);
        tracing::info!(session = %short_id(session_id), "E2EE handshake complete");
        Ok(session_id)
    }

    /// Whether a crypto session with this id exists.
    #[must_use]
    pub fn has_session(&self, session_id: Uuid) -> bool {
        self.sessions.contains_key(&session_id)
    }

    /// Decrypt a request envelope for the given crypto session.
    ///
    /// # Errors
    /// `BadRequest` when the session is unknown or authenticated decryption
    /// fails.
    pub fn open(&self, session_id: Uuid, payload: &EncryptedPayload) -> Result<Vec<u8>> {
        let key = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::bad_request("Invalid or missing session ID"))?;
        let cipher = Aes256Gcm::new_from_slice(key.value())
            .map_err(|_| Error::bad_request("Failed to decrypt request"))?;

        let iv = B64
            .decode(&payload.iv)
            .map_err(|_| Error::bad_request("Failed to decrypt request"))?;
        if iv.len() != IV_LEN {
            return Err(Error::bad_request("Failed to decrypt request"));
        }
        let ciphertext = B64
            .decode(&payload.ciphertext)
            .map_err(|_| Error::bad_request("Failed to decrypt request"))?;

        cipher
            .decrypt(Nonce::from_slice(&iv), ciphertext.as_slice())
            .map_err(|_| {
                tracing::warn!(session = %short_id(session_id), "request decryption failed");
                Error::bad_request("Failed to decrypt request")
            })
    }

    /// Encrypt a response body for the given crypto session.
    ///
    /// # Errors
    /// `BadRequest` when the session is unknown.
    pub fn seal(&self, session_id: Uuid, plaintext: &[u8]) -> Result<EncryptedPayload> {
        let key = self
            .sessions
            .get(&session_id)
            .ok_or_else(|| Error::bad_request("Invalid or missing session ID"))?;
        let cipher = Aes256Gcm::new_from_slice(key.value())
            .map_err(|e| Error::Internal(anyhow::anyhow!("cipher init failed: {e}")))?;

        let mut iv = [0u8; IV_LEN];
        rand::thread_rng().fill_bytes(&mut iv);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&iv), plaintext)
            .map_err(|e| Error::Internal(anyhow::anyhow!("response encryption failed: {e}")))?;

        Ok(EncryptedPayload {
            iv: B64.encode(iv),
            ciphertext: B64.encode(ciphertext),
        })
    }
}

fn short_id(id: Uuid) -> String {
    id.to_string().chars().take(8).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::RsaPublicKey;
    use rsa::pkcs8::EncodePrivateKey;

    fn test_channel() -> CryptoChannel {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        CryptoChannel::new(key)
    }

    #[test]
    fn load_rejects_missing_key() {
        let err = CryptoChannel::load(Path::new("/nonexistent/key.pem")).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }

    #[test]
    fn load_accepts_pkcs8_pem() {
        let tmp = tempfile::TempDir::new().unwrap();
        let key_path = tmp.path().join("server_key.pem");
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
        std::fs::write(&key_path, key.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes()).unwrap();

        let channel = CryptoChannel::load(&key_path).unwrap();
        assert!(channel.public_key_pem().contains("BEGIN PUBLIC KEY"));
    }

    #[test]
    fn handshake_signature_verifies() {
        let channel = test_channel();
        let initiate = channel.handshake_initiate().unwrap();

        let nonce = B64.decode(&initiate.nonce).unwrap();
        let signature = B64.decode(&initiate.signature).unwrap();
        assert_eq!(nonce.len(), 32);

        let public_key = RsaPublicKey::from(&channel.private_key);
        let digest = Sha256::digest(&nonce);
        public_key
            .verify(Pss::new_with_salt::<Sha256>(PSS_SALT_LEN), &digest, &signature)
            .unwrap();
    }

    #[test]
    fn full_handshake_and_envelope_round_trip() {
        let channel = test_channel();

        // Client side: wrap a fresh AES key with the server public key.
        let mut aes_key = [0u8; AES_KEY_LEN];
        rand::thread_rng().fill_bytes(&mut aes_key);
        let public_key = RsaPublicKey::from(&channel.private_key);
        let wrapped = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &aes_key)
            .unwrap();

        let session_id = channel.handshake_exchange(&B64.encode(wrapped)).unwrap();
        assert!(channel.has_session(session_id));

        let body = br#"{"application_id":"abc"}"#;
        let sealed = channel.seal(session_id, body).unwrap();
        let opened = channel.open(session_id, &sealed).unwrap();
        assert_eq!(opened, body);
    }

    #[test]
    fn tampered_ciphertext_is_rejected() {
        let channel = test_channel();
        let public_key = RsaPublicKey::from(&channel.private_key);
        let aes_key = [7u8; AES_KEY_LEN];
        let wrapped = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &aes_key)
            .unwrap();
        let session_id = channel.handshake_exchange(&B64.encode(wrapped)).unwrap();

        let mut sealed = channel.seal(session_id, b"payload").unwrap();
        let mut raw = B64.decode(&sealed.ciphertext).unwrap();
        raw[0] ^= 0xff;
        sealed.ciphertext = B64.encode(raw);

        let err = channel.open(session_id, &sealed).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let channel = test_channel();
        let public_key = RsaPublicKey::from(&channel.private_key);
        let wrapped = public_key
            .encrypt(&mut rand::thread_rng(), Oaep::new::<Sha256>(), &[1u8; 16])
            .unwrap();
        let err = channel.handshake_exchange(&B64.encode(wrapped)).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }

    #[test]
    fn unknown_session_is_rejected() {
        let channel = test_channel();
        let payload = EncryptedPayload {
            iv: B64.encode([0u8; IV_LEN]),
            ciphertext: B64.encode(b"junk"),
        };
        let err = channel.open(Uuid::new_v4(), &payload).unwrap_err();
        assert!(matches!(err, Error::BadRequest(_)));
    }
}
