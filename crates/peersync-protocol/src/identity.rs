/// Peer identity: Ed25519 keys, key ids and timestamped signed messages.
///
/// A key id is `"ed25519." + base64url_nopad(sha256(public_key))`. It is the
/// stable identity of a peer; instance ids are display names that are only
/// trusted once signed by the key they are paired with.
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use data_encoding::{BASE64, BASE64URL_NOPAD};
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::AuthError;

pub const KEYID_PREFIX: &str = "ed25519.";

/// Signed messages older than this are rejected.
pub const MAX_SIGNATURE_AGE: Duration = Duration::from_secs(5 * 60);

/// Serialized form of a public key as it appears in config and on the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyInfo {
    pub keyid: String,
    /// Standard base64 of the 32-byte Ed25519 public key.
    pub ed25519pub: String,
}

/// Serialized form of the local identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKeyConfig {
    pub keyid: String,
    /// Standard base64 of the 32-byte Ed25519 seed.
    pub ed25519priv: String,
    pub ed25519pub: String,
}

/// A payload signed together with the time it was signed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub payload: Bytes,
    pub signature: Bytes,
    pub keyid: String,
    pub timestamp_millis: i64,
}

pub fn derive_keyid(public_key: &[u8; 32]) -> String {
    format!("{KEYID_PREFIX}{}", BASE64URL_NOPAD.encode(&Sha256::digest(public_key)))
}

/// The local signing identity.
#[derive(Clone)]
pub struct PrivateKey {
    signing: SigningKey,
    keyid: String,
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey").field("keyid", &self.keyid).finish()
    }
}

impl PrivateKey {
    pub fn generate() -> Self {
        Self::from_seed(rand::random::<[u8; 32]>())
    }

    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = SigningKey::from_bytes(&seed);
        let keyid = derive_keyid(&signing.verifying_key().to_bytes());
        Self { signing, keyid }
    }

    /// Load from config. The configured key id and public key must match the seed.
    pub fn from_config(config: &PrivateKeyConfig) -> Result<Self, AuthError> {
        let seed = decode_key_bytes(&config.ed25519priv, "private key")?;
        let key = Self::from_seed(seed);
        if !config.keyid.is_empty() && config.keyid != key.keyid {
            return Err(AuthError::KeyIdMismatch {
                expected: config.keyid.clone(),
                got: key.keyid,
            });
        }
        if !config.ed25519pub.is_empty() && config.ed25519pub != key.public_key_info().ed25519pub {
            return Err(AuthError::InvalidKey("public key does not match private key".into()));
        }
        Ok(key)
    }

    pub fn to_config(&self) -> PrivateKeyConfig {
        let public = self.public_key_info();
        PrivateKeyConfig {
            keyid: self.keyid.clone(),
            ed25519priv: BASE64.encode(&self.signing.to_bytes()),
            ed25519pub: public.ed25519pub,
        }
    }

    pub fn keyid(&self) -> &str {
        &self.keyid
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying: self.signing.verifying_key(),
            keyid: self.keyid.clone(),
        }
    }

    pub fn public_key_info(&self) -> PublicKeyInfo {
        self.public_key().info()
    }

    /// Sign the SHA-256 digest of `payload`.
    pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
        self.signing.sign(&Sha256::digest(payload)).to_bytes().to_vec()
    }
}

/// A peer's verification key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    verifying: VerifyingKey,
    keyid: String,
}

impl PublicKey {
    /// Load a public key, rejecting it if the advertised key id is not the derived one.
    pub fn from_info(info: &PublicKeyInfo) -> Result<Self, AuthError> {
        let bytes = decode_key_bytes(&info.ed25519pub, "public key")?;
        let verifying = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| AuthError::InvalidKey(format!("public key: {e}")))?;
        let keyid = derive_keyid(&bytes);
        if info.keyid != keyid {
            return Err(AuthError::KeyIdMismatch {
                expected: keyid,
                got: info.keyid.clone(),
            });
        }
        Ok(Self { verifying, keyid })
    }

    pub fn keyid(&self) -> &str {
        &self.keyid
    }

    pub fn info(&self) -> PublicKeyInfo {
        PublicKeyInfo {
            keyid: self.keyid.clone(),
            ed25519pub: BASE64.encode(self.verifying.as_bytes()),
        }
    }

    pub fn verify(&self, payload: &[u8], signature: &[u8]) -> Result<(), AuthError> {
        let signature = Signature::from_slice(signature).map_err(|_| AuthError::InvalidSignature)?;
        self.verifying
            .verify_strict(&Sha256::digest(payload), &signature)
            .map_err(|_| AuthError::InvalidSignature)
    }
}

fn decode_key_bytes(encoded: &str, what: &str) -> Result<[u8; 32], AuthError> {
    let raw = BASE64
        .decode(encoded.as_bytes())
        .map_err(|e| AuthError::InvalidKey(format!("{what}: {e}")))?;
    raw.as_slice()
        .try_into()
        .map_err(|_| AuthError::InvalidKey(format!("{what}: expected 32 bytes, got {}", raw.len())))
}

pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn timestamped(timestamp_millis: i64, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + payload.len());
    buf.extend_from_slice(&(timestamp_millis as u64).to_be_bytes());
    buf.extend_from_slice(payload);
    buf
}

/// Sign `payload` with the current time.
pub fn create_signed_message(payload: &[u8], key: &PrivateKey) -> Result<SignedMessage, AuthError> {
    create_signed_message_at(payload, key, now_millis())
}

pub(crate) fn create_signed_message_at(
    payload: &[u8],
    key: &PrivateKey,
    timestamp_millis: i64,
) -> Result<SignedMessage, AuthError> {
    if payload.is_empty() {
        return Err(AuthError::EmptyPayload);
    }
    let signature = key.sign(&timestamped(timestamp_millis, payload));
    Ok(SignedMessage {
        payload: Bytes::copy_from_slice(payload),
        signature: Bytes::from(signature),
        keyid: key.keyid().to_string(),
        timestamp_millis,
    })
}

pub fn verify_signed_message(msg: &SignedMessage, key: &PublicKey) -> Result<(), AuthError> {
    if msg.payload.is_empty() {
        return Err(AuthError::EmptyPayload);
    }
    if msg.signature.is_empty() {
        return Err(AuthError::EmptySignature);
    }
    if msg.keyid.is_empty() {
        return Err(AuthError::EmptyKeyId);
    }
    if msg.keyid != key.keyid() {
        return Err(AuthError::KeyIdMismatch {
            expected: key.keyid().to_string(),
            got: msg.keyid.clone(),
        });
    }

    key.verify(&timestamped(msg.timestamp_millis, &msg.payload), &msg.signature)?;

    let age_millis = now_millis().saturating_sub(msg.timestamp_millis);
    if age_millis > MAX_SIGNATURE_AGE.as_millis() as i64 {
        return Err(AuthError::SignatureTooOld {
            max_age_secs: MAX_SIGNATURE_AGE.as_secs(),
        });
    }
    Ok(())
}
