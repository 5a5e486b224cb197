/// Tunnel key exchange and optional payload sealing.
///
/// Each multiplexer generates an ephemeral X25519 key at startup. Once the
/// peer's public key arrives the shared secret is fixed for the lifetime of
/// the physical stream. Sealing derives an XChaCha20-Poly1305 key from it via
/// HKDF-SHA256 and binds each sealed frame to its `(conn_id, seqno)`.
use bytes::{BufMut, Bytes, BytesMut};
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519Secret};

use crate::TunnelError;

const HKDF_INFO: &[u8] = b"peersync-tunnel-xchacha20poly1305-v1";
const NONCE_LEN: usize = 24;

/// Ephemeral X25519 keypair for one physical stream.
pub(crate) struct EphemeralKey {
    secret: X25519Secret,
    public: X25519PublicKey,
}

impl EphemeralKey {
    pub(crate) fn generate() -> Self {
        use chacha20poly1305::aead::rand_core::OsRng;

        let secret = X25519Secret::random_from_rng(OsRng);
        let public = X25519PublicKey::from(&secret);
        Self { secret, public }
    }

    pub(crate) fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// Compute the shared secret with the peer's public key.
    pub(crate) fn agree(&self, peer_public: &[u8]) -> Result<[u8; 32], TunnelError> {
        let bytes: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| TunnelError::Handshake(format!("bad X25519 key length {}", peer_public.len())))?;
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(bytes));
        if !shared.was_contributory() {
            return Err(TunnelError::Handshake("non-contributory X25519 key".into()));
        }
        Ok(shared.to_bytes())
    }
}

fn derive_key(shared_secret: &[u8; 32]) -> Result<[u8; 32], TunnelError> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|e| TunnelError::Crypto(format!("key derivation failed: {e}")))?;
    Ok(key)
}

fn associated_data(conn_id: i64, seqno: i64) -> [u8; 16] {
    let mut aad = [0u8; 16];
    aad[..8].copy_from_slice(&conn_id.to_be_bytes());
    aad[8..].copy_from_slice(&seqno.to_be_bytes());
    aad
}

/// Seals and opens data frames for one physical stream.
pub(crate) struct Sealer {
    cipher: XChaCha20Poly1305,
}

impl Sealer {
    pub(crate) fn new(shared_secret: &[u8; 32]) -> Result<Self, TunnelError> {
        let key = derive_key(shared_secret)?;
        Ok(Self {
            cipher: XChaCha20Poly1305::new(&key.into()),
        })
    }

    /// Returns `nonce || ciphertext`.
    pub(crate) fn seal(&self, conn_id: i64, seqno: i64, plaintext: &[u8]) -> Result<Bytes, TunnelError> {
        use chacha20poly1305::aead::rand_core::{OsRng, RngCore};

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let aad = associated_data(conn_id, seqno);
        let ciphertext = self
            .cipher
            .encrypt(
                &XNonce::from(nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| TunnelError::Crypto(format!("encryption failed: {e}")))?;

        let mut out = BytesMut::with_capacity(NONCE_LEN + ciphertext.len());
        out.put_slice(&nonce_bytes);
        out.put_slice(&ciphertext);
        Ok(out.freeze())
    }

    pub(crate) fn open(&self, conn_id: i64, seqno: i64, sealed: &[u8]) -> Result<Bytes, TunnelError> {
        if sealed.len() < NONCE_LEN {
            return Err(TunnelError::Crypto("sealed frame shorter than nonce".into()));
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aad = associated_data(conn_id, seqno);
        let plaintext = self
            .cipher
            .decrypt(
                XNonce::from_slice(nonce),
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| TunnelError::Crypto("decryption failed: authentication error".into()))?;
        Ok(Bytes::from(plaintext))
    }
}
