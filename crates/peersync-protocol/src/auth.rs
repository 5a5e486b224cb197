/// Peer authentication.
///
/// Two mechanisms share the same signed-instance-id proof:
///
/// - the `Authorization` header exchanged when a physical connection is
///   opened: an [`AuthorizationToken`] encoded as compact MessagePack, then
///   standard base64;
/// - the in-stream [`Handshake`] item that opens every sync session.
///
/// Verification only proves that the sender holds the key it presents. The
/// peer is trusted once its key id and instance id match a configured peer.
use std::collections::HashMap;

use data_encoding::BASE64;
use serde::{Deserialize, Serialize};

use crate::config::{Config, Peer};
use crate::identity::{create_signed_message, verify_signed_message, PrivateKey, PublicKey, PublicKeyInfo, SignedMessage};
use crate::messages::{Handshake, SyncStreamItem, SYNC_PROTOCOL_VERSION};
use crate::AuthError;

pub const AUTH_HEADER: &str = "Authorization";

/// Upper bound on the encoded token before base64.
pub const MAX_AUTH_TOKEN_SIZE: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationToken {
    pub instance_id: SignedMessage,
    pub public_key: PublicKeyInfo,
}

/// Header value proving the local instance identity from `config`.
pub fn create_auth_header(config: &Config) -> Result<String, AuthError> {
    let identity = config.multihost.identity.as_ref().ok_or(AuthError::MissingIdentity)?;
    let key = PrivateKey::from_config(identity)?;
    create_auth_header_with_key(&config.instance, &key)
}

pub fn create_auth_header_with_key(instance_id: &str, key: &PrivateKey) -> Result<String, AuthError> {
    let token = AuthorizationToken {
        instance_id: create_signed_message(instance_id.as_bytes(), key)?,
        public_key: key.public_key_info(),
    };
    let bytes = rmp_serde::to_vec(&token)
        .map_err(|e| AuthError::InvalidHeader(format!("encoding authorization token: {e}")))?;
    if bytes.len() > MAX_AUTH_TOKEN_SIZE {
        return Err(AuthError::TokenTooLarge {
            size: bytes.len(),
            max: MAX_AUTH_TOKEN_SIZE,
        });
    }
    Ok(BASE64.encode(&bytes))
}

fn signed_instance_id(msg: &SignedMessage) -> Result<String, AuthError> {
    String::from_utf8(msg.payload.to_vec())
        .map_err(|_| AuthError::InvalidHeader("instance id is not valid utf-8".into()))
}

/// Verify a header and resolve it to one of `peers`.
///
/// A token naming `local_instance_id` is rejected: an instance never
/// authenticates to itself.
pub fn decode_and_verify_auth_header(
    header: &str,
    local_instance_id: &str,
    peers: &[Peer],
) -> Result<Peer, AuthError> {
    let header = header.trim();
    if header.is_empty() {
        return Err(AuthError::MissingHeader);
    }
    let bytes = BASE64
        .decode(header.as_bytes())
        .map_err(|_| AuthError::InvalidHeader("invalid authorization header format".into()))?;
    if bytes.len() > MAX_AUTH_TOKEN_SIZE {
        return Err(AuthError::TokenTooLarge {
            size: bytes.len(),
            max: MAX_AUTH_TOKEN_SIZE,
        });
    }
    let token: AuthorizationToken = rmp_serde::from_slice(&bytes)
        .map_err(|e| AuthError::InvalidHeader(format!("decoding authorization token: {e}")))?;

    let public_key = PublicKey::from_info(&token.public_key)?;
    if public_key.keyid() != token.instance_id.keyid {
        return Err(AuthError::KeyIdMismatch {
            expected: public_key.keyid().to_string(),
            got: token.instance_id.keyid.clone(),
        });
    }
    verify_signed_message(&token.instance_id, &public_key)?;

    let instance_id = signed_instance_id(&token.instance_id)?;
    if instance_id == local_instance_id {
        return Err(AuthError::InvalidHeader(format!(
            "token names the local instance {instance_id:?}"
        )));
    }

    let peer = peers
        .iter()
        .find(|p| p.keyid == public_key.keyid())
        .ok_or_else(|| AuthError::UnknownPeer {
            keyid: public_key.keyid().to_string(),
        })?;
    if peer.instance_id != instance_id {
        return Err(AuthError::InstanceIdMismatch {
            expected: peer.instance_id.clone(),
            got: instance_id,
        });
    }
    Ok(peer.clone())
}

/// Client side check of the header a server answered with: it must come
/// from a known host, and from exactly the host we dialed.
pub fn verify_response_header(header: &str, config: &Config, want_peer: &Peer) -> Result<Peer, AuthError> {
    let peer = decode_and_verify_auth_header(header, &config.instance, &config.multihost.known_hosts)?;
    if peer.instance_id != want_peer.instance_id {
        return Err(AuthError::InstanceIdMismatch {
            expected: want_peer.instance_id.clone(),
            got: peer.instance_id,
        });
    }
    if peer.keyid != want_peer.keyid {
        return Err(AuthError::KeyIdMismatch {
            expected: want_peer.keyid.clone(),
            got: peer.keyid,
        });
    }
    Ok(peer)
}

/// A request that passed [`authenticate_request`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedPeer {
    pub peer: Peer,
    /// Our own header value, to be set on the response.
    pub response_header: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{status}: {body}")]
pub struct HttpRejection {
    pub status: u16,
    pub body: String,
}

/// Inbound check for a physical connection, against the authorized clients.
pub fn authenticate_request(
    headers: &HashMap<String, String>,
    config: &Config,
) -> Result<AuthenticatedPeer, HttpRejection> {
    let response_header = create_auth_header(config).map_err(|e| {
        tracing::error!("auth: failed to create response header: {e}");
        HttpRejection {
            status: 500,
            body: format!("internal error: {e}"),
        }
    })?;

    let header = headers
        .iter()
        .find(|(name, _)| name.eq_ignore_ascii_case(AUTH_HEADER))
        .map(|(_, value)| value.as_str())
        .unwrap_or("");

    let peer = decode_and_verify_auth_header(header, &config.instance, &config.multihost.authorized_clients)
        .map_err(|e| {
            tracing::warn!("auth: rejected request: {e}");
            HttpRejection {
                status: 401,
                body: format!("unauthorized: {e}"),
            }
        })?;

    Ok(AuthenticatedPeer { peer, response_header })
}

// ── In-stream handshake ───────────────────────────────────────────────

pub fn create_handshake_packet(instance_id: &str, key: &PrivateKey) -> Result<SyncStreamItem, AuthError> {
    Ok(SyncStreamItem::Handshake(Handshake {
        protocol_version: SYNC_PROTOCOL_VERSION,
        instance_id: create_signed_message(instance_id.as_bytes(), key)?,
        public_key: key.public_key_info(),
    }))
}

/// Check that the handshake is well formed and signed by the key it carries.
///
/// Says nothing about whether that key is trusted, see [`authorize_handshake_as_peer`].
pub fn verify_handshake_packet(item: &SyncStreamItem) -> Result<PublicKey, AuthError> {
    let SyncStreamItem::Handshake(handshake) = item else {
        return Err(AuthError::MissingHandshake);
    };
    if handshake.protocol_version != SYNC_PROTOCOL_VERSION {
        return Err(AuthError::ProtocolVersion {
            expected: SYNC_PROTOCOL_VERSION,
            got: handshake.protocol_version,
        });
    }
    if handshake.instance_id.payload.is_empty() {
        return Err(AuthError::EmptyPayload);
    }
    if handshake.instance_id.signature.is_empty() {
        return Err(AuthError::EmptySignature);
    }
    if handshake.public_key.keyid.is_empty() {
        return Err(AuthError::EmptyKeyId);
    }
    let key = PublicKey::from_info(&handshake.public_key)?;
    verify_signed_message(&handshake.instance_id, &key)?;
    Ok(key)
}

pub fn authorize_handshake_as_peer(item: &SyncStreamItem, peer: &Peer) -> Result<(), AuthError> {
    let SyncStreamItem::Handshake(handshake) = item else {
        return Err(AuthError::MissingHandshake);
    };
    let instance_id = String::from_utf8_lossy(&handshake.instance_id.payload);
    if instance_id != peer.instance_id {
        return Err(AuthError::InstanceIdMismatch {
            expected: peer.instance_id.clone(),
            got: instance_id.into_owned(),
        });
    }
    if handshake.public_key.keyid != peer.keyid {
        return Err(AuthError::KeyIdMismatch {
            expected: peer.keyid.clone(),
            got: handshake.public_key.keyid.clone(),
        });
    }
    Ok(())
}
