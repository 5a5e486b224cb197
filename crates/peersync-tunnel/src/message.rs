use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Control frame carrying the sender's ephemeral X25519 public key.
pub const HANDSHAKE_CONN_ID: i64 = -100;
/// Control frame sent periodically by the initiator.
pub const HEARTBEAT_CONN_ID: i64 = -1;

/// A single frame on the physical stream.
///
/// `conn_id <= 0` frames are control frames. Positive ids name a logical
/// connection: odd ids are opened by the initiator, even ids by the responder.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelMessage {
    pub conn_id: i64,
    pub seqno: i64,
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub close: bool,
    #[serde(default)]
    pub pubkey_x25519: Bytes,
    /// XChaCha20-Poly1305 nonce plus ciphertext when payload sealing is on.
    /// `data` is empty in that case.
    #[serde(default)]
    pub sealed: Bytes,
}

impl TunnelMessage {
    pub fn handshake(pubkey: [u8; 32]) -> Self {
        Self {
            conn_id: HANDSHAKE_CONN_ID,
            pubkey_x25519: Bytes::copy_from_slice(&pubkey),
            ..Default::default()
        }
    }

    pub fn heartbeat() -> Self {
        Self {
            conn_id: HEARTBEAT_CONN_ID,
            ..Default::default()
        }
    }

    /// First frame of a newly dialed connection.
    pub fn open(conn_id: i64) -> Self {
        Self {
            conn_id,
            seqno: 0,
            ..Default::default()
        }
    }

    pub fn data(conn_id: i64, seqno: i64, data: Bytes) -> Self {
        Self {
            conn_id,
            seqno,
            data,
            ..Default::default()
        }
    }

    pub fn close(conn_id: i64) -> Self {
        Self {
            conn_id,
            close: true,
            ..Default::default()
        }
    }

    pub fn is_control(&self) -> bool {
        self.conn_id <= 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_frames() {
        assert!(TunnelMessage::heartbeat().is_control());
        assert!(TunnelMessage::handshake([1; 32]).is_control());
        assert!(!TunnelMessage::open(3).is_control());
    }

    #[test]
    fn msgpack_roundtrip_keeps_bytes() {
        let msg = TunnelMessage::data(5, 2, Bytes::from_static(b"abc"));
        let bytes = rmp_serde::to_vec_named(&msg).unwrap();
        let decoded: TunnelMessage = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(decoded, msg);
    }
}
