use bytes::Bytes;
use peersync_protocol::identity::{create_signed_message, verify_signed_message};
use peersync_protocol::{create_auth_header_with_key, decode_and_verify_auth_header, Peer, PrivateKey};
use proptest::prelude::*;

/// Deterministic identity from a small seed.
fn key(seed: u8) -> PrivateKey {
    use rand::{Rng, SeedableRng};
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed as u64);
    PrivateKey::from_seed(rng.random())
}

fn peer(instance_id: &str, key: &PrivateKey) -> Peer {
    Peer {
        instance_id: instance_id.to_string(),
        keyid: key.keyid().to_string(),
        public_key: Some(key.public_key_info()),
        ..Default::default()
    }
}

proptest! {
    /// Signed messages always verify with the signer's key.
    #[test]
    fn sign_verify_roundtrip(payload in prop::collection::vec(any::<u8>(), 1..4096)) {
        let signer = key(1);
        let msg = create_signed_message(&payload, &signer).unwrap();
        prop_assert!(verify_signed_message(&msg, &signer.public_key()).is_ok());
    }

    /// Flipping any payload byte breaks the signature.
    #[test]
    fn tampered_payload_breaks_sig(
        payload in prop::collection::vec(any::<u8>(), 1..1024),
        pos in any::<prop::sample::Index>(),
        flip in 1u8..=255,
    ) {
        let signer = key(2);
        let mut msg = create_signed_message(&payload, &signer).unwrap();
        let mut tampered = payload.clone();
        let i = pos.index(tampered.len());
        tampered[i] ^= flip;
        msg.payload = Bytes::from(tampered);
        prop_assert!(verify_signed_message(&msg, &signer.public_key()).is_err());
    }

    /// The signed timestamp is covered by the signature.
    #[test]
    fn shifted_timestamp_breaks_sig(payload in prop::collection::vec(any::<u8>(), 1..256), shift in 1i64..100_000) {
        let signer = key(3);
        let mut msg = create_signed_message(&payload, &signer).unwrap();
        msg.timestamp_millis -= shift;
        prop_assert!(verify_signed_message(&msg, &signer.public_key()).is_err());
    }

    /// Another key never verifies.
    #[test]
    fn wrong_key_rejected(payload in prop::collection::vec(any::<u8>(), 1..512), seed in 10u8..=255) {
        let signer = key(4);
        let other = key(seed);
        let msg = create_signed_message(&payload, &signer).unwrap();
        prop_assert!(verify_signed_message(&msg, &other.public_key()).is_err());
    }

    /// Headers for ordinary instance names fit the token limit and resolve to the peer.
    #[test]
    fn auth_header_roundtrip(instance in "[a-z][a-z0-9-]{0,63}") {
        let client = key(5);
        let header = create_auth_header_with_key(&instance, &client).unwrap();
        let peers = vec![peer(&instance, &client)];
        let resolved = decode_and_verify_auth_header(&header, "local-server-instance", &peers).unwrap();
        prop_assert_eq!(resolved.instance_id, instance);
    }

    /// Arbitrary header text is rejected, never accepted and never a panic.
    #[test]
    fn garbage_headers_rejected(header in ".{0,700}") {
        let client = key(6);
        let peers = vec![peer("laptop", &client)];
        prop_assert!(decode_and_verify_auth_header(&header, "server", &peers).is_err());
    }
}
