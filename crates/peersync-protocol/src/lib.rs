//! peersync protocol layer.
//!
//! Authenticates peers by their Ed25519 key ids, then keeps their operation
//! logs reconciled and shares the part of each side's config the other is
//! allowed to see. Runs over any [`peersync_tunnel::FrameStream`].
//!
//! Wire format: MessagePack (named fields).
//! Crypto: Ed25519 signatures over instance ids and auth tokens.

pub mod auth;
pub mod backoff;
pub mod command_stream;
pub mod config;
pub mod error;
pub mod events;
pub mod identity;
pub mod logstore;
pub mod manager;
pub mod messages;
pub mod opid_mapper;
pub mod oplog;
pub mod peer_state;
pub mod permissions;
pub mod remote_config;
pub mod session;
pub mod sync_config;

pub use auth::{
    authenticate_request, authorize_handshake_as_peer, create_auth_header, create_auth_header_with_key,
    create_handshake_packet,
    decode_and_verify_auth_header, verify_handshake_packet, verify_response_header,
    AuthenticatedPeer, AuthorizationToken, HttpRejection, AUTH_HEADER,
};
pub use backoff::{ReconnectPolicy, ThrottleHandle};
pub use command_stream::CommandStream;
pub use config::{
    Config, ConfigStore, MemConfigStore, Multihost, Peer, Permission, PermissionType, Plan,
    RemoteConfig, Repo,
};
pub use error::{AuthError, RpcCode, StoreError, SyncError};
pub use events::{EventEmitter, SubscriptionId};
pub use identity::{PrivateKey, PrivateKeyConfig, PublicKey, PublicKeyInfo, SignedMessage};
pub use logstore::{LogSink, LogStore, MemLogStore};
pub use manager::{Dialer, SyncManager};
pub use messages::{OperationEvent, SyncStreamItem, SYNC_PROTOCOL_VERSION};
pub use opid_mapper::OpIdMapper;
pub use oplog::{MemOpLog, OpEvent, OpLog, Operation, OperationStatus, Query};
pub use peer_state::{
    ConnectionState, MemPeerStateStore, PeerState, PeerStateStore, SqlitePeerStateStore,
};
pub use permissions::PermissionSet;
pub use remote_config::{JsonDirRemoteConfigStore, MemRemoteConfigStore, RemoteConfigStore};
pub use session::{SessionPhase, SessionReport, SessionRole};
pub use sync_config::SyncConfig;
