//! Main Crate Error

use std::net::SocketAddrV4;

use crate::common::Id;
use crate::rpc::messages::ErrorSpecific;

#[derive(thiserror::Error, Debug)]
/// Chord-ring crate error enum.
pub enum Error {
    #[error(transparent)]
    /// Transparent [std::io::Error]
    IO(#[from] std::io::Error),

    /// A finger table entry was constructed with an index outside `[1, M]`.
    #[error("Invalid finger table index: {0}")]
    InvalidFingerIndex(usize),

    /// A remote node could not be reached before the request timeout.
    ///
    /// Callers treat this as "that peer may be dead".
    #[error("Node at {0} is unreachable")]
    RemoteUnreachable(SocketAddrV4),

    /// Two distinct identifying strings hashed onto the same ring id.
    /// The later node is rejected.
    #[error("Ring id {0} is already taken")]
    HashCollision(Id),

    /// An incoming request payload could not be decoded. The connection is
    /// dropped without a retry.
    #[error("Failed to decode request: {0}")]
    MalformedRequest(serde_json::Error),

    /// A response payload could not be decoded. The connection is dropped
    /// without a retry.
    #[error("Failed to decode response: {0}")]
    MalformedResponse(serde_json::Error),

    /// The remote node reported a failure while serving the request.
    #[error("Remote error {}: {}", .0.code, .0.description)]
    Remote(ErrorSpecific),
}
