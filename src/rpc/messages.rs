//! Wire messages exchanged between ring nodes.

use serde::{Deserialize, Serialize};

use crate::common::Id;

/// A single message on the wire: one request per connection, answered by one
/// response or error.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

/// The closed set of operations a node serves for its peers.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum RequestSpecific {
    FindSuccessor { id: Id },
    FindPredecessor { id: Id },
    ClosestPrecedingFinger { id: Id },
    GetPredecessor,
    SetPredecessor { id: Id },
    GetSuccessor,
    SetSuccessor { id: Id },
    UpdateFingerTable { candidate: Id, index: usize },
    Notify { candidate: Id },
    Ping,
    Put { key: String, value: String },
    Get { key: String },
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ResponseSpecific {
    /// A resolved ring node, for the lookup operations and `get_successor`.
    NodeId { id: Id },
    /// The callee's predecessor, which may be unset.
    Predecessor { id: Option<Id> },
    /// Whether `update_finger_table` adopted the candidate.
    Updated { updated: bool },
    /// Whether a `put` stored the pair.
    Stored { stored: bool },
    /// The value a `get` found, if any.
    Value { value: Option<String> },
    /// Liveness reply.
    Pong,
    /// Acknowledgement for the setter operations and `notify`.
    Done,
}

/// A failure reported back to the caller instead of a response.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl MessageType {
    pub fn from_bytes(bytes: &[u8]) -> Result<MessageType, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
