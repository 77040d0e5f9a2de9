#![doc = include_str!("../README.md")]

mod common;
mod dht;
mod error;
pub mod node;
pub mod rpc;

pub use crate::common::{FingerEntry, FingerTable, Id, ModRange, ModRangeIter, M, NODES};
pub use crate::dht::Testnet;
pub use crate::error::Error;
pub use crate::node::{ChordNode, Info};
pub use crate::rpc::config::{BasePortResolver, Config, ResolveAddress};

pub type Result<T, E = Error> = std::result::Result<T, E>;
