//! Ring identifier for a Chord node or a stored key
use std::fmt::{self, Debug, Display, Formatter};

use serde::{Deserialize, Serialize};

/// The size of ring ids in bits.
pub const M: usize = 7;
/// The size of the identifier space, `2^M`.
pub const NODES: u64 = 1 << M;

#[derive(Clone, Copy, PartialEq, Ord, PartialOrd, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
/// Ring identifier for a Chord node or a stored key
pub struct Id(u64);

impl Id {
    /// Create an Id from a raw integer, reduced into `[0, 2^M)`.
    pub fn new(id: u64) -> Id {
        Id(id % NODES)
    }

    /// Hash an identifying string onto the ring.
    ///
    /// Applies SHA-1 and keeps the first M bits of the digest. Two distinct
    /// inputs can collide; callers assembling a network must detect that and
    /// reject the later node.
    pub fn hash(input: &str) -> Id {
        let digest = sha1_smol::Sha1::from(input.as_bytes()).digest().bytes();

        let mut first_word = [0u8; 8];
        first_word.copy_from_slice(&digest[..8]);

        Id(u64::from_be_bytes(first_word) >> (64 - M))
    }

    /// The raw integer value in `[0, 2^M)`.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// `(self + n) mod 2^M`
    pub fn wrapping_add(&self, n: u64) -> Id {
        Id((self.0 + n % NODES) % NODES)
    }

    /// `(self - n) mod 2^M`
    pub fn wrapping_sub(&self, n: u64) -> Id {
        Id((self.0 + NODES - n % NODES) % NODES)
    }
}

impl Display for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Debug for Id {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.0)
    }
}
