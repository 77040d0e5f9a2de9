mod finger;
mod id;
mod range;

pub use finger::*;
pub use id::*;
pub use range::*;
