pub mod error;
pub mod hash;
pub mod serde_hex;
pub mod types;

pub use error::*;
pub use hash::*;
pub use types::*;
