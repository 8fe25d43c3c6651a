//! Payment notification signatures.

pub mod signature;
