//! Access policy: decision values and the resolver that produces them.

pub mod access;
pub mod resolver;

pub use access::{Access, AccessType, DenyCode, ScanCaps};
pub use resolver::EntitlementResolver;
