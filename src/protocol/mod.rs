//! Payment gateway wire formats.

pub mod gateway;
pub mod notification;
