//! The connection hub and everything that feeds it.

pub mod hub;
pub mod message;
pub mod publisher;
pub mod session;
pub mod types;
pub mod upgrade;
