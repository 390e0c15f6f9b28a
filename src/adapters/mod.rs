//! Adapters Layer
//!
//! Inbound adapters drive the application (REST); outbound adapters
//! implement the domain ports (storage, packet filter).

pub mod inbound;
pub mod outbound;
