//! Inbound Adapters
//!
//! The REST surface through which operators drive the configuration store.

mod api_server;

pub use api_server::{router, ApiServer};
