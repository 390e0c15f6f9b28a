//! ingressd Library
//!
//! Programs a Linux host's nftables NAT ruleset from a declarative routing
//! model: source classes, backend pools, and priority-ordered rules are
//! kept in an embedded store, continuously reconciled against backend
//! liveness, and installed into the kernel atomically.
//!
//! This module exposes the components for integration tests and embedding.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

// Re-export commonly used types
pub use adapters::inbound::ApiServer;
pub use adapters::outbound::{MemoryKernelHandle, NftKernelHandle, SqliteConfigStore};
pub use application::{KernelApplier, Reconciler};
pub use config::{load_config, Cli, Config};
pub use domain::ports::{ConfigStore, KernelHandle};
pub use domain::services::RuleCompiler;
pub use error::Error;
pub use infrastructure::{HealthProber, ProberConfig, ShutdownController};
