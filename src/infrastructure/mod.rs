//! Infrastructure Layer
//!
//! Cross-cutting concerns: health probing and coordinated shutdown.

pub mod health_prober;
pub mod shutdown;

pub use health_prober::{HealthProber, ProberConfig};
pub use shutdown::{shutdown_signal, ShutdownController};
