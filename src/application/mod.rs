//! Application Layer
//!
//! The reconciliation engine: applier and periodic reconciler.

mod applier;
mod reconciler;

pub use applier::KernelApplier;
pub use reconciler::Reconciler;
