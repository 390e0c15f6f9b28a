//! Kernel Applier
//!
//! Drives the kernel handle through one ensure-then-replace cycle per
//! reconciliation tick. The chain is ensured without flushing, then the
//! compiled ruleset replaces the previous one in a single transaction.

use std::sync::Arc;
use std::time::Duration;

use crate::domain::ports::{CompiledRule, KernelHandle};
use crate::error::Error;

/// Applies compiled rulesets to the kernel, bounding each commit with a
/// deadline. On deadline expiry the attempt is abandoned and the previous
/// ruleset stays in effect.
pub struct KernelApplier {
    kernel: Arc<dyn KernelHandle>,
    commit_timeout: Duration,
}

impl KernelApplier {
    pub fn new(kernel: Arc<dyn KernelHandle>, commit_timeout: Duration) -> Self {
        Self {
            kernel,
            commit_timeout,
        }
    }

    /// Ensure the table and chain exist, then atomically install `rules`.
    pub async fn apply(&self, rules: &[CompiledRule]) -> Result<(), Error> {
        tokio::time::timeout(self.commit_timeout, async {
            self.kernel.ensure().await?;
            self.kernel.replace_rules(rules).await
        })
        .await
        .map_err(|_| Error::Kernel("kernel commit deadline exceeded".to_string()))?
    }
}
