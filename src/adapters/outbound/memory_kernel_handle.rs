//! In-Memory Kernel Handle
//!
//! Honors the KernelHandle contract against process-local state. Used by
//! integration tests and as a dry-run backend where programming the real
//! packet filter is not wanted.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::ports::{CompiledRule, KernelHandle};
use crate::error::Error;

#[derive(Debug, Default)]
struct ChainState {
    exists: bool,
    rules: Vec<CompiledRule>,
}

/// KernelHandle that keeps the chain in memory.
pub struct MemoryKernelHandle {
    table: String,
    chain: String,
    state: Mutex<ChainState>,
    fail_commits: AtomicBool,
}

impl MemoryKernelHandle {
    pub fn new(table: impl Into<String>, chain: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            chain: chain.into(),
            state: Mutex::new(ChainState::default()),
            fail_commits: AtomicBool::new(false),
        }
    }

    /// Whether the table/chain currently exist.
    pub fn exists(&self) -> bool {
        self.state.lock().exists
    }

    /// Snapshot of the chain's rules, in evaluation order.
    pub fn rules(&self) -> Vec<CompiledRule> {
        self.state.lock().rules.clone()
    }

    /// Make subsequent replace commits fail, leaving the chain untouched.
    pub fn set_fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KernelHandle for MemoryKernelHandle {
    async fn ensure(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        if !state.exists {
            state.exists = true;
            tracing::debug!("created table {} chain {}", self.table, self.chain);
        }
        Ok(())
    }

    async fn replace_rules(&self, rules: &[CompiledRule]) -> Result<(), Error> {
        if self.fail_commits.load(Ordering::SeqCst) {
            return Err(Error::Kernel("injected commit failure".to_string()));
        }
        let mut state = self.state.lock();
        if !state.exists {
            return Err(Error::Kernel(format!(
                "chain {} does not exist",
                self.chain
            )));
        }
        state.rules = rules.to_vec();
        Ok(())
    }

    async fn teardown(&self) -> Result<(), Error> {
        let mut state = self.state.lock();
        state.exists = false;
        state.rules.clear();
        Ok(())
    }
}
