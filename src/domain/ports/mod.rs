mod config_store;
mod kernel_handle;

pub use config_store::{ConfigStore, ReconcileSnapshot};
pub use kernel_handle::{
    CompiledRule, KernelHandle, RuleExpr, IPV4_SRC_LEN, IPV4_SRC_OFFSET, TRANSPORT_DPORT_LEN,
    TRANSPORT_DPORT_OFFSET,
};
