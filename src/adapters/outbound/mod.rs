//! Outbound Adapters
//!
//! Concrete implementations of the store and kernel ports.

mod memory_kernel_handle;
mod nft_kernel_handle;
mod sqlite_config_store;

pub use memory_kernel_handle::MemoryKernelHandle;
pub use nft_kernel_handle::NftKernelHandle;
pub use sqlite_config_store::SqliteConfigStore;
