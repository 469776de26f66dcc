mod listing;
mod memory_meta;
mod meta_client;
mod rpc_meta;

pub use memory_meta::MemoryMetaHandler;
pub use meta_client::{FileRecord, Lookup, MetaClient, MetaHandler, LIST_ALL_PAGE_SIZE};
pub use rpc_meta::RpcMetaHandler;

#[macro_use]
extern crate log;
