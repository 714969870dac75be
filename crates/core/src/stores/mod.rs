pub mod elasticsearch;
pub mod json_dir;
pub mod memory;
pub mod objects;

pub use elasticsearch::ElasticsearchStore;
pub use json_dir::JsonDirRecordStore;
pub use memory::{MemoryRecordStore, MemorySearchIndex};
pub use objects::{FsObjectStore, HttpObjectStore, MemoryObjectStore};
