mod database;
mod filesystem;
mod memory;

pub use database::{DatabaseStorage, SCHEMA_VERSION};
pub use filesystem::{FilesystemBuilder, FilesystemStorage, NoRoot, WithRoot};
pub use memory::MemoryStorage;
