//! Operator command line for Lumen media storage.
//!
//! Settings come from `lumen.toml` (or `--config`) with `LUMEN__` environment overrides; the
//! `storage` section feeds [`lumen_storage::StorageManager`] and the `log` section configures
//! [`lumen_logger::Logger`].

pub mod args;
pub mod commands;
pub mod settings;
