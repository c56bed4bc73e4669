//! CLI command implementations.

pub mod compact;
pub mod delete;
pub mod dump_log;
pub mod inspect;
pub mod store;
