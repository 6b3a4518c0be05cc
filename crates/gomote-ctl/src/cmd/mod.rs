//! CLI command modules.

pub mod http;
pub mod instances;
pub mod ssh;
