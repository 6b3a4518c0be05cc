//! gomoted internals shared by the daemon binary and the integration tests.

pub mod ssh;
