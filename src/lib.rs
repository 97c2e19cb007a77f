//! Roost library — re-exports modules for integration tests.

pub mod logging;
pub mod monitor;
pub mod remote;
pub mod session;
