//! Test doubles for the request path.

pub mod mock_log;

pub use mock_log::{MemoryLog, StaticDirectory, server};
