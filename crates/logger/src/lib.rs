//! Shared tracing bootstrap for the obsdns binaries.

mod subscriber;

pub use subscriber::{LogFormat, init_tracing, parse_level};
