//! devprobe: a local demo server with plaintext and self-signed TLS
//! listeners that appends posted JSON telemetry to a line-delimited log.

pub mod config;
pub mod error;
pub mod identity;
pub mod logger;
pub mod sink;
pub mod subsystems;
pub mod supervisor;
