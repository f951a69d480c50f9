//! Subsystem modules for devprobe.

pub mod comms;
pub mod runtime;
pub mod ui;
