//! System-wide constants.

pub mod memory;
pub mod tasks;
