//! Adapters for the ports in [`crate::domain::ports`].

pub mod in_memory;
pub mod json_file;
pub mod simulated;
