//! Domain types and the ports the orchestration core talks through.

pub mod events;
pub mod intent;
pub mod ports;
pub mod reader;
pub mod request;
