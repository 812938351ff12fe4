//! Application layer: the payment orchestration engine and the reader
//! connectivity controller.
//!
//! Both run as `tokio` tasks that own their state and talk to callers over
//! channels. The engine only ever reads the reader connection; the
//! controller is the only writer.

pub mod connectivity;
pub mod engine;
pub mod policy;
