//! CSV input of checkout requests and output of their outcomes.

pub mod outcome_writer;
pub mod request_reader;
