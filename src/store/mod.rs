//! Random-access reading of indexed messages.

pub mod reader;
