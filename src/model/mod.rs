//! Core data model types: message records, byte ranges, and header values.

pub mod record;
