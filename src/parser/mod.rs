//! Archive parsing: the streaming MBOX boundary scanner and header decoding.

pub mod header;
pub mod mbox;
