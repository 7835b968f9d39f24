//! Writing archives: export of a selection, in-place rewrite and backup.

pub mod writer;
