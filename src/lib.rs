//! `mboxprune`: index, filter and prune MBOX archives of any size.
//!
//! This crate provides the core library: a streaming scanner that indexes an
//! archive without loading it into memory, header filters and body search,
//! a keep/remove selection, and a writer that exports the kept messages or
//! atomically rewrites the original file.
//!
//! ```rust,ignore
//! use mboxprune::config::Config;
//! use mboxprune::search::filter::{FilterField, FilterRule, FilterSet};
//! use mboxprune::session::ArchiveSession;
//!
//! let mut session = ArchiveSession::open("archive.mbox", &Config::default(), &mut ())?;
//! let spam = FilterSet::new().with_rule(FilterRule::contains(FilterField::Subject, "spam"));
//! let hits = session.filter(&spam)?;
//! session.set_selection(&hits, false)?;
//! session.export_to("clean.mbox", &mut ())?;
//! ```

pub mod config;
pub mod error;
pub mod export;
pub mod index;
pub mod model;
pub mod parser;
pub mod plan;
pub mod progress;
pub mod search;
pub mod session;
pub mod store;
