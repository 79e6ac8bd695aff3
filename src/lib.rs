//! Recursive firmware unpacking.
//!
//! A blob is scanned for format markers, each candidate offset is validated
//! by a cheap header check, and the survivors are carved out and handed to
//! an in-process decoder or an external tool. Claimed byte ranges go into a
//! per-file [`blacklist::Blacklist`] so no range is unpacked twice, and every
//! file that comes out is scanned again.

pub mod blacklist;
pub mod carve;
pub mod checks;
pub mod chunk;
pub mod cli;
pub mod config;
pub mod engine;
pub mod logging;
pub mod metadata;
pub mod pipeline;
pub mod scanner;
pub mod scratch;
pub mod source;
pub mod tool;
pub mod util;
