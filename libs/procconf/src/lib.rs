//! # skald-procconf
//!
//! Process-module configuration: the revisioned `(section, key, value)`
//! set served by a tenant, and the merge that folds it into a pristine
//! `ruxitagentproc.conf` baseline.
//!
//! The baseline format is line oriented: section headers are `[name]` on
//! their own line, property lines are `key value` with the first run of
//! whitespace separating key from value, comments start with `#`. The
//! merge keeps the baseline's shape (blank lines and comments included)
//! and only rewrites or appends property lines.
//!
//! ## Invariants
//!
//! - An empty override set reproduces the baseline byte for byte.
//! - Merging is idempotent: applying the same overrides twice equals
//!   applying them once.
//! - Every override key appears exactly once in the output, inside the
//!   section it belongs to.

pub mod merge;
pub mod types;

pub use merge::{merge_lines, section_header};
pub use types::{CachedProcessModuleConfig, ConfMap, ConfProperty, ProcessModuleConfig};
