//! Persistence of error groups, sessions, and settings (spec.md §4.5).
//!
//! Grounded on `repo/races.rs` / `repo/reads.rs`'s runtime-checked
//! `sqlx::query()` + `Row::get` style, used here instead of the teacher's
//! compile-time `sqlx::query!` macros because those require a live database
//! connection at build time.

pub mod error_groups;
pub mod sessions;
pub mod settings;

pub use error_groups::Pagination;
