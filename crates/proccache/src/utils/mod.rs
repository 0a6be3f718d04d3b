//! Shared helpers
//!
//! - **[`serde`]**: millisecond encoding of durations for config files

pub mod serde;

pub use self::serde::duration_millis;
