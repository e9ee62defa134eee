//! palaver-core: pure types and text processing.
//!
//! No async runtime, no I/O, no platform dependencies.

pub mod text_prep;
pub mod types;
pub mod validate;
pub mod wav;
