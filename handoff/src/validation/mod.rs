//! Validation gate between generation and stage completion.

mod gate;

pub use gate::{count_sections, non_whitespace_chars, ValidationGate, ValidationRules};
