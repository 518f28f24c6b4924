//! Channel layer for output accumulation, prompt learning and cleanup.
//!
//! These pieces work on decoded application text and know nothing about
//! the wire protocol that delivered it.

mod buffer;
pub mod normalize;
pub mod prompt;

pub use buffer::{OutputBuffer, PAGER_MARKER};
pub use normalize::{clean_line, clean_text, normalize_output};
pub use prompt::{LearnedPrompt, PromptLearner};
