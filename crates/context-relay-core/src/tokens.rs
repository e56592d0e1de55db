//! Length-based token estimation.
//!
//! Fragment costs are an approximation, not a tokenizer: `ceil(chars /
//! chars_per_token)`. The ratio is configurable (`assembly.chars_per_token`)
//! and every budget decision in the crate goes through one estimator so
//! assembly and chunk planning agree on the numbers.

use serde::{Deserialize, Serialize};

/// Default chars-per-token ratio.
pub const DEFAULT_CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenEstimator {
    chars_per_token: usize,
}

impl TokenEstimator {
    /// A ratio of zero is clamped to one.
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }

    pub fn chars_per_token(&self) -> usize {
        self.chars_per_token
    }

    /// Estimated tokens for `text`. Counts chars, not bytes, so non-ASCII
    /// text is not over-charged.
    pub fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        chars.div_ceil(self.chars_per_token)
    }
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(DEFAULT_CHARS_PER_TOKEN)
    }
}
