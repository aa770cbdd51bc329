//! Token estimation.
//!
//! A character heuristic of roughly four characters per token, which is
//! close enough for BPE tokenizers on English text to size a context
//! window without shipping a tokenizer.

use turnstile_core::session::Turn;

/// Framing cost of one message on the wire (role name, delimiters).
pub const TURN_OVERHEAD_TOKENS: usize = 4;

/// Estimate the token count for a string. Rounds up.
pub fn estimate_tokens(text: &str) -> usize {
    text.len().div_ceil(4)
}

/// Estimate tokens for a single turn including framing overhead.
pub fn estimate_turn_tokens(turn: &Turn) -> usize {
    TURN_OVERHEAD_TOKENS + estimate_tokens(&turn.content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_string_is_zero() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn rounds_up() {
        assert_eq!(estimate_tokens("test"), 1);
        assert_eq!(estimate_tokens("hello"), 2);
        assert_eq!(estimate_tokens(&"a".repeat(100)), 25);
    }

    #[test]
    fn turns_include_overhead() {
        assert_eq!(estimate_turn_tokens(&Turn::user("hello")), 6);
        assert_eq!(estimate_turn_tokens(&Turn::assistant("")), TURN_OVERHEAD_TOKENS);
    }
}
