//! Context window policy.
//!
//! Picks the newest suffix of a session's turns to hand to the provider.
//! The stored session is never touched; only the in-flight request sees
//! the truncated view.

use turnstile_config::ContextWindowConfig;
use turnstile_core::session::{Role, Turn};

use super::token::estimate_turn_tokens;

/// How the oldest turns are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextPolicy {
    /// Keep at most this many of the most recent turns
    LastTurns(usize),
    /// Keep the most recent turns whose estimated tokens fit the budget
    TokenBudget(usize),
}

impl Default for ContextPolicy {
    fn default() -> Self {
        Self::from(&ContextWindowConfig::default())
    }
}

impl From<&ContextWindowConfig> for ContextPolicy {
    fn from(config: &ContextWindowConfig) -> Self {
        match config {
            ContextWindowConfig::LastTurns { max_turns } => ContextPolicy::LastTurns(*max_turns),
            ContextWindowConfig::TokenBudget { max_tokens } => {
                ContextPolicy::TokenBudget(*max_tokens)
            }
        }
    }
}

impl ContextPolicy {
    /// Index of the first turn kept.
    ///
    /// Always lands on a user turn (or the end) so no reply is sent
    /// without the message it answered.
    fn cut(&self, turns: &[Turn]) -> usize {
        let start = self.raw_cut(turns);
        turns[start..]
            .iter()
            .position(|turn| turn.role == Role::User)
            .map_or(turns.len(), |offset| start + offset)
    }

    fn raw_cut(&self, turns: &[Turn]) -> usize {
        match *self {
            ContextPolicy::LastTurns(max) => turns.len().saturating_sub(max),
            ContextPolicy::TokenBudget(budget) => {
                let mut used = 0;
                let mut start = turns.len();
                for (i, turn) in turns.iter().enumerate().rev() {
                    used += estimate_turn_tokens(turn);
                    if used > budget {
                        break;
                    }
                    start = i;
                }
                start
            }
        }
    }

    /// The window of `turns` to send, oldest first.
    pub fn window<'a>(&self, turns: &'a [Turn]) -> &'a [Turn] {
        &turns[self.cut(turns)..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn history(n: usize) -> Vec<Turn> {
        (0..n)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("question {i}"))
                } else {
                    Turn::assistant(format!("answer {i}"))
                }
            })
            .collect()
    }

    #[test]
    fn last_turns_keeps_newest() {
        let turns = history(10);
        let window = ContextPolicy::LastTurns(4).window(&turns);
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["question 6", "answer 7", "question 8", "answer 9"]);
    }

    #[test]
    fn last_turns_never_starts_on_a_reply() {
        let turns = history(10);
        let window = ContextPolicy::LastTurns(3).window(&turns);
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["question 8", "answer 9"]);

        assert!(ContextPolicy::LastTurns(1).window(&turns).is_empty());
    }

    #[test]
    fn token_budget_never_starts_on_a_reply() {
        // Each turn: 4 overhead + ceil(10 / 4) = 7 tokens. 21 fits three.
        let turns: Vec<Turn> = (0..6)
            .map(|i| {
                if i % 2 == 0 {
                    Turn::user(format!("question {i}"))
                } else {
                    Turn::assistant(format!("answer {i:03}"))
                }
            })
            .collect();
        let window = ContextPolicy::TokenBudget(21).window(&turns);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].role, Role::User);
        assert_eq!(window[0].content, "question 4");
    }

    #[test]
    fn window_after_partial_history_starts_on_user() {
        // A trailing user turn with no reply yet still counts as an exchange.
        let mut turns = history(4);
        turns.push(Turn::user("question 4"));
        let window = ContextPolicy::LastTurns(2).window(&turns);
        let contents: Vec<&str> = window.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["question 4"]);
    }

    #[test]
    fn last_turns_with_short_history_keeps_all() {
        let turns = history(2);
        assert_eq!(ContextPolicy::LastTurns(20).window(&turns).len(), 2);
        assert!(ContextPolicy::LastTurns(20).window(&[]).is_empty());
    }

    #[test]
    fn token_budget_drops_oldest_first() {
        // Each turn: 4 overhead + ceil(8 / 4) = 6 tokens
        let turns: Vec<Turn> = (0..5).map(|i| Turn::user(format!("msg{i:05}"))).collect();
        let window = ContextPolicy::TokenBudget(13).window(&turns);
        assert_eq!(window.len(), 2);
        assert_eq!(window[0].content, "msg00003");
        assert_eq!(window[1].content, "msg00004");
    }

    #[test]
    fn token_budget_smaller_than_newest_turn_keeps_nothing() {
        let turns = vec![Turn::user("a".repeat(400))];
        assert!(ContextPolicy::TokenBudget(10).window(&turns).is_empty());
    }

    #[test]
    fn window_never_mutates_source() {
        let turns = history(6);
        let before = turns.clone();
        let _ = ContextPolicy::LastTurns(1).window(&turns);
        assert_eq!(turns, before);
    }

    #[test]
    fn from_config() {
        assert_eq!(ContextPolicy::default(), ContextPolicy::LastTurns(20));
        let config = ContextWindowConfig::TokenBudget { max_tokens: 2048 };
        assert_eq!(ContextPolicy::from(&config), ContextPolicy::TokenBudget(2048));
    }
}
