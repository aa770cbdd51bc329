//! Context window assembly: which stored turns the provider sees.

pub mod token;
pub mod window;

pub use token::{estimate_tokens, estimate_turn_tokens};
pub use window::ContextPolicy;
