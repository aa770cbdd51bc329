//! Request orchestration for Turnstile.
//!
//! Each chat request moves through a small state machine
//! (see [`phase::RequestPhase`]): it is validated, its session context is
//! loaded, a generation runs against a bounded window of that context, and
//! the user and assistant turns are committed together with one
//! optimistic-concurrency append.

pub mod context;
pub mod orchestrator;
pub mod phase;
pub mod stream_event;
pub mod validate;

pub use context::ContextPolicy;
pub use orchestrator::{FILTERED_MARKER, HealthReport, Orchestrator};
pub use phase::{PhaseTracker, RequestPhase};
pub use stream_event::ChatStreamEvent;
pub use validate::{ChatRequest, ChatResponse, ModelParams};
