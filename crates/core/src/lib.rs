//! # Turnstile Core
//!
//! Domain types, traits, and error definitions for the Turnstile chat service.
//! This crate has **no framework dependencies**: it defines the session model
//! and the two seams (`SessionStore`, `Provider`) that the store, provider,
//! and orchestrator crates implement against.
//!
//! ## Layout
//!
//! - [`session`]: sessions, turns, roles and usage accounting
//! - [`generation`]: generation parameters, requests and results
//! - [`provider`]: the LLM backend trait and its wire-neutral types
//! - [`store`]: the context store gateway trait
//! - [`error`]: the error taxonomy shared by every crate

pub mod error;
pub mod generation;
pub mod provider;
pub mod session;
pub mod store;

// Re-export key types at crate root for ergonomics
pub use error::{
    FailureOrigin, GenerationError, ProviderError, RejectKind, ServiceError, StoreError,
};
pub use generation::{FinishReason, GenerationParams, GenerationRequest, GenerationResult};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
pub use session::{Role, Session, SessionId, TokenUsage, Turn};
pub use store::SessionStore;
