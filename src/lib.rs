//! streamchat: a streaming chat client core for OpenAI-compatible
//! completion endpoints.
//!
//! Responses arrive as server-sent events and are decoded incrementally
//! ([`decoder`]), applied to a persisted transcript ([`transcript`]) by the
//! single-turn pipeline ([`pipeline`]), or fanned out across up to three
//! comparison endpoints ([`comparison`]). Every live operation is owned by
//! the [`cancel`] coordinator.

pub mod cancel;
pub mod cli;
pub mod client;
pub mod comparison;
pub mod config;
pub mod decoder;
pub mod error;
pub mod identity;
pub mod ids;
pub mod observer;
pub mod pipeline;
pub mod providers;
pub mod render;
pub mod settings;
pub mod storage;
pub mod transcript;

pub use cancel::{CancellationCoordinator, Domain, LiveHandle};
pub use client::{CompletionBackend, HttpBackend};
pub use comparison::{ComparisonReport, PanelOutcome, PanelResult};
pub use decoder::{ByteStream, DeltaStream, SseDecoder};
pub use error::ChatError;
pub use identity::{follow_identity, IdentityProvider, StaticIdentity};
pub use observer::{NullObserver, StreamObserver};
pub use pipeline::{AppState, ChatApp, PipelineState, TurnOutcome};
pub use settings::{ComparisonEndpoint, Settings};
pub use storage::{KeyValueStore, MemoryStore, SqliteStore};
pub use transcript::{Chat, Message, MessageKind, TranscriptStore};
