//! # swcache sw
//!
//! A client-resident caching proxy: requests are classified, served by a
//! fetch strategy against a generation-versioned response store, and each
//! deployment installs a new generation that replaces all older ones on
//! activation.
//!
//! ## Architecture
//!
//! ```text
//! Request ──▶ Classifier ──▶ StrategyExecutor ──▶ Fetcher (network)
//!                                 │     │
//!                           get   │     │ enqueue
//!                                 ▼     ▼
//!                    GenerationManager ◀── CacheWriter (background task)
//!                                 │
//!                                 ▼
//!                           ResponseStore
//!
//! LifecycleController ──▶ GenerationManager (install / activate / clear)
//!                     └─▶ ClientRegistry (takeover + relayed notifications)
//! ```
//!
//! [`CacheProxy`] wires all of it together.

pub mod classify;
pub mod config;
pub mod error;
pub mod generation;
pub mod lifecycle;
pub mod message;
pub mod proxy;
pub mod strategy;
pub mod synthetic;
pub mod writer;

pub use classify::{Classifier, RequestMatcher, Rule, StrategyTag};
pub use config::CacheConfig;
pub use error::{Result, SwError};
pub use generation::{GenerationInfo, GenerationManager, GenerationState, STAGING_SUFFIX};
pub use lifecycle::{Activation, ClientId, ClientInfo, ClientRegistry, LifecycleController, MessageOutcome};
pub use message::{ControlMessage, OutboundMessage};
pub use proxy::CacheProxy;
pub use strategy::StrategyExecutor;
pub use synthetic::{failure_response, FailureBody, FailureKind, ERROR_HEADER};
pub use writer::CacheWriter;
