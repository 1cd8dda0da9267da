//! Compute backends and failover pools.
//!
//! A [`Backend`] is one interchangeable text-generation provider. Backends
//! are grouped into a [`BackendPool`] that retries and fails over between
//! them, and [`EngineRoutes`] maps each plan [`Engine`] to its pool.
//!
//! # Architecture
//!
//! ```text
//! Dispatcher / MergeCoordinator
//!     |
//!     v
//! EngineRoutes --resolve("cloud")--> Arc<BackendPool>
//!     |                                   |
//!     |   invoke_from(active, request) ---+
//!     |        |
//!     |        v
//!     |   [A] --fail--> [B] --ok--> Invocation { text, thoughts, backend_index }
//!     |        |
//!     |   stream_generate --> aggregate --> Segment::{Visible, Thought}
//!     |   generate (fallback when the stream breaks)
//! ```

pub mod command;
pub mod engine;
pub mod pool;
pub mod trait_def;
pub mod types;

pub use command::CommandBackend;
pub use engine::{Engine, EngineParseError, EngineRoutes};
pub use pool::{BackendPool, CallOptions, Invocation, PoolError, RetryPolicy};
pub use trait_def::Backend;
pub use types::{BackendError, ChatMessage, GenerateRequest, Role, TextStream};
