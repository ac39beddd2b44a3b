// src/lib.rs

// Import the top-level `modelgate` module.
pub mod modelgate;

// Re-exporting key items for easier external access.
pub use modelgate::error;
pub use modelgate::orchestrator::{self, Gateway};
pub use modelgate::request::{
    self, ChatMessage, ExecutionOutput, ProviderRequest, ProviderResponse, Role,
    StreamingExecution,
};
pub use modelgate::{accounting, environment, planner, providers, registry, sanitize, stream, tools};

/// Initialise the process logger from `RUST_LOG`.  Safe to call more than
/// once; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default()).try_init();
}
