//! Closed error taxonomy for the execution service.
//!
//! Startup wiring in `main.rs` uses `anyhow::Result` with `.context(...)` for diagnostics that
//! never cross the request boundary. Everything that can become visible to a caller — in an
//! `ExecutionResult.error` field or an HTTP status — is one of these variants, so the message
//! surfaced is always caller-safe.

use thiserror::Error;

#[derive(Debug, Error, Clone)]
pub enum ExecutorError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("image resolve error: {0}")]
    ImageResolve(String),

    #[error("image pull error: {0}")]
    ImagePull(String),

    #[error("sandbox creation error: {0}")]
    SandboxCreation(String),

    #[error("pool '{pool}' exhausted: no sandbox became available within the acquire deadline")]
    PoolExhausted { pool: String },

    #[error("execution timeout")]
    ExecutionTimeout,

    #[error("runtime api error: {0}")]
    RuntimeApi(String),

    #[error("service is shutting down")]
    ShuttingDown,
}

impl ExecutorError {
    /// The message placed in `ExecutionResult.error`. Never leaks container ids or internal
    /// diagnostics — callers only ever see the variant's own caller-safe text.
    pub fn user_message(&self) -> String {
        self.to_string()
    }
}
