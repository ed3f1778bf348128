//! Rendering of secret templates to files and to a child's environment.

pub mod engine;
pub mod runner;
pub mod server;

pub use engine::{SecretRequest, Template};
pub use runner::{Output, PassOutcome, RenderTarget, Renderer};
pub use server::{file_targets, TemplateServer};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("map has no entry for key \"{0}\"")]
    MissingKey(String),

    #[error("{0}")]
    Exec(String),
}

impl From<TemplateError> for crate::error::AgentError {
    fn from(e: TemplateError) -> Self {
        crate::error::AgentError::Template(e.to_string())
    }
}
