//! Auto-auth: obtains and keeps a token alive for the rest of the agent.

pub mod backoff;
pub mod handler;

pub use backoff::Backoff;
pub use handler::{AuthHandler, AuthHandlerConfig, InvalidTokenSignal, TokenReceiver};
