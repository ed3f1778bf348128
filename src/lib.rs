//! Client-side agent for the secret service: authenticates with a configured
//! method, keeps the token renewed and delivers it to sinks, rendered
//! templates and a supervised child process.

pub mod agent;
pub mod auth;
pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod exec;
pub mod fsutil;
pub mod generate;
pub mod logging;
pub mod sink;
pub mod template;

pub use agent::Agent;
pub use config::Config;
pub use error::{AgentError, Result};
