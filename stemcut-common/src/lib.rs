//! # stemcut common library
//!
//! Shared code for the stemcut service:
//! - Settings resolution (CLI, environment, TOML, defaults)
//! - Common error type
//! - API key handling
//! - Service events and SSE helpers
//! - Track title and filename utilities

pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;
pub mod title;

pub use error::{Error, Result};
