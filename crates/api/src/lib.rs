//! Studio API Library
//!
//! This crate contains the HTTP server components of the studio platform:
//! configuration, auth, routes, transactional email and the chat assistant.

pub mod auth;
pub mod booking;
pub mod chat;
pub mod config;
pub mod email;
pub mod error;
pub mod routes;
pub mod security;
pub mod state;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
pub use email::{BookingDetails, StudioEmailService};
pub use error::{ApiError, ApiResult};
pub use state::AppState;
