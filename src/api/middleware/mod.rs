//! API middleware

mod auth;

pub use auth::{extract_token, require_token, API_TOKEN_HEADER};
