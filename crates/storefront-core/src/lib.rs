//! Storefront client core.
//!
//! Shared library for storefront front ends: the authenticated API client
//! with transparent token refresh, session management, and local caches.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod models;
pub mod utils;

#[cfg(test)]
mod test_support;

pub use api::{ApiClient, ApiError, RefreshFailure, RequestSpec};
pub use auth::{AuthContext, SessionEvent, SessionStore, TokenStore};
pub use cache::{CacheManager, CartStore};
pub use config::{Config, TokenBackend};
