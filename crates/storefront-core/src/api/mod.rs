//! REST API client module for the storefront backend.
//!
//! This module provides the `ApiClient` for talking to the backend's
//! account, catalog, cart, order and address endpoints.
//!
//! The API uses JWT bearer authentication. Access tokens are short-lived;
//! the `RefreshCoordinator` trades the refresh token for a new one when a
//! request is rejected.

pub mod client;
pub mod error;
pub mod refresh;

pub use client::{ApiClient, Attempt, RequestSpec};
pub use error::{ApiError, FieldErrors, RefreshFailure};
pub use refresh::{RefreshCoordinator, RefreshState};
