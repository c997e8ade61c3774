//! Authentication: credentials, session state and the shared context.
//!
//! This module provides:
//! - `TokenStore`: durable access/refresh token storage (file, keychain or memory)
//! - `AuthContext`: the object every request-building component shares
//! - `SessionStore`: login, registration, logout and profile loading
//!
//! The server decides when tokens expire; the client only learns about it
//! through 401 responses.

pub mod context;
pub mod session;
pub mod tokens;

pub use context::{
    AuthContext, Notice, NoticeLevel, SessionEvent, SessionState, SignOutReason,
    LOGIN_REDIRECT_DELAY,
};
pub use session::SessionStore;
pub use tokens::{Credentials, FileTokenStore, KeyringTokenStore, MemoryTokenStore, TokenStore};
