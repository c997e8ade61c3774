//! Shared authentication context.
//!
//! One `AuthContext` is built at startup and handed to the API client and the
//! stores. It owns the token store, the derived session state and the event
//! channel that carries user-facing notices.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::tokens::{Credentials, TokenStore};
use crate::api::RefreshFailure;
use crate::models::UserProfile;

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Delay before the login screen is shown after a session expires, so the
/// expiry notice stays readable
pub const LOGIN_REDIRECT_DELAY: Duration = Duration::from_secs(1);

/// Derived session cache
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionState {
    pub user: Option<UserProfile>,
    pub authenticated: bool,
    /// Last server-reported login/register failure
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// A short message meant for the user, in place of a toast
#[derive(Debug, Clone, PartialEq)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignOutReason {
    /// The user logged out
    UserRequested,
    /// The profile could not be loaded with the stored tokens
    SessionInvalid,
    /// The refresh token was missing or rejected
    RefreshFailed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notice(Notice),
    SignedIn(UserProfile),
    /// Tokens and session were cleared; client-local caches must follow
    SignedOut(SignOutReason),
    /// The front end should show its login entry point after `delay`
    RedirectToLogin { delay: Duration },
}

pub struct AuthContext {
    tokens: Arc<dyn TokenStore>,
    session: RwLock<SessionState>,
    events: broadcast::Sender<SessionEvent>,
}

impl AuthContext {
    pub fn new(tokens: Arc<dyn TokenStore>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            tokens,
            session: RwLock::new(SessionState::default()),
            events,
        })
    }

    pub fn tokens(&self) -> &dyn TokenStore {
        self.tokens.as_ref()
    }

    /// Snapshot of the session state
    pub fn session(&self) -> SessionState {
        self.session
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.session().authenticated
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.session().user
    }

    fn update_session(&self, f: impl FnOnce(&mut SessionState)) {
        let mut session = self
            .session
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut session);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No receivers is fine; nobody is listening yet
        let _ = self.events.send(event);
    }

    pub fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        let message = message.into();
        debug!(?level, message = %message, "Notice");
        self.emit(SessionEvent::Notice(Notice { level, message }));
    }

    /// Store fresh credentials and mark the session authenticated
    pub fn sign_in(&self, credentials: &Credentials, user: UserProfile) -> anyhow::Result<()> {
        self.tokens.set(credentials)?;
        self.update_session(|s| {
            s.user = Some(user.clone());
            s.authenticated = true;
            s.error = None;
        });
        info!(user_id = user.id, "Signed in");
        self.emit(SessionEvent::SignedIn(user));
        Ok(())
    }

    /// Replace the cached profile after it was (re)loaded from the server
    pub fn set_user(&self, user: UserProfile) {
        self.update_session(|s| {
            s.user = Some(user);
            s.authenticated = true;
        });
    }

    pub fn set_error(&self, message: Option<String>) {
        self.update_session(|s| s.error = message);
    }

    /// Clear tokens and session locally. Never fails: a token store that
    /// cannot be cleared is logged and the in-memory state is reset anyway.
    pub fn teardown(&self, reason: SignOutReason) {
        if let Err(e) = self.tokens.clear() {
            warn!(error = %e, "Failed to clear stored tokens");
        }
        self.update_session(|s| *s = SessionState::default());
        info!(?reason, "Session cleared");
        self.emit(SessionEvent::SignedOut(reason));
    }

    /// End the session after a refresh failure: clear everything, tell the
    /// user, and ask the front end to show the login screen.
    pub fn expire_session(&self, failure: &RefreshFailure) {
        warn!(error = %failure, "Session expired");
        self.teardown(SignOutReason::RefreshFailed);
        self.notify(NoticeLevel::Error, "Session expired. Please login again");
        self.emit(SessionEvent::RedirectToLogin {
            delay: LOGIN_REDIRECT_DELAY,
        });
    }
}
