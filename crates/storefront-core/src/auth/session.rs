use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, error, info, warn};

use super::context::{AuthContext, NoticeLevel, SessionState, SignOutReason};
use super::tokens::Credentials;
use crate::api::{ApiClient, ApiError};
use crate::models::{AuthResponse, PasswordChange, ProfileUpdate, RegisterForm, UserProfile};

/// How long logout waits for the server before clearing locally anyway
const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

/// Login, registration and profile state on top of the API client.
pub struct SessionStore {
    api: ApiClient,
    logout_timeout: Duration,
}

impl SessionStore {
    pub fn new(api: ApiClient) -> Self {
        Self {
            api,
            logout_timeout: LOGOUT_TIMEOUT,
        }
    }

    pub fn with_logout_timeout(mut self, timeout: Duration) -> Self {
        self.logout_timeout = timeout;
        self
    }

    pub fn context(&self) -> &Arc<AuthContext> {
        self.api.context()
    }

    pub fn state(&self) -> SessionState {
        self.context().session()
    }

    pub fn is_authenticated(&self) -> bool {
        self.context().is_authenticated()
    }

    /// Restore the session at startup from stored tokens
    pub async fn init(&self) -> bool {
        if !self.context().tokens().has_credentials() {
            debug!("No stored tokens, starting signed out");
            return false;
        }
        self.fetch_user().await.is_ok()
    }

    fn complete_sign_in(&self, auth: AuthResponse) -> Result<UserProfile> {
        let credentials = Credentials::new(auth.tokens.access, auth.tokens.refresh);
        self.context().sign_in(&credentials, auth.user.clone())?;
        Ok(auth.user)
    }

    fn report_failure(&self, err: &anyhow::Error, default: &str) -> String {
        let message = ApiError::server_message(err, default);
        self.context().set_error(Some(message.clone()));
        self.context().notify(NoticeLevel::Error, message.clone());
        message
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<UserProfile> {
        self.context().set_error(None);

        match self.api.login(email, password).await {
            Ok(auth) => {
                let user = self.complete_sign_in(auth)?;
                info!(user_id = user.id, "Login successful");
                self.context().notify(NoticeLevel::Success, "Welcome back!");
                Ok(user)
            }
            Err(e) => {
                error!(error = %e, "Login failed");
                self.report_failure(&e, "Login failed");
                Err(e)
            }
        }
    }

    pub async fn register(&self, form: &RegisterForm) -> Result<UserProfile> {
        self.context().set_error(None);

        match self.api.register(form).await {
            Ok(auth) => {
                let user = self.complete_sign_in(auth)?;
                info!(user_id = user.id, "Registration successful");
                self.context().notify(NoticeLevel::Success, "Account created!");
                Ok(user)
            }
            Err(e) => {
                error!(error = %e, "Registration failed");
                self.report_failure(&e, "Registration failed");
                Err(e)
            }
        }
    }

    /// Sign out. The server is told on a best-effort basis when
    /// `notify_server` is set; local tokens and session are cleared no matter
    /// how that call ends.
    pub async fn logout(&self, notify_server: bool) {
        if notify_server {
            if let Some(refresh) = self.context().tokens().refresh_token() {
                match tokio::time::timeout(self.logout_timeout, self.api.logout(&refresh)).await {
                    Ok(Ok(())) => debug!("Server acknowledged logout"),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Logout API failed (token might be expired already)")
                    }
                    Err(_) => warn!(timeout = ?self.logout_timeout, "Logout API timed out"),
                }
            }
        }

        let reason = if notify_server {
            SignOutReason::UserRequested
        } else {
            SignOutReason::SessionInvalid
        };
        self.context().teardown(reason);

        if notify_server {
            self.context()
                .notify(NoticeLevel::Success, "Logged out successfully");
        }
    }

    /// Reload the profile. Any failure means the stored session is unusable
    /// and it is cleared locally, unless a failed refresh already did that.
    pub async fn fetch_user(&self) -> Result<UserProfile> {
        match self.api.profile().await {
            Ok(user) => {
                self.context().set_user(user.clone());
                Ok(user)
            }
            Err(e) => {
                if matches!(e.downcast_ref::<ApiError>(), Some(ApiError::SessionExpired(_))) {
                    debug!("Session already expired during profile load");
                } else {
                    warn!(error = %e, "Session invalid");
                    self.logout(false).await;
                }
                Err(e)
            }
        }
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        match self.api.update_profile(update).await {
            Ok(user) => {
                self.context().set_user(user.clone());
                self.context().notify(NoticeLevel::Success, "Profile updated");
                Ok(user)
            }
            Err(e) => {
                let message = ApiError::server_message(&e, "Update failed");
                self.context().notify(NoticeLevel::Error, message);
                Err(e)
            }
        }
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<()> {
        match self.api.change_password(change).await {
            Ok(()) => {
                self.context()
                    .notify(NoticeLevel::Success, "Password changed");
                Ok(())
            }
            Err(e) => {
                let message = ApiError::server_message(&e, "Password change failed");
                self.context().notify(NoticeLevel::Error, message);
                Err(e)
            }
        }
    }
}
