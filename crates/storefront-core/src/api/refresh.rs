//! Access token refresh with single-flight coalescing.
//!
//! When a request comes back 401 the dispatcher asks the coordinator for a
//! fresh access token. Concurrent callers share one pending refresh call and
//! all receive its result. The success and failure side effects (persisting
//! the new token, or tearing the session down) run once per refresh, inside
//! the shared future.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{ApiError, RefreshFailure};
use crate::auth::AuthContext;

type RefreshFuture = Shared<BoxFuture<'static, Result<String, RefreshFailure>>>;

/// A refresh call and the access token it replaces
#[derive(Clone)]
struct PendingRefresh {
    replaces: String,
    future: RefreshFuture,
}

impl PendingRefresh {
    fn in_flight(&self) -> bool {
        self.future.peek().is_none()
    }
}

#[derive(Debug, Serialize)]
struct RefreshRequest<'a> {
    refresh: &'a str,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    access: String,
    /// Present when the backend rotates refresh tokens
    #[serde(default)]
    refresh: Option<String>,
}

/// Observable state of the refresh protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Normal,
    RefreshInFlight,
    /// The last refresh failed and no one has logged in since
    RefreshFailed,
}

pub struct RefreshCoordinator {
    client: Client,
    refresh_url: String,
    context: Arc<AuthContext>,
    pending: Mutex<Option<PendingRefresh>>,
    refresh_calls: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(client: Client, refresh_url: String, context: Arc<AuthContext>) -> Self {
        Self {
            client,
            refresh_url,
            context,
            pending: Mutex::new(None),
            refresh_calls: AtomicU64::new(0),
        }
    }

    /// Number of refresh calls issued so far
    pub fn refresh_calls(&self) -> u64 {
        self.refresh_calls.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> RefreshState {
        let pending = self.pending.lock().await;
        match pending.as_ref().map(|p| p.future.peek()) {
            Some(None) => RefreshState::RefreshInFlight,
            Some(Some(Err(_))) if !self.context.tokens().has_credentials() => {
                RefreshState::RefreshFailed
            }
            _ => RefreshState::Normal,
        }
    }

    /// Get an access token to replace `stale`, which the server just rejected.
    ///
    /// Joins the refresh already in flight when it replaces the same token.
    /// If another caller has already replaced `stale` in the token store,
    /// that token is returned without a network call.
    pub async fn refreshed_token(&self, stale: &str) -> Result<String, RefreshFailure> {
        loop {
            let mut slot = self.pending.lock().await;
            let previous = slot.clone();

            if let Some(pending) = previous.as_ref().filter(|p| p.in_flight()) {
                if pending.replaces == stale {
                    debug!("Joining in-flight token refresh");
                    drop(slot);
                    return pending.future.clone().await;
                }
            }

            let current = self.context.tokens().access_token();
            if let Some(current) = current.as_deref().filter(|c| *c != stale) {
                debug!("Access token already refreshed");
                return Ok(current.to_string());
            }

            match previous {
                // A refresh for an older session is still running; let it
                // settle before refreshing this one
                Some(pending) if pending.in_flight() => {
                    debug!("Waiting for refresh of a previous token");
                    drop(slot);
                    let _ = pending.future.await;
                    continue;
                }
                // The previous refresh failed and nobody signed in since:
                // hand out the same failure instead of running teardown again
                Some(pending) if current.is_none() => {
                    if let Some(Err(failure)) = pending.future.peek() {
                        return Err(failure.clone());
                    }
                }
                _ => {}
            }

            let pending = self.start_refresh(stale);
            *slot = Some(pending.clone());
            drop(slot);
            return pending.future.await;
        }
    }

    fn start_refresh(&self, stale: &str) -> PendingRefresh {
        let call = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        let client = self.client.clone();
        let url = self.refresh_url.clone();
        let context = Arc::clone(&self.context);
        let replaces = stale.to_string();

        let future = {
            let replaces = replaces.clone();
            async move {
                debug!(call, "Refreshing access token");
                let result = request_access_token(&client, &url, &context, &replaces).await;
                match &result {
                    Ok(_) => info!(call, "Access token refreshed"),
                    Err(failure) => context.expire_session(failure),
                }
                result
            }
            .boxed()
            .shared()
        };

        PendingRefresh { replaces, future }
    }
}

/// Exchange the stored refresh token for a new access token and persist it
/// in place of `stale`.
///
/// This is a bare client call: no bearer header and no 401 handling.
async fn request_access_token(
    client: &Client,
    url: &str,
    context: &AuthContext,
    stale: &str,
) -> Result<String, RefreshFailure> {
    let refresh_token = context
        .tokens()
        .refresh_token()
        .ok_or(RefreshFailure::MissingRefreshToken)?;

    let response = client
        .post(url)
        .json(&RefreshRequest {
            refresh: &refresh_token,
        })
        .send()
        .await
        .map_err(|e| RefreshFailure::Network(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(RefreshFailure::Rejected {
            status: status.as_u16(),
            body: ApiError::truncate_body(&body),
        });
    }

    let refreshed: RefreshResponse = response.json().await.map_err(|e| RefreshFailure::Rejected {
        status: status.as_u16(),
        body: format!("unreadable refresh response: {}", e),
    })?;

    let stored = context.tokens().replace_access(
        stale,
        &refreshed.access,
        refreshed.refresh.as_deref(),
    );
    match stored {
        Ok(true) => {}
        // Logged out or signed in again while the call was in flight
        Ok(false) => debug!("Refreshed token not stored, session changed meanwhile"),
        // The replay can still use the token we hold in hand
        Err(e) => warn!(error = %e, "Failed to persist refreshed access token"),
    }

    Ok(refreshed.access)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::api::ApiError;
    use crate::auth::{Credentials, SessionEvent, SignOutReason};
    use crate::test_support::{cart_json, client, context, drain, user_json};

    async fn mount_cart(server: &MockServer, token: &str, status: u16, times: u64) {
        let response = if status == 200 {
            ResponseTemplate::new(200).set_body_json(cart_json(1))
        } else {
            ResponseTemplate::new(status)
                .set_body_json(json!({"detail": "Given token not valid for any token type"}))
        };
        Mock::given(method("GET"))
            .and(path("/api/cart/"))
            .and(header("authorization", format!("Bearer {}", token).as_str()))
            .respond_with(response)
            .expect(times)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_stale_token_is_refreshed_and_request_replayed() {
        let server = MockServer::start().await;
        mount_cart(&server, "A1", 401, 1).await;
        mount_cart(&server, "A2", 200, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .and(body_json(json!({"refresh": "R1"})))
            .and(|req: &wiremock::Request| !req.headers.contains_key("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "A2"})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let api = client(&server, Arc::clone(&ctx));

        let cart = api.cart().await.unwrap();
        assert_eq!(cart.total_items, 1);
        assert_eq!(ctx.tokens().get(), Some(Credentials::new("A2", "R1")));
        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(api.refresh_state().await, RefreshState::Normal);
    }

    #[tokio::test]
    async fn test_rotated_refresh_token_is_stored() {
        let server = MockServer::start().await;
        mount_cart(&server, "A1", 401, 1).await;
        mount_cart(&server, "A2", 200, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access": "A2", "refresh": "R2"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let api = client(&server, Arc::clone(&ctx));
        api.cart().await.unwrap();
        assert_eq!(ctx.tokens().get(), Some(Credentials::new("A2", "R2")));
    }

    #[tokio::test]
    async fn test_second_401_is_not_refreshed_again() {
        let server = MockServer::start().await;
        mount_cart(&server, "A1", 401, 1).await;
        mount_cart(&server, "A2", 401, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "A2"})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let api = client(&server, Arc::clone(&ctx));

        let err = api.cart().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized(_))));
        assert_eq!(api.refresh_calls(), 1);
        // The refreshed token is kept; only a failed refresh ends the session
        assert_eq!(ctx.tokens().access_token().as_deref(), Some("A2"));
    }

    #[tokio::test]
    async fn test_failed_refresh_clears_session_and_rejects_caller() {
        let server = MockServer::start().await;
        mount_cart(&server, "A1", 401, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"detail": "Token is invalid or expired"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        ctx.set_user(serde_json::from_value(user_json()).unwrap());
        let mut rx = ctx.subscribe();
        let api = client(&server, Arc::clone(&ctx));

        let err = api.cart().await.unwrap_err();
        match err.downcast_ref::<ApiError>() {
            Some(ApiError::SessionExpired(RefreshFailure::Rejected { status, .. })) => {
                assert_eq!(*status, 401)
            }
            other => panic!("expected session expiry, got {other:?}"),
        }

        assert!(ctx.tokens().get().is_none());
        assert!(ctx.user().is_none());
        assert!(!ctx.is_authenticated());
        assert_eq!(api.refresh_state().await, RefreshState::RefreshFailed);

        let events = drain(&mut rx);
        assert_eq!(events[0], SessionEvent::SignedOut(SignOutReason::RefreshFailed));
        assert!(matches!(events[1], SessionEvent::Notice(_)));
        assert!(matches!(events[2], SessionEvent::RedirectToLogin { .. }));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_share_one_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/cart/"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1..=5)
            .mount(&server)
            .await;
        mount_cart(&server, "A2", 200, 5).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access": "A2"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let api = client(&server, Arc::clone(&ctx));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.cart().await })
            })
            .collect();
        for handle in handles {
            let cart = handle.await.unwrap().unwrap();
            assert_eq!(cart.total_items, 1);
        }

        assert_eq!(api.refresh_calls(), 1);
        assert_eq!(ctx.tokens().access_token().as_deref(), Some("A2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_401s_fail_together_with_one_teardown() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/orders/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(5)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let mut rx = ctx.subscribe();
        let api = client(&server, Arc::clone(&ctx));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let api = api.clone();
                tokio::spawn(async move { api.list_orders().await })
            })
            .collect();
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(
                err.downcast_ref::<ApiError>(),
                Some(ApiError::SessionExpired(_))
            ));
        }

        let signed_out = drain(&mut rx)
            .into_iter()
            .filter(|e| matches!(e, SessionEvent::SignedOut(_)))
            .count();
        assert_eq!(signed_out, 1);
        assert_eq!(api.refresh_calls(), 1);
    }

    #[tokio::test]
    async fn test_token_replaced_by_login_skips_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let ctx = context(Some(("A9", "R9")));
        let coordinator = RefreshCoordinator::new(
            reqwest::Client::new(),
            format!("{}/api/token/refresh/", server.uri()),
            Arc::clone(&ctx),
        );

        // A request that went out with A1 comes back 401 after A9 was stored
        assert_eq!(coordinator.refreshed_token("A1").await.unwrap(), "A9");
        assert_eq!(coordinator.refresh_calls(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_logout_during_refresh_is_not_undone() {
        let server = MockServer::start().await;
        mount_cart(&server, "A1", 401, 1).await;
        mount_cart(&server, "A2", 200, 1).await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access": "A2", "refresh": "R2"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let api = client(&server, Arc::clone(&ctx));
        let request = tokio::spawn({
            let api = api.clone();
            async move { api.cart().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(api.refresh_state().await, RefreshState::RefreshInFlight);
        ctx.teardown(SignOutReason::UserRequested);

        request.await.unwrap().unwrap();
        assert!(ctx.tokens().get().is_none());
        assert!(!ctx.is_authenticated());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_new_session_does_not_join_old_refresh() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .and(body_json(json!({"refresh": "R1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"access": "A2"}))
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .and(body_json(json!({"refresh": "NR1"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"access": "N2"})))
            .expect(1)
            .mount(&server)
            .await;

        let ctx = context(Some(("A1", "R1")));
        let coordinator = Arc::new(RefreshCoordinator::new(
            reqwest::Client::new(),
            format!("{}/api/token/refresh/", server.uri()),
            Arc::clone(&ctx),
        ));

        let old_session = tokio::spawn({
            let coordinator = Arc::clone(&coordinator);
            async move { coordinator.refreshed_token("A1").await }
        });
        tokio::time::sleep(Duration::from_millis(100)).await;

        // The user signs in again while the old refresh is still running,
        // and the new access token is rejected too
        ctx.tokens().set(&Credentials::new("N1", "NR1")).unwrap();
        assert_eq!(coordinator.refreshed_token("N1").await.unwrap(), "N2");

        assert_eq!(old_session.await.unwrap().unwrap(), "A2");
        assert_eq!(coordinator.refresh_calls(), 2);
        assert_eq!(ctx.tokens().get(), Some(Credentials::new("N2", "NR1")));
    }
}
