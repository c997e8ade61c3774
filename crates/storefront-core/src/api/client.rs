//! API client for the storefront REST backend.
//!
//! Every request is described by an immutable [`RequestSpec`]. The client
//! attaches the current access token as a bearer header and, when the
//! server answers 401, asks the [`RefreshCoordinator`] for a new token and
//! replays the request once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{header, Client, Method, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use super::refresh::{RefreshCoordinator, RefreshState};
use super::ApiError;
use crate::auth::AuthContext;
use crate::models::{
    Address, AddressForm, AuthResponse, Cart, CartMutation, Category, CheckoutRequest,
    CheckoutResponse, Listing, Order, PasswordChange, Product, ProductQuery, ProfileUpdate,
    RegisterForm, UserProfile,
};

// ============================================================================
// Constants
// ============================================================================

/// Default HTTP request timeout in seconds
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Token refresh endpoint, relative to the base URL
const REFRESH_PATH: &str = "/token/refresh/";

/// Which try of a request this is. Carried alongside the [`RequestSpec`];
/// a request is replayed at most once, after a successful token refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    Replay,
}

/// Description of one API call, rebuilt into a fresh HTTP request for every
/// attempt.
#[derive(Debug, Clone)]
pub struct RequestSpec {
    method: Method,
    path: String,
    query: Vec<(String, String)>,
    body: Option<Value>,
    refresh: bool,
}

impl RequestSpec {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            refresh: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn with_json<B: Serialize + ?Sized>(mut self, body: &B) -> Result<Self> {
        self.body = Some(serde_json::to_value(body).context("Failed to encode request body")?);
        Ok(self)
    }

    /// Add query parameters from a serializable struct; `None` fields are
    /// left out.
    pub fn with_query<Q: Serialize>(mut self, query: &Q) -> Result<Self> {
        if let Value::Object(map) =
            serde_json::to_value(query).context("Failed to encode query parameters")?
        {
            for (key, value) in map {
                let value = match value {
                    Value::Null => continue,
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                self.query.push((key, value));
            }
        }
        Ok(self)
    }

    /// Opt out of refresh-on-401. Used for the credential endpoints, whose
    /// 401 means "wrong password", not "stale token".
    pub fn without_refresh(mut self) -> Self {
        self.refresh = false;
        self
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

/// API client for the storefront backend.
/// Clone is cheap - reqwest::Client and the coordinator are shared.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: Arc<str>,
    context: Arc<AuthContext>,
    refresher: Arc<RefreshCoordinator>,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str, context: Arc<AuthContext>) -> Result<Self> {
        Self::with_timeout(base_url, context, Duration::from_secs(REQUEST_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: &str, context: Arc<AuthContext>, timeout: Duration) -> Result<Self> {
        let mut headers = header::HeaderMap::new();
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .context("Failed to build HTTP client")?;

        let base_url: Arc<str> = Arc::from(base_url.trim_end_matches('/'));
        let refresher = Arc::new(RefreshCoordinator::new(
            client.clone(),
            format!("{}{}", base_url, REFRESH_PATH),
            Arc::clone(&context),
        ));

        Ok(Self {
            client,
            base_url,
            context,
            refresher,
        })
    }

    pub fn context(&self) -> &Arc<AuthContext> {
        &self.context
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Number of token refresh calls this client has issued
    pub fn refresh_calls(&self) -> u64 {
        self.refresher.refresh_calls()
    }

    pub async fn refresh_state(&self) -> RefreshState {
        self.refresher.state().await
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Send one attempt of `spec`, with `token` as bearer if present
    async fn send(
        &self,
        spec: &RequestSpec,
        attempt: Attempt,
        token: Option<&str>,
    ) -> Result<reqwest::Response, ApiError> {
        debug!(method = %spec.method, path = %spec.path, ?attempt, authorized = token.is_some(), "Sending request");

        let mut request = self.client.request(spec.method.clone(), self.url(&spec.path));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        if !spec.query.is_empty() {
            request = request.query(&spec.query);
        }
        if let Some(ref body) = spec.body {
            request = request.json(body);
        }

        Ok(request.send().await?)
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }

    /// Run `spec` through bearer injection and the refresh-on-401 protocol.
    ///
    /// Only the first 401 of a request triggers a refresh, and only when a
    /// token was attached. The replay carries the token the refresh
    /// returned; a 401 on the replay is final.
    pub async fn dispatch(&self, spec: &RequestSpec) -> Result<reqwest::Response, ApiError> {
        let token = self.context.tokens().access_token();
        let response = self.send(spec, Attempt::First, token.as_deref()).await?;

        if response.status() != StatusCode::UNAUTHORIZED || !spec.refresh {
            return Self::check_response(response).await;
        }
        let Some(stale) = token else {
            return Self::check_response(response).await;
        };

        debug!(path = %spec.path, "Access token rejected, refreshing");
        let fresh = self
            .refresher
            .refreshed_token(&stale)
            .await
            .map_err(ApiError::SessionExpired)?;

        let response = self.send(spec, Attempt::Replay, Some(&fresh)).await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!(path = %spec.path, "Request rejected again after token refresh");
        }
        Self::check_response(response).await
    }

    pub async fn execute<T: DeserializeOwned>(&self, spec: RequestSpec) -> Result<T> {
        let response = self.dispatch(&spec).await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse JSON response from {}", spec.path))
    }

    /// Execute a request whose response body is not needed
    pub async fn execute_unit(&self, spec: RequestSpec) -> Result<()> {
        self.dispatch(&spec).await?;
        Ok(())
    }

    // ========================================================================
    // Account
    // ========================================================================

    pub async fn login(&self, email: &str, password: &str) -> Result<AuthResponse> {
        let spec = RequestSpec::post("/login/")
            .with_json(&json!({ "email": email, "password": password }))?
            .without_refresh();
        self.execute(spec).await
    }

    pub async fn register(&self, form: &RegisterForm) -> Result<AuthResponse> {
        let spec = RequestSpec::post("/register/")
            .with_json(form)?
            .without_refresh();
        self.execute(spec).await
    }

    /// Tell the server to revoke `refresh_token`. Never triggers a refresh.
    pub async fn logout(&self, refresh_token: &str) -> Result<()> {
        let spec = RequestSpec::post("/logout/")
            .with_json(&json!({ "refresh": refresh_token }))?
            .without_refresh();
        self.execute_unit(spec).await
    }

    pub async fn profile(&self) -> Result<UserProfile> {
        self.execute(RequestSpec::get("/profile/")).await
    }

    pub async fn update_profile(&self, update: &ProfileUpdate) -> Result<UserProfile> {
        self.execute(RequestSpec::put("/profile/update").with_json(update)?)
            .await
    }

    pub async fn change_password(&self, change: &PasswordChange) -> Result<()> {
        self.execute_unit(RequestSpec::post("/change-password").with_json(change)?)
            .await
    }

    // ========================================================================
    // Catalog
    // ========================================================================

    pub async fn list_products(&self, query: &ProductQuery) -> Result<Listing<Product>> {
        self.execute(RequestSpec::get("/products/").with_query(query)?)
            .await
    }

    pub async fn product(&self, id: i64) -> Result<Product> {
        self.execute(RequestSpec::get(format!("/products/{}/", id)))
            .await
    }

    pub async fn list_categories(&self) -> Result<Listing<Category>> {
        self.execute(RequestSpec::get("/categories/")).await
    }

    pub async fn category(&self, id: i64) -> Result<Category> {
        self.execute(RequestSpec::get(format!("/categories/{}/", id)))
            .await
    }

    // ========================================================================
    // Cart
    // ========================================================================

    pub async fn cart(&self) -> Result<Cart> {
        self.execute(RequestSpec::get("/cart/")).await
    }

    pub async fn add_to_cart(&self, product_id: i64, quantity: u32) -> Result<CartMutation> {
        let spec = RequestSpec::post("/cart/add/")
            .with_json(&json!({ "product_id": product_id, "quantity": quantity }))?;
        self.execute(spec).await
    }

    pub async fn update_cart_item(&self, item_id: i64, quantity: u32) -> Result<CartMutation> {
        let spec = RequestSpec::put(format!("/cart/update/{}/", item_id))
            .with_json(&json!({ "quantity": quantity }))?;
        self.execute(spec).await
    }

    pub async fn remove_cart_item(&self, item_id: i64) -> Result<CartMutation> {
        self.execute(RequestSpec::delete(format!("/cart/{}/", item_id)))
            .await
    }

    pub async fn clear_cart(&self) -> Result<()> {
        self.execute_unit(RequestSpec::delete("/cart/clear/")).await
    }

    // ========================================================================
    // Orders
    // ========================================================================

    pub async fn list_orders(&self) -> Result<Listing<Order>> {
        self.execute(RequestSpec::get("/orders/")).await
    }

    pub async fn order(&self, id: i64) -> Result<Order> {
        self.execute(RequestSpec::get(format!("/orders/{}/", id)))
            .await
    }

    pub async fn checkout(&self, request: &CheckoutRequest) -> Result<CheckoutResponse> {
        self.execute(RequestSpec::post("/checkout/").with_json(request)?)
            .await
    }

    pub async fn cancel_order(&self, id: i64) -> Result<()> {
        self.execute_unit(RequestSpec::put(format!("/orders/{}/cancel/", id)))
            .await
    }

    // ========================================================================
    // Addresses
    // ========================================================================

    pub async fn list_addresses(&self) -> Result<Listing<Address>> {
        self.execute(RequestSpec::get("/addresses/")).await
    }

    pub async fn address(&self, id: i64) -> Result<Address> {
        self.execute(RequestSpec::get(format!("/addresses/{}/", id)))
            .await
    }

    pub async fn create_address(&self, form: &AddressForm) -> Result<Address> {
        self.execute(RequestSpec::post("/addresses/").with_json(form)?)
            .await
    }

    pub async fn update_address(&self, id: i64, form: &AddressForm) -> Result<Address> {
        self.execute(RequestSpec::put(format!("/addresses/{}/", id)).with_json(form)?)
            .await
    }

    pub async fn delete_address(&self, id: i64) -> Result<()> {
        self.execute_unit(RequestSpec::delete(format!("/addresses/{}/", id)))
            .await
    }

    pub async fn set_default_address(&self, id: i64) -> Result<()> {
        self.execute_unit(RequestSpec::put(format!("/addresses/{}/set-default/", id)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{cart_json, client, context, user_json};
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_request_spec_query_skips_unset_fields() {
        let query = ProductQuery {
            category: Some(3),
            search: Some("silk kurta".into()),
            ..Default::default()
        };
        let spec = RequestSpec::get("/products/").with_query(&query).unwrap();
        assert_eq!(
            spec.query,
            vec![
                ("category".to_string(), "3".to_string()),
                ("search".to_string(), "silk kurta".to_string()),
            ]
        );
        assert!(spec.refresh);
        assert!(!spec.without_refresh().refresh);
    }

    #[tokio::test]
    async fn test_bearer_header_carries_stored_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/profile/"))
            .and(header("authorization", "Bearer A1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(user_json()))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(Some(("A1", "R1"))));
        let user = api.profile().await.unwrap();
        assert_eq!(user.email, "a@b.com");
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_no_authorization_header_without_token() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/categories/"))
            .and(|req: &wiremock::Request| !req.headers.contains_key("authorization"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "count": 1, "next": null, "previous": null,
                "results": [{"id": 1, "name": "Ethnic Wear", "slug": "ethnic-wear"}]
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(None));
        let categories = api.list_categories().await.unwrap();
        assert_eq!(categories.items()[0].name, "Ethnic Wear");
    }

    #[tokio::test]
    async fn test_product_query_is_sent() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/products/"))
            .and(query_param("category", "3"))
            .and(query_param("page", "2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(None));
        let query = ProductQuery {
            category: Some(3),
            page: Some(2),
            ..Default::default()
        };
        assert!(api.list_products(&query).await.unwrap().items().is_empty());
    }

    #[tokio::test]
    async fn test_anonymous_401_does_not_refresh() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/cart/"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let api = client(&server, context(None));
        let err = api.cart().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_login_401_reports_server_message_without_refresh() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/login/"))
            .and(body_json(serde_json::json!({"email": "a@b.com", "password": "nope"})))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(serde_json::json!({"error": "Invalid email or password"})),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/token/refresh/"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        // Stale tokens from an earlier session must not trigger a refresh
        let api = client(&server, context(Some(("OLD", "OLDR"))));
        let err = api.login("a@b.com", "nope").await.unwrap_err();
        assert_eq!(
            ApiError::server_message(&err, "Login failed"),
            "Invalid email or password"
        );
    }

    #[tokio::test]
    async fn test_validation_errors_are_surfaced_verbatim() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/cart/add/"))
            .and(body_json(serde_json::json!({"product_id": 4, "quantity": 9})))
            .respond_with(
                ResponseTemplate::new(400)
                    .set_body_json(serde_json::json!({"error": "Only 2 are available only."})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(Some(("A1", "R1"))));
        let err = api.add_to_cart(4, 9).await.unwrap_err();
        match err.downcast_ref::<ApiError>() {
            Some(ApiError::Validation(errors)) => {
                assert_eq!(errors.first_message().as_deref(), Some("Only 2 are available only."))
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_network_failure_is_not_retried() {
        // Nothing listens on port 9 of localhost in the test environment
        let api = ApiClient::with_timeout(
            "http://127.0.0.1:9/api",
            context(Some(("A1", "R1"))),
            Duration::from_secs(2),
        )
        .unwrap();
        let err = api.cart().await.unwrap_err();
        assert!(matches!(err.downcast_ref::<ApiError>(), Some(ApiError::NetworkError(_))));
        assert_eq!(api.refresh_calls(), 0);
    }

    #[tokio::test]
    async fn test_mutation_returns_updated_cart() {
        let server = MockServer::start().await;

        Mock::given(method("PUT"))
            .and(path("/api/cart/update/11/"))
            .and(body_json(serde_json::json!({"quantity": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "message": "Cart updated", "cart": cart_json(2)
            })))
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(Some(("A1", "R1"))));
        let mutation = api.update_cart_item(11, 2).await.unwrap();
        assert_eq!(mutation.message.as_deref(), Some("Cart updated"));
        assert_eq!(mutation.cart.total_items, 2);
        assert_eq!(mutation.cart.total_price, 1000.0);
    }

    #[tokio::test]
    async fn test_change_password_uses_backend_route() {
        let server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/api/change-password"))
            .and(header("authorization", "Bearer A1"))
            .and(body_json(serde_json::json!({
                "current_password": "old-pass", "new_password": "new-pass-1", "confirm_password": "new-pass-1"
            })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"message": "Password changed successfully"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = client(&server, context(Some(("A1", "R1"))));
        let change = PasswordChange {
            current_password: "old-pass".into(),
            new_password: "new-pass-1".into(),
            confirm_password: "new-pass-1".into(),
        };
        api.change_password(&change).await.unwrap();
    }
}
