//! Shared fixtures for the HTTP-level tests.

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::sync::broadcast;
use wiremock::MockServer;

use crate::api::ApiClient;
use crate::auth::{AuthContext, Credentials, MemoryTokenStore, SessionEvent};

pub fn context(tokens: Option<(&str, &str)>) -> Arc<AuthContext> {
    let store = match tokens {
        Some((access, refresh)) => MemoryTokenStore::with_credentials(Credentials::new(access, refresh)),
        None => MemoryTokenStore::new(),
    };
    AuthContext::new(Arc::new(store))
}

pub fn client(server: &MockServer, context: Arc<AuthContext>) -> ApiClient {
    ApiClient::new(&format!("{}/api", server.uri()), context).unwrap()
}

pub fn user_json() -> Value {
    json!({"id": 3, "email": "a@b.com", "first_name": "Asha", "last_name": "Patel"})
}

pub fn cart_json(total_items: u32) -> Value {
    let items: Vec<Value> = (0..total_items.min(1))
        .map(|_| {
            json!({"id": 11, "product": 4, "product_name": "Kurta", "unit_price": "500.00",
                   "quantity": total_items, "item_total": format!("{}.00", 500 * total_items)})
        })
        .collect();
    json!({
        "items": items,
        "total_items": total_items,
        "total_price": format!("{}.00", 500 * total_items),
        "subtotal": format!("{}.00", 500 * total_items),
    })
}

/// Everything currently queued on an event receiver
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
