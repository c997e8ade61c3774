use std::sync::{Arc, RwLock};

use anyhow::Result;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::api::{ApiClient, ApiError};
use crate::auth::{NoticeLevel, SessionEvent};
use crate::models::{Cart, CartItem, CartMutation, CheckoutRequest, Order};

/// Client-side copy of the server cart.
///
/// Every mutation replaces the copy with the cart the server returns; the
/// client never computes totals itself.
pub struct CartStore {
    api: ApiClient,
    cart: RwLock<Option<Cart>>,
}

impl CartStore {
    pub fn new(api: ApiClient) -> Arc<Self> {
        Arc::new(Self {
            api,
            cart: RwLock::new(None),
        })
    }

    /// Snapshot of the cached cart, if one was loaded
    pub fn cart(&self) -> Option<Cart> {
        self.cart
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn replace(&self, cart: Option<Cart>) {
        *self
            .cart
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cart;
    }

    fn notify(&self, level: NoticeLevel, message: impl Into<String>) {
        self.api.context().notify(level, message);
    }

    /// Load the cart. Failures are logged and the cached copy is kept.
    pub async fn fetch(&self) {
        match self.api.cart().await {
            Ok(cart) => self.replace(Some(cart)),
            Err(e) => error!(error = %e, "Failed to fetch cart"),
        }
    }

    fn apply_mutation(
        &self,
        result: Result<CartMutation>,
        success: &str,
        failure: &str,
    ) -> Result<()> {
        match result {
            Ok(mutation) => {
                self.replace(Some(mutation.cart));
                let message = mutation.message.unwrap_or_else(|| success.to_string());
                self.notify(NoticeLevel::Success, message);
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "{}", failure);
                self.notify(NoticeLevel::Error, ApiError::server_message(&e, failure));
                Err(e)
            }
        }
    }

    pub async fn add(&self, product_id: i64, quantity: u32) -> Result<()> {
        let result = self.api.add_to_cart(product_id, quantity).await;
        self.apply_mutation(result, "Added to cart", "Failed to add item to cart")
    }

    pub async fn update(&self, item_id: i64, quantity: u32) -> Result<()> {
        let result = self.api.update_cart_item(item_id, quantity).await;
        self.apply_mutation(result, "Cart updated", "Failed to update cart")
    }

    pub async fn remove(&self, item_id: i64) -> Result<()> {
        let result = self.api.remove_cart_item(item_id).await;
        self.apply_mutation(result, "Item removed from cart", "Failed to remove item from cart")
    }

    pub async fn clear(&self) -> Result<()> {
        match self.api.clear_cart().await {
            Ok(()) => {
                self.replace(Some(Cart::empty()));
                self.notify(NoticeLevel::Success, "Cart cleared");
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "Failed to clear cart");
                self.notify(
                    NoticeLevel::Error,
                    ApiError::server_message(&e, "Failed to clear cart"),
                );
                Err(e)
            }
        }
    }

    /// Place an order for the current cart, then reload the (now empty) cart
    pub async fn checkout(&self, request: &CheckoutRequest) -> Result<Order> {
        match self.api.checkout(request).await {
            Ok(response) => {
                self.notify(NoticeLevel::Success, "Order placed successfully!");
                self.fetch().await;
                Ok(response.order)
            }
            Err(e) => {
                warn!(error = %e, "Checkout failed");
                self.notify(
                    NoticeLevel::Error,
                    ApiError::server_message(&e, "Failed to place order"),
                );
                Err(e)
            }
        }
    }

    /// Drop the cached cart
    pub fn reset(&self) {
        debug!("Cart cache reset");
        self.replace(None);
    }

    /// React to session changes: the cart belongs to the signed-in user
    pub fn apply_event(&self, event: &SessionEvent) {
        if let SessionEvent::SignedOut(_) = event {
            self.reset();
        }
    }

    /// Keep the cart in step with the session. The task runs until aborted.
    pub fn watch_session(self: &Arc<Self>) -> JoinHandle<()> {
        let store = Arc::clone(self);
        let mut events = self.api.context().subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => store.apply_event(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        // A sign-out may have been among the skipped events
                        warn!(skipped, "Session events lagged, resetting cart");
                        store.reset();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    // ===== Derived state =====

    pub fn total_items(&self) -> u32 {
        self.cart().map(|c| c.total_items).unwrap_or(0)
    }

    pub fn total_price(&self) -> f64 {
        self.cart().map(|c| c.total_price).unwrap_or(0.0)
    }

    pub fn subtotal(&self) -> f64 {
        self.cart().map(|c| c.subtotal).unwrap_or(0.0)
    }

    pub fn items(&self) -> Vec<CartItem> {
        self.cart().map(|c| c.items).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.total_items() == 0
    }
}
