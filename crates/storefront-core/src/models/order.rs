use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{money, Address};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderStatus {
    Pending,
    Processing,
    Shipped,
    Delivered,
    Cancelled,
    #[serde(other)]
    Other,
}

impl OrderStatus {
    /// Orders can be cancelled until they leave the warehouse
    pub fn is_cancellable(&self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Processing)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "Pending"),
            OrderStatus::Processing => write!(f, "Processing"),
            OrderStatus::Shipped => write!(f, "Shipped"),
            OrderStatus::Delivered => write!(f, "Delivered"),
            OrderStatus::Cancelled => write!(f, "Cancelled"),
            OrderStatus::Other => write!(f, "Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Paid,
    Refunded,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItem {
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub product: Option<i64>,
    #[serde(default)]
    pub product_name: String,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub unit_price: f64,
    pub quantity: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: i64,
    #[serde(default)]
    pub order_number: String,
    pub status: OrderStatus,
    #[serde(default = "default_payment_status")]
    pub payment_status: PaymentStatus,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub subtotal: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub tax: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub total: f64,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub shipped_address: Option<Address>,
    #[serde(default)]
    pub items: Vec<OrderItem>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

fn default_payment_status() -> PaymentStatus {
    PaymentStatus::Unpaid
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutRequest {
    pub address_id: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub notes: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutResponse {
    #[serde(default)]
    pub message: Option<String>,
    pub order: Order,
}
