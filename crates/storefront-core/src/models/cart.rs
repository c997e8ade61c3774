use serde::{Deserialize, Serialize};

use super::money;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub id: i64,
    pub product: i64,
    #[serde(default)]
    pub product_name: String,
    #[serde(default)]
    pub product_image: Option<String>,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub unit_price: f64,
    pub quantity: u32,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub item_total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Cart {
    #[serde(default)]
    pub items: Vec<CartItem>,
    #[serde(default)]
    pub total_items: u32,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub total_price: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub subtotal: f64,
}

impl Cart {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Response to add/update/remove: the full cart plus a human message
#[derive(Debug, Clone, Deserialize)]
pub struct CartMutation {
    #[serde(default)]
    pub message: Option<String>,
    pub cart: Cart,
}
