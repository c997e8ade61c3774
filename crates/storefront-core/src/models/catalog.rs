use serde::{Deserialize, Serialize};

use super::money;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(deserialize_with = "money::deserialize")]
    pub price: f64,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub discount: f64,
    #[serde(default, deserialize_with = "money::deserialize_opt")]
    pub discounted_price: Option<f64>,
    #[serde(default, deserialize_with = "money::deserialize")]
    pub stock: f64,
    #[serde(default)]
    pub is_in_stock: Option<bool>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl Product {
    /// Price the customer pays. Uses the server's discounted price when
    /// present, otherwise applies `discount` as a percentage.
    pub fn effective_price(&self) -> f64 {
        if let Some(price) = self.discounted_price {
            return price;
        }
        if self.discount > 0.0 {
            self.price * (100.0 - self.discount.min(100.0)) / 100.0
        } else {
            self.price
        }
    }

    pub fn in_stock(&self) -> bool {
        self.is_in_stock.unwrap_or(self.stock > 0.0)
    }
}

/// Filters for the product listing. Unset fields are not sent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProductQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ordering: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_price: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
}
