//! Data models for storefront resources.
//!
//! This module contains the wire types exchanged with the backend:
//!
//! - `UserProfile`, `RegisterForm`, `ProfileUpdate`: account data
//! - `Product`, `Category`, `ProductQuery`: catalog browsing
//! - `Cart`, `CartItem`: the server-side cart
//! - `Order`, `OrderItem`, `OrderStatus`: order history and checkout
//! - `Address`, `AddressForm`: shipping addresses
//! - `Listing`: list endpoints, paginated or not

pub mod address;
pub mod cart;
pub mod catalog;
pub mod listing;
pub mod money;
pub mod order;
pub mod user;

pub use address::{Address, AddressForm};
pub use cart::{Cart, CartItem, CartMutation};
pub use catalog::{Category, Product, ProductQuery};
pub use listing::{Listing, Page};
pub use order::{CheckoutRequest, CheckoutResponse, Order, OrderItem, OrderStatus, PaymentStatus};
pub use user::{AuthResponse, PasswordChange, ProfileUpdate, RegisterForm, TokenPair, UserProfile};
