//! Client-local caches.
//!
//! - `CartStore`: in-memory copy of the signed-in user's cart, reset on sign-out
//! - `CacheManager`: JSON snapshots of the public catalog for offline
//!   browsing, considered stale after 60 minutes

pub mod cart;
pub mod manager;

pub use cart::CartStore;
pub use manager::{CacheManager, CachedData};
