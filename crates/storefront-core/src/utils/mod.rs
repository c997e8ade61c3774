//! Display helpers shared by front ends.

pub mod format;

pub use format::{format_date, format_price, truncate_string};
