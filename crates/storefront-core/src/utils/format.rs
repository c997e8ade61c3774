use chrono::{DateTime, Utc};

/// Format a rupee amount with Indian digit grouping, e.g. `₹1,23,456.50`.
/// Whole amounts drop the paise.
pub fn format_price(amount: f64) -> String {
    let negative = amount < 0.0;
    let paise = (amount.abs() * 100.0).round() as u64;
    let rupees = group_indian(paise / 100);
    let fraction = paise % 100;

    let sign = if negative && paise > 0 { "-" } else { "" };
    if fraction == 0 {
        format!("{}₹{}", sign, rupees)
    } else {
        format!("{}₹{}.{:02}", sign, rupees, fraction)
    }
}

/// Last three digits, then groups of two: 1234567 -> 12,34,567
fn group_indian(value: u64) -> String {
    let digits = value.to_string();
    if digits.len() <= 3 {
        return digits;
    }
    let (head, tail) = digits.split_at(digits.len() - 3);
    let mut groups: Vec<&str> = Vec::new();
    let mut end = head.len();
    while end > 0 {
        let start = end.saturating_sub(2);
        groups.push(&head[start..end]);
        end = start;
    }
    groups.reverse();
    format!("{},{}", groups.join(","), tail)
}

/// Truncate a string to a maximum length, adding ellipsis if needed
pub fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        s.chars().take(max_len).collect()
    } else {
        let truncated: String = s.chars().take(max_len - 3).collect();
        format!("{}...", truncated)
    }
}

/// Format an optional timestamp as `May 01, 2024`
pub fn format_date(date: Option<&DateTime<Utc>>) -> String {
    match date {
        Some(dt) => dt.format("%b %d, %Y").to_string(),
        None => "-".to_string(),
    }
}
