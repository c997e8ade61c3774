use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Unauthorized - credentials missing or rejected")]
    Unauthorized(FieldErrors),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    #[error("Session expired: {0}")]
    SessionExpired(RefreshFailure),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Why a token refresh could not mint a new access token.
///
/// Clone so that one failed refresh can be handed to every request that
/// was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshFailure {
    #[error("no refresh token stored")]
    MissingRefreshToken,

    #[error("refresh rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("refresh request failed: {0}")]
    Network(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    pub(crate) fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            400 | 422 => ApiError::Validation(FieldErrors::parse(body)),
            401 => ApiError::Unauthorized(FieldErrors::parse(body)),
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            500..=599 => ApiError::ServerError(truncated),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    pub fn is_unauthorized(&self) -> bool {
        matches!(self, ApiError::Unauthorized(_) | ApiError::SessionExpired(_))
    }

    /// Short, user-facing description of the failure
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Validation(errors) => errors
                .first_message()
                .unwrap_or_else(|| "The request was rejected".to_string()),
            ApiError::SessionExpired(_) => "Session expired. Please login again".to_string(),
            ApiError::Unauthorized(_) => "Please log in to continue".to_string(),
            ApiError::AccessDenied(_) => "You do not have access to this resource".to_string(),
            ApiError::NotFound(_) => "Not found".to_string(),
            ApiError::RateLimited => "Server is busy. Please wait a moment and try again.".to_string(),
            ApiError::ServerError(_) => "Server error. Please try again later.".to_string(),
            ApiError::NetworkError(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::NetworkError(_) => "Network error. Check your connection.".to_string(),
            ApiError::InvalidResponse(_) => "Unexpected response from server".to_string(),
        }
    }

    /// Server-reported message for an `anyhow` error, if it carries one.
    ///
    /// Falls back to `default` for errors that did not come from the server.
    pub fn server_message(err: &anyhow::Error, default: &str) -> String {
        match err.downcast_ref::<ApiError>() {
            Some(ApiError::Validation(errors)) | Some(ApiError::Unauthorized(errors)) => errors
                .first_message()
                .unwrap_or_else(|| default.to_string()),
            Some(ApiError::SessionExpired(_)) => {
                "Session expired. Please login again".to_string()
            }
            _ => default.to_string(),
        }
    }
}

/// Server-reported validation errors, kept verbatim.
///
/// The backend reports failures in several shapes:
/// `{"error": "message"}`, `{"error": {"field": ["message"]}}`,
/// `{"detail": "message"}` and bare `{"field": ["message", ...]}` maps.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldErrors {
    /// `(field, message)` pairs in the order the server sent them; `field`
    /// is `None` for non-field errors
    pub entries: Vec<(Option<String>, String)>,
    /// The raw body, for bodies that were not JSON
    pub raw: Option<String>,
}

impl FieldErrors {
    pub fn parse(body: &str) -> Self {
        let value: Value = match serde_json::from_str(body) {
            Ok(v) => v,
            Err(_) => {
                let trimmed = body.trim();
                return Self {
                    entries: Vec::new(),
                    raw: (!trimmed.is_empty()).then(|| ApiError::truncate_body(trimmed)),
                };
            }
        };

        let mut entries = Vec::new();
        match value {
            Value::Object(map) => {
                for (key, val) in map {
                    let field = match key.as_str() {
                        "error" | "detail" | "non_field_errors" | "message" => None,
                        _ => Some(key),
                    };
                    match val {
                        // {"error": {"email": ["taken"]}} nests the field map
                        Value::Object(inner) if field.is_none() => {
                            for (inner_key, inner_val) in inner {
                                let inner_field = (inner_key != "non_field_errors").then_some(inner_key);
                                collect_messages(inner_field, inner_val, &mut entries);
                            }
                        }
                        other => collect_messages(field, other, &mut entries),
                    }
                }
            }
            other => collect_messages(None, other, &mut entries),
        }

        Self { entries, raw: None }
    }

    /// First message, flattened across fields
    pub fn first_message(&self) -> Option<String> {
        self.entries
            .first()
            .map(|(_, message)| message.clone())
            .or_else(|| self.raw.clone())
    }

    /// Messages reported for one field
    pub fn for_field(&self, field: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(f, _)| f.as_deref() == Some(field))
            .map(|(_, m)| m.as_str())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.raw.is_none()
    }
}

fn collect_messages(field: Option<String>, value: Value, out: &mut Vec<(Option<String>, String)>) {
    match value {
        Value::String(s) => out.push((field, s)),
        Value::Array(items) => {
            for item in items {
                collect_messages(field.clone(), item, out);
            }
        }
        Value::Null => {}
        other => out.push((field, other.to_string())),
    }
}

impl std::fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(ref raw) = self.raw {
            return write!(f, "{}", raw);
        }
        let parts: Vec<String> = self
            .entries
            .iter()
            .map(|(field, message)| match field {
                Some(field) => format!("{}: {}", field, message),
                None => message.clone(),
            })
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}
