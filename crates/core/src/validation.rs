use serde::Deserialize;
use validator::Validate;

pub const MAX_SERVER_NAME_LEN: usize = 64;
pub const DEFAULT_LOG_LINES: usize = 50;
pub const MAX_LOG_LINES: usize = 200;

/// Server ids: an ASCII letter followed by letters, digits or underscores.
/// Ids become directory names, so anything else is refused before touching disk.
#[must_use]
pub fn is_valid_server_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_SERVER_NAME_LEN
        && first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn validate_server_name(name: &str) -> Result<(), validator::ValidationError> {
    if is_valid_server_name(name) {
        Ok(())
    } else {
        let mut err = validator::ValidationError::new("invalid_server_name");
        err.message = Some(
            "Name must start with a letter and contain only letters, digits and underscores (max 64)"
                .into(),
        );
        Err(err)
    }
}

fn validate_code(code: &str) -> Result<(), validator::ValidationError> {
    if code.trim().is_empty() {
        let mut err = validator::ValidationError::new("empty_code");
        err.message = Some("Code cannot be empty".into());
        Err(err)
    } else {
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_log_lines() -> usize {
    DEFAULT_LOG_LINES
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateServerRequest {
    #[validate(custom(function = validate_server_name))]
    pub name: String,

    #[validate(custom(function = validate_code))]
    pub code: String,

    #[serde(default)]
    #[validate(length(max = 1000, message = "Description must be at most 1000 characters"))]
    pub description: String,

    #[serde(default = "default_true")]
    pub auto_start: bool,

    #[serde(default)]
    pub allow_network: bool,
}

#[derive(Debug, Deserialize, Validate)]
pub struct EditServerRequest {
    #[validate(custom(function = validate_server_name))]
    pub name: String,

    #[validate(custom(function = validate_code))]
    pub code: String,
}

/// Requests that only name a server (delete, start, stop).
#[derive(Debug, Deserialize, Validate)]
pub struct ServerNameRequest {
    #[validate(custom(function = validate_server_name))]
    pub name: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ServerLogsRequest {
    #[validate(custom(function = validate_server_name))]
    pub name: String,

    #[serde(default = "default_log_lines")]
    #[validate(range(min = 1, message = "Lines must be at least 1"))]
    pub lines: usize,
}

impl ServerLogsRequest {
    /// Requested line count, clamped to the maximum tail size.
    #[must_use]
    pub fn clamped_lines(&self) -> usize {
        self.lines.min(MAX_LOG_LINES)
    }
}

/// Validation helper function
pub fn validate_request<T: Validate>(req: &T) -> Result<(), String> {
    req.validate()
        .map_err(|e| format!("Validation error: {}", e))
}
