use axum::http::HeaderMap;
use std::collections::HashMap;

#[cfg(test)]
mod tests;

/// Extract an API key from the HTTP Authorization header
///
/// Expected format: "Authorization: Bearer <key>"
/// Returns the key string if present and valid.
pub fn extract_bearer_token(headers: &HeaderMap) -> Result<String, TokenError> {
    let auth_header = headers
        .get("authorization")
        .ok_or(TokenError::Missing)?
        .to_str()
        .map_err(|_| TokenError::InvalidFormat)?;

    parse_bearer_token(auth_header)
}

/// Extract an API key from the `token` query parameter
///
/// Fallback for desktop clients that cannot set request headers.
pub fn extract_query_token(params: &HashMap<String, String>) -> Result<String, TokenError> {
    let token = params.get("token").ok_or(TokenError::Missing)?;

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.clone())
}

/// Extract an API key from a request, header first, query parameter second.
///
/// A present-but-malformed Authorization header is an error rather than a
/// reason to fall back; silent fallback would hide the client's mistake.
pub fn extract_api_key(
    headers: &HeaderMap,
    params: &HashMap<String, String>,
) -> Result<String, TokenError> {
    match extract_bearer_token(headers) {
        Ok(key) => Ok(key),
        Err(TokenError::Missing) => extract_query_token(params),
        Err(e) => Err(e),
    }
}

/// Parse bearer token from Authorization header value
///
/// Internal helper for extract_bearer_token
fn parse_bearer_token(header_value: &str) -> Result<String, TokenError> {
    // Expect "Bearer <key>"
    let parts: Vec<&str> = header_value.splitn(2, ' ').collect();

    if parts.len() != 2 {
        return Err(TokenError::InvalidFormat);
    }

    if parts[0].to_lowercase() != "bearer" {
        return Err(TokenError::InvalidFormat);
    }

    let token = parts[1].trim();

    if token.is_empty() {
        return Err(TokenError::Empty);
    }

    Ok(token.to_string())
}

/// API key extraction errors
#[derive(Debug, PartialEq, Clone)]
pub enum TokenError {
    /// Authorization header or token parameter not present
    Missing,
    /// Invalid format (not "Bearer <key>")
    InvalidFormat,
    /// Key is empty string
    Empty,
}

impl std::fmt::Display for TokenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TokenError::Missing => write!(f, "API key not provided"),
            TokenError::InvalidFormat => write!(f, "Invalid API key format"),
            TokenError::Empty => write!(f, "API key is empty"),
        }
    }
}

impl std::error::Error for TokenError {}
