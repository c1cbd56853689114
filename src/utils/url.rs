//! URL helpers for building inference server endpoints
//!
//! Server URLs are user-editable settings, so they arrive with or without
//! trailing slashes. Every endpoint is built through [`construct_api_url`]
//! so `http://localhost:11434/` and `http://localhost:11434` behave the same.

/// Normalize a base URL by removing trailing slashes and surrounding whitespace.
///
/// # Examples
///
/// ```
/// use splat::utils::url::normalize_base_url;
///
/// assert_eq!(normalize_base_url("http://localhost:11434"), "http://localhost:11434");
/// assert_eq!(normalize_base_url("http://localhost:11434/"), "http://localhost:11434");
/// assert_eq!(normalize_base_url(" http://localhost:11434// "), "http://localhost:11434");
/// ```
pub fn normalize_base_url(base_url: &str) -> String {
    base_url.trim().trim_end_matches('/').to_string()
}

/// Join a server base URL and an endpoint path such as `api/chat`.
///
/// # Examples
///
/// ```
/// use splat::utils::url::construct_api_url;
///
/// assert_eq!(
///     construct_api_url("http://localhost:11434", "api/chat"),
///     "http://localhost:11434/api/chat"
/// );
/// assert_eq!(
///     construct_api_url("http://localhost:11434/", "/api/tags"),
///     "http://localhost:11434/api/tags"
/// );
/// ```
pub fn construct_api_url(base_url: &str, endpoint: &str) -> String {
    let normalized_base = normalize_base_url(base_url);
    let endpoint = endpoint.trim_start_matches('/');
    format!("{normalized_base}/{endpoint}")
}
