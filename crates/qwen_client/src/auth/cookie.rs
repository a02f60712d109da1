//! Cookie-borne session tokens used by the web chat API.

pub const TOKEN_COOKIE: &str = "token";

/// Pull the `token` value out of a `Cookie` header (or a browser cookie
/// dump). Returns `None` when the cookie is absent or empty.
pub fn extract_token(cookies: &str) -> Option<String> {
    cookies
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| name.trim() == TOKEN_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// `token=<jwt>` followed by `; name=value` for each extra cookie.
pub fn build_cookie_string(token: &str, extras: &[(String, String)]) -> String {
    let mut cookie = format!("{TOKEN_COOKIE}={token}");
    for (name, value) in extras {
        cookie.push_str("; ");
        cookie.push_str(name);
        cookie.push('=');
        cookie.push_str(value);
    }
    cookie
}
