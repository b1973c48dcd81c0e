/// Coerces a user-supplied URL to the scheme the HTTP transport speaks.
/// The `libsql://` scheme is an alias for `https://`.
pub(crate) fn coerce_http_scheme(url: &str) -> String {
    let mut url = url
        .replace("libsql://", "https://")
        .replace("wss://", "https://")
        .replace("ws://", "http://");

    if !url.contains("://") {
        url = format!("https://{}", url)
    }

    url.trim_end_matches('/').to_string()
}

/// Coerces a user-supplied URL to the scheme the WebSocket transport
/// speaks.
pub(crate) fn coerce_ws_scheme(url: &str) -> String {
    let mut url = url
        .replace("libsql://", "wss://")
        .replace("https://", "wss://")
        .replace("http://", "ws://");

    if !url.contains("://") {
        url = format!("wss://{}", url)
    }

    url.trim_end_matches('/').to_string()
}
