//! Request normalization into the engine's execution context

use super::InstanceConfig;
use crate::error::ConfigurationError;
use sapi_api::{ExecutionContext, Request};
use std::collections::BTreeMap;

/// How a request asks to run code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestMode<'a> {
    /// Inline source, persisted to the eval path before the call
    Code(&'a str),
    /// A script already present in the virtual filesystem
    Script(&'a str),
}

impl<'a> RequestMode<'a> {
    pub(crate) fn from_request(request: &'a Request) -> Result<Self, ConfigurationError> {
        match (&request.code, &request.script_path) {
            (Some(_), Some(_)) => Err(ConfigurationError::ConflictingModes),
            (Some(code), None) => Ok(Self::Code(code)),
            (None, Some(path)) => Ok(Self::Script(path)),
            (None, None) => Err(ConfigurationError::NoExecutionMode),
        }
    }
}

/// Port the engine should believe it is serving on
///
/// An explicit port in the `Host` header wins unless it is 80; otherwise
/// the scheme decides.
pub(crate) fn infer_port(host: Option<&str>, protocol: &str) -> u16 {
    match host.and_then(host_port) {
        Some(port) if port != 80 => port,
        _ if protocol.eq_ignore_ascii_case("https") => 443,
        _ => 80,
    }
}

fn host_port(host: &str) -> Option<u16> {
    let port = match host.strip_prefix('[') {
        // [::1]:8080
        Some(rest) => rest.split_once("]:")?.1,
        None => host.rsplit_once(':')?.1,
    };
    port.parse::<u16>().ok().filter(|port| *port > 0)
}

fn host_name(host: &str) -> &str {
    if host.starts_with('[') {
        return host.split_once(']').map_or(host, |(name, _)| &name[1..]);
    }
    host.split_once(':').map_or(host, |(name, _)| name)
}

pub(crate) fn build_context(
    request: &Request,
    config: &InstanceConfig,
    script_path: &str,
) -> ExecutionContext {
    let request_uri = if request.relative_uri.starts_with('/') {
        request.relative_uri.clone()
    } else {
        format!("/{}", request.relative_uri)
    };
    let (path, query_string) = match request_uri.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (request_uri.clone(), None),
    };

    let protocol = request
        .protocol
        .as_deref()
        .unwrap_or("http")
        .to_ascii_lowercase();
    let method = request.method.to_ascii_uppercase();

    let headers: BTreeMap<String, String> = request
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect();

    let host = headers.get("host").map(String::as_str);
    let port = infer_port(host, &protocol);
    let cookie = headers.get("cookie").cloned();
    let content_type = headers.get("content-type").cloned();
    let content_length = headers
        .get("content-length")
        .and_then(|len| len.trim().parse().ok())
        .or_else(|| request.body.as_ref().map(|body| body.payload_len()));

    let mut server = BTreeMap::new();
    let mut set = |key: &str, value: String| {
        server.insert(key.to_string(), value);
    };
    set("REMOTE_ADDR", "127.0.0.1".to_string());
    set("DOCUMENT_ROOT", config.document_root.clone());
    let https = if port == 443 { "on" } else { "" };
    set("HTTPS", https.to_string());
    set(
        "SERVER_NAME",
        host.map(host_name)
            .filter(|name| !name.is_empty())
            .unwrap_or(config.server_name.as_str())
            .to_string(),
    );
    set("SERVER_PORT", port.to_string());
    set("SERVER_PROTOCOL", "HTTP/1.1".to_string());
    set("REQUEST_METHOD", method.clone());
    set("REQUEST_URI", request_uri.clone());
    set("QUERY_STRING", query_string.clone().unwrap_or_default());
    set("SCRIPT_NAME", path);
    set("SCRIPT_FILENAME", script_path.to_string());
    for (name, value) in &headers {
        let key = match name.as_str() {
            "content-type" => "CONTENT_TYPE".to_string(),
            "content-length" => "CONTENT_LENGTH".to_string(),
            other => format!("HTTP_{}", other.to_ascii_uppercase().replace('-', "_")),
        };
        set(&key, value.clone());
    }
    if let Some(len) = content_length {
        server
            .entry("CONTENT_LENGTH".to_string())
            .or_insert_with(|| len.to_string());
    }
    // Caller overrides win over everything synthesized above
    for (key, value) in &request.server {
        server.insert(key.clone(), value.clone());
    }

    ExecutionContext {
        method,
        request_uri,
        query_string,
        protocol,
        port,
        headers,
        cookie,
        content_type,
        content_length,
        server,
        env: request.env.clone(),
        script_path: script_path.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(request: &Request) -> ExecutionContext {
        build_context(request, &InstanceConfig::default(), "/index.code")
    }

    #[test]
    fn test_mode_is_exclusive() {
        let both = Request::with_code("1").script_path("/a");
        assert_eq!(
            RequestMode::from_request(&both),
            Err(ConfigurationError::ConflictingModes)
        );
        assert_eq!(
            RequestMode::from_request(&Request::default()),
            Err(ConfigurationError::NoExecutionMode)
        );
        let code = Request::with_code("1");
        assert_eq!(RequestMode::from_request(&code), Ok(RequestMode::Code("1")));
    }

    #[test]
    fn test_infer_port() {
        assert_eq!(infer_port(Some("example.com:8080"), "http"), 8080);
        assert_eq!(infer_port(Some("example.com:80"), "https"), 443);
        assert_eq!(infer_port(Some("example.com"), "https"), 443);
        assert_eq!(infer_port(Some("example.com"), "http"), 80);
        assert_eq!(infer_port(Some("example.com:0"), "http"), 80);
        assert_eq!(infer_port(Some("example.com:notaport"), "http"), 80);
        assert_eq!(infer_port(Some("[::1]:8443"), "http"), 8443);
        assert_eq!(infer_port(None, "http"), 80);
    }

    #[test]
    fn test_uri_and_query_split() {
        let req = Request::with_code("").uri("/search?q=rust&page=2");
        let ctx = context(&req);
        assert_eq!(ctx.request_uri, "/search?q=rust&page=2");
        assert_eq!(ctx.query_string.as_deref(), Some("q=rust&page=2"));
        assert_eq!(ctx.server["QUERY_STRING"], "q=rust&page=2");
        assert_eq!(ctx.server["SCRIPT_NAME"], "/search");

        let ctx = context(&Request::with_code("").uri("plain"));
        assert_eq!(ctx.request_uri, "/plain");
        assert!(ctx.query_string.is_none());
    }

    #[test]
    fn test_headers_are_lower_cased_and_special_cased() {
        let req = Request::with_code("")
            .method("post")
            .header("Host", "example.com:8080")
            .header("Cookie", "a=1")
            .header("Content-Type", "application/json")
            .header("X-Trace-Id", "abc")
            .body(b"{}".to_vec());
        let ctx = context(&req);

        assert_eq!(ctx.method, "POST");
        assert_eq!(ctx.headers["x-trace-id"], "abc");
        assert_eq!(ctx.cookie.as_deref(), Some("a=1"));
        assert_eq!(ctx.content_type.as_deref(), Some("application/json"));
        assert_eq!(ctx.content_length, Some(2));
        assert_eq!(ctx.port, 8080);
        assert_eq!(ctx.server["HTTP_X_TRACE_ID"], "abc");
        assert_eq!(ctx.server["CONTENT_TYPE"], "application/json");
        assert_eq!(ctx.server["CONTENT_LENGTH"], "2");
        assert_eq!(ctx.server["SERVER_NAME"], "example.com");
        assert_eq!(ctx.server["HTTPS"], "");
    }

    #[test]
    fn test_https_flag_follows_port() {
        let req = Request::with_code("").protocol("https");
        let ctx = context(&req);
        assert_eq!(ctx.port, 443);
        assert_eq!(ctx.server["HTTPS"], "on");
        assert_eq!(ctx.server["SERVER_NAME"], "localhost");
    }

    #[test]
    fn test_server_overrides_win() {
        let req = Request::with_code("")
            .server_var("REMOTE_ADDR", "10.0.0.1")
            .server_var("CUSTOM", "yes")
            .env("APP_ENV", "test");
        let ctx = context(&req);
        assert_eq!(ctx.server["REMOTE_ADDR"], "10.0.0.1");
        assert_eq!(ctx.server["CUSTOM"], "yes");
        assert_eq!(ctx.env["APP_ENV"], "test");
        assert_eq!(ctx.script_path, "/index.code");
    }
}
