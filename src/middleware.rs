//! CORS checks for the daemon: browsers on the loopback host are welcome on
//! any scheme and port; anything else must be listed in `OLLAMA_ORIGINS`.

use axum::{
    extract::Request,
    http::{
        header::{ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ORIGIN},
        HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::Response,
};

pub async fn cors_middleware(req: Request, next: Next) -> Result<Response, StatusCode> {
    let origin = req
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let Some(origin) = origin else {
        // Non-browser clients send no Origin header.
        return Ok(next.run(req).await);
    };

    if !origin_allowed(&origin, &crate::envconfig::allowed_origins()) {
        return Err(StatusCode::FORBIDDEN);
    }

    let header = HeaderValue::from_str(&origin).map_err(|_| StatusCode::FORBIDDEN)?;
    if req.method() == Method::OPTIONS {
        let mut resp = Response::new(axum::body::Body::empty());
        *resp.status_mut() = StatusCode::NO_CONTENT;
        resp.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, header);
        resp.headers_mut().insert(
            ACCESS_CONTROL_ALLOW_METHODS,
            HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
        );
        resp.headers_mut().insert(
            ACCESS_CONTROL_ALLOW_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        return Ok(resp);
    }

    let mut resp = next.run(req).await;
    resp.headers_mut().insert(ACCESS_CONTROL_ALLOW_ORIGIN, header);
    Ok(resp)
}

fn origin_allowed(origin: &str, extra: &[String]) -> bool {
    if let Some(host) = origin_host(origin) {
        if host == "localhost" || host == "127.0.0.1" || host == "[::1]" {
            return true;
        }
    }
    extra.iter().any(|allowed| allowed == origin || allowed == "*")
}

/// The host part of an origin like `http://localhost:8080`, without the port.
fn origin_host(origin: &str) -> Option<&str> {
    let rest = origin.split_once("://").map(|(_, r)| r).unwrap_or(origin);
    let rest = rest.split('/').next().unwrap_or(rest);
    if rest.starts_with('[') {
        // Bracketed IPv6 literal, possibly with a port.
        return rest.find(']').map(|end| &rest[..=end]);
    }
    Some(rest.split(':').next().unwrap_or(rest))
}
