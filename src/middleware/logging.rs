use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName};
use axum::middleware::Next;
use axum::response::Response;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

pub async fn request_logging_middleware(mut request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let headers = request.headers().clone();
    let request_id = Uuid::new_v4();

    let client_ip = extract_client_ip(&headers);

    request
        .headers_mut()
        .insert(HeaderName::from_static("x-request-id"), request_id.to_string().parse().unwrap());

    info!(request_id = %request_id, %method, %uri, client_ip = %client_ip, "request started");

    let response = next.run(request).await;
    let status = response.status();
    let duration_ms = start.elapsed().as_millis();

    if status.is_server_error() {
        error!(request_id = %request_id, %method, %uri, client_ip = %client_ip, %status, duration_ms, "request failed");
    } else if status.is_client_error() {
        warn!(request_id = %request_id, %method, %uri, client_ip = %client_ip, %status, duration_ms, "request rejected");
    } else {
        info!(request_id = %request_id, %method, %uri, client_ip = %client_ip, %status, duration_ms, "request completed");
    }

    response
}

fn extract_client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded_for) = headers.get("x-forwarded-for") {
        if let Ok(forwarded_str) = forwarded_for.to_str() {
            if let Some(first_ip) = forwarded_str.split(',').next() {
                return first_ip.trim().to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip") {
        if let Ok(ip_str) = real_ip.to_str() {
            return ip_str.to_string();
        }
    }

    if let Some(forwarded) = headers.get("forwarded") {
        if let Ok(forwarded_str) = forwarded.to_str() {
            for directive in forwarded_str.split(';') {
                if let Some(for_part) = directive.strip_prefix("for=") {
                    return for_part.trim_matches('"').to_string();
                }
            }
        }
    }

    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "192.168.1.1, 10.0.0.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), "192.168.1.1");
    }

    #[test]
    fn extract_client_ip_falls_back_to_real_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", "203.0.113.1".parse().unwrap());
        assert_eq!(extract_client_ip(&headers), "203.0.113.1");
    }

    #[test]
    fn extract_client_ip_defaults_to_unknown() {
        let headers = HeaderMap::new();
        assert_eq!(extract_client_ip(&headers), "unknown");
    }
}
