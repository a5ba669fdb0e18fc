use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use tracing::warn;

pub async fn security_headers_middleware(request: Request, next: Next) -> Result<Response, StatusCode> {
    validate_request_security(&request)?;
    let mut response = next.run(request).await;
    add_security_headers(&mut response);
    Ok(response)
}

fn validate_request_security(request: &Request) -> Result<(), StatusCode> {
    let uri = request.uri();
    let path = uri.path();
    let query = uri.query().unwrap_or("");

    if contains_dangerous_patterns(path) || contains_dangerous_patterns(query) {
        warn!(path, query, "rejected request containing a path-traversal pattern");
        return Err(StatusCode::BAD_REQUEST);
    }

    for (name, value) in request.headers().iter() {
        if value.len() > 8192 {
            warn!(header = %name, size = value.len(), "rejected oversized request header");
            return Err(StatusCode::BAD_REQUEST);
        }
    }

    Ok(())
}

fn contains_dangerous_patterns(input: &str) -> bool {
    let patterns = [
        "../", "..\\", "..%2f", "..%5c",
        "%2e%2e%2f", "%2e%2e%5c",
        "etc/passwd", "windows/system32",
        "/proc/", "/sys/",
        "\\x00", "%00",
    ];
    let lower = input.to_lowercase();
    patterns.iter().any(|p| lower.contains(p))
}

fn add_security_headers(response: &mut Response) {
    let headers = response.headers_mut();
    headers.insert(HeaderName::from_static("x-content-type-options"), HeaderValue::from_static("nosniff"));
    headers.insert(HeaderName::from_static("x-frame-options"), HeaderValue::from_static("DENY"));
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_dotdot_traversal() {
        assert!(contains_dangerous_patterns("/download/../../etc/passwd"));
    }

    #[test]
    fn detects_encoded_traversal() {
        assert!(contains_dangerous_patterns("%2e%2e%2fsecrets"));
    }

    #[test]
    fn normal_job_id_path_is_not_flagged() {
        assert!(!contains_dangerous_patterns("/api/jobs/3e1f6c2a-9b3e-4c8a-9a1d-1c2b3a4d5e6f"));
    }
}
