use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};

/// Camera state changes from one request to the next; keep API responses
/// out of browser and proxy caches.
pub(crate) async fn no_cache_middleware(request: Request, next: Next) -> Response {
    let is_api = request.uri().path().starts_with("/api/");
    let mut response = next.run(request).await;

    if is_api {
        let headers = response.headers_mut();
        headers.insert(
            "Cache-Control",
            HeaderValue::from_static("no-cache, no-store, must-revalidate, max-age=0"),
        );
        headers.insert("Pragma", HeaderValue::from_static("no-cache"));
    }

    response
}
